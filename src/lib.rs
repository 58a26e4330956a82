pub mod binary;
pub mod bus;
pub mod config;
pub mod environment;
pub mod error;
pub mod plugin;
pub mod process_monitor;
pub mod rest;
pub mod transaction;
