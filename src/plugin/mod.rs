//! 플러그인 수명주기 계약
//!
//! 모든 플러그인은 `MessageBus`에 등록되어 토픽 구독만으로 협력합니다.
//! 플러그인끼리 직접 호출하는 일은 없습니다.

pub mod validator;

use crate::bus::{Message, Publisher, Topic};
use serde::Serialize;

pub use validator::{NginxValidator, ValidatorSettings};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

impl PluginInfo {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PluginError {
    #[error("plugin is not initialized")]
    NotInitialized,

    #[error("unexpected payload for topic '{0}'")]
    UnexpectedPayload(Topic),

    #[error(transparent)]
    Bus(#[from] crate::bus::BusError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

/// 버스에 등록되는 기능 단위.
///
/// `process`는 디스패처 태스크에서 순서대로 호출되므로 오래 걸리는 작업은
/// 플러그인이 직접 `tokio::spawn`으로 넘겨야 합니다.
/// `subscriptions`는 등록 시점에 한 번 읽히고 이후 바뀌지 않습니다.
pub trait Plugin: Send + Sync {
    fn init(&self, publisher: Publisher) -> anyhow::Result<()>;

    fn process(&self, message: &Message) -> Result<(), PluginError>;

    fn subscriptions(&self) -> Vec<Topic>;

    fn info(&self) -> PluginInfo;

    fn close(&self);
}
