use nginx_agent::binary::BinaryInspector;
use nginx_agent::bus::{AgentInfo, Message, MessageBus};
use nginx_agent::config::AgentConfig;
use nginx_agent::environment::{resolve_system_id, Environment};
use nginx_agent::plugin::NginxValidator;
use nginx_agent::process_monitor::SysinfoProcessSource;
use nginx_agent::rest::{self, RequestBridge};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("NGINX agent starting");

    let cfg = AgentConfig::load()?;
    let system_id = resolve_system_id(cfg.system_id.as_deref());
    tracing::info!("System id: {}", system_id);

    let env = Arc::new(Environment::new(
        Arc::new(SysinfoProcessSource::default()),
        &system_id,
        cfg.allowed_directories.clone(),
    ));
    let inspector = BinaryInspector::new(cfg.default_config_path.clone());
    let bridge = Arc::new(RequestBridge::new(env, inspector, cfg.apply_timeout()));

    let bus = MessageBus::new();
    bus.register(bridge.clone())?;
    bus.register(Arc::new(NginxValidator::new(cfg.validator_settings())))?;
    let dispatcher = bus.start()?;
    tracing::info!("Plugins registered: {:?}", bus.plugin_names());

    bus.publish(Message::agent_started(AgentInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        system_id: system_id.clone(),
    }))?;

    // Graceful shutdown: Ctrl+C 시 진행 중인 요청을 마치고 종료
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, cleaning up...");
    };
    if let Err(e) = rest::serve(bridge, &cfg.listen_addr, shutdown).await {
        tracing::error!("REST API server error: {}", e);
    }

    bus.close();
    if let Err(e) = dispatcher.await {
        tracing::error!("Message bus dispatcher panicked: {}", e);
    }

    tracing::info!("NGINX agent shut down");
    Ok(())
}
