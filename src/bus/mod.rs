//! 토픽 기반 publish/subscribe 디스패처
//!
//! 발행은 무제한 채널에 넣기만 하므로 절대 블로킹되지 않습니다.
//! 단일 디스패처 태스크가 발행 순서대로 메시지를 꺼내, 구독 중인 플러그인에
//! 등록 순서대로 하나씩 전달합니다 (broadcast).

pub mod message;

use crate::plugin::Plugin;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use message::{
    AgentInfo, ApplyConfigRequest, ApplyConfigResponse, ApplyStatus, Message, Payload, Topic,
};

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("plugin '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("plugin '{name}' failed to initialize: {source}")]
    InitFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("message bus is closed")]
    Closed,

    #[error("message bus dispatcher is already running")]
    AlreadyStarted,
}

enum Envelope {
    Deliver(Message),
    Shutdown,
}

struct Registered {
    name: String,
    subscriptions: HashSet<Topic>,
    plugin: Arc<dyn Plugin>,
}

/// 플러그인에게 넘겨주는 발행 전용 핸들.
///
/// 플러그인 목록을 참조하지 않으므로 플러그인이 보관해도 순환 참조가 생기지 않습니다.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<Envelope>,
    closed: Arc<RwLock<bool>>,
}

impl Publisher {
    pub fn publish(&self, message: Message) -> Result<(), BusError> {
        // read 락을 쥔 채 전송해야 close()의 Shutdown보다 앞에 들어간다
        let closed = self.closed.read().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return Err(BusError::Closed);
        }
        tracing::debug!("Publishing message on '{}'", message.topic());
        self.tx
            .send(Envelope::Deliver(message))
            .map_err(|_| BusError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(|e| e.into_inner())
    }

    fn shutdown(&self) {
        let mut closed = self.closed.write().unwrap_or_else(|e| e.into_inner());
        if *closed {
            return;
        }
        *closed = true;
        let _ = self.tx.send(Envelope::Shutdown);
    }
}

pub struct MessageBus {
    publisher: Publisher,
    plugins: Arc<RwLock<Vec<Registered>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            publisher: Publisher {
                tx,
                closed: Arc::new(RwLock::new(false)),
            },
            plugins: Arc::new(RwLock::new(Vec::new())),
            receiver: Mutex::new(Some(rx)),
        }
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// 플러그인 등록. 같은 이름(`PluginInfo::name`)은 두 번 등록할 수 없습니다.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), BusError> {
        if self.publisher.is_closed() {
            return Err(BusError::Closed);
        }

        let info = plugin.info();
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        if plugins.iter().any(|p| p.name == info.name) {
            tracing::warn!("Rejecting duplicate plugin registration: {}", info.name);
            return Err(BusError::AlreadyRegistered(info.name));
        }

        plugin
            .init(self.publisher.clone())
            .map_err(|source| BusError::InitFailed {
                name: info.name.clone(),
                source,
            })?;

        let subscriptions: HashSet<Topic> = plugin.subscriptions().into_iter().collect();
        tracing::info!(
            "Registered plugin '{}' v{} (topics: {:?})",
            info.name,
            info.version,
            subscriptions
        );
        plugins.push(Registered {
            name: info.name,
            subscriptions,
            plugin,
        });
        Ok(())
    }

    pub fn publish(&self, message: Message) -> Result<(), BusError> {
        self.publisher.publish(message)
    }

    pub fn plugin_names(&self) -> Vec<String> {
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins.iter().map(|p| p.name.clone()).collect()
    }

    /// 디스패처 태스크 시작. 반환된 핸들은 `close()` 후 큐가 비워지고
    /// 모든 플러그인의 `close()`가 호출되면 종료됩니다.
    pub fn start(&self) -> Result<JoinHandle<()>, BusError> {
        let rx = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(BusError::AlreadyStarted)?;
        let plugins = self.plugins.clone();
        Ok(tokio::spawn(dispatch_loop(rx, plugins)))
    }

    /// 이후 발행을 거부합니다. 이미 큐에 들어간 메시지는 끝까지 전달됩니다.
    pub fn close(&self) {
        tracing::info!("Message bus closing");
        self.publisher.shutdown();
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    plugins: Arc<RwLock<Vec<Registered>>>,
) {
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Deliver(message) => deliver(&plugins, &message),
            Envelope::Shutdown => break,
        }
    }

    let registered: Vec<(String, Arc<dyn Plugin>)> = {
        let plugins = plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins.iter().map(|p| (p.name.clone(), p.plugin.clone())).collect()
    };
    for (name, plugin) in registered {
        plugin.close();
        tracing::info!("Plugin '{}' closed", name);
    }
    tracing::info!("Message bus dispatcher stopped");
}

fn deliver(plugins: &RwLock<Vec<Registered>>, message: &Message) {
    let topic = message.topic();
    let targets: Vec<(String, Arc<dyn Plugin>)> = {
        let plugins = plugins.read().unwrap_or_else(|e| e.into_inner());
        plugins
            .iter()
            .filter(|p| p.subscriptions.contains(&topic))
            .map(|p| (p.name.clone(), p.plugin.clone()))
            .collect()
    };

    if targets.is_empty() {
        tracing::trace!("No subscribers for '{}', dropping message", topic);
        return;
    }

    for (name, plugin) in targets {
        // 한 플러그인의 실패가 나머지 구독자 전달을 막으면 안 된다
        match std::panic::catch_unwind(AssertUnwindSafe(|| plugin.process(message))) {
            Ok(Ok(())) => {
                tracing::trace!("Delivered '{}' to plugin '{}'", topic, name);
            }
            Ok(Err(e)) => {
                tracing::error!("Plugin '{}' failed to process '{}': {}", name, topic, e);
            }
            Err(_) => {
                tracing::error!("Plugin '{}' panicked while processing '{}'", name, topic);
            }
        }
    }
}
