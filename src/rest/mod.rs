//! REST API 플러그인
//!
//! 블로킹 HTTP 요청 하나를 인스턴스별 비동기 apply 왕복으로 이어 줍니다.
//! 인스턴스마다 쓰기 → 발행 → 대기 → 확정(또는 복구)을 끝낸 뒤 다음 인스턴스로 넘어갑니다.

mod handlers;
pub mod pending;

use crate::binary::{BinaryInspector, ManagedInstance};
use crate::bus::{ApplyConfigResponse, ApplyStatus, Message, Payload, Publisher, Topic};
use crate::environment::Environment;
use crate::error::AgentError;
use crate::plugin::{Plugin, PluginError, PluginInfo};
use crate::transaction::ConfigFile;
use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use pending::{PendingError, PendingRequests};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// 업로드 최대 크기 (32 MiB)
pub const MAX_UPLOAD_BYTES: usize = 32 << 20;

/// 인스턴스별 응답 대기 기본값 (초)
pub const DEFAULT_APPLY_TIMEOUT_SECS: u64 = 30;

/// 처리 도중 실패한 인스턴스와, 그 전까지 끝난 결과
#[derive(Debug)]
pub struct ApplyFailure {
    pub nginx_id: String,
    pub error: AgentError,
    pub completed: Vec<ApplyConfigResponse>,
}

impl IntoResponse for ApplyFailure {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let mut body = self.error.to_json();
        body["nginx_id"] = serde_json::json!(self.nginx_id);
        body["results"] = serde_json::json!(self.completed);
        (status, Json(body)).into_response()
    }
}

pub struct RequestBridge {
    env: Arc<Environment>,
    inspector: BinaryInspector,
    pending: PendingRequests,
    apply_timeout: Duration,
    publisher: OnceLock<Publisher>,
}

impl RequestBridge {
    pub fn new(env: Arc<Environment>, inspector: BinaryInspector, apply_timeout: Duration) -> Self {
        Self {
            env,
            inspector,
            pending: PendingRequests::new(),
            apply_timeout,
            publisher: OnceLock::new(),
        }
    }

    /// 실행 중인 마스터 인스턴스 목록
    pub async fn instances(&self) -> Vec<ManagedInstance> {
        let processes = self.env.processes_async().await;
        let instances = self.inspector.masters(&processes);
        if instances.is_empty() {
            tracing::info!("No master process found");
        }
        instances
    }

    /// 발견된 모든 인스턴스에 순서대로 적용합니다. 첫 실패에서 멈추며,
    /// 이미 끝난 인스턴스의 결과는 되돌리지 않습니다.
    pub async fn apply(&self, contents: &[u8]) -> Result<Vec<ApplyConfigResponse>, ApplyFailure> {
        let instances = self.instances().await;
        let mut completed = Vec::with_capacity(instances.len());

        for instance in &instances {
            match self.apply_to_instance(instance, contents).await {
                Ok(response) => completed.push(response),
                Err(error) => {
                    tracing::error!("Config apply for nginx {} failed: {}", instance.nginx_id, error);
                    return Err(ApplyFailure {
                        nginx_id: instance.nginx_id.clone(),
                        error,
                        completed,
                    });
                }
            }
        }
        Ok(completed)
    }

    /// 한 인스턴스에 대한 write → 발행 → 대기 왕복.
    ///
    /// 파일은 발행 전에 디스크에 교체되지만 트랜잭션은 응답이 올 때까지 열어 둡니다.
    /// 검증 성공이면 확정하고, 검증 실패나 타임아웃이면 같은 경로 락 아래에서
    /// 원본으로 되돌립니다.
    pub async fn apply_to_instance(
        &self,
        instance: &ManagedInstance,
        contents: &[u8],
    ) -> Result<ApplyConfigResponse, AgentError> {
        let publisher = self
            .publisher
            .get()
            .ok_or_else(|| anyhow::anyhow!("REST API plugin is not registered on the message bus"))?;

        // Applying: 실패 시 트랜잭션 내부에서 이미 롤백됨
        let mut tx = self.env.begin_transaction(&instance.conf_path).await?;
        self.env
            .write_files(&mut tx, &[ConfigFile::new(&instance.conf_path, contents.to_vec())])
            .await?;
        tx.persist()?;
        tracing::info!(
            "Wrote {} bytes to {} for nginx {}",
            contents.len(),
            instance.conf_path.display(),
            instance.nginx_id
        );

        // Dispatching: 발행 전에 슬롯을 먼저 등록해야 응답을 놓치지 않는다
        let waiter = self.pending.register(self.apply_timeout);
        let request = self.inspector.read_config(
            instance,
            contents.to_vec(),
            self.env.system_id(),
            waiter.correlation_id(),
        );
        if let Err(e) = publisher.publish(Message::apply_config(request)) {
            tx.rollback(&e.to_string())?;
            return Err(e.into());
        }

        // Awaiting → Completing
        match waiter.wait().await {
            Ok(response) if response.status == ApplyStatus::Ok => {
                tx.complete()?;
                Ok(response)
            }
            Ok(mut response) => {
                tx.rollback(&response.message)?;
                tracing::warn!(
                    "Config for nginx {} rejected, previous config restored: {}",
                    instance.nginx_id,
                    response.message
                );
                response.message = format!("{} (previous config restored)", response.message);
                Ok(response)
            }
            Err(PendingError::TimedOut) => {
                tracing::warn!(
                    "No apply response for nginx {} within {}s",
                    instance.nginx_id,
                    self.apply_timeout.as_secs()
                );
                tx.rollback("no apply response before deadline")?;
                Err(AgentError::Timeout {
                    nginx_id: instance.nginx_id.clone(),
                    timeout: self.apply_timeout,
                })
            }
            Err(e) => {
                tx.rollback(&e.to_string())?;
                Err(AgentError::Internal(anyhow::anyhow!(e)))
            }
        }
    }
}

impl Plugin for RequestBridge {
    fn init(&self, publisher: Publisher) -> Result<()> {
        tracing::info!("REST API initializing");
        self.publisher
            .set(publisher)
            .map_err(|_| anyhow::anyhow!("REST API plugin already initialized"))
    }

    fn process(&self, message: &Message) -> Result<(), PluginError> {
        match message.payload() {
            Payload::ApplyConfigResponse(response) => {
                tracing::debug!(
                    "Apply response {} for nginx {}: {:?}",
                    response.correlation_id,
                    response.nginx_id,
                    response.status
                );
                self.pending.deliver(response.clone());
                Ok(())
            }
            _ => Err(PluginError::UnexpectedPayload(message.topic())),
        }
    }

    fn subscriptions(&self) -> Vec<Topic> {
        vec![Topic::NginxConfigApplyResponse]
    }

    fn info(&self) -> PluginInfo {
        PluginInfo::new("REST API Plugin", env!("CARGO_PKG_VERSION"))
    }

    fn close(&self) {
        tracing::info!("REST API is wrapping up");
    }
}

pub fn router(bridge: Arc<RequestBridge>) -> Router {
    Router::new()
        .route("/nginx", get(handlers::list_instances).fallback(handlers::not_found))
        .route("/nginx/", get(handlers::list_instances).fallback(handlers::not_found))
        .route("/nginx/config", put(handlers::apply_config).fallback(handlers::not_found))
        .route("/nginx/config/", put(handlers::apply_config).fallback(handlers::not_found))
        .fallback(handlers::not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .with_state(bridge)
}

/// HTTP 서버 실행. `shutdown`이 끝나면 진행 중인 요청을 마치고 종료합니다.
pub async fn serve<F>(bridge: Arc<RequestBridge>, listen_addr: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("REST API listening on http://{}", listen_addr);

    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
