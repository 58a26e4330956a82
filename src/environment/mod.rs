//! 호스트 환경 파사드: 프로세스 열거 + 설정 파일 쓰기

use crate::process_monitor::{Process, ProcessSource};
use crate::transaction::{ConfigFile, ConfigTransaction, PathLocks, TransactionError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

pub struct Environment {
    source: Arc<dyn ProcessSource>,
    system_id: String,
    allowed_directories: Vec<PathBuf>,
    locks: PathLocks,
}

impl Environment {
    pub fn new(source: Arc<dyn ProcessSource>, system_id: &str, allowed_directories: Vec<PathBuf>) -> Self {
        Self {
            source,
            system_id: system_id.to_string(),
            allowed_directories,
            locks: PathLocks::new(),
        }
    }

    // 프로세스 테이블 스캔은 동기 시스템 콜이라 블로킹 스레드풀에서 실행합니다.
    pub async fn processes_async(&self) -> Vec<Process> {
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || source.processes())
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Process enumeration task failed: {}", e);
                Vec::new()
            })
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub async fn begin_transaction(&self, target: &Path) -> Result<ConfigTransaction, TransactionError> {
        ConfigTransaction::begin(target, &self.allowed_directories, &self.locks).await
    }

    /// 트랜잭션에 파일을 스테이징합니다. 실패 시 트랜잭션은 이미 롤백된 상태입니다.
    pub async fn write_files(
        &self,
        tx: &mut ConfigTransaction,
        files: &[ConfigFile],
    ) -> Result<(), TransactionError> {
        tx.write(files).await
    }
}

/// 시스템 식별자 결정 순서: 설정값 → machine-id → 호스트명 → 임의 UUID
pub fn resolve_system_id(configured: Option<&str>) -> String {
    if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }

    for path in MACHINE_ID_PATHS {
        if let Ok(content) = std::fs::read_to_string(path) {
            let id = content.trim();
            if !id.is_empty() {
                tracing::debug!("System id read from {}", path);
                return id.to_string();
            }
        }
    }

    if let Some(host) = sysinfo::System::host_name() {
        return host;
    }

    let id = uuid::Uuid::new_v4().to_string();
    tracing::warn!("Could not determine a stable system id, using random {}", id);
    id
}
