//! 설정 파일 트랜잭션
//!
//! 대상 파일마다 경로 락을 잡고 원본(바이트 + 퍼미션)을 먼저 스냅샷한 뒤,
//! 새 내용은 같은 디렉토리의 임시 파일에 스테이징합니다. `complete()`에서
//! rename으로 한 번에 교체하고, 중간에 하나라도 실패하면 이미 교체된 파일까지
//! 스냅샷으로 되돌립니다.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// 새로 만들어지는 파일의 기본 퍼미션
pub const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Completed,
    RolledBack,
}

#[derive(thiserror::Error, Debug)]
pub enum TransactionError {
    #[error("path '{}' is not under any allowed directory", .0.display())]
    PathNotAllowed(PathBuf),

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transaction is {0:?}, expected Open")]
    NotOpen(TransactionState),

    #[error("rollback after '{cause}' left {} file(s) unrestored: {}", .failures.len(), .failures.join("; "))]
    RollbackIncomplete { cause: String, failures: Vec<String> },
}

impl TransactionError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// 트랜잭션에 기록할 파일 하나.
/// `permissions`가 `None`이면 기존 파일의 퍼미션을 유지하고, 새 파일은 0644.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub contents: Vec<u8>,
    pub permissions: Option<u32>,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            permissions: None,
        }
    }

    pub fn with_permissions(mut self, mode: u32) -> Self {
        self.permissions = Some(mode);
        self
    }
}

/// SHA-256 hex digest
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub enum Snapshot {
    Existing {
        bytes: Vec<u8>,
        permissions: fs::Permissions,
    },
    Absent,
}

impl Snapshot {
    fn capture(path: &Path) -> Result<Self, TransactionError> {
        match fs::read(path) {
            Ok(bytes) => {
                let permissions = fs::metadata(path)
                    .map_err(|e| TransactionError::io(path, e))?
                    .permissions();
                Ok(Self::Existing { bytes, permissions })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::Absent),
            Err(e) => Err(TransactionError::io(path, e)),
        }
    }

    fn restore(&self, path: &Path) -> io::Result<()> {
        match self {
            Self::Existing { bytes, permissions } => {
                fs::write(path, bytes)?;
                fs::set_permissions(path, permissions.clone())
            }
            Self::Absent => match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        }
    }
}

/// 경로별 비동기 락 테이블.
/// 같은 파일을 겨냥한 트랜잭션끼리 스냅샷/쓰기/완료 단계가 섞이지 않게 합니다.
#[derive(Clone, Default)]
pub struct PathLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // 아무도 쥐고 있지 않은 항목 정리
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(path.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// `.`/`..` 를 어휘적으로 정리합니다. 파일이 아직 없을 수 있으므로 canonicalize는 쓰지 않음.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn is_allowed(path: &Path, allowed: &[PathBuf]) -> bool {
    let path = normalize(path);
    path.is_absolute() && allowed.iter().any(|dir| path.starts_with(normalize(dir)))
}

/// 심볼릭 링크를 따라간 실제 대상 경로. 아직 없는 파일은 어휘적으로 정리한 경로 그대로.
/// 링크 자체를 rename으로 덮어쓰지 않도록 스냅샷/스테이징/교체는 모두 이 경로에서 합니다.
fn resolve_target(path: &Path) -> Result<PathBuf, TransactionError> {
    let path = normalize(path);
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::canonicalize(&path).map_err(|e| TransactionError::io(&path, e))
        }
        Ok(_) => Ok(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(path),
        Err(e) => Err(TransactionError::io(&path, e)),
    }
}

/// 해석된 경로 검사. 허용 디렉토리 자체가 링크일 수 있으므로 실제 경로와도 비교합니다.
fn is_allowed_resolved(resolved: &Path, allowed: &[PathBuf]) -> bool {
    is_allowed(resolved, allowed)
        || allowed
            .iter()
            .filter_map(|dir| fs::canonicalize(dir).ok())
            .any(|dir| resolved.starts_with(dir))
}

pub struct ConfigTransaction {
    id: Uuid,
    allowed: Vec<PathBuf>,
    locks: PathLocks,
    snapshots: BTreeMap<PathBuf, Snapshot>,
    staged: BTreeMap<PathBuf, NamedTempFile>,
    mutated: BTreeSet<PathBuf>,
    created_dirs: Vec<PathBuf>,
    guards: Vec<OwnedMutexGuard<()>>,
    state: TransactionState,
}

impl ConfigTransaction {
    /// 트랜잭션 시작. 허용 디렉토리 밖이면 아무것도 건드리지 않고 실패합니다.
    pub async fn begin(
        target: impl AsRef<Path>,
        allowed: &[PathBuf],
        locks: &PathLocks,
    ) -> Result<Self, TransactionError> {
        let target = target.as_ref();
        if !is_allowed(target, allowed) {
            tracing::warn!("Refusing config transaction outside allowed directories: {}", target.display());
            return Err(TransactionError::PathNotAllowed(target.to_path_buf()));
        }

        let mut tx = Self {
            id: Uuid::new_v4(),
            allowed: allowed.to_vec(),
            locks: locks.clone(),
            snapshots: BTreeMap::new(),
            staged: BTreeMap::new(),
            mutated: BTreeSet::new(),
            created_dirs: Vec::new(),
            guards: Vec::new(),
            state: TransactionState::Open,
        };

        if let Err(e) = tx.track(target).await {
            // 아직 변경된 것이 없으므로 그대로 닫는다
            tx.state = TransactionState::RolledBack;
            tx.guards.clear();
            return Err(e);
        }

        tracing::debug!("Config transaction {} opened for {}", tx.id, target.display());
        Ok(tx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn snapshot(&self, path: &Path) -> Option<&Snapshot> {
        let path = resolve_target(path).ok()?;
        self.snapshots.get(&path)
    }

    fn ensure_open(&self) -> Result<(), TransactionError> {
        match self.state {
            TransactionState::Open => Ok(()),
            other => Err(TransactionError::NotOpen(other)),
        }
    }

    /// 경로 락 획득 후 첫 변경 전에 스냅샷
    async fn track(&mut self, path: &Path) -> Result<PathBuf, TransactionError> {
        if !is_allowed(path, &self.allowed) {
            return Err(TransactionError::PathNotAllowed(path.to_path_buf()));
        }
        let resolved = resolve_target(path)?;
        if !is_allowed_resolved(&resolved, &self.allowed) {
            tracing::warn!("{} links outside allowed directories ({})", path.display(), resolved.display());
            return Err(TransactionError::PathNotAllowed(path.to_path_buf()));
        }
        let path = resolved;
        if self.snapshots.contains_key(&path) {
            return Ok(path);
        }

        let guard = self.locks.acquire(&path).await;
        self.guards.push(guard);
        let snapshot = Snapshot::capture(&path)?;
        self.snapshots.insert(path.clone(), snapshot);
        Ok(path)
    }

    /// 새 내용을 스테이징합니다. 대상 파일 자체는 `persist()`/`complete()` 전까지 그대로입니다.
    /// 실패하면 롤백한 뒤 에러를 돌려줍니다.
    ///
    /// 경로 락은 처음 건드리는 순서대로 잡고 트랜잭션이 끝날 때까지 유지됩니다.
    /// 여러 경로를 다루는 트랜잭션들이 동시에 돌 때는 모두 같은 순서(예: 정렬 순)로
    /// 경로를 넘겨야 서로를 기다리며 멈추지 않습니다.
    pub async fn write(&mut self, files: &[ConfigFile]) -> Result<(), TransactionError> {
        self.ensure_open()?;
        for file in files {
            if let Err(e) = self.stage(file).await {
                return Err(self.fail(e));
            }
        }
        Ok(())
    }

    async fn stage(&mut self, file: &ConfigFile) -> Result<(), TransactionError> {
        let path = self.track(&file.path).await?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| TransactionError::io(&path, io::Error::new(io::ErrorKind::InvalidInput, "no parent directory")))?;
        self.ensure_dir(&parent)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".nginx-agent-")
            .suffix(".staged")
            .tempfile_in(&parent)
            .map_err(|e| TransactionError::io(&path, e))?;
        tmp.write_all(&file.contents)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| TransactionError::io(&path, e))?;

        let permissions = match (file.permissions, self.snapshots.get(&path)) {
            (Some(mode), _) => permissions_from_mode(mode),
            (None, Some(Snapshot::Existing { permissions, .. })) => Some(permissions.clone()),
            (None, _) => permissions_from_mode(DEFAULT_FILE_MODE),
        };
        if let Some(permissions) = permissions {
            fs::set_permissions(tmp.path(), permissions).map_err(|e| TransactionError::io(&path, e))?;
        }

        tracing::debug!("Staged {} bytes for {}", file.contents.len(), path.display());
        self.staged.insert(path, tmp);
        Ok(())
    }

    fn ensure_dir(&mut self, dir: &Path) -> Result<(), TransactionError> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(d) = current {
            if d.exists() {
                break;
            }
            missing.push(d.to_path_buf());
            current = d.parent();
        }
        for d in missing.into_iter().rev() {
            fs::create_dir(&d).map_err(|e| TransactionError::io(&d, e))?;
            tracing::debug!("Created directory {}", d.display());
            self.created_dirs.push(d);
        }
        Ok(())
    }

    /// 스테이징된 파일을 디스크에 교체해 넣되 트랜잭션은 열어 둡니다.
    /// 스냅샷과 경로 락이 유지되므로 이후 검증 결과에 따라 `complete()` 또는
    /// `rollback()`으로 끝낼 수 있습니다. 교체 중 하나라도 실패하면 전체를 되돌립니다.
    pub fn persist(&mut self) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let staged = std::mem::take(&mut self.staged);
        for (path, tmp) in staged {
            match tmp.persist(&path) {
                Ok(_) => {
                    self.mutated.insert(path);
                }
                Err(e) => {
                    let err = TransactionError::io(&path, e.error);
                    return Err(self.fail(err));
                }
            }
        }
        Ok(())
    }

    /// 남은 스테이징 파일을 교체하고 트랜잭션을 확정합니다. 락은 여기서 풀립니다.
    pub fn complete(&mut self) -> Result<(), TransactionError> {
        self.persist()?;

        self.state = TransactionState::Completed;
        self.guards.clear();
        tracing::info!(
            "Config transaction {} completed ({} file(s))",
            self.id,
            self.mutated.len()
        );
        Ok(())
    }

    /// 쓰기 후 완료까지 한 번에
    pub async fn apply(&mut self, files: &[ConfigFile]) -> Result<(), TransactionError> {
        self.write(files).await?;
        self.complete()
    }

    /// 변경된 모든 파일을 스냅샷으로 복구합니다.
    /// 일부 복구가 실패해도 나머지는 계속 시도하고, 상태는 항상 RolledBack이 됩니다.
    pub fn rollback(&mut self, cause: &str) -> Result<(), TransactionError> {
        self.ensure_open()?;
        tracing::warn!("Rolling back config transaction {}: {}", self.id, cause);

        self.staged.clear();
        let mut failures = Vec::new();
        for path in std::mem::take(&mut self.mutated) {
            let Some(snapshot) = self.snapshots.get(&path) else {
                continue;
            };
            match snapshot.restore(&path) {
                Ok(()) => tracing::debug!("Restored {}", path.display()),
                Err(e) => failures.push(format!("{}: {}", path.display(), e)),
            }
        }
        for dir in self.created_dirs.drain(..).rev() {
            if let Err(e) = fs::remove_dir(&dir) {
                tracing::debug!("Leaving directory {} in place: {}", dir.display(), e);
            }
        }

        self.state = TransactionState::RolledBack;
        self.guards.clear();

        if failures.is_empty() {
            tracing::info!("Config transaction {} rolled back", self.id);
            Ok(())
        } else {
            tracing::error!(
                "Config transaction {} rollback incomplete: {}",
                self.id,
                failures.join("; ")
            );
            Err(TransactionError::RollbackIncomplete {
                cause: cause.to_string(),
                failures,
            })
        }
    }

    fn fail(&mut self, err: TransactionError) -> TransactionError {
        match self.rollback(&err.to_string()) {
            Ok(()) => err,
            Err(rollback_err) => rollback_err,
        }
    }
}

impl Drop for ConfigTransaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Open {
            tracing::error!("Config transaction {} dropped while open", self.id);
            let _ = self.rollback("transaction dropped while open");
        }
    }
}

#[cfg(unix)]
fn permissions_from_mode(mode: u32) -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn permissions_from_mode(_mode: u32) -> Option<fs::Permissions> {
    None
}
