use crate::binary::DEFAULT_CONFIG_PATH;
use crate::plugin::ValidatorSettings;
use crate::rest::DEFAULT_APPLY_TIMEOUT_SECS;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 설정 파일 경로를 지정하는 환경변수
pub const CONFIG_PATH_ENV: &str = "NGINX_AGENT_CONFIG";
pub const DEFAULT_AGENT_CONFIG: &str = "config/agent.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub listen_addr: String,
    pub allowed_directories: Vec<PathBuf>,
    pub apply_timeout_secs: u64,
    pub default_config_path: PathBuf,
    /// 지정하지 않으면 machine-id / 호스트명에서 유도
    pub system_id: Option<String>,
    pub validation: ValidationConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub reload_on_apply: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".to_string(),
            allowed_directories: vec![PathBuf::from("/etc/nginx")],
            apply_timeout_secs: DEFAULT_APPLY_TIMEOUT_SECS,
            default_config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            system_id: None,
            validation: ValidationConfig::default(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        let settings = ValidatorSettings::default();
        Self {
            enabled: settings.run_binary,
            timeout_secs: settings.timeout.as_secs(),
            reload_on_apply: settings.reload_on_apply,
        }
    }
}

impl AgentConfig {
    /// `NGINX_AGENT_CONFIG` (기본 `config/agent.toml`)에서 읽고 환경변수 오버라이드 적용
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_AGENT_CONFIG.to_string());
        let mut cfg = Self::load_from(Path::new(&path))?;
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// 파일이 없으면 기본값, 있는데 파싱이 안 되면 에러
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let cfg: Self = toml::from_str(&s).with_context(|| format!("invalid config file {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("NGINX_AGENT_LISTEN") {
            self.listen_addr = addr;
        }
        if let Some(dirs) = lookup("NGINX_AGENT_ALLOWED_DIRS") {
            self.allowed_directories = dirs
                .split(':')
                .filter(|d| !d.trim().is_empty())
                .map(|d| PathBuf::from(d.trim()))
                .collect();
        }
        if let Some(secs) = lookup("NGINX_AGENT_APPLY_TIMEOUT") {
            self.apply_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("NGINX_AGENT_APPLY_TIMEOUT must be seconds, got '{}'", secs))?;
        }
        Ok(())
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn validator_settings(&self) -> ValidatorSettings {
        ValidatorSettings {
            run_binary: self.validation.enabled,
            timeout: Duration::from_secs(self.validation.timeout_secs),
            reload_on_apply: self.validation.reload_on_apply,
        }
    }
}
