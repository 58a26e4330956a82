//! 설정 검증 플러그인
//!
//! `NginxConfigApply`를 받아 디스크에 기록된 설정을 검사하고, 결과를
//! `NginxConfigApplyResponse`로 다시 발행합니다. 바이너리를 실행하는 검사는
//! 디스패처를 막지 않도록 별도 태스크에서 돌립니다.

use super::{Plugin, PluginError, PluginInfo};
use crate::bus::{ApplyConfigRequest, ApplyConfigResponse, ApplyStatus, Message, Payload, Publisher, Topic};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

/// 기본 검증 타임아웃 (초)
pub const DEFAULT_VALIDATION_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    /// 인스턴스 바이너리로 `-t -c <conf>` 검사를 실행할지 여부
    pub run_binary: bool,
    pub timeout: Duration,
    /// 검증 통과 후 마스터 프로세스에 SIGHUP
    pub reload_on_apply: bool,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            run_binary: true,
            timeout: Duration::from_secs(DEFAULT_VALIDATION_TIMEOUT_SECS),
            reload_on_apply: false,
        }
    }
}

pub struct NginxValidator {
    settings: ValidatorSettings,
    publisher: OnceLock<Publisher>,
}

impl NginxValidator {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self {
            settings,
            publisher: OnceLock::new(),
        }
    }
}

impl Plugin for NginxValidator {
    fn init(&self, publisher: Publisher) -> anyhow::Result<()> {
        tracing::info!("NGINX config validator initializing");
        self.publisher
            .set(publisher)
            .map_err(|_| anyhow::anyhow!("validator already initialized"))
    }

    fn process(&self, message: &Message) -> Result<(), PluginError> {
        let Payload::ApplyConfig(request) = message.payload() else {
            return Err(PluginError::UnexpectedPayload(message.topic()));
        };
        let publisher = self.publisher.get().cloned().ok_or(PluginError::NotInitialized)?;
        let settings = self.settings.clone();
        let request = request.clone();

        tokio::spawn(async move {
            let response = validate_and_reload(&settings, &request).await;
            tracing::info!(
                "Config for nginx {} validated: {:?} ({})",
                response.nginx_id,
                response.status,
                response.message
            );
            if let Err(e) = publisher.publish(Message::apply_config_response(response)) {
                tracing::warn!("Dropping validation result for {}: {}", request.correlation_id, e);
            }
        });
        Ok(())
    }

    fn subscriptions(&self) -> Vec<Topic> {
        vec![Topic::NginxConfigApply]
    }

    fn info(&self) -> PluginInfo {
        PluginInfo::new("NGINX Config Validator", env!("CARGO_PKG_VERSION"))
    }

    fn close(&self) {
        tracing::info!("NGINX config validator is wrapping up");
    }
}

async fn validate_and_reload(settings: &ValidatorSettings, request: &ApplyConfigRequest) -> ApplyConfigResponse {
    let binary = request
        .process_path
        .as_deref()
        .filter(|path| settings.run_binary && path.exists());

    let result = match binary {
        Some(binary) => run_config_test(binary, &request.config_path, settings.timeout).await,
        None => {
            tracing::debug!("No runnable binary for nginx {}, using structural check", request.nginx_id);
            check_structure(&request.contents)
        }
    };

    if let Err(message) = result {
        return ApplyConfigResponse::for_request(request, ApplyStatus::Error, message);
    }

    if settings.reload_on_apply {
        return match reload(request.process_id) {
            Ok(()) => ApplyConfigResponse::for_request(request, ApplyStatus::Ok, "config applied and reload signalled"),
            Err(e) => ApplyConfigResponse::for_request(
                request,
                ApplyStatus::Error,
                format!("config is valid but reload failed: {}", e),
            ),
        };
    }

    ApplyConfigResponse::for_request(request, ApplyStatus::Ok, "config applied")
}

/// `<binary> -t -c <conf>` 실행. 실패 시 stderr 내용을 메시지로 돌려줍니다.
pub async fn run_config_test(binary: &Path, config_path: &Path, timeout: Duration) -> Result<(), String> {
    tracing::debug!("Running config test: {} -t -c {}", binary.display(), config_path.display());

    let mut cmd = Command::new(binary);
    cmd.arg("-t")
        .arg("-c")
        .arg(config_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!("Config test failed (exit {:?}): {}", output.status.code(), stderr);
            Err(if stderr.is_empty() {
                format!("config test failed with exit code {:?}", output.status.code())
            } else {
                stderr
            })
        }
        Ok(Err(e)) => Err(format!("failed to run {}: {}", binary.display(), e)),
        Err(_) => {
            tracing::warn!("Config test timed out after {}s", timeout.as_secs());
            Err(format!("config test timed out after {}s", timeout.as_secs()))
        }
    }
}

/// 바이너리 없이 할 수 있는 최소 검사: UTF-8, 비어있지 않음, 중괄호 짝.
/// 주석(`#`)과 따옴표 안의 중괄호는 무시합니다.
pub fn check_structure(contents: &[u8]) -> Result<(), String> {
    let text = std::str::from_utf8(contents).map_err(|e| format!("config is not valid UTF-8: {}", e))?;
    if text.trim().is_empty() {
        return Err("config is empty".to_string());
    }

    let mut depth: i64 = 0;
    let mut line = 1;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut in_comment = false;

    for ch in text.chars() {
        if ch == '\n' {
            line += 1;
            in_comment = false;
            continue;
        }
        if in_comment {
            continue;
        }
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '#' => in_comment = true,
            '"' | '\'' => quote = Some(ch),
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(format!("unexpected '}}' on line {}", line));
                }
            }
            _ => {}
        }
    }

    if quote.is_some() {
        return Err("unterminated quoted string".to_string());
    }
    if depth > 0 {
        return Err(format!("{} unclosed '{{' block(s)", depth));
    }
    Ok(())
}

#[cfg(unix)]
fn reload(pid: u32) -> anyhow::Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(pid as i32), Signal::SIGHUP)
        .map_err(|e| anyhow::anyhow!("failed to signal pid {}: {}", pid, e))?;
    tracing::info!("Sent SIGHUP to nginx master {}", pid);
    Ok(())
}

#[cfg(not(unix))]
fn reload(pid: u32) -> anyhow::Result<()> {
    Err(anyhow::anyhow!("reload of pid {} is not supported on this platform", pid))
}
