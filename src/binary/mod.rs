//! 프로세스 목록 → 관리 대상 인스턴스 기술자 변환

use crate::bus::ApplyConfigRequest;
use crate::process_monitor::Process;
use crate::transaction::checksum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nginx/nginx.conf";

/// 요청 시점에 발견된 실행 중 인스턴스 하나의 스냅샷. 저장되지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedInstance {
    pub nginx_id: String,
    pub is_master: bool,
    pub conf_path: PathBuf,
    pub process_id: u32,
    pub process_path: Option<PathBuf>,
    pub prefix: Option<PathBuf>,
    pub start_time: u64,
}

/// 마스터 커맨드라인에서 읽어낸 값들
#[derive(Debug, Default, PartialEq, Eq)]
struct CommandLine {
    binary: Option<PathBuf>,
    conf: Option<PathBuf>,
    prefix: Option<PathBuf>,
}

/// `nginx: master process /usr/sbin/nginx -c /etc/nginx/nginx.conf -p /usr/share/nginx`
/// 형태와 일반 argv 형태를 모두 처리합니다.
fn parse_command_line(cmd: &[String]) -> CommandLine {
    let joined = cmd.join(" ");
    let mut tokens: Vec<&str> = joined.split_whitespace().collect();
    if tokens.len() >= 3 && tokens[0] == "nginx:" && tokens[1] == "master" && tokens[2] == "process" {
        tokens.drain(..3);
    }

    let mut parsed = CommandLine::default();
    let mut iter = tokens.into_iter().peekable();
    if let Some(first) = iter.peek() {
        if !first.starts_with('-') {
            parsed.binary = Some(PathBuf::from(*first));
            iter.next();
        }
    }
    while let Some(token) = iter.next() {
        match token {
            "-c" => parsed.conf = iter.next().map(PathBuf::from),
            "-p" => parsed.prefix = iter.next().map(PathBuf::from),
            _ => {}
        }
    }
    parsed
}

/// 인스턴스 ID: 바이너리 경로, 설정 경로, prefix 조합의 SHA-256
pub fn generate_nginx_id(binary: Option<&Path>, conf: &Path, prefix: Option<&Path>) -> String {
    fn display(p: Option<&Path>) -> String {
        p.map(|p| p.display().to_string()).unwrap_or_default()
    }
    checksum(format!("{}_{}_{}", display(binary), conf.display(), display(prefix)).as_bytes())
}

#[derive(Debug, Clone)]
pub struct BinaryInspector {
    default_config_path: PathBuf,
}

impl Default for BinaryInspector {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_PATH)
    }
}

impl BinaryInspector {
    pub fn new(default_config_path: impl Into<PathBuf>) -> Self {
        Self {
            default_config_path: default_config_path.into(),
        }
    }

    /// 마스터 프로세스만 골라 기술자로 변환. 없으면 빈 목록.
    pub fn masters(&self, processes: &[Process]) -> Vec<ManagedInstance> {
        processes
            .iter()
            .filter(|p| {
                if !p.is_master {
                    tracing::trace!("Skipping non-master process: {}", p.pid);
                }
                p.is_master
            })
            .map(|p| self.instance_from_process(p))
            .collect()
    }

    pub fn instance_from_process(&self, process: &Process) -> ManagedInstance {
        let parsed = parse_command_line(&process.cmd);
        let process_path = process.path.clone().or(parsed.binary);

        let conf_path = match (parsed.conf, &parsed.prefix) {
            (Some(conf), Some(prefix)) if conf.is_relative() => prefix.join(conf),
            (Some(conf), _) => conf,
            (None, Some(prefix)) => prefix.join("conf").join("nginx.conf"),
            (None, None) => self.default_config_path.clone(),
        };

        ManagedInstance {
            nginx_id: generate_nginx_id(process_path.as_deref(), &conf_path, parsed.prefix.as_deref()),
            is_master: process.is_master,
            conf_path,
            process_id: process.pid,
            process_path,
            prefix: parsed.prefix,
            start_time: process.start_time,
        }
    }

    /// 디스크에 기록된 설정을 "apply configuration" 요청으로 묶습니다.
    pub fn read_config(
        &self,
        instance: &ManagedInstance,
        contents: Vec<u8>,
        system_id: &str,
        correlation_id: Uuid,
    ) -> ApplyConfigRequest {
        ApplyConfigRequest {
            correlation_id,
            nginx_id: instance.nginx_id.clone(),
            system_id: system_id.to_string(),
            config_path: instance.conf_path.clone(),
            process_id: instance.process_id,
            process_path: instance.process_path.clone(),
            checksum: checksum(&contents),
            contents,
        }
    }
}
