use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sysinfo::System;

/// OS 프로세스 목록의 한 항목
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub name: String,
    pub path: Option<PathBuf>,
    /// 프로세스 커맨드라인 (예: ["nginx: master process /usr/sbin/nginx -c /etc/nginx/nginx.conf"])
    #[serde(default)]
    pub cmd: Vec<String>,
    pub is_master: bool,
    /// UNIX epoch seconds
    pub start_time: u64,
}

/// 프로세스 열거 원천. 실제 OS 스캔은 에이전트 코어 바깥의 관심사이므로
/// 결과 목록만 이 trait으로 받습니다.
pub trait ProcessSource: Send + Sync {
    fn processes(&self) -> Vec<Process>;
}

/// sysinfo로 nginx 프로세스를 찾는 기본 구현
#[derive(Debug, Clone)]
pub struct SysinfoProcessSource {
    process_name: String,
}

impl Default for SysinfoProcessSource {
    fn default() -> Self {
        Self {
            process_name: "nginx".to_string(),
        }
    }
}

impl SysinfoProcessSource {
    pub fn new(process_name: &str) -> Self {
        Self {
            process_name: process_name.to_lowercase(),
        }
    }
}

impl ProcessSource for SysinfoProcessSource {
    fn processes(&self) -> Vec<Process> {
        let mut sys = System::new();
        sys.refresh_processes();

        let own_pid = std::process::id();
        let matching: Vec<&sysinfo::Process> = sys
            .processes()
            .values()
            .filter(|p| p.pid().as_u32() != own_pid)
            .filter(|p| is_named_process(p.name(), p.cmd(), &self.process_name))
            .collect();
        let matching_pids: Vec<u32> = matching.iter().map(|p| p.pid().as_u32()).collect();

        let processes: Vec<Process> = matching
            .into_iter()
            .map(|p| {
                let cmd = p.cmd().to_vec();
                let ppid = p.parent().map(|pid| pid.as_u32());
                let is_master = is_master_process(&cmd, ppid, &matching_pids);
                Process {
                    pid: p.pid().as_u32(),
                    ppid,
                    name: p.name().to_string(),
                    path: p.exe().map(PathBuf::from),
                    cmd,
                    is_master,
                    start_time: p.start_time(),
                }
            })
            .collect();

        tracing::debug!("Found {} {} processes", processes.len(), self.process_name);
        processes
    }
}

/// 이름이 정확히 일치하거나(`nginx`, `nginx.exe`) 커맨드라인이 `nginx: ` 타이틀로
/// 시작하는 프로세스만 대상입니다. `nginx-agent`처럼 이름에 포함만 된 경우는 제외.
pub fn is_named_process(name: &str, cmd: &[String], process_name: &str) -> bool {
    let name = name.to_lowercase();
    let name = name.strip_suffix(".exe").unwrap_or(&name);
    if name == process_name {
        return true;
    }
    cmd.first()
        .map(|title| title.to_lowercase().starts_with(&format!("{}: ", process_name)))
        .unwrap_or(false)
}

/// 마스터 판별: 커맨드라인이 "master process"를 알리거나, 부모가 같은 이름의 프로세스가 아닐 때.
pub fn is_master_process(cmd: &[String], ppid: Option<u32>, sibling_pids: &[u32]) -> bool {
    let cmdline = cmd.join(" ");
    if cmdline.contains("master process") {
        return true;
    }
    if cmdline.contains("worker process") || cmdline.contains("cache manager") || cmdline.contains("cache loader") {
        return false;
    }
    match ppid {
        Some(parent) => !sibling_pids.contains(&parent),
        None => true,
    }
}

/// 고정된 프로세스 목록 (임베딩 / 테스트용)
#[derive(Debug, Clone, Default)]
pub struct StaticProcessSource {
    processes: Vec<Process>,
}

impl StaticProcessSource {
    pub fn new(processes: Vec<Process>) -> Self {
        Self { processes }
    }
}

impl ProcessSource for StaticProcessSource {
    fn processes(&self) -> Vec<Process> {
        self.processes.clone()
    }
}
