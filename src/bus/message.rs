use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// 버스 라우팅 토픽
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// 에이전트 기동 완료 (main에서 한 번 발행)
    AgentStarted,
    /// 새 설정 파일이 디스크에 기록됨: 검증/리로드 요청
    NginxConfigApply,
    /// 검증 플러그인의 결과 (correlation id로 요청과 연결)
    NginxConfigApplyResponse,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentStarted => "agent.started",
            Self::NginxConfigApply => "nginx.config.apply",
            Self::NginxConfigApplyResponse => "nginx.config.apply.response",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub version: String,
    pub system_id: String,
}

/// "apply configuration" 요청. 인스턴스 하나당 하나씩 발행됩니다.
#[derive(Debug, Clone)]
pub struct ApplyConfigRequest {
    pub correlation_id: Uuid,
    pub nginx_id: String,
    pub system_id: String,
    pub config_path: PathBuf,
    pub process_id: u32,
    pub process_path: Option<PathBuf>,
    pub contents: Vec<u8>,
    /// SHA-256 hex of `contents`
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyConfigResponse {
    pub correlation_id: Uuid,
    pub nginx_id: String,
    pub system_id: String,
    pub config_path: PathBuf,
    pub status: ApplyStatus,
    pub message: String,
    pub checksum: String,
}

impl ApplyConfigResponse {
    /// 요청의 식별 정보를 그대로 옮겨 담은 응답을 만듭니다.
    pub fn for_request(request: &ApplyConfigRequest, status: ApplyStatus, message: impl Into<String>) -> Self {
        Self {
            correlation_id: request.correlation_id,
            nginx_id: request.nginx_id.clone(),
            system_id: request.system_id.clone(),
            config_path: request.config_path.clone(),
            status,
            message: message.into(),
            checksum: request.checksum.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    AgentStarted(AgentInfo),
    ApplyConfig(ApplyConfigRequest),
    ApplyConfigResponse(ApplyConfigResponse),
}

/// 버스 메시지. 생성 이후에는 변경할 수 없습니다.
#[derive(Debug, Clone)]
pub struct Message {
    topic: Topic,
    payload: Payload,
}

impl Message {
    pub fn new(topic: Topic, payload: Payload) -> Self {
        Self { topic, payload }
    }

    pub fn agent_started(info: AgentInfo) -> Self {
        Self::new(Topic::AgentStarted, Payload::AgentStarted(info))
    }

    pub fn apply_config(request: ApplyConfigRequest) -> Self {
        Self::new(Topic::NginxConfigApply, Payload::ApplyConfig(request))
    }

    pub fn apply_config_response(response: ApplyConfigResponse) -> Self {
        Self::new(Topic::NginxConfigApplyResponse, Payload::ApplyConfigResponse(response))
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }
}
