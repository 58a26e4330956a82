//! correlation id별 단일 사용 응답 슬롯 테이블
//!
//! 버스 디스패처 쪽에서 `deliver`로 한 번 쓰고, HTTP 핸들러 쪽에서 `wait`로 한 번
//! 읽습니다. 대기자가 사라지면(타임아웃 포함) 항목도 함께 제거되므로 늦게 도착한
//! 응답은 버려집니다.

use crate::bus::ApplyConfigResponse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

type Slots = Arc<Mutex<HashMap<Uuid, oneshot::Sender<ApplyConfigResponse>>>>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PendingError {
    #[error("deadline elapsed before a response arrived")]
    TimedOut,

    #[error("response slot was dropped")]
    Abandoned,
}

#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Slots,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, timeout: Duration) -> PendingRequest {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(correlation_id, tx);
        PendingRequest {
            correlation_id,
            deadline: Instant::now() + timeout,
            rx,
            slots: self.slots.clone(),
        }
    }

    /// 응답을 대기자에게 넘깁니다. 대기자가 없으면 `false`.
    pub fn deliver(&self, response: ApplyConfigResponse) -> bool {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&response.correlation_id);
        match slot {
            Some(tx) => {
                let id = response.correlation_id;
                let delivered = tx.send(response).is_ok();
                if !delivered {
                    tracing::debug!("Waiter for {} went away before delivery", id);
                }
                delivered
            }
            None => {
                tracing::debug!(
                    "Discarding response for unknown or expired correlation id {}",
                    response.correlation_id
                );
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct PendingRequest {
    correlation_id: Uuid,
    deadline: Instant,
    rx: oneshot::Receiver<ApplyConfigResponse>,
    slots: Slots,
}

impl PendingRequest {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// 응답 도착과 마감 시각 중 먼저 오는 쪽으로 끝납니다.
    pub async fn wait(mut self) -> Result<ApplyConfigResponse, PendingError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(PendingError::Abandoned),
            Err(_) => Err(PendingError::TimedOut),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.correlation_id);
    }
}
