//! Terminal refusal stage.

use crate::core::stage::Stage;
use crate::core::{Request, StageResult};
use crate::error::ProxyError;
use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;

/// Always fails with a configured status and reason, rendered as a
/// synthetic upstream response so the client sees it verbatim.
pub struct DenyStage {
    status: StatusCode,
    reason: Bytes,
}

impl DenyStage {
    pub fn new(status: StatusCode, reason: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Stage for DenyStage {
    async fn process(&self, _req: &mut Request) -> StageResult {
        Err(ProxyError::UpstreamResponse {
            status: self.status,
            headers: HeaderMap::new(),
            body: self.reason.clone(),
        })
    }
}
