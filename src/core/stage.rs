//! The processing-stage contract.

use crate::core::{Request, StageResult};
use async_trait::async_trait;
use std::sync::Arc;

/// One step of the request pipeline. Stages are long-lived,
/// concurrency-safe, and compose by holding their downstream as an
/// `Arc<dyn Stage>`; the chain shape is fixed at composition time.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn process(&self, req: &mut Request) -> StageResult;
}

pub type SharedStage = Arc<dyn Stage>;
