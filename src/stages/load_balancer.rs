//! Smooth weighted round-robin with bounded retry.
//!
//! Each backend carries an accumulator weight; every selection adds the
//! static weight to every accumulator, picks the largest, and subtracts
//! the total from the winner. Accumulators start at a random point in
//! `[0, weight]` so freshly built replicas do not move in lockstep.

use crate::core::stage::{SharedStage, Stage};
use crate::core::{Request, StageResult};
use crate::error::ProxyError;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Weight applied when every configured weight is zero.
const EQUAL_WEIGHT: i64 = 100;

pub struct BackendItem {
    pub name: String,
    pub weight: i64,
    pub stage: SharedStage,
}

struct WrrBackend {
    name: String,
    weight: i64,
    current_weight: i64,
    stage: SharedStage,
}

pub struct WeightedRoundRobin {
    backends: Mutex<Vec<WrrBackend>>,
    retry_timeout: Duration,
    retry_max_count: u32,
}

impl WeightedRoundRobin {
    pub fn new(
        backends: Vec<BackendItem>,
        retry_timeout: Duration,
        retry_max_count: u32,
    ) -> Result<Self, ProxyError> {
        if backends.is_empty() {
            return Err(ProxyError::Config(
                "load balancer needs at least one backend".to_string(),
            ));
        }
        if let Some(bad) = backends.iter().find(|b| b.weight < 0) {
            return Err(ProxyError::Config(format!(
                "backend {} has negative weight {}",
                bad.name, bad.weight
            )));
        }

        let all_zero = backends.iter().all(|b| b.weight == 0);
        let mut rng = rand::thread_rng();
        let backends = backends
            .into_iter()
            .map(|item| {
                let weight = if all_zero { EQUAL_WEIGHT } else { item.weight };
                WrrBackend {
                    name: item.name,
                    weight,
                    current_weight: rng.gen_range(0..=weight),
                    stage: item.stage,
                }
            })
            .collect();

        Ok(Self {
            backends: Mutex::new(backends),
            retry_timeout,
            retry_max_count,
        })
    }

    /// One smooth-WRR selection step.
    fn next_backend(&self) -> (String, SharedStage) {
        let mut backends = self.backends.lock().expect("wrr lock poisoned");
        let mut total = 0;
        let mut winner: Option<usize> = None;
        let mut max_weight = i64::MIN;
        for (idx, backend) in backends.iter_mut().enumerate() {
            backend.current_weight += backend.weight;
            total += backend.weight;
            if backend.current_weight > max_weight {
                max_weight = backend.current_weight;
                winner = Some(idx);
            }
        }
        let winner = &mut backends[winner.expect("at least one backend")];
        winner.current_weight -= total;
        (winner.name.clone(), winner.stage.clone())
    }
}

#[async_trait]
impl Stage for WeightedRoundRobin {
    async fn process(&self, req: &mut Request) -> StageResult {
        let start = Instant::now();
        let mut retries = 0;
        loop {
            let (name, stage) = self.next_backend();
            info!(backend = %name, "load balancer selected backend");
            let result = stage.process(req).await;
            let err = match result {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };

            retries += 1;
            if start.elapsed() >= self.retry_timeout {
                warn!(
                    timeout = ?self.retry_timeout,
                    "retry period reached, returning last error"
                );
                return Err(err);
            }
            if retries >= self.retry_max_count {
                warn!(
                    max = self.retry_max_count,
                    "retry count reached, returning last error"
                );
                return Err(err);
            }
            info!(retries, elapsed = ?start.elapsed(), "retrying after backend failure");
        }
    }
}
