//! Fixed request-header injection.

use crate::core::stage::{SharedStage, Stage};
use crate::core::{Request, StageResult};
use crate::error::ProxyError;
use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use std::collections::HashMap;

/// Sets configured headers on the request, then delegates. No other
/// side effects.
pub struct AddHeaderStage {
    headers: Vec<(HeaderName, HeaderValue)>,
    next: SharedStage,
}

impl AddHeaderStage {
    pub fn new(headers: &HashMap<String, String>, next: SharedStage) -> Result<Self, ProxyError> {
        let mut parsed = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            let name: HeaderName = name
                .parse()
                .map_err(|_| ProxyError::Config(format!("invalid header name {name:?}")))?;
            let value: HeaderValue = value
                .parse()
                .map_err(|_| ProxyError::Config(format!("invalid header value for {name}")))?;
            parsed.push((name, value));
        }
        Ok(Self {
            headers: parsed,
            next,
        })
    }
}

#[async_trait]
impl Stage for AddHeaderStage {
    async fn process(&self, req: &mut Request) -> StageResult {
        for (name, value) in &self.headers {
            req.headers.insert(name.clone(), value.clone());
        }
        self.next.process(req).await
    }
}
