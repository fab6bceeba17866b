//! Ordered rule chain with first-match-wins dispatch.

use crate::core::stage::{SharedStage, Stage};
use crate::core::{Request, StageResult};
use crate::error::ProxyError;
use crate::stages::matcher::Matcher;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Name of the synthetic rule the composer appends to every chain.
pub const FALLBACK_RULE_NAME: &str = "fallback";

pub struct Rule {
    pub name: String,
    pub matcher: Arc<dyn Matcher>,
    pub stage: SharedStage,
}

pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl Stage for RuleEngine {
    async fn process(&self, req: &mut Request) -> StageResult {
        for rule in &self.rules {
            debug!(rule = %rule.name, "matching rule");
            if !rule.matcher.matches(req).await {
                continue;
            }
            debug!(rule = %rule.name, "rule matched, executing");
            match rule.stage.process(req).await {
                Ok(resp) => return Ok(resp),
                Err(ProxyError::RuleContinue) => {
                    debug!(rule = %rule.name, "rule asked to continue");
                    continue;
                }
                Err(err) => {
                    error!(rule = %rule.name, error = %err, "rule execution failed");
                    return Err(err);
                }
            }
        }
        Err(ProxyError::NoRuleMatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::body::Body;
    use crate::core::{ApiFormat, Response};
    use crate::stages::matcher::FixedMatcher;
    use axum::http::{HeaderMap, StatusCode};

    struct NamedStage {
        name: &'static str,
        result: fn() -> StageResult,
    }

    #[async_trait]
    impl Stage for NamedStage {
        async fn process(&self, _req: &mut Request) -> StageResult {
            let mut resp = (self.result)()?;
            resp.headers
                .insert("x-rule", self.name.parse().expect("ascii"));
            Ok(resp)
        }
    }

    fn ok_response() -> StageResult {
        Ok(Response::buffered(
            StatusCode::OK,
            HeaderMap::new(),
            Body::from_bytes(b"{}".as_slice(), None),
        ))
    }

    fn rule(name: &'static str, matched: bool, result: fn() -> StageResult) -> Rule {
        Rule {
            name: name.to_string(),
            matcher: Arc::new(FixedMatcher(matched)),
            stage: Arc::new(NamedStage { name, result }),
        }
    }

    fn req() -> Request {
        Request::new(
            ApiFormat::ChatCompletions,
            Body::from_bytes(b"{}".as_slice(), None),
        )
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let engine = RuleEngine::new(vec![
            rule("r1", false, ok_response),
            rule("r2", true, ok_response),
            rule("r3", true, ok_response),
        ]);
        let resp = engine.process(&mut req()).await.unwrap();
        assert_eq!(resp.headers["x-rule"], "r2");
    }

    #[tokio::test]
    async fn continue_error_falls_through() {
        let engine = RuleEngine::new(vec![
            rule("r1", true, || Err(ProxyError::RuleContinue)),
            rule("r2", true, ok_response),
        ]);
        let resp = engine.process(&mut req()).await.unwrap();
        assert_eq!(resp.headers["x-rule"], "r2");
    }

    #[tokio::test]
    async fn other_errors_surface() {
        let engine = RuleEngine::new(vec![
            rule("r1", true, || {
                Err(ProxyError::UpstreamTransport("boom".into()))
            }),
            rule("r2", true, ok_response),
        ]);
        assert!(matches!(
            engine.process(&mut req()).await,
            Err(ProxyError::UpstreamTransport(_))
        ));
    }

    #[tokio::test]
    async fn exhausted_chain_reports_no_match() {
        let engine = RuleEngine::new(vec![rule("r1", false, ok_response)]);
        assert!(matches!(
            engine.process(&mut req()).await,
            Err(ProxyError::NoRuleMatched)
        ));
    }
}
