//! Rule composer: builds and caches the per-(org, model) root stage.
//!
//! Access control first, then the rule list (org-specific rules ahead of
//! model defaults), the default pool over `default:`-prefixed backends,
//! one stage per rule, and a rule engine closed by a constant-true
//! fallback rule. Results are cached until the next configuration load.

use crate::composer::model_repo::ModelRepo;
use crate::config::{ConfigFile, ModelAccess, RuleConfig};
use crate::core::stage::{SharedStage, Stage};
use crate::core::{ApiFormat, Request, StageResult};
use crate::error::ProxyError;
use crate::schemas::chat::ChatCompletionRequest;
use crate::schemas::messages::MessagesRequest;
use crate::stages::deny::DenyStage;
use crate::stages::load_balancer::{BackendItem, WeightedRoundRobin};
use crate::stages::matcher::{ExprMatcher, FixedMatcher, Matcher, SimpleFeatureExtractor};
use crate::stages::rule_engine::{Rule, RuleEngine, FALLBACK_RULE_NAME};
use async_trait::async_trait;
use axum::http::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// Weight given to every member of the default pool.
const DEFAULT_POOL_WEIGHT: i64 = 100;

/// Prefix marking a backend as part of the default pool.
pub const DEFAULT_POOL_PREFIX: &str = "default:";

pub struct RuleComposer {
    repo: Arc<ModelRepo>,
    conf: RwLock<Arc<ConfigFile>>,
    retry_timeout: Duration,
    retry_max_count: u32,
    cache: RwLock<HashMap<(String, String), SharedStage>>,
}

impl RuleComposer {
    pub fn new(repo: Arc<ModelRepo>, retry_timeout: Duration, retry_max_count: u32) -> Self {
        Self {
            repo,
            conf: RwLock::new(Arc::new(ConfigFile::default())),
            retry_timeout,
            retry_max_count,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Swap in a new configuration and invalidate the cache wholesale.
    pub fn update_from_config(&self, conf: Arc<ConfigFile>) {
        *self.conf.write().expect("composer lock poisoned") = conf;
        self.cache
            .write()
            .expect("composer lock poisoned")
            .clear();
    }

    /// Root stage for (org, model), built on first request. Concurrent
    /// builders converge on one instance through a double-checked insert.
    pub fn stage_for(&self, org: &str, model: &str) -> Result<SharedStage, ProxyError> {
        let key = (org.to_string(), model.to_string());
        {
            let cache = self.cache.read().expect("composer lock poisoned");
            if let Some(stage) = cache.get(&key) {
                return Ok(stage.clone());
            }
        }

        let conf = self.conf.read().expect("composer lock poisoned").clone();
        let stage = self.build(&conf, org, model)?;

        let mut cache = self.cache.write().expect("composer lock poisoned");
        let stage = cache.entry(key).or_insert(stage).clone();
        Ok(stage)
    }

    fn build(
        &self,
        conf: &ConfigFile,
        org: &str,
        model: &str,
    ) -> Result<SharedStage, ProxyError> {
        let model_conf = conf.models.get(model).ok_or_else(|| {
            ProxyError::handler(StatusCode::NOT_FOUND, "Model Not Found")
        })?;

        let org_model_conf = if org.is_empty() {
            None
        } else {
            conf.users
                .get(org)
                .and_then(|org_conf| org_conf.models.get(model))
        };

        match model_conf.access {
            ModelAccess::Public => {}
            ModelAccess::Internal => {
                if org.is_empty() {
                    return Err(ProxyError::handler(
                        StatusCode::UNAUTHORIZED,
                        "Unauthorized",
                    ));
                }
            }
            ModelAccess::Private => {
                if org_model_conf.is_none() {
                    return Err(ProxyError::handler(
                        StatusCode::UNAUTHORIZED,
                        "Unauthorized",
                    ));
                }
            }
        }

        let mut rules: Vec<&RuleConfig> = Vec::new();
        if let Some(org_model) = org_model_conf {
            rules.extend(org_model.rules.iter());
        }
        rules.extend(model_conf.default_rules.iter());

        let default_pool = self.build_default_pool(model);
        if rules.is_empty() {
            return default_pool;
        }
        let default_pool = default_pool.map_err(|err| {
            warn!(model, error = %err, "failed to build default pool");
            err
        })?;

        let mut chain = Vec::with_capacity(rules.len() + 1);
        for rule_conf in rules {
            chain.push(self.build_rule(rule_conf, model, default_pool.clone())?);
        }
        chain.push(Rule {
            name: FALLBACK_RULE_NAME.to_string(),
            matcher: Arc::new(FixedMatcher(true)),
            stage: default_pool,
        });

        Ok(Arc::new(RuleEngine::new(chain)))
    }

    /// Load balancer over the `default:` backends at equal weight.
    fn build_default_pool(&self, model: &str) -> Result<SharedStage, ProxyError> {
        let mut items = Vec::new();
        for name in self.repo.backend_names(model) {
            if !name.starts_with(DEFAULT_POOL_PREFIX) {
                continue;
            }
            match self.repo.stage(model, &name) {
                Ok(stage) => items.push(BackendItem {
                    name,
                    weight: DEFAULT_POOL_WEIGHT,
                    stage,
                }),
                Err(err) => {
                    warn!(model, backend = %name, error = %err, "failed to build backend stage");
                }
            }
        }
        if items.is_empty() {
            return Err(ProxyError::Internal(format!(
                "no default backend found for model {model}"
            )));
        }
        let lb = WeightedRoundRobin::new(items, self.retry_timeout, self.retry_max_count)?;
        Ok(Arc::new(lb))
    }

    fn build_rule(
        &self,
        rule_conf: &RuleConfig,
        model: &str,
        default_pool: SharedStage,
    ) -> Result<Rule, ProxyError> {
        let matcher: Arc<dyn Matcher> = if rule_conf.match_expr.is_empty() {
            Arc::new(FixedMatcher(true))
        } else {
            Arc::new(ExprMatcher::new(
                rule_conf.match_expr.clone(),
                Some(SimpleFeatureExtractor::default()),
            ))
        };

        if let Some(deny) = &rule_conf.deny {
            let status = StatusCode::from_u16(deny.http_status_code)
                .unwrap_or(StatusCode::FORBIDDEN);
            return Ok(Rule {
                name: rule_conf.name.clone(),
                matcher,
                stage: Arc::new(DenyStage::new(status, deny.reason_text.clone())),
            });
        }

        let mut stage = default_pool;
        if let Some(weights) = &rule_conf.forward_weights {
            let mut items = Vec::new();
            for (backend, weight) in weights {
                match self.repo.stage(model, backend) {
                    Ok(backend_stage) => items.push(BackendItem {
                        name: backend.clone(),
                        weight: *weight,
                        stage: backend_stage,
                    }),
                    Err(err) => {
                        warn!(model, backend, error = %err, "failed to build backend stage");
                    }
                }
            }
            if !items.is_empty() {
                stage = Arc::new(WeightedRoundRobin::new(
                    items,
                    self.retry_timeout,
                    self.retry_max_count,
                )?);
            }
        }

        Ok(Rule {
            name: rule_conf.name.clone(),
            matcher,
            stage,
        })
    }
}

/// Entry stage handed to the HTTP surface: resolves the model (lifting
/// it from the body when the route carries none) and dispatches to the
/// composed root stage for (org, model).
pub struct GatewayStage {
    composer: Arc<RuleComposer>,
    org: String,
    model: Option<String>,
}

impl GatewayStage {
    pub fn new(composer: Arc<RuleComposer>, org: impl Into<String>, model: Option<String>) -> Self {
        Self {
            composer,
            org: org.into(),
            model,
        }
    }
}

#[async_trait]
impl Stage for GatewayStage {
    async fn process(&self, req: &mut Request) -> StageResult {
        let model = match &self.model {
            Some(model) => model.clone(),
            None => lift_model(req).await?,
        };
        let stage = self.composer.stage_for(&self.org, &model)?;
        stage.process(req).await
    }
}

/// Pull the model name out of the request body.
async fn lift_model(req: &mut Request) -> Result<String, ProxyError> {
    let model = match req.format {
        ApiFormat::ChatCompletions => req
            .body
            .parsed_as::<ChatCompletionRequest>()
            .await?
            .model
            .clone()
            .unwrap_or_default(),
        ApiFormat::Messages => req.body.parsed_as::<MessagesRequest>().await?.model.clone(),
        ApiFormat::Unknown => String::new(),
    };
    if model.is_empty() {
        return Err(ProxyError::handler(
            StatusCode::BAD_REQUEST,
            "model is required",
        ));
    }
    Ok(model)
}
