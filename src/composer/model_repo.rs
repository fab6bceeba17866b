//! Model repository: resolved backend descriptors and their stages.
//!
//! Resolution applies `use` inheritance (field-wise override,
//! `extra_headers` deep-merge, rewrite-policy merge) and folds in
//! model-level rewrite policies. Backend stages are built lazily, cached
//! per (model, backend), and assembled outer to inner as
//! rewrite → add-header → format-converter → HTTP client.

use crate::composer::client_pool::ProxyClientPool;
use crate::config::{BackendConfig, ConfigFile};
use crate::core::stage::SharedStage;
use crate::core::ApiFormat;
use crate::error::ProxyError;
use crate::stages::add_header::AddHeaderStage;
use crate::stages::convert::{FormatRouteStage, MessagesToChatStage};
use crate::stages::http_client::{general_endpoint, EndpointConfig};
use crate::stages::rewrite::{RewritePolicy, RewriteStage};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

#[derive(Default)]
struct RepoInner {
    /// model name -> backend name -> resolved descriptor
    backends: HashMap<String, HashMap<String, BackendConfig>>,
    /// (model name, backend name) -> built stage
    stages: HashMap<(String, String), SharedStage>,
}

pub struct ModelRepo {
    inner: RwLock<RepoInner>,
    pool: Arc<ProxyClientPool>,
}

impl Default for ModelRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRepo {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RepoInner::default()),
            pool: Arc::new(ProxyClientPool::new()),
        }
    }

    /// Replace the backend map from configuration and drop every cached
    /// stage.
    pub fn update_from_config(&self, conf: &ConfigFile) {
        let mut resolved: HashMap<String, HashMap<String, BackendConfig>> = HashMap::new();
        for (model_name, model) in &conf.models {
            let entry = resolved.entry(model_name.clone()).or_default();
            for (backend_name, backend) in &model.backends {
                let mut descriptor = resolve_backend(conf, backend);
                descriptor.request_rewrites = RewritePolicy::merge(
                    model.request_rewrites.as_ref(),
                    descriptor.request_rewrites.as_ref(),
                );
                descriptor.response_rewrites = RewritePolicy::merge(
                    model.response_rewrites.as_ref(),
                    descriptor.response_rewrites.as_ref(),
                );
                descriptor.stream_chunk_rewrites = RewritePolicy::merge(
                    model.stream_chunk_rewrites.as_ref(),
                    descriptor.stream_chunk_rewrites.as_ref(),
                );
                entry.insert(backend_name.clone(), descriptor);
            }
        }

        let mut inner = self.inner.write().expect("model repo lock poisoned");
        inner.backends = resolved;
        inner.stages.clear();
    }

    pub fn backend_names(&self, model: &str) -> Vec<String> {
        let inner = self.inner.read().expect("model repo lock poisoned");
        inner
            .backends
            .get(model)
            .map(|backends| backends.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stage for (model, backend), built on first use. Concurrent
    /// builders for the same key converge on one instance.
    pub fn stage(&self, model: &str, backend: &str) -> Result<SharedStage, ProxyError> {
        let key = (model.to_string(), backend.to_string());
        {
            let inner = self.inner.read().expect("model repo lock poisoned");
            if let Some(stage) = inner.stages.get(&key) {
                return Ok(stage.clone());
            }
        }

        let mut inner = self.inner.write().expect("model repo lock poisoned");
        if let Some(stage) = inner.stages.get(&key) {
            return Ok(stage.clone());
        }
        let descriptor = inner
            .backends
            .get(model)
            .and_then(|backends| backends.get(backend))
            .cloned()
            .ok_or_else(|| {
                ProxyError::Config(format!("model backend ({model}/{backend}) not found"))
            })?;
        let stage = self.build_backend_stage(&descriptor)?;
        inner.stages.insert(key, stage.clone());
        Ok(stage)
    }

    fn build_backend_stage(&self, b: &BackendConfig) -> Result<SharedStage, ProxyError> {
        let mut paths = HashMap::new();
        if let Some(path) = &b.url_path_chat {
            paths.insert(ApiFormat::ChatCompletions, path.clone());
        }
        if let Some(path) = &b.url_path_messages {
            paths.insert(ApiFormat::Messages, path.clone());
        }
        if paths.is_empty() {
            return Err(ProxyError::Config(
                "backend must specify url_path_chat or url_path_messages".to_string(),
            ));
        }

        let conf = EndpointConfig {
            base_url: b.base_url.clone(),
            paths,
            api_key: b.api_key.clone().unwrap_or_default(),
            anthropic_api_key_as_bearer: b.anthropic_api_key_as_bearer.unwrap_or(false),
        };
        let client = self.pool.client(b.http_proxy.as_deref().unwrap_or(""));
        let mut stage: SharedStage = Arc::new(general_endpoint(conf, client));

        match b.convert_to_messages.as_deref() {
            Some("from_chat") => {
                let converter = Arc::new(MessagesToChatStage::new(stage.clone()));
                stage = Arc::new(FormatRouteStage::new(converter, stage));
            }
            Some(other) => {
                warn!(convert_to_messages = other, "unknown converter, ignored");
            }
            None => {}
        }

        if let Some(headers) = &b.extra_headers {
            if !headers.is_empty() {
                stage = Arc::new(AddHeaderStage::new(headers, stage)?);
            }
        }

        if b.request_rewrites.is_some()
            || b.response_rewrites.is_some()
            || b.stream_chunk_rewrites.is_some()
        {
            stage = Arc::new(RewriteStage::new(
                stage,
                b.request_rewrites.clone(),
                b.response_rewrites.clone(),
                b.stream_chunk_rewrites.clone(),
            ));
        }
        Ok(stage)
    }
}

/// Apply `use` inheritance: start from the referenced global descriptor
/// and overlay the model-local override field by field.
fn resolve_backend(conf: &ConfigFile, backend: &BackendConfig) -> BackendConfig {
    let mut resolved = if backend.use_backend.is_empty() {
        BackendConfig::default()
    } else {
        match conf.backends.get(&backend.use_backend) {
            Some(global) => global.clone(),
            None => {
                warn!(name = %backend.use_backend, "referenced global backend not found");
                BackendConfig::default()
            }
        }
    };
    resolved.use_backend = String::new();

    if !backend.base_url.is_empty() {
        resolved.base_url = backend.base_url.clone();
    }
    if backend.http_proxy.is_some() {
        resolved.http_proxy = backend.http_proxy.clone();
    }
    if backend.api_key.is_some() {
        resolved.api_key = backend.api_key.clone();
    }
    if backend.anthropic_api_key_as_bearer.is_some() {
        resolved.anthropic_api_key_as_bearer = backend.anthropic_api_key_as_bearer;
    }
    if let Some(headers) = &backend.extra_headers {
        let merged = resolved.extra_headers.get_or_insert_with(HashMap::new);
        for (name, value) in headers {
            merged.insert(name.clone(), value.clone());
        }
    }
    if backend.url_path_chat.is_some() {
        resolved.url_path_chat = backend.url_path_chat.clone();
    }
    if backend.url_path_messages.is_some() {
        resolved.url_path_messages = backend.url_path_messages.clone();
    }
    if backend.url_path_vertex.is_some() {
        resolved.url_path_vertex = backend.url_path_vertex.clone();
    }
    if backend.convert_to_messages.is_some() {
        resolved.convert_to_messages = backend.convert_to_messages.clone();
    }

    resolved.request_rewrites = RewritePolicy::merge(
        resolved.request_rewrites.as_ref(),
        backend.request_rewrites.as_ref(),
    );
    resolved.response_rewrites = RewritePolicy::merge(
        resolved.response_rewrites.as_ref(),
        backend.response_rewrites.as_ref(),
    );
    resolved.stream_chunk_rewrites = RewritePolicy::merge(
        resolved.stream_chunk_rewrites.as_ref(),
        backend.stream_chunk_rewrites.as_ref(),
    );

    resolved
}
