//! Configuration: CLI/env server options plus the YAML gateway file.
//!
//! The file declares global backends, models (with per-model backends,
//! access levels and rules) and user organizations with API keys and
//! per-model rule overrides. Nullable fields use `Option` throughout so
//! inheritance can distinguish "unset" from "explicitly empty".

use crate::error::ProxyError;
use crate::stages::rewrite::RewritePolicy;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Server command-line options.
#[derive(Debug, Clone, Parser)]
#[command(name = "octollm-server")]
#[command(about = "LLM gateway: policy-driven reverse proxy for chat and messages APIs")]
#[command(version)]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "OCTOLLM_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Gateway configuration file
    #[arg(short = 'c', long, env = "OCTOLLM_CONFIG", default_value = "./config.yaml")]
    pub config: String,

    /// Load-balancer retry window in seconds
    #[arg(long, env = "OCTOLLM_RETRY_TIMEOUT_SECS", default_value = "5")]
    pub retry_timeout_secs: u64,

    /// Load-balancer maximum retry count
    #[arg(long, env = "OCTOLLM_RETRY_MAX_COUNT", default_value = "10")]
    pub retry_max_count: u32,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

/// Root of the YAML configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Named backend descriptors referenced via `use`.
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    /// Organization name to org descriptor.
    #[serde(default)]
    pub users: HashMap<String, UserOrgConfig>,
}

impl ConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ProxyError::Config(format!("failed to read config file {}: {err}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        serde_yaml::from_str(raw)
            .map_err(|err| ProxyError::Config(format!("failed to parse config file: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelAccess {
    /// Reachable without authentication.
    #[default]
    Public,
    /// Requires a resolved organization.
    Internal,
    /// Requires an explicit per-org entry for the model.
    Private,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub access: ModelAccess,
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
    #[serde(default)]
    pub default_rules: Vec<RuleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_org_limits: Option<LimitsConfig>,

    // Rewrites effective for every backend of the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_rewrites: Option<RewritePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_rewrites: Option<RewritePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_chunk_rewrites: Option<RewritePolicy>,
}

/// Backend descriptor. `use` names a global descriptor to inherit from;
/// non-`None` fields here override it, `extra_headers` deep-merge, and
/// rewrite policies combine through [`RewritePolicy::merge`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default, rename = "use", skip_serializing_if = "String::is_empty")]
    pub use_backend: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key_as_bearer: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path_chat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path_messages: Option<String>,
    /// Accepted for file compatibility; the vertex format is not routed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path_vertex: Option<String>,
    /// `from_chat` marks a chat-only backend that serves messages-format
    /// clients through the converter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert_to_messages: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_rewrites: Option<RewritePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_rewrites: Option<RewritePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_chunk_rewrites: Option<RewritePolicy>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "match", skip_serializing_if = "String::is_empty")]
    pub match_expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<DenyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_weights: Option<HashMap<String, i64>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DenyConfig {
    #[serde(default)]
    pub reason_text: String,
    #[serde(default)]
    pub http_status_code: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UserOrgConfig {
    /// User name to API key.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    #[serde(default)]
    pub models: HashMap<String, UserModelConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UserModelConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_limits: Option<LimitsConfig>,
}

/// Quota knobs, parsed for file compatibility. Rate limiting is out of
/// scope and the values are not enforced.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub tpm: u64,
    #[serde(default)]
    pub rpm: u64,
    #[serde(default)]
    pub tpd: u64,
    #[serde(default)]
    pub rpd: u64,
    #[serde(default)]
    pub concurrency: u64,
    #[serde(default)]
    pub deny_when_exceeding: bool,
}
