//! Request matchers for the rule engine.
//!
//! [`ExprMatcher`] evaluates a CEL expression against the request. The
//! environment exposes `RawReq` (the body as a generic JSON tree),
//! `Features` (derived values from [`SimpleFeatureExtractor`]), and
//! `CtxValue(key)` for trace-metadata lookup. Programs compile once per
//! matcher; a compile error makes the matcher permanently falsy.

use crate::core::Request;
use crate::schemas::chat::ChatCompletionRequest;
use async_trait::async_trait;
use cel_interpreter::objects::Key;
use cel_interpreter::{Context, Program, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

#[async_trait]
pub trait Matcher: Send + Sync {
    async fn matches(&self, req: &mut Request) -> bool;
}

/// Constant matcher; `FixedMatcher(true)` backs the synthetic fallback
/// rule.
pub struct FixedMatcher(pub bool);

#[async_trait]
impl Matcher for FixedMatcher {
    async fn matches(&self, _req: &mut Request) -> bool {
        self.0
    }
}

pub struct ExprMatcher {
    code: String,
    extractor: Option<SimpleFeatureExtractor>,
    compiled: OnceLock<Option<Program>>,
}

impl ExprMatcher {
    pub fn new(code: impl Into<String>, extractor: Option<SimpleFeatureExtractor>) -> Self {
        Self {
            code: code.into(),
            extractor,
            compiled: OnceLock::new(),
        }
    }

    fn program(&self) -> Option<&Program> {
        self.compiled
            .get_or_init(|| match Program::compile(&self.code) {
                Ok(program) => Some(program),
                Err(err) => {
                    warn!(code = %self.code, error = %err, "match expression failed to compile");
                    None
                }
            })
            .as_ref()
    }
}

#[async_trait]
impl Matcher for ExprMatcher {
    async fn matches(&self, req: &mut Request) -> bool {
        let Some(program) = self.program() else {
            return false;
        };

        let raw_req: serde_json::Value = match req.body.bytes().await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
            Err(err) => {
                warn!(error = %err, "failed to read request body for matching");
                serde_json::Value::Null
            }
        };
        let features = match &self.extractor {
            Some(extractor) => extractor.features(req).await,
            None => HashMap::new(),
        };

        let mut ctx = Context::default();
        ctx.add_variable_from_value("RawReq", json_to_cel(&raw_req));
        ctx.add_variable_from_value(
            "Features",
            json_to_cel(&serde_json::Value::Object(features.into_iter().collect())),
        );
        let trace = req.context().trace().clone();
        ctx.add_function("CtxValue", move |key: Arc<String>| -> String {
            trace.get(key.as_str()).cloned().unwrap_or_default()
        });

        let output = match program.execute(&ctx) {
            Ok(output) => output,
            Err(err) => {
                warn!(code = %self.code, error = %err, "match expression failed to run");
                return false;
            }
        };

        match output {
            Value::Bool(b) => b,
            Value::Int(i) => i != 0,
            Value::UInt(u) => u != 0,
            Value::Float(f) => f != 0.0,
            other => {
                warn!(code = %self.code, result = ?other, "match expression returned non-boolean");
                false
            }
        }
    }
}

/// Convert a JSON tree to a CEL value.
pub fn json_to_cel(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::String(Arc::new(s.clone())),
        serde_json::Value::Array(items) => {
            Value::List(Arc::new(items.iter().map(json_to_cel).collect()))
        }
        serde_json::Value::Object(map) => {
            let entries: HashMap<Key, Value> = map
                .iter()
                .map(|(k, v)| (Key::String(Arc::new(k.clone())), json_to_cel(v)))
                .collect();
            Value::Map(entries.into())
        }
    }
}

/// Derives matcher features from a chat-format request: total prompt
/// text length plus prefix/suffix hashes of the first message at the
/// configured lengths. Non-chat bodies yield no features.
#[derive(Debug, Clone)]
pub struct SimpleFeatureExtractor {
    pub prefix_hash_len: Vec<usize>,
    pub suffix_hash_len: Vec<usize>,
}

impl Default for SimpleFeatureExtractor {
    fn default() -> Self {
        Self {
            prefix_hash_len: vec![20],
            suffix_hash_len: vec![20],
        }
    }
}

impl SimpleFeatureExtractor {
    pub async fn features(&self, req: &mut Request) -> HashMap<String, serde_json::Value> {
        let chat = match req.body.parsed_as::<ChatCompletionRequest>().await {
            Ok(chat) => chat,
            Err(err) => {
                debug!(error = %err, "feature extraction skipped: not a chat request");
                return HashMap::new();
            }
        };

        let mut features = HashMap::new();
        let prompt_len: usize = chat
            .messages
            .iter()
            .map(|m| m.combined_text().chars().count())
            .sum();
        features.insert("promptTextLen".to_string(), prompt_len.into());

        let model = chat.model.clone().unwrap_or_default();
        let first_text = chat
            .messages
            .first()
            .map(|m| m.combined_text())
            .unwrap_or_default();
        let first_text = first_text.trim();
        for &len in &self.prefix_hash_len {
            let prefix: String = first_text.chars().take(len).collect();
            features.insert(format!("prefix{len}"), affinity_hash(&model, &prefix).into());
        }
        for &len in &self.suffix_hash_len {
            let chars: Vec<char> = first_text.chars().collect();
            let start = chars.len().saturating_sub(len);
            let suffix: String = chars[start..].iter().collect();
            features.insert(format!("suffix{len}"), affinity_hash(&model, &suffix).into());
        }
        features
    }
}

/// 8-hex FNV-1a over model name ++ text slice.
fn affinity_hash(model: &str, text: &str) -> String {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET;
    for byte in model.bytes().chain(text.bytes()) {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    format!("{hash:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::body::{Body, JsonParser};
    use crate::core::{ApiFormat, RequestContext};

    fn chat_request(raw: &str) -> Request {
        Request::new(
            ApiFormat::ChatCompletions,
            Body::from_bytes(
                raw.as_bytes().to_vec(),
                Some(JsonParser::<ChatCompletionRequest>::arc()),
            ),
        )
    }

    #[tokio::test]
    async fn expression_sees_raw_request() {
        let matcher = ExprMatcher::new("RawReq.stream == true", None);
        let mut req = chat_request(r#"{"model":"m","messages":[],"stream":true}"#);
        assert!(matcher.matches(&mut req).await);

        let mut req = chat_request(r#"{"model":"m","messages":[]}"#);
        assert!(!matcher.matches(&mut req).await);
    }

    #[tokio::test]
    async fn numeric_results_coerce() {
        let mut req = chat_request(r#"{"messages":[]}"#);
        assert!(ExprMatcher::new("1", None).matches(&mut req).await);
        assert!(!ExprMatcher::new("0", None).matches(&mut req).await);
        // Strings do not coerce.
        assert!(!ExprMatcher::new("'yes'", None).matches(&mut req).await);
    }

    #[tokio::test]
    async fn ternary_form_is_supported() {
        let matcher = ExprMatcher::new("RawReq.model == 'm' ? true : false", None);
        let mut req = chat_request(r#"{"model":"m","messages":[]}"#);
        assert!(matcher.matches(&mut req).await);
    }

    #[tokio::test]
    async fn compile_error_is_permanently_falsy() {
        let matcher = ExprMatcher::new("this ( is not valid", None);
        let mut req = chat_request(r#"{"messages":[]}"#);
        assert!(!matcher.matches(&mut req).await);
        assert!(!matcher.matches(&mut req).await);
    }

    #[tokio::test]
    async fn ctx_value_reads_trace_metadata() {
        let matcher = ExprMatcher::new("CtxValue('org') == 'acme'", None);
        let trace = HashMap::from([("org".to_string(), "acme".to_string())]);
        let mut req = chat_request(r#"{"messages":[]}"#)
            .with_context(RequestContext::new(trace));
        assert!(matcher.matches(&mut req).await);
    }

    #[tokio::test]
    async fn features_expose_prompt_len_and_hashes() {
        let extractor = SimpleFeatureExtractor::default();
        let mut req = chat_request(
            r#"{"model":"m","messages":[
                {"role":"user","content":"hello"},
                {"role":"assistant","content":"world!"}]}"#,
        );
        let features = extractor.features(&mut req).await;
        assert_eq!(features["promptTextLen"], serde_json::json!(11));
        let prefix = features["prefix20"].as_str().unwrap();
        assert_eq!(prefix.len(), 8);
        assert_eq!(prefix, affinity_hash("m", "hello"));
        // Shorter than 20 chars: suffix hash equals prefix hash.
        assert_eq!(features["suffix20"], features["prefix20"]);
    }

    #[tokio::test]
    async fn matcher_can_use_features() {
        let matcher = ExprMatcher::new(
            "Features.promptTextLen > 3",
            Some(SimpleFeatureExtractor::default()),
        );
        let mut req = chat_request(r#"{"model":"m","messages":[{"role":"user","content":"hello"}]}"#);
        assert!(matcher.matches(&mut req).await);
    }

    #[test]
    fn affinity_hash_is_stable() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(affinity_hash("", ""), "811c9dc5");
        assert_eq!(affinity_hash("m", "hello"), affinity_hash("m", "hello"));
        assert_ne!(affinity_hash("m", "hello"), affinity_hash("n", "hello"));
    }
}
