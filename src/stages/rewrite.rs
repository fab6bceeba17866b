//! Declarative JSON rewriting.
//!
//! A [`RewritePolicy`] names keys to remove, keys to set to literal
//! values, and keys to set from a compiled expression. The stage applies
//! up to three policies at the three positions a payload passes through:
//! the request body, the buffered response body, and each stream chunk.
//! Application order is fixed: remove, then set, then set-by-expression.

use crate::core::stage::{SharedStage, Stage};
use crate::core::{Chunk, ChunkStream, Request, ResponsePayload, StageResult};
use async_trait::async_trait;
use cel_interpreter::{Context, Program};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mutations to apply to a JSON document. Policies merge associatively:
/// later wins for `set_keys` and `set_keys_by_expr`, `remove_keys`
/// appends.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RewritePolicy {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set_keys: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set_keys_by_expr: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_keys: Vec<String>,
}

impl RewritePolicy {
    pub fn is_empty(&self) -> bool {
        self.set_keys.is_empty() && self.set_keys_by_expr.is_empty() && self.remove_keys.is_empty()
    }

    /// Merge two optional policies; `other` wins on key conflicts.
    pub fn merge(
        base: Option<&RewritePolicy>,
        other: Option<&RewritePolicy>,
    ) -> Option<RewritePolicy> {
        match (base, other) {
            (None, None) => None,
            (Some(p), None) => Some(p.clone()),
            (None, Some(p)) => Some(p.clone()),
            (Some(base), Some(other)) => {
                let mut merged = base.clone();
                merged
                    .set_keys
                    .extend(other.set_keys.iter().map(|(k, v)| (k.clone(), v.clone())));
                merged.set_keys_by_expr.extend(
                    other
                        .set_keys_by_expr
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
                merged.remove_keys.extend(other.remove_keys.iter().cloned());
                Some(merged)
            }
        }
    }
}

/// Set a dot-path key, creating intermediate objects. Numeric segments
/// index arrays; an index one past the end appends.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    set_segments(root, &segments, value);
}

fn set_segments(node: &mut Value, segments: &[&str], value: Value) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };

    if let Ok(index) = head.parse::<usize>() {
        if !node.is_array() {
            *node = Value::Array(Vec::new());
        }
        let arr = node.as_array_mut().expect("array ensured above");
        while arr.len() <= index {
            arr.push(Value::Null);
        }
        if rest.is_empty() {
            arr[index] = value;
        } else {
            set_segments(&mut arr[index], rest, value);
        }
        return;
    }

    if !node.is_object() {
        *node = Value::Object(serde_json::Map::new());
    }
    let map = node.as_object_mut().expect("object ensured above");
    if rest.is_empty() {
        map.insert((*head).to_string(), value);
        return;
    }
    let child = map.entry((*head).to_string()).or_insert(Value::Null);
    set_segments(child, rest, value);
}

/// Remove a dot-path key. Missing segments are a no-op.
pub fn remove_path(root: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    remove_segments(root, &segments);
}

fn remove_segments(node: &mut Value, segments: &[&str]) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };

    if rest.is_empty() {
        match (head.parse::<usize>(), node) {
            (Ok(index), Value::Array(arr)) => {
                if index < arr.len() {
                    arr.remove(index);
                }
            }
            (_, Value::Object(map)) => {
                map.remove(*head);
            }
            _ => {}
        }
        return;
    }

    let child = match (head.parse::<usize>(), node) {
        (Ok(index), Value::Array(arr)) => arr.get_mut(index),
        (_, Value::Object(map)) => map.get_mut(*head),
        _ => None,
    };
    if let Some(child) = child {
        remove_segments(child, rest);
    }
}

/// A policy with its expressions compiled once. A compile failure
/// permanently skips that key (logged).
pub struct JsonRewriter {
    policy: RewritePolicy,
    programs: HashMap<String, Program>,
}

impl JsonRewriter {
    pub fn new(policy: RewritePolicy) -> Self {
        let mut programs = HashMap::new();
        for (key, code) in &policy.set_keys_by_expr {
            match Program::compile(code) {
                Ok(program) => {
                    programs.insert(key.clone(), program);
                }
                Err(err) => {
                    warn!(key, code, error = %err, "rewrite expression failed to compile, key skipped");
                }
            }
        }
        Self { policy, programs }
    }

    /// Apply the policy to a JSON document. Non-JSON input (for example
    /// the `[DONE]` stream marker) passes through untouched.
    pub fn rewrite(&self, data: &[u8]) -> Vec<u8> {
        let mut doc: Value = match serde_json::from_slice(data) {
            Ok(doc) => doc,
            Err(_) => {
                debug!("rewrite skipped: payload is not json");
                return data.to_vec();
            }
        };

        for key in &self.policy.remove_keys {
            remove_path(&mut doc, key);
        }
        for (key, value) in &self.policy.set_keys {
            set_path(&mut doc, key, value.clone());
        }
        for key in self.policy.set_keys_by_expr.keys() {
            let Some(program) = self.programs.get(key) else {
                continue;
            };
            let value = match program.execute(&Context::default()) {
                Ok(value) => value,
                Err(err) => {
                    warn!(key, error = %err, "rewrite expression failed, key skipped");
                    continue;
                }
            };
            match cel_to_json(&value) {
                Some(Value::Null) | None => {
                    debug!(key, "rewrite expression returned nil, key not set");
                }
                Some(json) => set_path(&mut doc, key, json),
            }
        }

        serde_json::to_vec(&doc).unwrap_or_else(|_| data.to_vec())
    }
}

/// Convert an expression result into JSON. `None` for values with no
/// JSON rendering.
pub fn cel_to_json(value: &cel_interpreter::Value) -> Option<Value> {
    use cel_interpreter::Value as Cel;
    match value {
        Cel::Null => Some(Value::Null),
        Cel::Bool(b) => Some(Value::Bool(*b)),
        Cel::Int(i) => Some(Value::from(*i)),
        Cel::UInt(u) => Some(Value::from(*u)),
        Cel::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number),
        Cel::String(s) => Some(Value::String(s.as_ref().clone())),
        Cel::List(items) => items.iter().map(cel_to_json).collect::<Option<Vec<_>>>().map(Value::Array),
        Cel::Map(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map.map.iter() {
                let key = match key {
                    cel_interpreter::objects::Key::String(s) => s.as_ref().clone(),
                    cel_interpreter::objects::Key::Int(i) => i.to_string(),
                    cel_interpreter::objects::Key::Uint(u) => u.to_string(),
                    cel_interpreter::objects::Key::Bool(b) => b.to_string(),
                };
                out.insert(key, cel_to_json(item)?);
            }
            Some(Value::Object(out))
        }
        _ => None,
    }
}

/// Stage applying rewrite policies around a downstream stage. Stream
/// chunks keep their metadata; only the body is mutated.
pub struct RewriteStage {
    request: Option<JsonRewriter>,
    response: Option<JsonRewriter>,
    stream_chunk: Option<Arc<JsonRewriter>>,
    next: SharedStage,
}

impl RewriteStage {
    pub fn new(
        next: SharedStage,
        request: Option<RewritePolicy>,
        response: Option<RewritePolicy>,
        stream_chunk: Option<RewritePolicy>,
    ) -> Self {
        Self {
            request: request.map(JsonRewriter::new),
            response: response.map(JsonRewriter::new),
            stream_chunk: stream_chunk.map(|p| Arc::new(JsonRewriter::new(p))),
            next,
        }
    }
}

#[async_trait]
impl Stage for RewriteStage {
    async fn process(&self, req: &mut Request) -> StageResult {
        if let Some(rewriter) = &self.request {
            let bytes = req.body.bytes().await?;
            req.body.set_bytes(rewriter.rewrite(&bytes));
        }

        let mut resp = self.next.process(req).await?;

        match resp.payload {
            ResponsePayload::Stream(upstream) => {
                let Some(rewriter) = self.stream_chunk.clone() else {
                    resp.payload = ResponsePayload::Stream(upstream);
                    return Ok(resp);
                };
                let token = req.context().child_token();
                let (tx, out) = ChunkStream::channel(token.clone());
                tokio::spawn(rewrite_stream(upstream, tx, token, rewriter));
                resp.payload = ResponsePayload::Stream(out);
                Ok(resp)
            }
            ResponsePayload::Buffered(mut body) => {
                if let Some(rewriter) = &self.response {
                    let bytes = body.bytes().await?;
                    body.set_bytes(rewriter.rewrite(&bytes));
                }
                resp.payload = ResponsePayload::Buffered(body);
                Ok(resp)
            }
        }
    }
}

async fn rewrite_stream(
    mut upstream: ChunkStream,
    tx: crate::core::ChunkSender,
    token: tokio_util::sync::CancellationToken,
    rewriter: Arc<JsonRewriter>,
) {
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => break,
            chunk = upstream.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        let mut chunk: Chunk = chunk;
        match chunk.body.bytes().await {
            Ok(bytes) => chunk.body.set_bytes(rewriter.rewrite(&bytes)),
            Err(err) => {
                warn!(error = %err, "read stream chunk error, chunk dropped");
                continue;
            }
        }
        let forwarded = tokio::select! {
            _ = token.cancelled() => break,
            sent = tx.send(chunk) => sent.is_ok(),
        };
        if !forwarded {
            break;
        }
    }
    upstream.close();
}
