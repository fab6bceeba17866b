//! Wire-format data structures.
//!
//! Two client-visible formats exist: the OpenAI-compatible
//! chat-completions shape ([`chat`]) and the Anthropic-compatible
//! messages shape ([`messages`]). Both are plain serde types; the
//! [`crate::core::body::JsonParser`] turns them into typed body values.

pub mod chat;
pub mod messages;
