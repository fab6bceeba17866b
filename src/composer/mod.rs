//! Turns declarative configuration into a live stage graph.
//!
//! [`model_repo::ModelRepo`] owns resolved backend descriptors and their
//! lazily built stages; [`rule_composer::RuleComposer`] assembles the
//! per-(org, model) root stage and caches it for the process lifetime.

pub mod client_pool;
pub mod model_repo;
pub mod rule_composer;

pub use client_pool::ProxyClientPool;
pub use model_repo::ModelRepo;
pub use rule_composer::{GatewayStage, RuleComposer};
