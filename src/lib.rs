//! # OctoLLM Gateway
//!
//! A reverse proxy for LLM traffic: accepts chat-completions and
//! messages requests, selects and rewires an upstream backend per
//! configured policy, and streams or buffers the response back.
//!
//! The core is a composable chain of processing stages
//! ([`core::stage::Stage`]): rule evaluation, weighted load balancing
//! with retry, declarative JSON rewriting, cross-protocol format
//! conversion, and an SSE-aware HTTP client. The [`composer`] turns the
//! YAML configuration into a live stage graph per (org, model); the
//! [`server`] module adapts it to axum.
//!
//! ```no_run
//! use octollm::composer::{ModelRepo, RuleComposer};
//! use octollm::config::ConfigFile;
//! use octollm::server::{auth::ApiKeyAuth, create_router, AppState};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conf = Arc::new(ConfigFile::load("./config.yaml")?);
//!     let repo = Arc::new(ModelRepo::new());
//!     repo.update_from_config(&conf);
//!     let composer = Arc::new(RuleComposer::new(repo, Duration::from_secs(5), 10));
//!     composer.update_from_config(conf.clone());
//!     let auth = Arc::new(ApiKeyAuth::new());
//!     auth.update_from_config(&conf)?;
//!
//!     let app = create_router(AppState { composer, auth });
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod composer;
pub mod config;
pub mod core;
pub mod error;
pub mod schemas;
pub mod server;
pub mod stages;

pub use error::ProxyError;
