//! HTTP surface: routes, shared state, and middleware stack.

pub mod auth;
pub mod handlers;

use crate::composer::RuleComposer;
use auth::ApiKeyAuth;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{self, TraceLayer},
};
use tracing::Level;

/// Shared application state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub composer: Arc<RuleComposer>,
    pub auth: Arc<ApiKeyAuth>,
}

/// Router with the gateway routes and the middleware stack.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/messages", post(handlers::messages))
        .route("/health", get(handlers::health_check))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(CompressionLayer::new())
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
