//! Gateway server binary.

use clap::Parser;
use octollm::composer::{ModelRepo, RuleComposer};
use octollm::config::{ConfigFile, ServerArgs};
use octollm::server::{auth::ApiKeyAuth, create_router, AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ServerArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter).unwrap_or_default())
        .init();

    info!(config = %args.config, "loading gateway configuration");
    let conf = Arc::new(ConfigFile::load(&args.config)?);

    let repo = Arc::new(ModelRepo::new());
    repo.update_from_config(&conf);

    let composer = Arc::new(RuleComposer::new(
        repo,
        Duration::from_secs(args.retry_timeout_secs),
        args.retry_max_count,
    ));
    composer.update_from_config(conf.clone());

    let auth = Arc::new(ApiKeyAuth::new());
    auth.update_from_config(&conf)?;

    let app = create_router(AppState { composer, auth });

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install shutdown handler");
        return;
    }
    info!("shutting down");
}
