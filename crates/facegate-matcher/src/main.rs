use std::sync::Arc;

use anyhow::{Context, Result};
use facegate_core::{DatasetStore, EncodingCache, FaceEncoder, OnnxFaceEncoder};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod routes;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegate-matcher starting");

    let config = config::Config::from_env();

    let encoder: Arc<dyn FaceEncoder> = Arc::new(
        OnnxFaceEncoder::load(&config.scrfd_model_path(), &config.arcface_model_path())
            .context("loading face models")?,
    );
    let cache = Arc::new(EncodingCache::new(
        DatasetStore::new(config.dataset_dir.clone()),
        encoder.clone(),
        config.cache_ttl,
    ));
    let tolerance = config.tolerance_for(encoder.as_ref());
    let engine = engine::Engine::new(encoder, cache, tolerance);

    let persons = engine.warm().await.context("pre-warming encoding cache")?;
    tracing::info!(persons, "encoding cache pre-warmed");

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;

    tracing::info!(
        bind = %config.bind,
        dataset = %config.dataset_dir.display(),
        tolerance,
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "facegate-matcher ready"
    );

    axum::serve(listener, routes::router(engine, config.max_body_bytes))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("serving HTTP")?;

    tracing::info!("facegate-matcher shutting down");
    Ok(())
}
