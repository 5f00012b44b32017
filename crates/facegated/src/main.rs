use std::sync::Arc;

use anyhow::{Context, Result};
use facegate_env::{CondaBackend, Provisioner, Registry};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod gateway;
mod health;
mod routes;
mod transport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = config::Config::from_env();

    let registry = match &config.environments_file {
        Some(path) => Registry::load(path)
            .with_context(|| format!("loading environment registry {}", path.display()))?,
        None => Registry::builtin().clone(),
    };
    let backend = Arc::new(CondaBackend::new(config.env_manager.clone()));
    let provisioner = Arc::new(Provisioner::new(registry, backend));

    let transport = Arc::new(transport::HttpTransport::new().context("building HTTP client")?);
    let gateway = Arc::new(gateway::Gateway::new(&config, transport, provisioner));

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;

    tracing::info!(
        bind = %config.bind,
        matcher = %config.matcher_url,
        analyzer = %config.analyzer_url,
        dataset = %config.dataset_dir.display(),
        require_environments = config.require_environments,
        max_body_bytes = config.max_body_bytes,
        "facegated ready"
    );

    axum::serve(listener, routes::router(gateway, config.max_body_bytes))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("serving HTTP")?;

    tracing::info!("facegated shutting down");
    Ok(())
}
