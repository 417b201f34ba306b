pub mod aggregator;
pub mod api;
pub mod bitbucket;
pub mod cache;
pub mod config;
pub mod directory;
pub mod errors;
pub mod joiner;
pub mod metrics_defs;
pub mod resolver;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::aggregator::{Aggregator, AggregatorSettings};
use crate::api::{ApiState, ConnectionInfo};
use crate::bitbucket::{BitbucketApi, BitbucketClient};
use crate::cache::AdvisoryCache;
use crate::config::{Config, DirectoryConfig};
use crate::directory::{Directory, HttpDirectory, InMemoryDirectory};
use crate::errors::StartupError;
use shared::admin_service::AdminService;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;

/// Checks that the configured credentials can see the configured workspace.
pub async fn check_workspace(bitbucket: &dyn BitbucketApi) -> Result<(), StartupError> {
    let workspaces = bitbucket.list_workspaces().await?;
    if workspaces
        .iter()
        .any(|workspace| workspace.slug == bitbucket.workspace())
    {
        Ok(())
    } else {
        Err(StartupError::UnknownWorkspace(bitbucket.workspace().to_string()))
    }
}

fn build_directory(config: &DirectoryConfig) -> Result<Arc<dyn Directory>, StartupError> {
    Ok(match config {
        DirectoryConfig::Http { url } => Arc::new(HttpDirectory::new(url.clone())),
        DirectoryConfig::File { path } => Arc::new(InMemoryDirectory::from_file(path)?),
    })
}

/// Runs the API and admin listeners until the process is interrupted.
pub async fn run(config: Config) -> Result<(), StartupError> {
    config.validate()?;

    let bitbucket: Arc<dyn BitbucketApi> = Arc::new(BitbucketClient::new(&config.bitbucket));
    let directory = build_directory(&config.directory)?;
    let cache: Arc<dyn AdvisoryCache> = Arc::from(cache::from_config(&config.cache));

    let aggregator = Aggregator::new(
        bitbucket.clone(),
        directory,
        cache,
        AggregatorSettings {
            cache_ttl: Duration::from_secs(config.cache.ttl_secs),
            worker_multiplier: config.fanout.worker_multiplier,
            resource_workers: config.fanout.resource_workers,
        },
    );
    let state = ApiState {
        aggregator: Arc::new(aggregator),
        connection: ConnectionInfo {
            workspace: config.bitbucket.workspace.clone(),
            username: config.bitbucket.credentials.username().map(str::to_string),
        },
    };

    let ready = Arc::new(AtomicBool::new(false));
    let ready_probe = ready.clone();
    let admin = AdminService::<_, StartupError>::new(
        move || ready_probe.load(Ordering::Relaxed),
        metrics_defs::ALL_METRICS,
    );
    let admin_listener = config.admin_listener.clone();
    tokio::spawn(async move {
        if let Err(e) =
            shared::http::run_http_service(&admin_listener.host, admin_listener.port, admin).await
        {
            tracing::error!(error = %e, "admin listener stopped");
        }
    });

    let listener =
        TcpListener::bind(format!("{}:{}", config.listener.host, config.listener.port)).await?;

    check_workspace(bitbucket.as_ref()).await?;
    ready.store(true, Ordering::Relaxed);
    tracing::info!(
        workspace = %config.bitbucket.workspace,
        addr = %format!("{}:{}", config.listener.host, config.listener.port),
        "Serving"
    );

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
