use std::sync::Arc;

use anyhow::Context;
use crawld::api::{ApiServer, ApiServerConfig};
use crawld::config::DaemonConfig;
use crawld::logging::init_logging;
use crawld::services::ServiceContainer;
use mimalloc::MiMalloc;
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = DaemonConfig::from_env_or_default().context("invalid configuration")?;

    let (logging_config, _guard) =
        init_logging(&config.scheduler.log_dir).context("failed to initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node_name = %config.node_name,
        max_jobs = config.scheduler.max_jobs,
        max_jobs_per_project = config.scheduler.max_jobs_per_project,
        queue_ceiling = config.scheduler.queue_ceiling,
        "Starting crawld"
    );

    let api_config: ApiServerConfig = config.api.clone();
    let container = ServiceContainer::init(config)
        .await
        .context("failed to initialize services")?;
    container
        .start()
        .await
        .context("failed to start scheduler")?;

    logging_config.start_retention_cleanup(container.cancellation_token());

    let server = Arc::new(ApiServer::new(
        api_config,
        container.app_state(Some(Arc::clone(&logging_config))),
    ));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
        _ = wait_for_sigterm() => info!("Received SIGTERM, shutting down"),
        result = wait_for(server_task) => {
            if let Err(e) = result {
                error!(error = %e, "API server stopped unexpectedly");
            }
        }
    }

    server.shutdown();
    container.shutdown().await?;
    info!("crawld stopped");
    Ok(())
}

async fn wait_for(task: tokio::task::JoinHandle<crawld::Result<()>>) -> anyhow::Result<()> {
    task.await.context("API server task panicked")??;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
