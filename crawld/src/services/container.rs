//! Service container.
//!
//! Owns the database pools and the scheduler, and drives their lifecycle:
//! `init` connects and migrates, `start` recovers and begins admitting jobs,
//! `shutdown` cancels running jobs and closes the pools.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::api::server::AppState;
use crate::config::DaemonConfig;
use crate::database::repositories::{JobRepository, SqlxJobRepository};
use crate::database::{self, DbPool, WritePool};
use crate::logging::LoggingConfig;
use crate::metrics::HealthChecker;
use crate::scheduler::Scheduler;

/// Time allowed for running jobs to stop on shutdown, on top of their grace period.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

pub struct ServiceContainer {
    pub config: DaemonConfig,
    pub pool: DbPool,
    pub write_pool: WritePool,
    pub repository: Arc<dyn JobRepository>,
    pub scheduler: Arc<Scheduler>,
    pub health_checker: Arc<HealthChecker>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Connect to the database, apply migrations and build the scheduler.
    pub async fn init(config: DaemonConfig) -> Result<Self> {
        info!(database_url = %config.database_url, "Initializing services");

        let write_pool = database::init_write_pool(&config.database_url).await?;
        database::run_migrations(&write_pool).await?;
        let pool = database::init_pool(&config.database_url).await?;

        let repository: Arc<dyn JobRepository> =
            Arc::new(SqlxJobRepository::new(pool.clone(), write_pool.clone()));
        let scheduler = Scheduler::new(config.scheduler.clone(), Arc::clone(&repository))?;
        let health_checker = Arc::new(HealthChecker::new(pool.clone(), Arc::clone(&scheduler)));

        Ok(Self {
            config,
            pool,
            write_pool,
            repository,
            scheduler,
            health_checker,
            cancellation_token: CancellationToken::new(),
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await
    }

    /// API state backed by this container's services.
    pub fn app_state(&self, logging_config: Option<Arc<LoggingConfig>>) -> AppState {
        let state = AppState::new(Arc::clone(&self.scheduler), self.config.node_name.clone())
            .with_health_checker(Arc::clone(&self.health_checker));
        match logging_config {
            Some(logging_config) => state.with_logging_config(logging_config),
            None => state,
        }
    }

    /// Shut down, allowing running jobs their grace period to exit.
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = self.config.scheduler.grace_period + SHUTDOWN_MARGIN;
        self.shutdown_with_timeout(timeout).await
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        if tokio::time::timeout(timeout, self.scheduler.shutdown())
            .await
            .is_err()
        {
            warn!(
                running = self.scheduler.launcher().running_total(),
                "Shutdown timeout reached, forcing shutdown"
            );
        }

        info!("Closing database pools...");
        self.pool.close().await;
        self.write_pool.close().await;

        info!("All services shut down");
        Ok(())
    }

    /// Cancelled when shutdown begins; background tasks tie their lifetime to it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.database_url = format!("sqlite:{}?mode=rwc", dir.path().join("c.db").display());
        config.node_name = "node-1".to_string();
        config.scheduler.log_dir = dir.path().join("logs");

        let container = ServiceContainer::init(config).await.unwrap();
        container.start().await.unwrap();
        assert!(container.scheduler.is_running());
        assert!(dir.path().join("logs").is_dir());

        let state = container.app_state(None);
        assert_eq!(state.node_name, "node-1");
        assert!(state.health_checker.is_some());
        assert!(state.logging_config.is_none());

        let token = container.cancellation_token();
        container
            .shutdown_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(token.is_cancelled());
        assert!(!container.scheduler.is_running());
        assert!(container.pool.is_closed());
    }
}
