use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::local::{LocalBackend, BACKEND_NAME};
use crate::backend::AdapterSet;
use crate::config::GantryConfig;
use crate::credentials::{CachedCredentialGate, CredentialGate, StaticCredentialGate};
use crate::error::Result;
use crate::monitor::MonitoringEngine;
use crate::pool::{ShutdownReport, WorkerPool};
use crate::registry::Registry;
use crate::repository::Repository;

/// One process's handle on a job repository, owning every component.
pub struct Session {
    pub config: GantryConfig,
    pub repository: Arc<Repository>,
    pub pool: Arc<WorkerPool>,
    pub registry: Arc<Registry>,
    pub monitor: Arc<MonitoringEngine>,
}

impl Session {
    /// Open with the local backend and a credential gate that accepts
    /// everything.
    pub async fn open(config: GantryConfig) -> Result<Self> {
        let workspace = config.repository.root.join("workspace");
        let adapters = AdapterSet::new().with_backend(
            BACKEND_NAME,
            Arc::new(LocalBackend::new(workspace, config.sandbox.clone())),
        );
        let gate = CachedCredentialGate::new(
            StaticCredentialGate::allow_all(),
            Duration::from_millis(config.credentials.cache_ttl_ms),
        );
        Self::open_with(config, adapters, Arc::new(gate)).await
    }

    /// Open the repository and wire up the pool, registry and monitoring
    /// engine around it.
    pub async fn open_with(
        config: GantryConfig,
        adapters: AdapterSet,
        credentials: Arc<dyn CredentialGate>,
    ) -> Result<Self> {
        let repository = Arc::new(Repository::open(config.repository.clone()).await?);
        let pool = Arc::new(WorkerPool::new(config.pool.clone()));
        let registry = Registry::open(
            repository.clone(),
            pool.clone(),
            adapters,
            credentials,
            config.registry.clone(),
        )
        .await?;
        let monitor = MonitoringEngine::new(registry.clone(), config.monitoring.clone());

        tracing::info!(
            session = repository.session_id(),
            root = %config.repository.root.display(),
            "Session opened"
        );

        Ok(Self {
            config,
            repository,
            pool,
            registry,
            monitor,
        })
    }

    /// Run monitoring until `shutdown` is cancelled, then close.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<ShutdownReport> {
        self.monitor.start().await;
        shutdown.cancelled().await;
        self.close().await
    }

    /// Stop monitoring, drain the pool, write anything left and release
    /// this session's locks.
    pub async fn close(self) -> Result<ShutdownReport> {
        self.monitor.stop().await;

        let report = self.pool.shutdown(self.config.pool.shutdown_timeout()).await;
        if !report.is_clean() {
            tracing::warn!(
                abandoned = ?report.abandoned,
                dropped = report.dropped,
                "Pool did not drain cleanly"
            );
        }

        if let Err(e) = self.registry.flush_all().await {
            tracing::error!(error = %e, "Failed to flush jobs at shutdown");
        }
        self.repository.shutdown().await?;
        tracing::info!(session = self.repository.session_id(), "Session closed");
        Ok(report)
    }
}
