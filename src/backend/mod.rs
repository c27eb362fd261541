//! Backend adapter contract.
//!
//! An adapter speaks to one kind of execution system. The engine looks
//! adapters up by `(application kind, backend kind)` and only ever calls
//! them from the worker pool, so a slow backend cannot stall the caller.
//!
//! - [`BackendAdapter`]: submit, kill, resubmit and bulk status polling
//! - [`AdapterSet`]: lookup table with per-backend fallbacks
//! - [`local::LocalBackend`]: runs executable applications on this host

pub mod local;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{GantryError, Result};
use crate::job::{Fqid, Job, JobStatus};

/// Outcome of a successful submission: the remote handle of every record
/// that was sent to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub remote_ids: Vec<(Fqid, String)>,
}

impl SubmitReceipt {
    pub fn single(fqid: Fqid, remote_id: impl Into<String>) -> Self {
        Self {
            remote_ids: vec![(fqid, remote_id.into())],
        }
    }
}

/// A status reported by a backend for one job or subjob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub fqid: Fqid,
    pub status: JobStatus,
}

impl StatusUpdate {
    pub fn new(fqid: Fqid, status: JobStatus) -> Self {
        Self { fqid, status }
    }
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn supports_resubmit(&self) -> bool {
        true
    }

    /// Send a job and all of its subjobs to the backend.
    async fn submit(&self, job: &Job) -> Result<SubmitReceipt>;

    async fn kill(&self, job: &Job) -> Result<()>;

    async fn resubmit(&self, job: &Job) -> Result<SubmitReceipt> {
        self.submit(job).await
    }

    /// Report the current status of each job (or subjob) that changed.
    /// Jobs whose status is unchanged may be omitted.
    async fn update_status(&self, jobs: &[Job]) -> Result<Vec<StatusUpdate>>;
}

/// Adapters keyed by application and backend kind.
#[derive(Clone, Default)]
pub struct AdapterSet {
    exact: HashMap<(String, String), Arc<dyn BackendAdapter>>,
    by_backend: HashMap<String, Arc<dyn BackendAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for one application kind on a backend.
    pub fn register(
        &mut self,
        application: impl Into<String>,
        backend: impl Into<String>,
        adapter: Arc<dyn BackendAdapter>,
    ) {
        self.exact
            .insert((application.into(), backend.into()), adapter);
    }

    /// Register an adapter serving every application kind on a backend.
    pub fn register_backend(&mut self, backend: impl Into<String>, adapter: Arc<dyn BackendAdapter>) {
        self.by_backend.insert(backend.into(), adapter);
    }

    pub fn with_backend(mut self, backend: impl Into<String>, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.register_backend(backend, adapter);
        self
    }

    pub fn resolve(&self, application: &str, backend: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.exact
            .get(&(application.to_string(), backend.to_string()))
            .or_else(|| self.by_backend.get(backend))
            .cloned()
            .ok_or_else(|| GantryError::NoAdapter {
                application: application.to_string(),
                backend: backend.to_string(),
            })
    }

    pub fn for_job(&self, job: &Job) -> Result<Arc<dyn BackendAdapter>> {
        self.resolve(&job.application().kind, &job.backend().kind)
    }

    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_backend
            .keys()
            .chain(self.exact.keys().map(|(_, backend)| backend))
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet")
            .field("backends", &self.backends())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl BackendAdapter for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn submit(&self, job: &Job) -> Result<SubmitReceipt> {
            Ok(SubmitReceipt::single(job.fqid(), "r"))
        }

        async fn kill(&self, _job: &Job) -> Result<()> {
            Ok(())
        }

        async fn update_status(&self, _jobs: &[Job]) -> Result<Vec<StatusUpdate>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn exact_match_wins_over_backend_fallback() {
        let mut set = AdapterSet::new().with_backend("batch", Arc::new(Named("generic")));
        set.register("root", "batch", Arc::new(Named("root-batch")));

        assert_eq!(set.resolve("root", "batch").unwrap().name(), "root-batch");
        assert_eq!(set.resolve("executable", "batch").unwrap().name(), "generic");
        assert!(matches!(
            set.resolve("executable", "grid"),
            Err(GantryError::NoAdapter { .. })
        ));
        assert_eq!(set.backends(), vec!["batch".to_string()]);
    }
}
