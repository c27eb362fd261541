//! Test harness for session-level integration tests.
//!
//! Provides a scriptable backend adapter, a session on a temporary
//! repository with short timeouts, and polling helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use gantry::backend::{AdapterSet, BackendAdapter, StatusUpdate, SubmitReceipt};
use gantry::config::{GantryConfig, MonitoringConfig, RepositoryConfig, WorkerPoolConfig};
use gantry::credentials::{CredentialGate, StaticCredentialGate};
use gantry::job::{ApplicationRef, BackendRef, Fqid, Job, JobId, JobSpec, JobStatus};
use gantry::session::Session;
use gantry::{GantryError, Result};

pub const SCRIPTED: &str = "scripted";

/// How the scripted backend answers a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    Succeed,
    Fail,
    /// Never answer; the pool's task timeout fires instead.
    Hang,
}

/// Backend adapter whose answers are set by the test.
pub struct ScriptedBackend {
    submit_mode: Mutex<SubmitMode>,
    submit_delay: Mutex<Duration>,
    reports: Mutex<HashMap<Fqid, JobStatus>>,
    report_all: Mutex<Option<JobStatus>>,
    resubmit: AtomicBool,
    pub submits: AtomicUsize,
    pub kills: AtomicUsize,
    pub polls: AtomicUsize,
    pub polled_jobs: AtomicUsize,
    pub max_batch: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            submit_mode: Mutex::new(SubmitMode::Succeed),
            submit_delay: Mutex::new(Duration::ZERO),
            reports: Mutex::new(HashMap::new()),
            report_all: Mutex::new(None),
            resubmit: AtomicBool::new(true),
            submits: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            polled_jobs: AtomicUsize::new(0),
            max_batch: AtomicUsize::new(0),
        }
    }
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_submit_mode(&self, mode: SubmitMode) {
        *self.submit_mode.lock().unwrap() = mode;
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = delay;
    }

    pub fn set_supports_resubmit(&self, supported: bool) {
        self.resubmit.store(supported, Ordering::SeqCst);
    }

    /// Report `status` for one record on every poll.
    pub fn report(&self, fqid: Fqid, status: JobStatus) {
        self.reports.lock().unwrap().insert(fqid, status);
    }

    /// Report `status` for every polled record without its own report.
    pub fn report_all(&self, status: JobStatus) {
        *self.report_all.lock().unwrap() = Some(status);
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn failure(job: &Job, message: &str) -> GantryError {
        GantryError::Backend {
            fqid: job.fqid(),
            backend: SCRIPTED.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl BackendAdapter for ScriptedBackend {
    fn name(&self) -> &str {
        SCRIPTED
    }

    fn supports_resubmit(&self) -> bool {
        self.resubmit.load(Ordering::SeqCst)
    }

    async fn submit(&self, job: &Job) -> Result<SubmitReceipt> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mode = *self.submit_mode.lock().unwrap();
        match mode {
            SubmitMode::Succeed => Ok(SubmitReceipt {
                remote_ids: job
                    .leaves()
                    .into_iter()
                    .map(|leaf| (leaf.fqid(), format!("remote-{}", leaf.fqid())))
                    .collect(),
            }),
            SubmitMode::Fail => Err(Self::failure(job, "rejected by scripted backend")),
            SubmitMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Self::failure(job, "hang ended"))
            }
        }
    }

    async fn kill(&self, _job: &Job) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_status(&self, jobs: &[Job]) -> Result<Vec<StatusUpdate>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.polled_jobs.fetch_add(jobs.len(), Ordering::SeqCst);
        self.max_batch.fetch_max(jobs.len(), Ordering::SeqCst);

        let reports = self.reports.lock().unwrap();
        let all = *self.report_all.lock().unwrap();
        let mut updates = Vec::new();
        for job in jobs {
            for leaf in job.leaves() {
                let fqid = leaf.fqid();
                if let Some(status) = reports.get(&fqid).copied().or(all) {
                    updates.push(StatusUpdate::new(fqid, status));
                }
            }
        }
        Ok(updates)
    }
}

/// Test configuration with shorter timeouts for faster tests
pub fn test_config(root: &std::path::Path) -> GantryConfig {
    let mut config = GantryConfig::new(root)
        .with_pool(
            WorkerPoolConfig::default()
                .with_workers(4)
                .with_task_timeout(Duration::from_millis(300)),
        )
        .with_monitoring(
            MonitoringConfig::default()
                .with_poll_interval(Duration::from_millis(50))
                .with_default_backend_interval(Duration::ZERO),
        );
    config.repository = RepositoryConfig::new(root).with_lock_wait(Duration::from_millis(300));
    config.registry.job_lock_wait_ms = 2_000;
    config.pool.shutdown_timeout_ms = 1_000;
    config
}

/// A session on a temporary repository, backed by a [`ScriptedBackend`].
pub struct TestEnv {
    pub dir: TempDir,
    pub backend: Arc<ScriptedBackend>,
    pub gate: Arc<StaticCredentialGate>,
    pub session: Session,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(|config| config).await
    }

    /// Build an environment after letting the test adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(GantryConfig) -> GantryConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend::new();
        let gate = Arc::new(StaticCredentialGate::default());
        let session = open_session(adjust(test_config(dir.path())), &backend, &gate).await;
        Self {
            dir,
            backend,
            gate,
            session,
        }
    }

    /// Close the session and open a new one on the same repository.
    pub async fn reopen(self) -> Self {
        let TestEnv {
            dir,
            backend,
            gate,
            session,
        } = self;
        session.close().await.unwrap();
        let session = open_session(test_config(dir.path()), &backend, &gate).await;
        Self {
            dir,
            backend,
            gate,
            session,
        }
    }

    pub async fn create(&self, subjobs: usize) -> JobId {
        self.session
            .registry
            .create(scripted_spec(subjobs))
            .await
            .unwrap()
            .id
    }

    pub async fn status(&self, id: JobId) -> JobStatus {
        self.session.registry.get(id).await.unwrap().status()
    }

    /// Status as persisted, read through a fresh load.
    pub async fn stored_status(&self, id: JobId) -> JobStatus {
        self.session
            .repository
            .load_one(id)
            .await
            .unwrap()
            .status()
    }
}

async fn open_session(
    config: GantryConfig,
    backend: &Arc<ScriptedBackend>,
    gate: &Arc<StaticCredentialGate>,
) -> Session {
    let adapters = AdapterSet::new().with_backend(SCRIPTED, backend.clone() as Arc<dyn BackendAdapter>);
    Session::open_with(config, adapters, gate.clone() as Arc<dyn CredentialGate>)
        .await
        .unwrap()
}

pub fn scripted_spec(subjobs: usize) -> JobSpec {
    JobSpec::new(ApplicationRef::executable("true"), BackendRef::new(SCRIPTED))
        .with_name("test")
        .with_subjobs(subjobs)
}

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
