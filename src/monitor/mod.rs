//! Background polling of backends for status changes.
//!
//! Each cycle snapshots the non-terminal jobs from the registry index,
//! partitions them by backend and asks each backend's adapter for their
//! current status. Adapter calls run on the worker pool keyed by backend
//! name: different backends are polled concurrently, calls to one backend
//! are serialized. Reported changes go back through
//! [`Registry::apply_monitoring_results`], which re-validates them under the
//! job lock.
//!
//! The base loop interval only decides how often to check which backends
//! are due; each backend has its own poll interval.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::StatusUpdate;
use crate::config::MonitoringConfig;
use crate::credentials::CredentialRequirement;
use crate::job::{Job, JobId};
use crate::pool::TaskSpec;
use crate::registry::{IndexFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Running,
    Stopping,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorState::Stopped => write!(f, "stopped"),
            MonitorState::Running => write!(f, "running"),
            MonitorState::Stopping => write!(f, "stopping"),
        }
    }
}

/// What one monitoring cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub backends: Vec<String>,
    /// Jobs whose status was requested from a backend.
    pub polled: usize,
    /// Committed transitions.
    pub applied: usize,
    /// Reports refused by the transition graph.
    pub rejected: usize,
    /// Jobs left out: busy, missing credentials or stopped early.
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl CycleReport {
    fn merge(&mut self, other: CycleReport) {
        self.backends.extend(other.backends);
        self.polled += other.polled;
        self.applied += other.applied;
        self.rejected += other.rejected;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub enabled: bool,
    pub cycles: u64,
    pub needed_credentials: Vec<String>,
    pub last_cycle: Option<CycleReport>,
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct MonitoringEngine {
    registry: Arc<Registry>,
    config: MonitoringConfig,
    state: Mutex<MonitorState>,
    running: Mutex<Option<LoopHandle>>,
    enabled: AtomicBool,
    poll_all: AtomicBool,
    wake: Notify,
    last_polled: Mutex<HashMap<String, Instant>>,
    needed: Mutex<BTreeSet<CredentialRequirement>>,
    last_cycle: Mutex<Option<CycleReport>>,
    cycles: AtomicU64,
}

impl MonitoringEngine {
    pub fn new(registry: Arc<Registry>, config: MonitoringConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            state: Mutex::new(MonitorState::Stopped),
            running: Mutex::new(None),
            enabled: AtomicBool::new(true),
            poll_all: AtomicBool::new(false),
            wake: Notify::new(),
            last_polled: Mutex::new(HashMap::new()),
            needed: Mutex::new(BTreeSet::new()),
            last_cycle: Mutex::new(None),
            cycles: AtomicU64::new(0),
        })
    }

    pub async fn state(&self) -> MonitorState {
        *self.state.lock().await
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Resume polling in a running loop.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!("Monitoring enabled");
    }

    /// Skip cycles without stopping the loop.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!("Monitoring disabled");
    }

    /// Wake the loop and poll every backend, due or not.
    pub fn poll_now(&self) {
        self.poll_all.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub async fn status(&self) -> MonitorStatus {
        MonitorStatus {
            state: self.state().await,
            enabled: self.is_enabled(),
            cycles: self.cycles.load(Ordering::SeqCst),
            needed_credentials: self
                .needed
                .lock()
                .await
                .iter()
                .map(ToString::to_string)
                .collect(),
            last_cycle: self.last_cycle.lock().await.clone(),
        }
    }

    /// Start the polling loop. Returns false if it is already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() || self.state().await != MonitorState::Stopped {
            return false;
        }

        let cancel = CancellationToken::new();
        let engine = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { engine.run_loop(token).await });
        *running = Some(LoopHandle { cancel, task });
        *self.state.lock().await = MonitorState::Running;

        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "Monitoring started"
        );
        true
    }

    /// Ask the loop to stop and wait for it. A backend call already in
    /// flight completes and its results are applied.
    pub async fn stop(&self) {
        let Some(handle) = self.running.lock().await.take() else {
            return;
        };
        *self.state.lock().await = MonitorState::Stopping;
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::error!(error = %e, "Monitoring loop ended abnormally");
        }
        *self.state.lock().await = MonitorState::Stopped;
        tracing::info!("Monitoring stopped");
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            if !self.is_enabled() {
                continue;
            }

            let poll_all = self.poll_all.swap(false, Ordering::SeqCst);
            let report = self.cycle(&cancel, !poll_all).await;
            if report.polled > 0 || !report.errors.is_empty() {
                tracing::debug!(
                    polled = report.polled,
                    applied = report.applied,
                    rejected = report.rejected,
                    skipped = report.skipped,
                    errors = report.errors.len(),
                    "Monitoring cycle finished"
                );
            }
        }
    }

    /// Poll every backend once, regardless of poll intervals.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleReport {
        self.cycle(&CancellationToken::new(), false).await
    }

    async fn cycle(self: &Arc<Self>, cancel: &CancellationToken, only_due: bool) -> CycleReport {
        let mut partitions: BTreeMap<String, Vec<JobId>> = BTreeMap::new();
        for record in self.registry.select(&IndexFilter::monitored()).await {
            partitions
                .entry(record.backend.clone())
                .or_default()
                .push(record.id());
        }

        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut last_polled = self.last_polled.lock().await;
            for (backend, ids) in partitions {
                let interval = self.config.backend_interval(&backend);
                let is_due = last_polled
                    .get(&backend)
                    .map(|at| now.duration_since(*at) >= interval)
                    .unwrap_or(true);
                if only_due && !is_due {
                    continue;
                }
                last_polled.insert(backend.clone(), now);
                due.push((backend, ids));
            }
        }

        let mut tasks = JoinSet::new();
        for (backend, ids) in due {
            let engine = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { engine.poll_backend(backend, ids, cancel).await });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(partial) => report.merge(partial),
                Err(e) => report.errors.push(format!("backend poll task failed: {}", e)),
            }
        }

        self.cycles.fetch_add(1, Ordering::SeqCst);
        *self.last_cycle.lock().await = Some(report.clone());
        report
    }

    async fn poll_backend(
        self: Arc<Self>,
        backend: String,
        ids: Vec<JobId>,
        cancel: CancellationToken,
    ) -> CycleReport {
        let mut report = CycleReport {
            backends: vec![backend.clone()],
            ..Default::default()
        };

        // Group by credential and application so each batch has one adapter.
        let mut groups: BTreeMap<(Option<CredentialRequirement>, String), Vec<Job>> =
            BTreeMap::new();
        for id in ids {
            // A submit or kill in flight commits its own outcome first.
            if self.registry.is_busy(id).await {
                report.skipped += 1;
                continue;
            }
            match self.registry.get(id).await {
                Ok(job) if job.status().is_monitored() => {
                    let key = (job.credential.clone(), job.application().kind.clone());
                    groups.entry(key).or_default().push(job);
                }
                Ok(_) => {}
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        for ((credential, _), jobs) in groups {
            if let Some(requirement) = &credential {
                if !self.registry.credentials().is_valid(requirement).await {
                    if self.needed.lock().await.insert(requirement.clone()) {
                        tracing::warn!(
                            backend = %backend,
                            credential = %requirement,
                            jobs = jobs.len(),
                            "Skipping jobs until credential is available"
                        );
                    }
                    report.skipped += jobs.len();
                    continue;
                }
                self.needed.lock().await.remove(requirement);
            }

            let adapter = match self.registry.adapters().for_job(&jobs[0]) {
                Ok(adapter) => adapter,
                Err(e) => {
                    report.skipped += jobs.len();
                    report.errors.push(e.to_string());
                    continue;
                }
            };

            let batches: Vec<Vec<Job>> = jobs
                .chunks(self.config.max_jobs_per_call.max(1))
                .map(<[Job]>::to_vec)
                .collect();
            for batch in batches {
                if cancel.is_cancelled() {
                    report.skipped += batch.len();
                    continue;
                }
                report.polled += batch.len();

                let adapter = adapter.clone();
                let call = async move { adapter.update_status(&batch).await };
                let outcome = match self
                    .registry
                    .pool()
                    .dispatch(TaskSpec::for_backend(backend.clone(), "update_status"), call)
                    .await
                {
                    Ok(handle) => handle.wait().await,
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(updates) => self.apply(updates, &mut report).await,
                    Err(e) => {
                        tracing::warn!(backend = %backend, error = %e, "Status poll failed");
                        report.errors.push(e.to_string());
                    }
                }
            }
        }
        report
    }

    async fn apply(&self, updates: Vec<StatusUpdate>, report: &mut CycleReport) {
        let mut by_job: BTreeMap<JobId, Vec<StatusUpdate>> = BTreeMap::new();
        for update in updates {
            by_job.entry(update.fqid.id).or_default().push(update);
        }

        for (id, updates) in by_job {
            match self.registry.apply_monitoring_results(id, &updates).await {
                Ok(applied) => {
                    report.applied += applied.applied.len();
                    report.rejected += applied.rejected.len();
                }
                Err(e) => {
                    tracing::warn!(job_id = id, error = %e, "Failed to apply status report");
                    report.errors.push(e.to_string());
                }
            }
        }
    }
}
