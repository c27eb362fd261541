//! In-memory view of the job repository and the single place where job
//! state changes.
//!
//! The registry keeps the index records of every job and lazily loads full
//! records on access. Every mutation takes the per-job lock (in-process
//! mutex plus the repository slot lock), re-reads the record from disk,
//! applies the change to that fresh copy, flushes it and only then swaps it
//! into memory. Backend calls run on the worker pool and commit their
//! outcome through the same path.
//!
//! When the storage medium fails the registry turns read-only. Cached reads
//! keep working; writes are refused until a probe of the medium succeeds.

pub mod events;
pub mod filter;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};

use crate::backend::{AdapterSet, BackendAdapter, StatusUpdate, SubmitReceipt};
use crate::config::RegistryConfig;
use crate::credentials::CredentialGate;
use crate::error::{GantryError, Result};
use crate::job::{Fqid, IndexRecord, Job, JobId, JobSpec, JobStatus, TransitionGraph};
use crate::pool::{TaskHandle, TaskKey, TaskSpec, WorkerPool};
use crate::repository::lock::LockKey;
use crate::repository::Repository;
use events::{Changes, Mode};
pub use events::{TransitionEvent, TransitionHook};
pub use filter::IndexFilter;

/// Handle of a submit, resubmit or kill running on the worker pool. Resolves
/// to the job's status after the outcome was committed.
pub type PendingOperation = TaskHandle<JobStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Submit,
    Resubmit,
    Kill,
}

impl Operation {
    /// Whether a leaf in `status` takes part in the operation.
    fn acts_on(self, status: JobStatus) -> bool {
        match self {
            Operation::Submit => status == JobStatus::New,
            Operation::Resubmit => matches!(status, JobStatus::Failed | JobStatus::Killed),
            Operation::Kill => matches!(status, JobStatus::Submitted | JobStatus::Running),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Operation::Submit => "submit",
            Operation::Resubmit => "resubmit",
            Operation::Kill => "kill",
        }
    }
}

/// Outcome of applying backend status reports to one job.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: Vec<TransitionEvent>,
    pub rejected: Vec<(Fqid, GantryError)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub jobs: usize,
    pub resident: usize,
    pub incomplete: usize,
    pub degraded: bool,
    pub by_status: BTreeMap<JobStatus, usize>,
}

pub struct Registry {
    repository: Arc<Repository>,
    pool: Arc<WorkerPool>,
    adapters: AdapterSet,
    credentials: Arc<dyn CredentialGate>,
    graph: TransitionGraph,
    config: RegistryConfig,
    index: RwLock<BTreeMap<JobId, IndexRecord>>,
    resident: RwLock<HashMap<JobId, Job>>,
    incomplete: RwLock<BTreeMap<JobId, String>>,
    job_locks: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
    degraded: AtomicBool,
    events: broadcast::Sender<TransitionEvent>,
    hooks: RwLock<Vec<Arc<dyn TransitionHook>>>,
}

impl Registry {
    /// Build the registry from the repository's index, repairing stale
    /// bucket indexes on the way. Unreadable records are listed as
    /// incomplete and never block startup.
    pub async fn open(
        repository: Arc<Repository>,
        pool: Arc<WorkerPool>,
        adapters: AdapterSet,
        credentials: Arc<dyn CredentialGate>,
        config: RegistryConfig,
    ) -> Result<Arc<Self>> {
        let scan = repository.scan_index().await?;
        let mut index: BTreeMap<JobId, IndexRecord> =
            scan.records.into_iter().map(|r| (r.id(), r)).collect();
        let mut incomplete = BTreeMap::new();
        for id in scan.incomplete {
            index.insert(id, IndexRecord::incomplete(id));
            incomplete.insert(id, "record unreadable at startup".to_string());
        }

        tracing::info!(
            jobs = index.len(),
            incomplete = incomplete.len(),
            rebuilt = ?scan.rebuilt,
            dropped = ?scan.dropped,
            "Registry opened"
        );

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Ok(Arc::new(Self {
            repository,
            pool,
            adapters,
            credentials,
            graph: TransitionGraph::standard(),
            config,
            index: RwLock::new(index),
            resident: RwLock::new(HashMap::new()),
            incomplete: RwLock::new(incomplete),
            job_locks: Mutex::new(HashMap::new()),
            degraded: AtomicBool::new(false),
            events,
            hooks: RwLock::new(Vec::new()),
        }))
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialGate> {
        &self.credentials
    }

    pub fn graph(&self) -> &TransitionGraph {
        &self.graph
    }

    // ==================== Reads ====================

    /// Create a job from a specification and persist it in status `new`.
    pub async fn create(&self, spec: JobSpec) -> Result<Job> {
        self.ensure_writable().await?;
        let mut job = Job::from_spec(&spec);
        if let Err(e) = self.repository.add(&mut job).await {
            self.note_failure(&e);
            return Err(e);
        }
        self.install(&job).await;
        tracing::info!(
            job_id = job.id,
            backend = %job.backend().kind,
            subjobs = job.subjobs().len(),
            "Job created"
        );
        Ok(job)
    }

    /// Full record of a job, loading it from the repository on first access.
    pub async fn get(&self, id: JobId) -> Result<Job> {
        if let Some(job) = self.resident.read().await.get(&id) {
            return Ok(job.clone());
        }
        if let Some(reason) = self.incomplete.read().await.get(&id) {
            return Err(GantryError::InaccessibleObject {
                id: Fqid::master(id),
                reason: reason.clone(),
            });
        }
        let job = self.load_fresh(id).await?;
        self.install(&job).await;
        Ok(job)
    }

    /// Record of a job or one of its subjobs.
    pub async fn get_fqid(&self, fqid: Fqid) -> Result<Job> {
        let master = self.get(fqid.id).await?;
        match fqid.sub {
            None => Ok(master),
            Some(_) => master
                .find(fqid)
                .cloned()
                .ok_or(GantryError::JobNotFound(fqid)),
        }
    }

    /// Drop the cached copy and read the job again.
    pub async fn reload(&self, id: JobId) -> Result<Job> {
        self.resident.write().await.remove(&id);
        self.incomplete.write().await.remove(&id);
        let job = self.load_fresh(id).await?;
        self.install(&job).await;
        Ok(job)
    }

    /// Summary of a job without loading its full record.
    pub async fn peek_index(&self, id: JobId) -> Option<IndexRecord> {
        self.index.read().await.get(&id).cloned()
    }

    /// Whether the full record of a job is held in memory.
    pub async fn has_loaded(&self, id: JobId) -> bool {
        self.resident.read().await.contains_key(&id)
    }

    pub async fn select(&self, filter: &IndexFilter) -> Vec<IndexRecord> {
        self.index
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    pub async fn ids(&self) -> Vec<JobId> {
        self.index.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Jobs whose records could not be read, with the reason.
    pub async fn incomplete(&self) -> Vec<(JobId, String)> {
        self.incomplete
            .read()
            .await
            .iter()
            .map(|(id, reason)| (*id, reason.clone()))
            .collect()
    }

    /// Rescan the repository, picking up jobs written by other sessions.
    pub async fn refresh_index(&self) -> Result<usize> {
        let scan = self.repository.scan_index().await.inspect_err(|e| self.note_failure(e))?;
        let mut index = self.index.write().await;
        let mut incomplete = self.incomplete.write().await;
        index.clear();
        for record in scan.records {
            index.insert(record.id(), record);
        }
        for id in scan.incomplete {
            index.insert(id, IndexRecord::incomplete(id));
            incomplete
                .entry(id)
                .or_insert_with(|| "record unreadable".to_string());
        }
        self.resident
            .write()
            .await
            .retain(|id, _| index.contains_key(id));
        Ok(index.len())
    }

    pub async fn stats(&self) -> RegistryStats {
        let index = self.index.read().await;
        let mut by_status = BTreeMap::new();
        for record in index.values() {
            *by_status.entry(record.status).or_insert(0) += 1;
        }
        RegistryStats {
            jobs: index.len(),
            resident: self.resident.read().await.len(),
            incomplete: self.incomplete.read().await.len(),
            degraded: self.is_degraded(),
            by_status,
        }
    }

    // ==================== Events ====================

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    pub async fn add_hook(&self, hook: Arc<dyn TransitionHook>) {
        self.hooks.write().await.push(hook);
    }

    async fn publish(&self, events: Vec<TransitionEvent>) {
        for event in events {
            if event.forced {
                tracing::warn!(
                    job_id = %event.fqid,
                    from = %event.from,
                    to = %event.to,
                    forced = true,
                    reason = event.reason.as_deref().unwrap_or(""),
                    "Status forced"
                );
            } else if event.fqid.is_subjob() {
                tracing::debug!(job_id = %event.fqid, from = %event.from, to = %event.to, "Status changed");
            } else {
                tracing::info!(job_id = %event.fqid, from = %event.from, to = %event.to, "Status changed");
            }

            let _ = self.events.send(event.clone());
            if event.to.fires_hooks() {
                let hooks = self.hooks.read().await.clone();
                for hook in hooks {
                    hook.on_terminal(&event).await;
                }
            }
        }
    }

    // ==================== Mutations ====================

    /// Change non-status fields of a job.
    pub async fn modify<F>(&self, id: JobId, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        self.locked_commit(id, Changes::new(&self.graph), |job, _| f(job))
            .await
            .map(|(job, _, _)| job)
    }

    pub async fn submit(self: &Arc<Self>, id: JobId) -> Result<PendingOperation> {
        self.start(id, Operation::Submit).await
    }

    /// Submit the failed or killed parts of a job again.
    pub async fn resubmit(self: &Arc<Self>, id: JobId) -> Result<PendingOperation> {
        self.start(id, Operation::Resubmit).await
    }

    /// Ask the backend to stop a job. The status changes only once the
    /// backend confirmed the kill.
    pub async fn kill(self: &Arc<Self>, id: JobId) -> Result<PendingOperation> {
        self.start(id, Operation::Kill).await
    }

    async fn start(self: &Arc<Self>, id: JobId, op: Operation) -> Result<PendingOperation> {
        let guard = self.acquire(id).await?;
        let result = self.prepare(id, op).await;
        self.release(id, guard).await;
        let (handle, events) = result?;
        self.publish(events).await;
        Ok(handle)
    }

    async fn prepare(
        self: &Arc<Self>,
        id: JobId,
        op: Operation,
    ) -> Result<(PendingOperation, Vec<TransitionEvent>)> {
        let current = self.load_fresh(id).await?;
        let adapter = self.adapters.for_job(&current)?;
        if op == Operation::Resubmit && !adapter.supports_resubmit() {
            return Err(GantryError::Backend {
                fqid: current.fqid(),
                backend: adapter.name().to_string(),
                message: "backend does not support resubmission".to_string(),
            });
        }
        let targets = self.targets(&current, op)?;
        if let Some(requirement) = &current.credential {
            self.credentials.ensure(requirement).await?;
        }

        let (job, events) = match op {
            Operation::Kill => (current, Vec::new()),
            Operation::Submit | Operation::Resubmit => {
                let (job, events) = self
                    .commit(current, Changes::new(&self.graph), |job, changes| {
                        for fqid in &targets {
                            changes.step(job, *fqid, JobStatus::Submitting, Mode::User)?;
                        }
                        Ok(())
                    })
                    .await?;
                (job, events.1)
            }
        };

        match self.dispatch(id, op, adapter, job, targets.clone()).await {
            Ok(handle) => Ok((handle, events)),
            Err(e) => {
                if op != Operation::Kill {
                    // Nothing reached the backend. The job lock is still held.
                    let reverted = match self.load_fresh(id).await {
                        Ok(job) => self
                            .commit(job, Changes::new(&self.graph), revert_steps(op, &targets))
                            .await
                            .map(|_| ()),
                        Err(load) => Err(load),
                    };
                    if let Err(revert) = reverted {
                        tracing::error!(job_id = id, error = %revert, "Failed to roll back after dispatch error");
                    }
                }
                Err(e)
            }
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        id: JobId,
        op: Operation,
        adapter: Arc<dyn BackendAdapter>,
        snapshot: Job,
        targets: Vec<Fqid>,
    ) -> Result<PendingOperation> {
        let registry = self.clone();
        let spec = TaskSpec::for_job(id, op.name());
        match op {
            Operation::Submit | Operation::Resubmit => {
                self.pool
                    .dispatch_with(
                        spec,
                        async move {
                            if op == Operation::Submit {
                                adapter.submit(&snapshot).await
                            } else {
                                adapter.resubmit(&snapshot).await
                            }
                        },
                        move |outcome| async move {
                            registry.finish_submission(id, op, targets, outcome).await
                        },
                    )
                    .await
            }
            Operation::Kill => {
                self.pool
                    .dispatch_with(
                        spec,
                        async move { adapter.kill(&snapshot).await },
                        move |outcome| async move { registry.finish_kill(id, targets, outcome).await },
                    )
                    .await
            }
        }
    }

    /// Leaf records an operation acts on.
    fn targets(&self, job: &Job, op: Operation) -> Result<Vec<Fqid>> {
        let status = job.status();
        let (allowed, to) = match op {
            Operation::Submit => (status == JobStatus::New, JobStatus::Submitting),
            Operation::Resubmit => (
                matches!(status, JobStatus::Failed | JobStatus::Killed),
                JobStatus::Submitting,
            ),
            Operation::Kill => (true, JobStatus::Killed),
        };
        let targets: Vec<Fqid> = job
            .leaves()
            .into_iter()
            .filter(|leaf| op.acts_on(leaf.status()))
            .map(Job::fqid)
            .collect();

        if !allowed || targets.is_empty() {
            return Err(GantryError::IllegalTransition {
                fqid: job.fqid(),
                from: status,
                to,
            });
        }
        Ok(targets)
    }

    async fn finish_submission(
        self: Arc<Self>,
        id: JobId,
        op: Operation,
        targets: Vec<Fqid>,
        outcome: Result<SubmitReceipt>,
    ) -> Result<JobStatus> {
        match outcome {
            Ok(receipt) => {
                let (job, _, _) = self
                    .locked_commit(id, Changes::new(&self.graph), |job, changes| {
                        for (fqid, remote_id) in &receipt.remote_ids {
                            if let Some(leaf) = job.find_mut(*fqid) {
                                leaf.set_remote_id(Some(remote_id.clone()));
                            }
                        }
                        for fqid in &targets {
                            let still_submitting = job
                                .find(*fqid)
                                .map(|leaf| leaf.status() == JobStatus::Submitting)
                                .unwrap_or(false);
                            if still_submitting {
                                changes.step(job, *fqid, JobStatus::Submitted, Mode::Backend)?;
                            }
                        }
                        Ok(())
                    })
                    .await?;
                Ok(job.status())
            }
            Err(e @ GantryError::Timeout { .. }) => {
                tracing::warn!(
                    job_id = id,
                    operation = op.name(),
                    "Submission outcome unknown, left in submitting for monitoring to resolve"
                );
                Err(e)
            }
            Err(e) => {
                tracing::warn!(job_id = id, operation = op.name(), error = %e, "Submission failed");
                if let Err(revert) = self.revert(id, op, &targets).await {
                    tracing::error!(job_id = id, error = %revert, "Failed to record submission failure");
                }
                Err(e)
            }
        }
    }

    async fn revert(&self, id: JobId, op: Operation, targets: &[Fqid]) -> Result<()> {
        self.locked_commit(id, Changes::new(&self.graph), revert_steps(op, targets))
            .await
            .map(|_| ())
    }

    async fn finish_kill(
        self: Arc<Self>,
        id: JobId,
        targets: Vec<Fqid>,
        outcome: Result<()>,
    ) -> Result<JobStatus> {
        if let Err(e) = outcome {
            tracing::warn!(job_id = id, error = %e, "Kill failed");
            return Err(e);
        }
        let (job, _, _) = self
            .locked_commit(id, Changes::new(&self.graph), |job, changes| {
                let mut killed = 0;
                for fqid in &targets {
                    let Some(status) = job.find(*fqid).map(Job::status) else {
                        continue;
                    };
                    // Another outcome may have been committed meanwhile.
                    if changes.graph().is_legal(status, JobStatus::Killed) {
                        changes.step(job, *fqid, JobStatus::Killed, Mode::User)?;
                        killed += 1;
                    }
                }
                if killed == 0 {
                    return Err(GantryError::IllegalTransition {
                        fqid: job.fqid(),
                        from: job.status(),
                        to: JobStatus::Killed,
                    });
                }
                Ok(())
            })
            .await?;
        Ok(job.status())
    }

    /// Apply one backend status report.
    pub async fn apply_monitoring_result(&self, fqid: Fqid, status: JobStatus) -> Result<ApplyReport> {
        self.apply_monitoring_results(fqid.id, &[StatusUpdate::new(fqid, status)])
            .await
    }

    /// Apply backend status reports for one master job in a single commit.
    ///
    /// A report that skips intermediate states is applied as the chain of
    /// backend edges leading to it. Reports with no such chain, or for
    /// records that no longer exist, are rejected individually.
    pub async fn apply_monitoring_results(&self, id: JobId, updates: &[StatusUpdate]) -> Result<ApplyReport> {
        let mut rejected = Vec::new();
        let (_, _, applied) = self
            .locked_commit(id, Changes::new(&self.graph), |job, changes| {
                for update in updates {
                    let Some(leaf) = job.find(update.fqid) else {
                        rejected.push((update.fqid, GantryError::JobNotFound(update.fqid)));
                        continue;
                    };
                    if !leaf.subjobs().is_empty() {
                        tracing::warn!(job_id = %update.fqid, to = %update.status, "Ignored backend report for a master with subjobs");
                        rejected.push((
                            update.fqid,
                            GantryError::IllegalTransition {
                                fqid: update.fqid,
                                from: leaf.status(),
                                to: update.status,
                            },
                        ));
                        continue;
                    }
                    let from = leaf.status();
                    if from == update.status {
                        continue;
                    }
                    let Some(path) = changes.graph().backend_path(from, update.status) else {
                        tracing::warn!(
                            job_id = %update.fqid,
                            from = %from,
                            to = %update.status,
                            "Rejected backend status report"
                        );
                        rejected.push((
                            update.fqid,
                            GantryError::IllegalTransition {
                                fqid: update.fqid,
                                from,
                                to: update.status,
                            },
                        ));
                        continue;
                    };
                    for step in path {
                        changes.step(job, update.fqid, step, Mode::Backend)?;
                    }
                }
                Ok(())
            })
            .await?;
        Ok(ApplyReport { applied, rejected })
    }

    /// Set a status regardless of the transition graph. On a master with
    /// subjobs every subjob is forced.
    pub async fn force_status(&self, fqid: Fqid, status: JobStatus, reason: impl Into<String>) -> Result<Job> {
        let changes = Changes::new(&self.graph).with_reason(reason);
        self.locked_commit(fqid.id, changes, |job, changes| {
            let leaves: Vec<Fqid> = match job.find(fqid) {
                Some(target) if target.subjobs().is_empty() => vec![fqid],
                Some(target) => target.subjobs().iter().map(Job::fqid).collect(),
                None => return Err(GantryError::JobNotFound(fqid)),
            };
            for leaf in leaves {
                changes.step(job, leaf, status, Mode::Forced)?;
            }
            Ok(())
        })
        .await
        .map(|(job, _, _)| job)
    }

    /// Delete a job. Active jobs are killed first unless `force` is set.
    pub async fn remove(self: &Arc<Self>, id: JobId, force: bool) -> Result<()> {
        if !force {
            match self.get(id).await {
                Ok(job) if job.leaves().iter().any(|l| self.graph.is_legal(l.status(), JobStatus::Killed)) => {
                    match self.kill(id).await {
                        Ok(handle) => match handle.wait().await {
                            Ok(_) | Err(GantryError::IllegalTransition { .. }) => {}
                            Err(e) => return Err(e),
                        },
                        Err(GantryError::IllegalTransition { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(_) | Err(GantryError::InaccessibleObject { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let guard = self.acquire(id).await?;
        let result = self.delete_locked(id).await;
        self.release(id, guard).await;
        let event = result?;
        self.job_locks.lock().await.remove(&id);
        self.publish(vec![event]).await;
        Ok(())
    }

    async fn delete_locked(&self, id: JobId) -> Result<TransitionEvent> {
        self.ensure_writable().await?;
        let from = match self.repository.load_one(id).await {
            Ok(job) => job.status(),
            Err(GantryError::InaccessibleObject { .. }) => JobStatus::Incomplete,
            Err(e) => {
                self.note_failure(&e);
                return Err(e);
            }
        };
        self.repository
            .delete(&[id])
            .await
            .inspect_err(|e| self.note_failure(e))?;

        self.index.write().await.remove(&id);
        self.resident.write().await.remove(&id);
        self.incomplete.write().await.remove(&id);
        Ok(TransitionEvent {
            fqid: Fqid::master(id),
            from,
            to: JobStatus::Removed,
            forced: false,
            aggregate: false,
            at: chrono::Utc::now(),
            reason: None,
        })
    }

    /// Write resident records changed outside a commit, such as records
    /// recovered from a backup. Returns how many jobs were written.
    pub async fn flush_all(&self) -> Result<usize> {
        let dirty: Vec<JobId> = self
            .resident
            .read()
            .await
            .iter()
            .filter(|(_, job)| job.is_dirty())
            .map(|(id, _)| *id)
            .collect();

        let mut written = 0;
        for id in dirty {
            self.locked_commit(id, Changes::new(&self.graph), |_, _| Ok(()))
                .await?;
            written += 1;
        }
        Ok(written)
    }

    // ==================== Commit path ====================

    async fn acquire(&self, id: JobId) -> Result<OwnedMutexGuard<()>> {
        self.ensure_writable().await?;
        let lock = self
            .job_locks
            .lock()
            .await
            .entry(id)
            .or_default()
            .clone();
        let wait = Duration::from_millis(self.config.job_lock_wait_ms);
        let guard = tokio::time::timeout(wait, lock.lock_owned())
            .await
            .map_err(|_| GantryError::LockContention {
                key: LockKey::Slot(id),
                holder: Some(self.repository.session_id().to_string()),
            })?;
        self.repository
            .lock(id)
            .await
            .inspect_err(|e| self.note_failure(e))?;
        Ok(guard)
    }

    async fn release(&self, id: JobId, guard: OwnedMutexGuard<()>) {
        if let Err(e) = self.repository.unlock(id).await {
            tracing::warn!(job_id = id, error = %e, "Failed to release slot lock");
        }
        drop(guard);
    }

    /// Lock, load a fresh copy, mutate, flush, release, publish. Returns the
    /// committed job, the closure's value and the published transitions.
    async fn locked_commit<T, F>(
        &self,
        id: JobId,
        changes: Changes<'_>,
        f: F,
    ) -> Result<(Job, T, Vec<TransitionEvent>)>
    where
        F: FnOnce(&mut Job, &mut Changes<'_>) -> Result<T>,
    {
        let guard = self.acquire(id).await?;
        let result = match self.load_fresh(id).await {
            Ok(job) => self.commit(job, changes, f).await,
            Err(e) => Err(e),
        };
        self.release(id, guard).await;
        let (job, (value, events)) = result?;
        self.publish(events.clone()).await;
        Ok((job, value, events))
    }

    /// Mutate a freshly loaded record and flush it. The in-memory copy is
    /// replaced only after the write succeeded. Caller holds the job lock.
    async fn commit<T, F>(
        &self,
        mut job: Job,
        mut changes: Changes<'_>,
        f: F,
    ) -> Result<(Job, (T, Vec<TransitionEvent>))>
    where
        F: FnOnce(&mut Job, &mut Changes<'_>) -> Result<T>,
    {
        self.ensure_writable().await?;
        let value = f(&mut job, &mut changes)?;
        changes.finish(&mut job);
        if let Err(e) = self.repository.flush_one(&mut job).await {
            self.note_failure(&e);
            return Err(e);
        }
        self.install(&job).await;
        Ok((job, (value, changes.into_events())))
    }

    async fn load_fresh(&self, id: JobId) -> Result<Job> {
        match self.repository.load_one(id).await {
            Ok(job) => {
                self.incomplete.write().await.remove(&id);
                Ok(job)
            }
            Err(e) => {
                match &e {
                    GantryError::InaccessibleObject { reason, .. } => {
                        tracing::warn!(job_id = id, reason = %reason, "Job record inaccessible");
                        self.incomplete.write().await.insert(id, reason.clone());
                        self.resident.write().await.remove(&id);
                        let mut index = self.index.write().await;
                        let record = index.entry(id).or_insert_with(|| IndexRecord::incomplete(id));
                        record.status = JobStatus::Incomplete;
                    }
                    GantryError::JobNotFound(_) => {
                        self.index.write().await.remove(&id);
                        self.resident.write().await.remove(&id);
                    }
                    other => self.note_failure(other),
                }
                Err(e)
            }
        }
    }

    async fn install(&self, job: &Job) {
        self.index.write().await.insert(job.id, job.index_record());
        self.resident.write().await.insert(job.id, job.clone());
    }

    // ==================== Degraded mode ====================

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn note_failure(&self, error: &GantryError) {
        if error.is_medium_failure() && !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::error!(error = %error, "Storage medium failed, registry is now read-only");
        }
    }

    /// Refuse writes while degraded, unless the medium has come back.
    async fn ensure_writable(&self) -> Result<()> {
        if !self.is_degraded() {
            return Ok(());
        }
        match self.repository.probe().await {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                tracing::info!("Storage medium recovered, registry writable again");
                Ok(())
            }
            Err(e) => Err(GantryError::ReadOnly(e.to_string())),
        }
    }

    /// Whether an operation for this job is queued or running on the pool.
    pub async fn is_busy(&self, id: JobId) -> bool {
        self.pool.is_busy(&TaskKey::Job(id)).await
    }
}

/// Undo the optimistic `submitting`: back to `new` for a first submission,
/// `failed` for a resubmission. Leaves that already moved on are kept.
fn revert_steps(
    op: Operation,
    targets: &[Fqid],
) -> impl FnOnce(&mut Job, &mut Changes<'_>) -> Result<()> + '_ {
    let (to, mode) = match op {
        Operation::Submit => (JobStatus::New, Mode::Rollback),
        _ => (JobStatus::Failed, Mode::Backend),
    };
    move |job, changes| {
        for fqid in targets {
            let submitting = job
                .find(*fqid)
                .map(|leaf| leaf.status() == JobStatus::Submitting)
                .unwrap_or(false);
            if submitting {
                changes.step(job, *fqid, to, mode)?;
            }
        }
        Ok(())
    }
}
