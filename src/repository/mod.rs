//! Persistent job repository.
//!
//! Jobs are stored one slot per master id, grouped into buckets:
//!
//! - **Records** are schema-versioned JSON envelopes written crash-safely
//!   (`data.json.new` then rename, previous version kept as `data.json~`).
//! - **Indexes** per bucket summarize every master so the registry can list
//!   jobs without loading them.
//! - **Sessions** hold cross-process lock files; see [`lock`].
//!
//! The repository knows nothing about status transitions. It stores what
//! it is given and reports what it finds.

pub mod index;
pub mod lock;
pub mod schema;
pub mod storage;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::RepositoryConfig;
use crate::error::{GantryError, Result};
use crate::job::{Fqid, IndexRecord, Job, JobId};
use index::IndexScan;
use lock::{LockKey, SessionInfo, SessionLocks};
use schema::{SchemaRegistry, JOB_TYPE};
use storage::Layout;

#[derive(Debug, Default)]
struct RepositoryStats {
    slot_writes: AtomicU64,
    index_writes: AtomicU64,
    loads: AtomicU64,
    recoveries: AtomicU64,
}

/// Counters of repository activity since the session opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Record files written (masters and subjobs).
    pub slot_writes: u64,
    pub index_writes: u64,
    pub loads: u64,
    /// Records read from their backup copy.
    pub recoveries: u64,
}

#[derive(Debug)]
pub struct Repository {
    layout: Layout,
    schema: SchemaRegistry,
    locks: Arc<SessionLocks>,
    stats: RepositoryStats,
    index_guard: Mutex<()>,
    counter_guard: Mutex<()>,
    cancel: CancellationToken,
}

impl Repository {
    pub async fn open(config: RepositoryConfig) -> Result<Self> {
        Self::open_with_schema(config, SchemaRegistry::standard()).await
    }

    pub async fn open_with_schema(config: RepositoryConfig, schema: SchemaRegistry) -> Result<Self> {
        let layout = Layout::new(config.registry_dir(), config.bucket_size);
        tokio::fs::create_dir_all(layout.base())
            .await
            .map_err(|e| GantryError::storage(layout.base(), e))?;

        let locks = Arc::new(
            SessionLocks::open(
                layout.locks_dir(),
                layout.sessions_dir(),
                Duration::from_millis(config.session_expiry_ms),
                Duration::from_millis(config.lock_wait_ms),
            )
            .await?,
        );

        let cancel = CancellationToken::new();
        lock::spawn_heartbeat(
            locks.clone(),
            Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            cancel.clone(),
        );

        tracing::info!(path = %layout.base().display(), "Repository opened");

        Ok(Self {
            layout,
            schema,
            locks,
            stats: RepositoryStats::default(),
            index_guard: Mutex::new(()),
            counter_guard: Mutex::new(()),
            cancel,
        })
    }

    pub fn session_id(&self) -> &str {
        self.locks.session_id()
    }

    pub fn base(&self) -> &Path {
        self.layout.base()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn with_lock<T, F, Fut>(&self, key: LockKey, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.locks.acquire(key).await?;
        let result = f().await;
        let released = self.locks.release(key).await;
        let value = result?;
        released?;
        Ok(value)
    }

    async fn next_id(&self) -> Result<JobId> {
        let _guard = self.counter_guard.lock().await;
        self.with_lock(LockKey::Counter, || self.bump_counter())
            .await
    }

    async fn bump_counter(&self) -> Result<JobId> {
        let path = self.layout.counter_file();
        let mut next = 0;
        for candidate in [path.clone(), storage::backup_path(&path)] {
            if let Some(bytes) = storage::read_optional(&candidate).await? {
                if let Ok(value) = String::from_utf8_lossy(&bytes).trim().parse::<JobId>() {
                    next = value;
                    break;
                }
                tracing::warn!(path = %candidate.display(), "Ignoring unreadable id counter");
            }
        }
        storage::safe_write(&path, (next + 1).to_string().as_bytes()).await?;
        Ok(next)
    }

    /// Persist a new master job, assigning its id. Ids are never reused.
    pub async fn add(&self, job: &mut Job) -> Result<JobId> {
        if job.master.is_some() {
            return Err(GantryError::Internal(
                "subjobs are stored with their master".to_string(),
            ));
        }
        let id = self.next_id().await?;
        job.assign_id(id);
        for sub in job.subjobs_mut() {
            sub.mark_dirty();
        }
        self.flush_one(job).await?;
        tracing::debug!(job_id = id, subjobs = job.subjobs().len(), "Job added to repository");
        Ok(id)
    }

    /// Write every dirty job. Returns how many jobs were written.
    pub async fn flush(&self, jobs: &mut [Job]) -> Result<usize> {
        let mut written = 0;
        for job in jobs.iter_mut() {
            if self.flush_one(job).await? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Write one job if it has unflushed changes. A clean job costs no I/O.
    pub async fn flush_one(&self, job: &mut Job) -> Result<bool> {
        if !job.is_dirty() {
            return Ok(false);
        }
        job.sync_aggregate(Utc::now());

        let id = job.id;
        let snapshot: &Job = job;
        self.with_lock(LockKey::Slot(id), || self.write_slot(snapshot))
            .await?;
        job.mark_clean();
        Ok(true)
    }

    async fn write_slot(&self, job: &Job) -> Result<()> {
        let id = job.id;

        let mut subjobs_written = false;
        for sub in job.subjobs() {
            if !sub.own_dirty() {
                continue;
            }
            let bytes = self.schema.encode(JOB_TYPE, sub)?;
            storage::safe_write(&self.layout.subjob_file(id, sub.id as usize), &bytes).await?;
            self.stats.slot_writes.fetch_add(1, Ordering::Relaxed);
            subjobs_written = true;
        }
        if subjobs_written {
            let records: Vec<IndexRecord> = job.subjobs().iter().map(Job::index_record).collect();
            index::write_subjobs(&self.layout.subjob_index(id), &records).await?;
            self.stats.index_writes.fetch_add(1, Ordering::Relaxed);
        }

        if job.own_dirty() {
            let bytes = self.schema.encode(JOB_TYPE, job)?;
            storage::safe_write(&self.layout.data_file(id), &bytes).await?;
            self.stats.slot_writes.fetch_add(1, Ordering::Relaxed);

            for name in storage::list_dir(&self.layout.subjobs_dir(id)).await? {
                if let Ok(n) = name.parse::<usize>() {
                    if n >= job.subjobs().len() {
                        storage::remove_tree(&self.layout.subjobs_dir(id).join(&name)).await?;
                    }
                }
            }

            self.update_index(
                self.layout.bucket_of(id),
                vec![(id, Some(job.index_record()))],
            )
            .await?;
        }
        Ok(())
    }

    async fn update_index(
        &self,
        bucket: u64,
        changes: Vec<(JobId, Option<IndexRecord>)>,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let _guard = self.index_guard.lock().await;
        self.with_lock(LockKey::Bucket(bucket), || async {
            let path = self.layout.bucket_index(bucket);
            let mut bucket_index = index::read_bucket(&path).await?.unwrap_or_default();
            for (id, record) in changes {
                match record {
                    Some(record) => {
                        bucket_index.insert(id, record);
                    }
                    None => {
                        bucket_index.remove(&id);
                    }
                }
            }
            index::write_bucket(&path, &bucket_index).await?;
            self.stats.index_writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .await
    }

    /// Load a batch of jobs. Each id succeeds or fails on its own.
    pub async fn load(&self, ids: &[JobId]) -> BTreeMap<JobId, Result<Job>> {
        let mut loaded = BTreeMap::new();
        for &id in ids {
            if loaded.contains_key(&id) {
                continue;
            }
            loaded.insert(id, self.load_one(id).await);
        }
        loaded
    }

    /// Load a master job together with all of its subjobs.
    pub async fn load_one(&self, id: JobId) -> Result<Job> {
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let fqid = Fqid::master(id);
        if !storage::exists(&self.layout.slot_dir(id)).await? {
            return Err(GantryError::JobNotFound(fqid));
        }

        let mut job = self.read_record(fqid, &self.layout.data_file(id)).await?;
        if job.id != id || job.master.is_some() {
            return Err(GantryError::InaccessibleObject {
                id: fqid,
                reason: format!("slot holds record {}", job.fqid()),
            });
        }

        let mut subjobs = Vec::with_capacity(job.declared_subjobs());
        for n in 0..job.declared_subjobs() {
            let sub_fqid = Fqid::sub(id, n);
            let sub = self
                .read_record(sub_fqid, &self.layout.subjob_file(id, n))
                .await?;
            if sub.fqid() != sub_fqid {
                return Err(GantryError::InaccessibleObject {
                    id: sub_fqid,
                    reason: format!("subjob slot holds record {}", sub.fqid()),
                });
            }
            subjobs.push(sub);
        }
        job.attach_subjobs(subjobs);
        Ok(job)
    }

    async fn read_record(&self, fqid: Fqid, path: &Path) -> Result<Job> {
        let mut primary = storage::read_optional(path).await?;
        if primary.is_none() {
            // Another session may be between the two renames of a safe write.
            tokio::time::sleep(Duration::from_millis(20)).await;
            primary = storage::read_optional(path).await?;
        }

        let reason = match primary {
            Some(bytes) => match self.schema.decode::<Job>(JOB_TYPE, &bytes) {
                Ok(job) => return Ok(job),
                Err(reason) => reason,
            },
            None => "record file missing".to_string(),
        };

        let backup = storage::backup_path(path);
        let Some(bytes) = storage::read_optional(&backup).await? else {
            return Err(GantryError::InaccessibleObject { id: fqid, reason });
        };
        match self.schema.decode::<Job>(JOB_TYPE, &bytes) {
            Ok(mut job) => {
                tracing::warn!(
                    job_id = %fqid,
                    reason = %reason,
                    "Recovered job from backup, recent changes may be lost"
                );
                self.stats.recoveries.fetch_add(1, Ordering::Relaxed);
                job.mark_dirty();
                Ok(job)
            }
            Err(backup_reason) => Err(GantryError::InaccessibleObject {
                id: fqid,
                reason: format!("{}; backup: {}", reason, backup_reason),
            }),
        }
    }

    /// Subjob summaries of a master, read from its subjob index.
    pub async fn subjob_index(&self, id: JobId) -> Result<Vec<IndexRecord>> {
        index::read_subjobs(&self.layout.subjob_index(id)).await
    }

    /// Delete jobs. Fails without deleting anything if another session holds
    /// any of the slots.
    pub async fn delete(&self, ids: &[JobId]) -> Result<()> {
        let ids: BTreeSet<JobId> = ids.iter().copied().collect();
        let mut acquired = Vec::new();
        let mut failure = None;
        for &id in &ids {
            match self.locks.try_acquire(LockKey::Slot(id)).await {
                Ok(None) => acquired.push(id),
                Ok(Some(holder)) => {
                    failure = Some(GantryError::LockContention {
                        key: LockKey::Slot(id),
                        holder: Some(holder),
                    });
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let result = match failure {
            Some(e) => Err(e),
            None => self.delete_locked(&ids).await,
        };
        for id in acquired {
            self.locks.release(LockKey::Slot(id)).await?;
        }
        result
    }

    async fn delete_locked(&self, ids: &BTreeSet<JobId>) -> Result<()> {
        let mut by_bucket: BTreeMap<u64, Vec<(JobId, Option<IndexRecord>)>> = BTreeMap::new();
        for &id in ids {
            storage::remove_tree(&self.layout.slot_dir(id)).await?;
            by_bucket
                .entry(self.layout.bucket_of(id))
                .or_default()
                .push((id, None));
            tracing::debug!(job_id = id, "Job deleted from repository");
        }
        for (bucket, changes) in by_bucket {
            self.update_index(bucket, changes).await?;
        }
        Ok(())
    }

    /// Read every bucket index and reconcile it with the slots on disk.
    pub async fn scan_index(&self) -> Result<IndexScan> {
        let mut scan = IndexScan::default();
        for name in storage::list_dir(self.layout.base()).await? {
            if let Some(bucket) = Layout::parse_bucket(&name) {
                self.scan_bucket(bucket, &mut scan).await?;
            }
        }
        scan.records.sort_by_key(|r| r.fqid);
        Ok(scan)
    }

    async fn scan_bucket(&self, bucket: u64, scan: &mut IndexScan) -> Result<()> {
        let slots: BTreeSet<JobId> = storage::list_dir(&self.layout.bucket_dir(bucket))
            .await?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        let mut bucket_index = index::read_bucket(&self.layout.bucket_index(bucket))
            .await?
            .unwrap_or_default();

        let mut changes = Vec::new();
        let stale: Vec<JobId> = bucket_index
            .keys()
            .filter(|id| !slots.contains(id))
            .copied()
            .collect();
        for id in stale {
            bucket_index.remove(&id);
            changes.push((id, None));
            scan.dropped.push(id);
        }

        for id in slots {
            if bucket_index.contains_key(&id) {
                continue;
            }
            match self.load_one(id).await {
                Ok(job) => {
                    let record = job.index_record();
                    bucket_index.insert(id, record.clone());
                    changes.push((id, Some(record)));
                    scan.rebuilt.push(id);
                }
                Err(e) if e.is_medium_failure() => return Err(e),
                Err(e) => {
                    tracing::warn!(job_id = id, error = %e, "Slot could not be indexed");
                    scan.incomplete.push(id);
                }
            }
        }

        if !changes.is_empty() {
            tracing::info!(bucket, changes = changes.len(), "Repaired bucket index");
            self.update_index(bucket, changes).await?;
        }
        scan.records.extend(bucket_index.into_values());
        Ok(())
    }

    /// Take the slot lock of a job for this session.
    pub async fn lock(&self, id: JobId) -> Result<()> {
        self.locks.acquire(LockKey::Slot(id)).await
    }

    pub async fn unlock(&self, id: JobId) -> Result<()> {
        self.locks.release(LockKey::Slot(id)).await
    }

    /// Session holding the slot lock of a job, if any.
    pub async fn lock_holder(&self, id: JobId) -> Result<Option<String>> {
        self.locks.holder(LockKey::Slot(id)).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>> {
        self.locks.sessions().await
    }

    pub async fn other_sessions(&self) -> Result<Vec<SessionInfo>> {
        self.locks.other_sessions().await
    }

    pub async fn reap_locks(&self) -> Result<Vec<LockKey>> {
        self.locks.reap_locks().await
    }

    /// Check that the medium accepts writes.
    pub async fn probe(&self) -> Result<()> {
        let path = self
            .layout
            .base()
            .join(format!(".probe-{}", self.session_id()));
        tokio::fs::write(&path, b"probe")
            .await
            .map_err(|e| GantryError::storage(&path, e))?;
        storage::remove_file(&path).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            slot_writes: self.stats.slot_writes.load(Ordering::Relaxed),
            index_writes: self.stats.index_writes.load(Ordering::Relaxed),
            loads: self.stats.loads.load(Ordering::Relaxed),
            recoveries: self.stats.recoveries.load(Ordering::Relaxed),
        }
    }

    /// Stop the heartbeat and release every lock this session holds.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.locks.close().await
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
