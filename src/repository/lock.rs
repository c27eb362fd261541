use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::storage;
use crate::error::{GantryError, Result};
use crate::job::JobId;

/// A lockable resource in the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Slot(JobId),
    Bucket(u64),
    Counter,
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKey::Slot(id) => write!(f, "slot-{}", id),
            LockKey::Bucket(n) => write!(f, "bucket-{}", n),
            LockKey::Counter => write!(f, "counter"),
        }
    }
}

impl LockKey {
    fn file_name(&self) -> String {
        format!("{}.lock", self)
    }

    fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".lock")?;
        if stem == "counter" {
            return Some(LockKey::Counter);
        }
        if let Some(id) = stem.strip_prefix("slot-") {
            return id.parse().ok().map(LockKey::Slot);
        }
        stem.strip_prefix("bucket-")?.parse().ok().map(LockKey::Bucket)
    }
}

/// Liveness record of one repository session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl SessionInfo {
    pub fn is_alive(&self, expiry: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.heartbeat_at);
        age.to_std().map(|age| age < expiry).unwrap_or(true)
    }
}

/// Cross-process locks held by one session.
///
/// Each lock is a file under `locks/` whose content is the owning session
/// id. The file is written aside and hard-linked into place, so it never
/// appears empty. Locks are reentrant within the session. A lock whose owner
/// has stopped refreshing its session file for longer than the expiry is
/// stale and gets reaped by the next contender.
#[derive(Debug)]
pub struct SessionLocks {
    info: SessionInfo,
    locks_dir: PathBuf,
    sessions_dir: PathBuf,
    expiry: Duration,
    wait: Duration,
    held: Mutex<HashMap<LockKey, usize>>,
}

impl SessionLocks {
    pub async fn open(
        locks_dir: PathBuf,
        sessions_dir: PathBuf,
        expiry: Duration,
        wait: Duration,
    ) -> Result<Self> {
        for dir in [&locks_dir, &sessions_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| GantryError::storage(dir, e))?;
        }

        let now = Utc::now();
        let locks = Self {
            info: SessionInfo {
                id: Uuid::new_v4().to_string(),
                pid: std::process::id(),
                started_at: now,
                heartbeat_at: now,
            },
            locks_dir,
            sessions_dir,
            expiry,
            wait,
            held: Mutex::new(HashMap::new()),
        };
        locks.write_session(now).await?;

        tracing::info!(session = %locks.info.id, pid = locks.info.pid, "Repository session opened");
        Ok(locks)
    }

    pub fn session_id(&self) -> &str {
        &self.info.id
    }

    fn lock_path(&self, key: LockKey) -> PathBuf {
        self.locks_dir.join(key.file_name())
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.session", id))
    }

    async fn write_session(&self, heartbeat_at: DateTime<Utc>) -> Result<()> {
        let info = SessionInfo {
            heartbeat_at,
            ..self.info.clone()
        };
        let bytes = serde_json::to_vec(&info)?;
        storage::safe_write(&self.session_path(&self.info.id), &bytes).await
    }

    /// Refresh this session's heartbeat.
    pub async fn refresh(&self) -> Result<()> {
        self.write_session(Utc::now()).await
    }

    /// Acquire `key`, waiting up to the configured lock wait for another
    /// session to release it.
    pub async fn acquire(&self, key: LockKey) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.wait;
        loop {
            let holder = match self.try_acquire(key).await? {
                None => return Ok(()),
                Some(holder) => holder,
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::debug!(lock = %key, holder = %holder, "Lock wait expired");
                return Err(GantryError::LockContention {
                    key,
                    holder: Some(holder),
                });
            }
            let jitter = rand::thread_rng().gen_range(10..=50);
            let pause = Duration::from_millis(jitter).min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// One attempt at acquiring `key`. Returns the holding session when the
    /// lock belongs to someone else.
    pub async fn try_acquire(&self, key: LockKey) -> Result<Option<String>> {
        let mut held = self.held.lock().await;
        if let Some(count) = held.get_mut(&key) {
            *count += 1;
            return Ok(None);
        }

        let path = self.lock_path(key);
        for _ in 0..2 {
            if self.create_lock(&path).await? {
                held.insert(key, 1);
                return Ok(None);
            }

            let holder = match read_holder(&path).await? {
                Some(holder) => holder,
                // Released between our attempt and the read.
                None => continue,
            };
            if holder == self.info.id {
                held.insert(key, 1);
                return Ok(None);
            }
            if holder.is_empty() || self.is_session_alive(&holder).await? {
                return Ok(Some(holder_name(holder)));
            }

            if self.reap(&path, &holder).await? {
                tracing::warn!(lock = %key, stale_session = %holder, "Reaped lock of expired session");
            }
        }
        let holder = read_holder(&path).await?;
        Ok(Some(holder.map(holder_name).unwrap_or_else(|| "unknown".to_string())))
    }

    /// Create the lock file holding this session's id. Returns false when
    /// the lock already exists.
    async fn create_lock(&self, path: &Path) -> Result<bool> {
        let staged = storage::with_suffix(path, &format!(".{}.tmp", self.info.id));
        write_synced(&staged, self.info.id.as_bytes())
            .await
            .map_err(|e| GantryError::storage(&staged, e))?;
        let linked = fs::hard_link(&staged, path).await;
        storage::remove_file(&staged).await?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(GantryError::storage(path, e)),
        }
    }

    /// Remove the lock at `path` if it still belongs to `stale`.
    ///
    /// The lock is renamed to a tombstone first and its content checked
    /// there. A lock that another contender took over in the meantime is
    /// linked back into place.
    async fn reap(&self, path: &Path, stale: &str) -> Result<bool> {
        let tombstone = storage::with_suffix(path, &format!(".reap-{}", Uuid::new_v4()));
        match fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(GantryError::storage(path, e)),
        }

        let holder = read_holder(&tombstone).await?;
        if holder.as_deref() == Some(stale) {
            storage::remove_file(&tombstone).await?;
            return Ok(true);
        }

        match fs::hard_link(&tombstone, path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::error!(
                    lock = %path.display(),
                    holder = holder.as_deref().unwrap_or(""),
                    "Lock taken over while being reaped"
                );
            }
            Err(e) => return Err(GantryError::storage(path, e)),
        }
        storage::remove_file(&tombstone).await?;
        Ok(false)
    }

    pub async fn release(&self, key: LockKey) -> Result<()> {
        let mut held = self.held.lock().await;
        let Some(count) = held.get_mut(&key) else {
            return Ok(());
        };
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        held.remove(&key);
        storage::remove_file(&self.lock_path(key)).await
    }

    pub async fn holds(&self, key: LockKey) -> bool {
        self.held.lock().await.contains_key(&key)
    }

    /// Session currently holding `key`, if any.
    pub async fn holder(&self, key: LockKey) -> Result<Option<String>> {
        read_holder(&self.lock_path(key)).await
    }

    /// Liveness record of a session. Falls back to the backup while a
    /// heartbeat is replacing the file.
    pub async fn session(&self, id: &str) -> Result<Option<SessionInfo>> {
        let path = self.session_path(id);
        let bytes = match storage::read_optional(&path).await? {
            Some(bytes) => Some(bytes),
            None => storage::read_optional(&storage::backup_path(&path)).await?,
        };
        Ok(bytes.and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    pub async fn is_session_alive(&self, id: &str) -> Result<bool> {
        Ok(self
            .session(id)
            .await?
            .map(|info| info.is_alive(self.expiry, Utc::now()))
            .unwrap_or(false))
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        for name in storage::list_dir(&self.sessions_dir).await? {
            let Some(id) = name.strip_suffix(".session") else {
                continue;
            };
            if let Some(info) = self.session(id).await? {
                sessions.push(info);
            }
        }
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    /// Live sessions other than this one.
    pub async fn other_sessions(&self) -> Result<Vec<SessionInfo>> {
        let now = Utc::now();
        Ok(self
            .sessions()
            .await?
            .into_iter()
            .filter(|s| s.id != self.info.id && s.is_alive(self.expiry, now))
            .collect())
    }

    /// Remove every lock and session file belonging to an expired session.
    pub async fn reap_locks(&self) -> Result<Vec<LockKey>> {
        let mut reaped = Vec::new();
        for name in storage::list_dir(&self.locks_dir).await? {
            let Some(key) = LockKey::from_file_name(&name) else {
                continue;
            };
            let path = self.locks_dir.join(&name);
            let Some(holder) = read_holder(&path).await? else {
                continue;
            };
            if holder.is_empty() || holder == self.info.id {
                continue;
            }
            if !self.is_session_alive(&holder).await? && self.reap(&path, &holder).await? {
                tracing::info!(lock = %key, session = %holder, "Reaped stale lock");
                reaped.push(key);
            }
        }

        let now = Utc::now();
        for info in self.sessions().await? {
            if info.id != self.info.id && !info.is_alive(self.expiry, now) {
                let path = self.session_path(&info.id);
                storage::remove_file(&path).await?;
                storage::remove_file(&storage::backup_path(&path)).await?;
            }
        }
        Ok(reaped)
    }

    /// Release every lock held by this session and remove its session file.
    pub async fn close(&self) -> Result<()> {
        let keys: Vec<LockKey> = self.held.lock().await.drain().map(|(k, _)| k).collect();
        for key in keys {
            storage::remove_file(&self.lock_path(key)).await?;
        }
        let session_path = self.session_path(&self.info.id);
        storage::remove_file(&session_path).await?;
        storage::remove_file(&storage::backup_path(&session_path)).await?;
        tracing::info!(session = %self.info.id, "Repository session closed");
        Ok(())
    }
}

async fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

fn holder_name(holder: String) -> String {
    if holder.is_empty() {
        "unknown".to_string()
    } else {
        holder
    }
}

async fn read_holder(path: &Path) -> Result<Option<String>> {
    Ok(storage::read_optional(path)
        .await?
        .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string()))
}

/// Periodically refreshes the session file until cancelled.
pub fn spawn_heartbeat(
    locks: Arc<SessionLocks>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = locks.refresh().await {
                        tracing::warn!(session = %locks.session_id(), error = %e, "Session heartbeat failed");
                    }
                }
            }
        }
    })
}
