use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for Docker-based execution in the local backend.
///
/// When enabled, job commands run in sandboxed containers instead of
/// directly on the host.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Run inside Docker. If false, all other settings are ignored.
    pub enabled: bool,
    /// Docker image to use for job execution
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Where and how job records are persisted.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub root: PathBuf,
    /// Name of the registry directory below `root`.
    pub registry_name: String,
    /// Number of ids grouped into one bucket directory.
    pub bucket_size: u64,
    /// How long a lock request waits for another session before failing.
    pub lock_wait_ms: u64,
    /// Sessions that have not refreshed their heartbeat for this long are
    /// considered dead and their locks may be reaped.
    pub session_expiry_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("gantry"),
            registry_name: "jobs".to_string(),
            bucket_size: 1000,
            lock_wait_ms: 2000,
            session_expiry_ms: 30_000,
            heartbeat_interval_ms: 5_000,
        }
    }
}

impl RepositoryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_registry_name(mut self, name: impl Into<String>) -> Self {
        self.registry_name = name.into();
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_session_expiry(mut self, expiry: Duration) -> Self {
        self.session_expiry_ms = expiry.as_millis() as u64;
        self
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join(&self.registry_name)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent executors.
    pub workers: usize,
    /// Upper bound on a single backend call.
    pub task_timeout_ms: u64,
    /// How long shutdown waits for in-flight tasks before abandoning them.
    pub shutdown_timeout_ms: u64,
    pub default_priority: u8,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            task_timeout_ms: 60_000,
            shutdown_timeout_ms: 10_000,
            default_priority: 5,
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Base loop interval; decides how often backends are checked for being due.
    pub poll_interval_ms: u64,
    /// Poll interval for backends without an explicit override.
    pub default_backend_poll_interval_ms: u64,
    pub backend_poll_intervals: HashMap<String, u64>,
    /// Largest number of jobs handed to one adapter call.
    pub max_jobs_per_call: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            default_backend_poll_interval_ms: 30_000,
            backend_poll_intervals: HashMap::new(),
            max_jobs_per_call: 100,
        }
    }
}

impl MonitoringConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_backend_interval(mut self, backend: impl Into<String>, interval: Duration) -> Self {
        self.backend_poll_intervals
            .insert(backend.into(), interval.as_millis() as u64);
        self
    }

    pub fn with_default_backend_interval(mut self, interval: Duration) -> Self {
        self.default_backend_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_jobs_per_call(mut self, max: usize) -> Self {
        self.max_jobs_per_call = max.max(1);
        self
    }

    pub fn backend_interval(&self, backend: &str) -> Duration {
        Duration::from_millis(
            self.backend_poll_intervals
                .get(backend)
                .copied()
                .unwrap_or(self.default_backend_poll_interval_ms),
        )
    }
}

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// How long a validity answer from the gate is trusted.
    pub cache_ttl_ms: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self { cache_ttl_ms: 10_000 }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long an operation waits for a per-job lock held by another task.
    pub job_lock_wait_ms: u64,
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            job_lock_wait_ms: 5_000,
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GantryConfig {
    pub repository: RepositoryConfig,
    pub registry: RegistryConfig,
    pub pool: WorkerPoolConfig,
    pub monitoring: MonitoringConfig,
    pub credentials: CredentialConfig,
    pub sandbox: SandboxConfig,
}

impl GantryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            repository: RepositoryConfig::new(root),
            ..Default::default()
        }
    }

    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.monitoring = monitoring;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.image, "alpine:latest");
        assert!(cfg.network_disabled);
        assert_eq!(cfg.memory_limit.as_deref(), Some("256m"));
    }

    #[test]
    fn repository_config_default() {
        let cfg = RepositoryConfig::default();
        assert_eq!(cfg.bucket_size, 1000);
        assert_eq!(cfg.session_expiry_ms, 30_000);
        assert_eq!(cfg.registry_name, "jobs");
    }

    #[test]
    fn repository_config_builders() {
        let cfg = RepositoryConfig::new("/tmp/repo")
            .with_registry_name("box")
            .with_lock_wait(Duration::from_millis(250));
        assert_eq!(cfg.registry_dir(), PathBuf::from("/tmp/repo/box"));
        assert_eq!(cfg.lock_wait_ms, 250);
    }

    #[test]
    fn pool_config_default() {
        let cfg = WorkerPoolConfig::default();
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.default_priority, 5);
        assert_eq!(cfg.task_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn monitoring_backend_intervals() {
        let cfg = MonitoringConfig::default()
            .with_backend_interval("batch", Duration::from_secs(5))
            .with_max_jobs_per_call(0);
        assert_eq!(cfg.poll_interval_ms, 2_000);
        assert_eq!(cfg.backend_interval("batch"), Duration::from_secs(5));
        assert_eq!(cfg.backend_interval("local"), Duration::from_secs(30));
        assert_eq!(cfg.max_jobs_per_call, 1);
    }

    #[test]
    fn gantry_config_new() {
        let cfg = GantryConfig::new("/var/gantry")
            .with_pool(WorkerPoolConfig::default().with_workers(8));
        assert_eq!(cfg.repository.root, PathBuf::from("/var/gantry"));
        assert_eq!(cfg.pool.workers, 8);
        assert_eq!(cfg.credentials.cache_ttl_ms, 10_000);
    }
}
