use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{BackendAdapter, StatusUpdate, SubmitReceipt};
use crate::config::SandboxConfig;
use crate::error::{GantryError, Result};
use crate::job::{Fqid, Job, JobStatus};
use crate::repository::storage;

pub const BACKEND_NAME: &str = "local";
pub const EXIT_CODE_FILE: &str = "__exitcode__";
pub const KILLED_FILE: &str = "__killed__";

/// Runs the program given as arguments, captures its output and records the
/// exit code once it finishes.
const WRAPPER: &str =
    "\"$@\" >stdout 2>stderr; echo $? >__exitcode__.tmp; mv __exitcode__.tmp __exitcode__";

/// Runs executable applications as detached processes on this host.
///
/// Each job (or subjob) gets its own workspace directory below `workdir`.
/// When the sandbox is enabled the command runs in a Docker container with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
#[derive(Debug, Clone)]
pub struct LocalBackend {
    workdir: PathBuf,
    sandbox: SandboxConfig,
}

impl LocalBackend {
    pub fn new(workdir: impl Into<PathBuf>, sandbox: SandboxConfig) -> Self {
        Self {
            workdir: workdir.into(),
            sandbox,
        }
    }

    pub fn workspace(&self, fqid: Fqid) -> PathBuf {
        self.workdir.join(fqid.to_string())
    }

    /// Captured stdout of a job, once it has produced any.
    pub async fn output(&self, fqid: Fqid) -> Result<Option<String>> {
        let path = self.workspace(fqid).join("stdout");
        Ok(storage::read_optional(&path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
    }

    fn program(&self, command: &str, workspace: &Path) -> Vec<String> {
        if !self.sandbox.enabled {
            return vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        }

        let mut args = vec!["docker".to_string(), "run".to_string(), "--rm".to_string()];

        if self.sandbox.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.sandbox.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.sandbox.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push(format!("--volume={}:/work", workspace.display()));
        args.push("--workdir=/work".to_string());

        args.push(self.sandbox.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(command.to_string());
        args
    }

    async fn launch(&self, leaf: &Job) -> Result<String> {
        let fqid = leaf.fqid();
        let command = leaf
            .application()
            .setting("command")
            .ok_or_else(|| GantryError::Backend {
                fqid,
                backend: BACKEND_NAME.to_string(),
                message: format!(
                    "application '{}' has no command",
                    leaf.application().kind
                ),
            })?;

        let workspace = self.workspace(fqid);
        storage::remove_tree(&workspace).await?;
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| GantryError::storage(&workspace, e))?;

        tracing::info!(
            job_id = %fqid,
            command,
            sandboxed = self.sandbox.enabled,
            "Launching local job"
        );

        let mut wrapper = std::process::Command::new("sh");
        wrapper
            .arg("-c")
            .arg(WRAPPER)
            .arg("gantry-job")
            .args(self.program(command, &workspace))
            .current_dir(&workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let child = Command::from(wrapper)
            .spawn()
            .map_err(|e| GantryError::Backend {
                fqid,
                backend: BACKEND_NAME.to_string(),
                message: format!("failed to spawn: {}", e),
            })?;

        child
            .id()
            .map(|pid| pid.to_string())
            .ok_or_else(|| GantryError::Backend {
                fqid,
                backend: BACKEND_NAME.to_string(),
                message: "process exited before its pid was known".to_string(),
            })
    }

    async fn probe(&self, leaf: &Job) -> Result<JobStatus> {
        let workspace = self.workspace(leaf.fqid());
        let killed = storage::exists(&workspace.join(KILLED_FILE)).await?;
        if let Some(status) = read_exit_status(&workspace).await? {
            if killed && status == JobStatus::Failed {
                return Ok(JobStatus::Killed);
            }
            return Ok(status);
        }

        let alive = match leaf.remote_id() {
            Some(pid) => is_alive(pid).await,
            None => false,
        };
        if alive {
            return Ok(JobStatus::Running);
        }

        if killed {
            return Ok(JobStatus::Killed);
        }
        // The wrapper may have finished between the two checks.
        if let Some(status) = read_exit_status(&workspace).await? {
            return Ok(status);
        }
        Ok(JobStatus::Unknown)
    }
}

async fn read_exit_status(workspace: &Path) -> Result<Option<JobStatus>> {
    let Some(bytes) = storage::read_optional(&workspace.join(EXIT_CODE_FILE)).await? else {
        return Ok(None);
    };
    let code = String::from_utf8_lossy(&bytes).trim().parse::<i32>().ok();
    Ok(Some(match code {
        Some(0) => JobStatus::Completed,
        _ => JobStatus::Failed,
    }))
}

async fn is_alive(pid: &str) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[async_trait]
impl BackendAdapter for LocalBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn submit(&self, job: &Job) -> Result<SubmitReceipt> {
        let mut receipt = SubmitReceipt::default();
        for leaf in job.leaves() {
            let pid = self.launch(leaf).await?;
            receipt.remote_ids.push((leaf.fqid(), pid));
        }
        Ok(receipt)
    }

    async fn kill(&self, job: &Job) -> Result<()> {
        for leaf in job.leaves() {
            if !leaf.status().is_monitored() {
                continue;
            }
            let fqid = leaf.fqid();
            let workspace = self.workspace(fqid);
            tokio::fs::write(workspace.join(KILLED_FILE), b"")
                .await
                .map_err(|e| GantryError::storage(&workspace, e))?;

            let Some(pid) = leaf.remote_id() else {
                continue;
            };
            // Negative pid signals the whole process group of the job.
            let status = Command::new("kill")
                .arg("-TERM")
                .arg("--")
                .arg(format!("-{}", pid))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|e| GantryError::Backend {
                    fqid,
                    backend: BACKEND_NAME.to_string(),
                    message: format!("failed to run kill: {}", e),
                })?;
            if !status.success() && is_alive(pid).await {
                return Err(GantryError::Backend {
                    fqid,
                    backend: BACKEND_NAME.to_string(),
                    message: format!("could not signal process {}", pid),
                });
            }
            tracing::info!(job_id = %fqid, pid, "Killed local job");
        }
        Ok(())
    }

    async fn update_status(&self, jobs: &[Job]) -> Result<Vec<StatusUpdate>> {
        let mut updates = Vec::new();
        for job in jobs {
            for leaf in job.leaves() {
                if !leaf.status().is_monitored() {
                    continue;
                }
                // Launch still in flight.
                if leaf.status() == JobStatus::Submitting && leaf.remote_id().is_none() {
                    continue;
                }
                let status = self.probe(leaf).await?;
                if status != leaf.status() {
                    updates.push(StatusUpdate::new(leaf.fqid(), status));
                }
            }
        }
        Ok(updates)
    }
}
