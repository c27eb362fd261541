use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::job::{Fqid, JobId, JobStatus};
use crate::repository::lock::LockKey;

#[derive(Error, Debug)]
pub enum GantryError {
    #[error("Storage error on {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry is read-only, storage medium unavailable: {0}")]
    ReadOnly(String),

    #[error("Job {id} is inaccessible: {reason}")]
    InaccessibleObject { id: Fqid, reason: String },

    #[error("Illegal transition of job {fqid} from {from} to {to}")]
    IllegalTransition {
        fqid: Fqid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Lock {key} is held by {}", .holder.as_deref().unwrap_or("another session"))]
    LockContention { key: LockKey, holder: Option<String> },

    #[error("Backend {backend} failed for job {fqid}: {message}")]
    Backend {
        fqid: Fqid,
        backend: String,
        message: String,
    },

    #[error("{operation} timed out after {after:?}{}", .fqid.as_ref().map(|f| format!(" for job {f}")).unwrap_or_default())]
    Timeout {
        fqid: Option<Fqid>,
        operation: String,
        after: Duration,
    },

    #[error("Credential {requirement} unavailable: {reason}")]
    Credential { requirement: String, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(Fqid),

    #[error("Cannot change {field} of job {id} after submission")]
    Immutable { id: JobId, field: &'static str },

    #[error("No backend adapter for application {application} on backend {backend}")]
    NoAdapter {
        application: String,
        backend: String,
    },

    #[error("Worker pool is not accepting tasks")]
    PoolShutdown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GantryError {
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GantryError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Errors a caller may retry without administrative action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GantryError::LockContention { .. }
                | GantryError::Timeout { .. }
                | GantryError::Credential { .. }
                | GantryError::IllegalTransition { .. }
        )
    }

    /// The job this error is bound to, when it is local to a single job.
    pub fn fqid(&self) -> Option<Fqid> {
        match self {
            GantryError::InaccessibleObject { id, .. } => Some(*id),
            GantryError::IllegalTransition { fqid, .. } => Some(*fqid),
            GantryError::Backend { fqid, .. } => Some(*fqid),
            GantryError::Timeout { fqid, .. } => *fqid,
            GantryError::JobNotFound(fqid) => Some(*fqid),
            GantryError::Immutable { id, .. } => Some(Fqid::master(*id)),
            GantryError::LockContention {
                key: LockKey::Slot(id),
                ..
            } => Some(Fqid::master(*id)),
            _ => None,
        }
    }

    /// True when the storage medium itself failed rather than one record.
    pub fn is_medium_failure(&self) -> bool {
        matches!(self, GantryError::Storage { .. } | GantryError::ReadOnly(_))
    }
}

pub type Result<T> = std::result::Result<T, GantryError>;
