use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::JobStatus;
use crate::credentials::CredentialRequirement;
use crate::error::{GantryError, Result};

pub type JobId = u64;

/// Fully-qualified job identifier: a master id plus an optional subjob index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fqid {
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<usize>,
}

impl Fqid {
    pub fn master(id: JobId) -> Self {
        Self { id, sub: None }
    }

    pub fn sub(id: JobId, index: usize) -> Self {
        Self {
            id,
            sub: Some(index),
        }
    }

    pub fn is_subjob(&self) -> bool {
        self.sub.is_some()
    }

    pub fn master_fqid(&self) -> Fqid {
        Fqid::master(self.id)
    }
}

impl std::fmt::Display for Fqid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.sub {
            Some(sub) => write!(f, "{}.{}", self.id, sub),
            None => write!(f, "{}", self.id),
        }
    }
}

impl FromStr for Fqid {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parse_id = |v: &str| {
            v.parse::<JobId>()
                .map_err(|_| format!("invalid job id '{}'", s))
        };
        match s.split_once('.') {
            Some((master, sub)) => {
                let sub = sub
                    .parse::<usize>()
                    .map_err(|_| format!("invalid subjob index in '{}'", s))?;
                Ok(Fqid::sub(parse_id(master)?, sub))
            }
            None => Ok(Fqid::master(parse_id(s)?)),
        }
    }
}

/// Backend configuration referenced by a job. Opaque to the engine apart
/// from `kind`, which selects the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    pub kind: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl BackendRef {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRef {
    pub kind: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl ApplicationRef {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            settings: BTreeMap::new(),
        }
    }

    /// A shell command application.
    pub fn executable(command: impl Into<String>) -> Self {
        Self::new("executable").with_setting("command", command)
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

/// Everything needed to create a job.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub name: String,
    pub application: ApplicationRef,
    pub backend: BackendRef,
    pub credential: Option<CredentialRequirement>,
    pub comment: String,
    pub metadata: BTreeMap<String, String>,
    pub subjobs: usize,
}

impl JobSpec {
    pub fn new(application: ApplicationRef, backend: BackendRef) -> Self {
        Self {
            application,
            backend,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_subjobs(mut self, count: usize) -> Self {
        self.subjobs = count;
        self
    }

    pub fn with_credential(mut self, credential: CredentialRequirement) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A job record. Masters carry their subjobs in memory; on disk every
/// subjob is its own record under the master's slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<JobId>,
    status: JobStatus,
    #[serde(default)]
    pub name: String,
    application: ApplicationRef,
    backend: BackendRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRequirement>,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_id: Option<String>,
    #[serde(default)]
    subjob_count: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    status_times: BTreeMap<JobStatus, DateTime<Utc>>,
    #[serde(skip)]
    subjobs: Vec<Job>,
    #[serde(skip)]
    dirty: bool,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.master == other.master
            && self.status == other.status
            && self.name == other.name
            && self.application == other.application
            && self.backend == other.backend
            && self.credential == other.credential
            && self.comment == other.comment
            && self.metadata == other.metadata
            && self.remote_id == other.remote_id
            && self.created_at == other.created_at
            && self.status_times == other.status_times
            && self.subjobs == other.subjobs
    }
}

impl Job {
    /// Build an unsaved job from a spec. The id is assigned by the repository.
    pub fn from_spec(spec: &JobSpec) -> Self {
        let now = Utc::now();
        let master = Self {
            id: 0,
            master: None,
            status: JobStatus::New,
            name: spec.name.clone(),
            application: spec.application.clone(),
            backend: spec.backend.clone(),
            credential: spec.credential.clone(),
            comment: spec.comment.clone(),
            metadata: spec.metadata.clone(),
            remote_id: None,
            subjob_count: spec.subjobs,
            created_at: now,
            status_times: BTreeMap::from([(JobStatus::New, now)]),
            subjobs: Vec::new(),
            dirty: true,
        };

        let subjobs = (0..spec.subjobs)
            .map(|index| {
                let mut sub = master.clone();
                sub.id = index as JobId;
                sub.master = Some(0);
                sub.subjob_count = 0;
                sub.name = format!("{}.{}", spec.name, index);
                sub
            })
            .collect();

        Self { subjobs, ..master }
    }

    pub(crate) fn assign_id(&mut self, id: JobId) {
        self.id = id;
        for sub in &mut self.subjobs {
            sub.master = Some(id);
        }
        self.dirty = true;
    }

    pub fn fqid(&self) -> Fqid {
        match self.master {
            Some(master) => Fqid::sub(master, self.id as usize),
            None => Fqid::master(self.id),
        }
    }

    /// Current status. A master with subjobs reports the aggregate of its
    /// subjobs, so it cannot disagree with them.
    pub fn status(&self) -> JobStatus {
        if self.subjobs.is_empty() {
            self.status
        } else {
            aggregate_status(self.subjobs.iter().map(|s| s.status))
        }
    }

    /// Status as stored on this record, ignoring subjobs.
    pub fn own_status(&self) -> JobStatus {
        self.status
    }

    pub fn application(&self) -> &ApplicationRef {
        &self.application
    }

    pub fn backend(&self) -> &BackendRef {
        &self.backend
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn status_time(&self, status: JobStatus) -> Option<DateTime<Utc>> {
        self.status_times.get(&status).copied()
    }

    pub fn subjobs(&self) -> &[Job] {
        &self.subjobs
    }

    pub fn subjob(&self, index: usize) -> Option<&Job> {
        self.subjobs.get(index)
    }

    /// Number of subjobs this master declares on disk.
    pub fn declared_subjobs(&self) -> usize {
        self.subjob_count
    }

    pub fn has_been_submitted(&self) -> bool {
        self.status_times.contains_key(&JobStatus::Submitting)
    }

    /// True if this record or any subjob has unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.subjobs.iter().any(|s| s.dirty)
    }

    pub(crate) fn own_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
        for sub in &mut self.subjobs {
            sub.dirty = false;
        }
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
        self.dirty = true;
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
        self.dirty = true;
    }

    pub fn set_backend(&mut self, backend: BackendRef) -> Result<()> {
        self.ensure_mutable("backend")?;
        for sub in &mut self.subjobs {
            sub.backend = backend.clone();
            sub.dirty = true;
        }
        self.backend = backend;
        self.dirty = true;
        Ok(())
    }

    pub fn set_application(&mut self, application: ApplicationRef) -> Result<()> {
        self.ensure_mutable("application")?;
        for sub in &mut self.subjobs {
            sub.application = application.clone();
            sub.dirty = true;
        }
        self.application = application;
        self.dirty = true;
        Ok(())
    }

    fn ensure_mutable(&self, field: &'static str) -> Result<()> {
        if self.has_been_submitted() || self.status() != JobStatus::New {
            return Err(GantryError::Immutable { id: self.id, field });
        }
        Ok(())
    }

    /// Record a new status on this record only. Graph validation happens in
    /// the registry before this is called.
    pub(crate) fn apply_status(&mut self, status: JobStatus, at: DateTime<Utc>) {
        self.status = status;
        self.status_times.insert(status, at);
        self.dirty = true;
    }

    /// Recompute the stored master status from its subjobs.
    pub(crate) fn sync_aggregate(&mut self, at: DateTime<Utc>) {
        if self.subjobs.is_empty() {
            return;
        }
        let aggregate = self.status();
        if aggregate != self.status {
            self.apply_status(aggregate, at);
        }
    }

    pub(crate) fn set_remote_id(&mut self, remote_id: Option<String>) {
        self.remote_id = remote_id;
        self.dirty = true;
    }

    pub(crate) fn attach_subjobs(&mut self, subjobs: Vec<Job>) {
        self.subjobs = subjobs;
    }

    pub(crate) fn take_subjobs(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.subjobs)
    }

    pub(crate) fn subjobs_mut(&mut self) -> &mut [Job] {
        &mut self.subjobs
    }

    /// The record addressed by `fqid` within this master.
    pub fn find(&self, fqid: Fqid) -> Option<&Job> {
        if fqid.id != self.id || self.master.is_some() {
            return None;
        }
        match fqid.sub {
            None => Some(self),
            Some(index) => self.subjobs.get(index),
        }
    }

    pub(crate) fn find_mut(&mut self, fqid: Fqid) -> Option<&mut Job> {
        if fqid.id != self.id || self.master.is_some() {
            return None;
        }
        match fqid.sub {
            None => Some(self),
            Some(index) => self.subjobs.get_mut(index),
        }
    }

    /// Every addressable record: the master when it has no subjobs,
    /// otherwise each subjob.
    pub fn leaves(&self) -> Vec<&Job> {
        if self.subjobs.is_empty() {
            vec![self]
        } else {
            self.subjobs.iter().collect()
        }
    }

    pub fn index_record(&self) -> IndexRecord {
        IndexRecord {
            fqid: self.fqid(),
            status: self.status(),
            name: self.name.clone(),
            application: self.application.kind.clone(),
            backend: self.backend.kind.clone(),
            subjobs: self.subjobs.len().max(self.subjob_count),
            updated_at: self
                .status_times
                .values()
                .max()
                .copied()
                .unwrap_or(self.created_at),
        }
    }
}

/// Aggregate master status from subjob statuses, most significant first.
pub fn aggregate_status(statuses: impl IntoIterator<Item = JobStatus>) -> JobStatus {
    const PRECEDENCE: [JobStatus; 9] = [
        JobStatus::Submitting,
        JobStatus::Submitted,
        JobStatus::Running,
        JobStatus::Unknown,
        JobStatus::Incomplete,
        JobStatus::Failed,
        JobStatus::Killed,
        JobStatus::New,
        JobStatus::Completed,
    ];

    let seen: Vec<JobStatus> = statuses.into_iter().collect();
    if seen.is_empty() {
        return JobStatus::New;
    }
    if seen.iter().all(|s| *s == JobStatus::Removed) {
        return JobStatus::Removed;
    }
    PRECEDENCE
        .into_iter()
        .find(|candidate| seen.contains(candidate))
        .unwrap_or(JobStatus::Removed)
}

/// Lightweight per-job summary held in the registry cache without
/// loading the full record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub fqid: Fqid,
    pub status: JobStatus,
    pub name: String,
    pub application: String,
    pub backend: String,
    #[serde(default)]
    pub subjobs: usize,
    pub updated_at: DateTime<Utc>,
}

impl IndexRecord {
    pub fn id(&self) -> JobId {
        self.fqid.id
    }

    /// Placeholder for a slot whose record could not be read.
    pub fn incomplete(id: JobId) -> Self {
        Self {
            fqid: Fqid::master(id),
            status: JobStatus::Incomplete,
            name: String::new(),
            application: String::new(),
            backend: String::new(),
            subjobs: 0,
            updated_at: Utc::now(),
        }
    }
}
