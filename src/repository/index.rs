use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use super::storage;
use crate::error::Result;
use crate::job::{IndexRecord, JobId};

/// Summaries of every master job in one bucket.
pub type BucketIndex = BTreeMap<JobId, IndexRecord>;

/// Result of reading all bucket indexes at startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexScan {
    pub records: Vec<IndexRecord>,
    /// Ids whose slot exists but could not be read.
    pub incomplete: Vec<JobId>,
    /// Index entries added for slots missing from the index.
    pub rebuilt: Vec<JobId>,
    /// Index entries dropped because their slot is gone.
    pub dropped: Vec<JobId>,
}

/// Read a bucket index. A missing file is an empty index; an unreadable
/// one yields `None` so the caller rebuilds it from the slots.
pub async fn read_bucket(path: &Path) -> Result<Option<BucketIndex>> {
    let Some(bytes) = storage::read_optional(path).await? else {
        return Ok(Some(BucketIndex::new()));
    };
    match serde_json::from_slice(&bytes) {
        Ok(index) => Ok(Some(index)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable index");
            Ok(None)
        }
    }
}

pub async fn write_bucket(path: &Path, index: &BucketIndex) -> Result<()> {
    storage::safe_write(path, &serde_json::to_vec_pretty(index)?).await
}

pub async fn read_subjobs(path: &Path) -> Result<Vec<IndexRecord>> {
    let Some(bytes) = storage::read_optional(path).await? else {
        return Ok(Vec::new());
    };
    Ok(serde_json::from_slice(&bytes).unwrap_or_default())
}

pub async fn write_subjobs(path: &Path, records: &[IndexRecord]) -> Result<()> {
    storage::safe_write(path, &serde_json::to_vec_pretty(records)?).await
}
