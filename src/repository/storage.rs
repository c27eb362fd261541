use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{GantryError, Result};
use crate::job::JobId;

pub const DATA_FILE: &str = "data.json";
pub const INDEX_FILE: &str = "index.json";
pub const SUBJOB_DIR: &str = "subjobs";
pub const COUNTER_FILE: &str = "cnt";
pub const LOCKS_DIR: &str = "locks";
pub const SESSIONS_DIR: &str = "sessions";

/// Maps job ids onto paths below the registry directory.
///
/// ```text
/// <base>/cnt
/// <base>/<bucket>xxx/index.json
/// <base>/<bucket>xxx/<id>/data.json
/// <base>/<bucket>xxx/<id>/subjobs/index.json
/// <base>/<bucket>xxx/<id>/subjobs/<n>/data.json
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    base: PathBuf,
    bucket_size: u64,
}

impl Layout {
    pub fn new(base: impl Into<PathBuf>, bucket_size: u64) -> Self {
        Self {
            base: base.into(),
            bucket_size: bucket_size.max(1),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn bucket_of(&self, id: JobId) -> u64 {
        id / self.bucket_size
    }

    pub fn bucket_dir(&self, bucket: u64) -> PathBuf {
        self.base.join(format!("{}xxx", bucket))
    }

    /// Parse a bucket directory name back into its number.
    pub fn parse_bucket(name: &str) -> Option<u64> {
        name.strip_suffix("xxx")?.parse().ok()
    }

    pub fn bucket_index(&self, bucket: u64) -> PathBuf {
        self.bucket_dir(bucket).join(INDEX_FILE)
    }

    pub fn slot_dir(&self, id: JobId) -> PathBuf {
        self.bucket_dir(self.bucket_of(id)).join(id.to_string())
    }

    pub fn data_file(&self, id: JobId) -> PathBuf {
        self.slot_dir(id).join(DATA_FILE)
    }

    pub fn subjobs_dir(&self, id: JobId) -> PathBuf {
        self.slot_dir(id).join(SUBJOB_DIR)
    }

    pub fn subjob_file(&self, id: JobId, index: usize) -> PathBuf {
        self.subjobs_dir(id).join(index.to_string()).join(DATA_FILE)
    }

    pub fn subjob_index(&self, id: JobId) -> PathBuf {
        self.subjobs_dir(id).join(INDEX_FILE)
    }

    pub fn counter_file(&self) -> PathBuf {
        self.base.join(COUNTER_FILE)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.base.join(LOCKS_DIR)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join(SESSIONS_DIR)
    }
}

pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, "~")
}

pub fn staging_path(path: &Path) -> PathBuf {
    with_suffix(path, ".new")
}

/// Replace `path` with `bytes` without ever leaving a torn file behind.
///
/// The content goes to `<path>.new` first and is synced. The previous
/// version is kept as `<path>~` before the new file is renamed into place,
/// so a crash at any point leaves either the old or the new record readable.
pub async fn safe_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| GantryError::storage(parent, e))?;
    }

    let staging = staging_path(path);
    let mut file = fs::File::create(&staging)
        .await
        .map_err(|e| GantryError::storage(&staging, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| GantryError::storage(&staging, e))?;
    file.sync_all()
        .await
        .map_err(|e| GantryError::storage(&staging, e))?;
    drop(file);

    let backup = backup_path(path);
    match fs::rename(path, &backup).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(GantryError::storage(path, e)),
    }

    fs::rename(&staging, path)
        .await
        .map_err(|e| GantryError::storage(path, e))
}

/// Read a file, returning `None` if it does not exist.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(GantryError::storage(path, e)),
    }
}

pub async fn exists(path: &Path) -> Result<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| GantryError::storage(path, e))
}

/// Remove a directory tree, ignoring one that is already gone.
pub async fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GantryError::storage(path, e)),
    }
}

pub async fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GantryError::storage(path, e)),
    }
}

/// Names of the entries of a directory, empty if it does not exist.
pub async fn list_dir(path: &Path) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(GantryError::storage(path, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| GantryError::storage(path, e))?
    {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_buckets_by_thousand() {
        let layout = Layout::new("/repo/jobs", 1000);
        assert_eq!(layout.bucket_of(999), 0);
        assert_eq!(layout.bucket_of(1000), 1);
        assert_eq!(
            layout.data_file(1234),
            PathBuf::from("/repo/jobs/1xxx/1234/data.json")
        );
        assert_eq!(
            layout.subjob_file(7, 2),
            PathBuf::from("/repo/jobs/0xxx/7/subjobs/2/data.json")
        );
        assert_eq!(Layout::parse_bucket("12xxx"), Some(12));
        assert_eq!(Layout::parse_bucket("index.json"), None);
    }

    #[test]
    fn suffix_paths() {
        let path = Path::new("/r/0xxx/1/data.json");
        assert_eq!(backup_path(path), PathBuf::from("/r/0xxx/1/data.json~"));
        assert_eq!(staging_path(path), PathBuf::from("/r/0xxx/1/data.json.new"));
    }

    #[tokio::test]
    async fn safe_write_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("data.json");

        safe_write(&path, b"one").await.unwrap();
        assert_eq!(read_optional(&path).await.unwrap().unwrap(), b"one");
        assert!(read_optional(&backup_path(&path)).await.unwrap().is_none());

        safe_write(&path, b"two").await.unwrap();
        assert_eq!(read_optional(&path).await.unwrap().unwrap(), b"two");
        assert_eq!(
            read_optional(&backup_path(&path)).await.unwrap().unwrap(),
            b"one"
        );
        assert!(!exists(&staging_path(&path)).await.unwrap());
    }

    #[tokio::test]
    async fn list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_dir(&dir.path().join("nope")).await.unwrap().is_empty());
        remove_tree(&dir.path().join("nope")).await.unwrap();
        remove_file(&dir.path().join("nope.txt")).await.unwrap();
    }
}
