// Crash-safe persistence of completed segment indices.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::DownloadError;

/// Name of the progress file inside the work directory.
pub const PROGRESS_FILE_NAME: &str = "download_state.txt";

/// Persistence of the set of completed segment indices.
///
/// `save` must be durable against an abrupt process exit: once it returns,
/// the recorded set survives. Save calls are serialized by the processor.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn load(&self) -> Result<BTreeSet<u64>, DownloadError>;
    async fn save(&self, done: &BTreeSet<u64>) -> Result<(), DownloadError>;
    async fn cleanup(&self) -> Result<(), DownloadError>;
}

/// Default store: a single text file holding the sorted indices joined by
/// commas, written via a temporary sibling and an atomic rename.
pub struct FileProgressStore {
    path: PathBuf,
}

impl FileProgressStore {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            path: work_dir.join(PROGRESS_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self) -> Result<BTreeSet<u64>, DownloadError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(DownloadError::io(&self.path, e)),
        };

        let mut done = BTreeSet::new();
        for token in contents.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let index = token.parse::<u64>().map_err(|e| {
                DownloadError::io(
                    &self.path,
                    std::io::Error::new(
                        ErrorKind::InvalidData,
                        format!("corrupt progress entry `{token}`: {e}"),
                    ),
                )
            })?;
            done.insert(index);
        }
        debug!(path = %self.path.display(), count = done.len(), "Loaded progress state");
        Ok(done)
    }

    async fn save(&self, done: &BTreeSet<u64>) -> Result<(), DownloadError> {
        let serialized = done
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let tmp = self.tmp_path();
        fs::write(&tmp, serialized.as_bytes())
            .await
            .map_err(|e| DownloadError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| DownloadError::io(&self.path, e))?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), DownloadError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::io(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileProgressStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileProgressStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn absent_file_loads_as_empty_set() {
        let (_dir, store) = store();
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn empty_file_loads_as_empty_set() {
        let (_dir, store) = store();
        tokio::fs::write(store.path(), b"").await.expect("write");
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (_dir, store) = store();
        let done: BTreeSet<u64> = [4, 0, 2].into_iter().collect();
        store.save(&done).await.expect("save");
        assert_eq!(store.load().await.expect("load"), done);
    }

    #[tokio::test]
    async fn serialization_is_sorted_and_comma_joined() {
        let (_dir, store) = store();
        let done: BTreeSet<u64> = [7, 1, 3].into_iter().collect();
        store.save(&done).await.expect("save");
        let contents = tokio::fs::read_to_string(store.path()).await.expect("read");
        assert_eq!(contents, "1,3,7");
    }

    #[tokio::test]
    async fn save_leaves_no_temporary_sibling() {
        let (dir, store) = store();
        store.save(&BTreeSet::from([1u64])).await.expect("save");
        let mut entries = tokio::fs::read_dir(dir.path()).await.expect("read_dir");
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![PROGRESS_FILE_NAME.to_string()]);
    }

    #[tokio::test]
    async fn save_overwrites_previous_state() {
        let (_dir, store) = store();
        store.save(&BTreeSet::from([1u64, 2])).await.expect("save");
        store.save(&BTreeSet::from([1u64, 2, 3])).await.expect("save");
        assert_eq!(
            store.load().await.expect("load"),
            BTreeSet::from([1u64, 2, 3])
        );
    }

    #[tokio::test]
    async fn cleanup_removes_the_file_and_is_idempotent() {
        let (_dir, store) = store();
        store.save(&BTreeSet::from([1u64])).await.expect("save");
        store.cleanup().await.expect("cleanup");
        assert!(!store.path().exists());
        store.cleanup().await.expect("second cleanup");
    }

    #[tokio::test]
    async fn corrupt_entries_fail_the_load() {
        let (_dir, store) = store();
        tokio::fs::write(store.path(), b"1,banana,3")
            .await
            .expect("write");
        assert!(matches!(
            store.load().await,
            Err(DownloadError::IOFailed { .. })
        ));
    }
}
