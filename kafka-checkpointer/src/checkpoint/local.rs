use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::checkpoint::{CheckpointEntry, CheckpointStore};
use crate::error::StoreError;
use crate::kafka::types::Partition;

// filename suffix of a partition's checkpoint entry
const ENTRY_EXTENSION: &str = "json";

/// File-backed checkpoint store. Each partition is a small JSON document at
/// `<base_dir>/<topic>/<partition>.json`, replaced atomically (write to a
/// temp file, fsync, rename) so a reader in another process sees either the
/// old or the new entry, never a torn one.
pub struct LocalCheckpointStore {
    base_dir: PathBuf,
    // serializes read-modify-write per partition within this process
    write_locks: DashMap<Partition, Arc<Mutex<()>>>,
}

impl LocalCheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_locks: DashMap::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the entry for a partition:
    /// <base_dir>/<topic_name>/<partition_number>.json
    pub fn entry_path(&self, partition: &Partition) -> PathBuf {
        self.base_dir.join(partition.topic()).join(format!(
            "{}.{ENTRY_EXTENSION}",
            partition.partition_number()
        ))
    }

    fn write_lock(&self, partition: &Partition) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_entry(&self, path: &Path) -> Result<Option<CheckpointEntry>, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn write_entry(&self, path: &Path, entry: &CheckpointEntry) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(entry).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        let tmp_path = path.with_extension(format!("{ENTRY_EXTENSION}.tmp-{}", Uuid::new_v4()));
        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp_path, path).await
        }
        .await;

        if let Err(source) = write_result {
            // best effort, the temp name is unique so a leftover is harmless
            if tokio::fs::remove_file(&tmp_path).await.is_err() {
                debug!("Could not remove temp checkpoint file {tmp_path:?}");
            }
            return Err(io_err(source));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for LocalCheckpointStore {
    async fn persist(&self, partition: &Partition, offset: i64) -> Result<(), StoreError> {
        let lock = self.write_lock(partition);
        let _guard = lock.lock().await;

        let path = self.entry_path(partition);
        if let Some(existing) = self.read_entry(&path).await? {
            if existing.offset >= offset {
                debug!(
                    partition = %partition,
                    stored = existing.offset,
                    requested = offset,
                    "Stored checkpoint is already at or past requested offset"
                );
                return Ok(());
            }
        }

        self.write_entry(&path, &CheckpointEntry::new(partition, offset))
            .await?;
        debug!(partition = %partition, offset = offset, "Persisted checkpoint");
        Ok(())
    }

    async fn read(&self, partition: &Partition) -> Result<Option<i64>, StoreError> {
        Ok(self
            .read_entry(&self.entry_path(partition))
            .await?
            .map(|entry| entry.offset))
    }
}
