//! File metadata records and their stores
//!
//! Each logical file has one [`FileMeta`] record holding its length and the
//! chunk size it was created with. Stores replace records wholesale; there is
//! no partial update.

use crate::core::validation::storage_key;
use crate::error::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Persisted description of a logical file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    file_name: String,
    length: u64,
    chunk_size: u64,
}

impl FileMeta {
    /// Metadata for a brand-new, zero-length file
    pub fn new(file_name: impl Into<String>, chunk_size: u64) -> Self {
        FileMeta {
            file_name: file_name.into(),
            length: 0,
            chunk_size,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Copy of this record with a different length
    pub fn with_length(&self, length: u64) -> Self {
        FileMeta {
            length,
            ..self.clone()
        }
    }

    /// Number of chunks holding readable content (`ceil(length / chunk_size)`)
    pub fn chunk_count(&self) -> u64 {
        self.length.div_ceil(self.chunk_size)
    }
}

/// Keyed storage for [`FileMeta`] records
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Fetch the record for `file_name`, if any
    async fn get(&self, file_name: &str) -> Result<Option<FileMeta>, BackendError>;

    /// Store `meta`, replacing any existing record for its file name
    async fn set(&self, meta: &FileMeta) -> Result<(), BackendError>;

    /// Remove the record for `file_name`; removing a missing record is not an error
    async fn del(&self, file_name: &str) -> Result<(), BackendError>;

    async fn exists(&self, file_name: &str) -> Result<bool, BackendError> {
        Ok(self.get(file_name).await?.is_some())
    }
}

/// In-memory metadata store for tests and ephemeral files
#[derive(Default)]
pub struct MemoryMetaStore {
    records: Mutex<HashMap<String, FileMeta>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, file_name: &str) -> Result<Option<FileMeta>, BackendError> {
        Ok(self.records.lock().get(file_name).cloned())
    }

    async fn set(&self, meta: &FileMeta) -> Result<(), BackendError> {
        self.records
            .lock()
            .insert(meta.file_name.clone(), meta.clone());
        Ok(())
    }

    async fn del(&self, file_name: &str) -> Result<(), BackendError> {
        self.records.lock().remove(file_name);
        Ok(())
    }
}

/// Metadata store keeping one JSON document per file under `<root>/meta/`
pub struct FsMetaStore {
    dir: PathBuf,
}

impl FsMetaStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FsMetaStore {
            dir: root.as_ref().join("meta"),
        }
    }

    fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", storage_key(file_name)))
    }
}

#[async_trait]
impl MetaStore for FsMetaStore {
    async fn get(&self, file_name: &str) -> Result<Option<FileMeta>, BackendError> {
        match fs::read(self.path_for(file_name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, meta: &FileMeta) -> Result<(), BackendError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&meta.file_name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(meta)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Stored meta for {} (length {})", meta.file_name, meta.length);
        Ok(())
    }

    async fn del(&self, file_name: &str) -> Result<(), BackendError> {
        match fs::remove_file(self.path_for(file_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_serialized_field_names() {
        let meta = FileMeta::new("notes.txt", 4096).with_length(10);
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"fileName":"notes.txt","length":10,"chunkSize":4096}"#);

        let back: FileMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_chunk_count() {
        let meta = FileMeta::new("a", 4);
        assert_eq!(meta.chunk_count(), 0);
        assert_eq!(meta.with_length(1).chunk_count(), 1);
        assert_eq!(meta.with_length(4).chunk_count(), 1);
        assert_eq!(meta.with_length(5).chunk_count(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_replaces_records() {
        let store = MemoryMetaStore::new();
        assert!(!store.exists("a").await.unwrap());

        store.set(&FileMeta::new("a", 16).with_length(3)).await.unwrap();
        store.set(&FileMeta::new("a", 16).with_length(7)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().unwrap().length(), 7);
        assert_eq!(store.len(), 1);

        store.del("a").await.unwrap();
        store.del("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = FsMetaStore::new(temp.path());

        assert!(store.get("dir/file.bin").await.unwrap().is_none());
        let meta = FileMeta::new("dir/file.bin", 512).with_length(1000);
        store.set(&meta).await.unwrap();

        let reopened = FsMetaStore::new(temp.path());
        assert_eq!(reopened.get("dir/file.bin").await.unwrap(), Some(meta));

        reopened.del("dir/file.bin").await.unwrap();
        assert!(!store.exists("dir/file.bin").await.unwrap());
    }
}
