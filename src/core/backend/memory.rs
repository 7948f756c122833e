//! In-memory chunk backend
//!
//! Chunks live in a `BTreeMap` per file behind one lock, so every batch is
//! trivially atomic. Failure injection lets tests drive the error paths of
//! the handle without a real store.

use super::{
    Backend, BlockingHook, Chunk, ChunkBatch, ChunkStore, ConnectionEvents, ConnectionState,
    ConnectionTracker,
};
use crate::error::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type ChunkMap = BTreeMap<u64, Vec<u8>>;

#[derive(Default)]
struct Shared {
    files: Mutex<HashMap<String, ChunkMap>>,
    tracker: ConnectionTracker,
    failing_commits: AtomicUsize,
    failing_reads: AtomicUsize,
}

impl Shared {
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Process-local backend; clones share the same storage
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with `Aborted` without applying anything
    pub fn fail_next_commits(&self, n: usize) {
        self.shared.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` chunk reads fail with `Aborted`
    pub fn fail_next_reads(&self, n: usize) {
        self.shared.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Indices of the chunks stored for `file_name`
    pub fn chunk_indices(&self, file_name: &str) -> Vec<u64> {
        self.shared
            .files
            .lock()
            .get(file_name)
            .map(|chunks| chunks.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Raw content of one stored chunk
    pub fn chunk(&self, file_name: &str, index: u64) -> Option<Vec<u8>> {
        self.shared
            .files
            .lock()
            .get(file_name)
            .and_then(|chunks| chunks.get(&index).cloned())
    }

    pub fn live_connections(&self, file_name: &str) -> usize {
        self.shared.tracker.live_connections(file_name)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(
        &self,
        file_name: &str,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn ChunkStore>, BackendError> {
        let state = self.shared.tracker.register(file_name, events);
        debug!("Opened in-memory connection to {}", file_name);
        Ok(Arc::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            state,
        }))
    }

    async fn destroy(
        &self,
        file_name: &str,
        on_blocked: Option<BlockingHook>,
    ) -> Result<(), BackendError> {
        self.shared
            .tracker
            .notify_delete(file_name, on_blocked.as_ref());
        self.shared.files.lock().remove(file_name);
        debug!("Destroyed in-memory chunks of {}", file_name);
        Ok(())
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    state: Arc<ConnectionState>,
}

impl MemoryConnection {
    fn check_read(&self) -> Result<(), BackendError> {
        self.state.ensure_open()?;
        if Shared::take_failure(&self.shared.failing_reads) {
            return Err(BackendError::Aborted(format!(
                "injected read failure on {}",
                self.state.file_name()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for MemoryConnection {
    fn file_name(&self) -> &str {
        self.state.file_name()
    }

    async fn get(&self, index: u64) -> Result<Option<Vec<u8>>, BackendError> {
        self.check_read()?;
        Ok(self
            .shared
            .files
            .lock()
            .get(self.file_name())
            .and_then(|chunks| chunks.get(&index).cloned()))
    }

    async fn get_range(&self, range: RangeInclusive<u64>) -> Result<Vec<Chunk>, BackendError> {
        self.check_read()?;
        if range.start() > range.end() {
            return Ok(Vec::new());
        }
        let files = self.shared.files.lock();
        Ok(files
            .get(self.file_name())
            .map(|chunks| {
                chunks
                    .range(range)
                    .map(|(&index, data)| Chunk {
                        index,
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, batch: ChunkBatch) -> Result<(), BackendError> {
        self.state.ensure_open()?;
        if Shared::take_failure(&self.shared.failing_commits) {
            return Err(BackendError::Aborted(format!(
                "injected commit failure on {}",
                self.file_name()
            )));
        }

        let mut files = self.shared.files.lock();
        let chunks = files.entry(self.file_name().to_string()).or_default();
        for range in &batch.deletes {
            let doomed: Vec<u64> = chunks.range(range.clone()).map(|(&i, _)| i).collect();
            for index in doomed {
                chunks.remove(&index);
            }
        }
        for chunk in batch.puts {
            chunks.insert(chunk.index, chunk.data);
        }
        if chunks.is_empty() {
            files.remove(self.file_name());
        }
        Ok(())
    }

    fn close(&self) {
        self.state.close();
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(backend: &MemoryBackend, name: &str) -> Arc<dyn ChunkStore> {
        backend
            .connect(name, ConnectionEvents::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_applies_deletes_before_puts() {
        let backend = MemoryBackend::new();
        let conn = connect(&backend, "f").await;

        let mut batch = ChunkBatch::new();
        batch.put(0, vec![1; 4]).put(1, vec![2; 4]).put(2, vec![3; 4]);
        conn.commit(batch).await.unwrap();

        let mut batch = ChunkBatch::new();
        batch.delete_from(1).put(1, vec![9; 4]);
        conn.commit(batch).await.unwrap();

        assert_eq!(backend.chunk_indices("f"), vec![0, 1]);
        assert_eq!(conn.get(1).await.unwrap(), Some(vec![9; 4]));
        assert_eq!(conn.get(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_range_skips_missing() {
        let backend = MemoryBackend::new();
        let conn = connect(&backend, "f").await;

        let mut batch = ChunkBatch::new();
        batch.put(1, vec![1]).put(3, vec![3]).put(7, vec![7]);
        conn.commit(batch).await.unwrap();

        let chunks = conn.get_range(0..=4).await.unwrap();
        let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_injected_commit_failure_applies_nothing() {
        let backend = MemoryBackend::new();
        let conn = connect(&backend, "f").await;

        backend.fail_next_commits(1);
        let mut batch = ChunkBatch::new();
        batch.put(0, vec![1]);
        assert!(matches!(
            conn.commit(batch.clone()).await,
            Err(BackendError::Aborted(_))
        ));
        assert!(backend.chunk_indices("f").is_empty());

        conn.commit(batch).await.unwrap();
        assert_eq!(backend.chunk_indices("f"), vec![0]);
    }

    #[tokio::test]
    async fn test_injected_read_failure() {
        let backend = MemoryBackend::new();
        let conn = connect(&backend, "f").await;

        backend.fail_next_reads(2);
        assert!(conn.get(0).await.is_err());
        assert!(conn.get_range(0..=1).await.is_err());
        assert!(conn.get(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_calls() {
        let backend = MemoryBackend::new();
        let conn = connect(&backend, "f").await;
        assert_eq!(backend.live_connections("f"), 1);

        conn.close();
        assert!(conn.is_closed());
        assert!(matches!(
            conn.get(0).await,
            Err(BackendError::ConnectionClosed(name)) if name == "f"
        ));
        assert_eq!(backend.live_connections("f"), 0);
    }

    #[tokio::test]
    async fn test_destroy_removes_chunks() {
        let backend = MemoryBackend::new();
        let conn = connect(&backend, "f").await;
        let mut batch = ChunkBatch::new();
        batch.put(0, vec![1]);
        conn.commit(batch).await.unwrap();

        backend.destroy("f", None).await.unwrap();
        assert!(backend.chunk_indices("f").is_empty());
    }
}
