//! Filesystem chunk backend
//!
//! Layout under the backend root:
//!
//! ```text
//! chunks/<sha256(file name)>/<index>.chunk
//! chunks/<sha256(file name)>/batch.journal
//! ```
//!
//! A commit first writes the whole batch to `batch.journal` (framed with a
//! length and a CRC32), then applies it chunk by chunk, then removes the
//! journal. A journal found on connect belongs to an interrupted commit and is
//! replayed; a journal whose frame does not verify was never fully written and
//! is discarded.
//!
//! Before applying, a commit reads the prior content of every chunk it touches.
//! If applying fails, that prior content replaces the journal and is written
//! back, so a failed commit leaves the chunks as they were. When the rollback
//! cannot finish, the connection is closed and the next connect replays it.

use super::{
    Backend, BlockingHook, Chunk, ChunkBatch, ChunkStore, ConnectionEvents, ConnectionState,
    ConnectionTracker,
};
use crate::core::validation::storage_key;
use crate::error::BackendError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

const JOURNAL_NAME: &str = "batch.journal";
const JOURNAL_MAGIC: &[u8; 4] = b"CFJ1";
const FRAME_HEADER_LEN: usize = 4 + 8 + 4;
const CHUNK_SUFFIX: &str = ".chunk";
/// Ranges up to this many blocks are read by index instead of listing the directory
const DIRECT_LOOKUP_SPAN: u64 = 64;

/// Frame an encoded batch: magic, payload length (u64 LE), CRC32 (u32 LE), payload
pub fn encode_journal(batch: &ChunkBatch) -> Result<Vec<u8>, BackendError> {
    let payload = bincode::serialize(batch)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(JOURNAL_MAGIC);
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Inverse of [`encode_journal`]; any framing or checksum mismatch is `CorruptJournal`
pub fn decode_journal(frame: &[u8], origin: &str) -> Result<ChunkBatch, BackendError> {
    let corrupt = || BackendError::CorruptJournal(origin.to_string());

    if frame.len() < FRAME_HEADER_LEN || &frame[..4] != JOURNAL_MAGIC {
        return Err(corrupt());
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&frame[4..12]);
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&frame[12..16]);

    let payload = &frame[FRAME_HEADER_LEN..];
    if u64::from_le_bytes(len_bytes) != payload.len() as u64 {
        return Err(corrupt());
    }
    if crc32fast::hash(payload) != u32::from_le_bytes(crc_bytes) {
        return Err(corrupt());
    }

    Ok(bincode::deserialize(payload)?)
}

/// Backend storing each file's chunks in its own directory
#[derive(Clone)]
pub struct FsBackend {
    chunks_dir: PathBuf,
    tracker: Arc<ConnectionTracker>,
}

impl FsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FsBackend {
            chunks_dir: root.as_ref().join("chunks"),
            tracker: Arc::new(ConnectionTracker::new()),
        }
    }

    fn dir_for(&self, file_name: &str) -> PathBuf {
        self.chunks_dir.join(storage_key(file_name))
    }

    pub fn live_connections(&self, file_name: &str) -> usize {
        self.tracker.live_connections(file_name)
    }
}

#[async_trait]
impl Backend for FsBackend {
    async fn connect(
        &self,
        file_name: &str,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn ChunkStore>, BackendError> {
        let dir = self.dir_for(file_name);
        fs::create_dir_all(&dir).await?;
        replay_journal(&dir, file_name).await?;

        let state = self.tracker.register(file_name, events);
        debug!("Opened chunk directory {} for {}", dir.display(), file_name);
        Ok(Arc::new(FsConnection {
            dir,
            state,
            commit_lock: AsyncMutex::new(()),
        }))
    }

    async fn destroy(
        &self,
        file_name: &str,
        on_blocked: Option<BlockingHook>,
    ) -> Result<(), BackendError> {
        self.tracker.notify_delete(file_name, on_blocked.as_ref());
        match fs::remove_dir_all(self.dir_for(file_name)).await {
            Ok(()) => {
                info!("Destroyed chunk directory of {}", file_name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct FsConnection {
    dir: PathBuf,
    state: Arc<ConnectionState>,
    commit_lock: AsyncMutex<()>,
}

fn chunk_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{}{}", index, CHUNK_SUFFIX))
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, BackendError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_optional(path: &Path) -> Result<(), BackendError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Indices of the chunk files present in `dir`, unordered
async fn list_indices(dir: &Path) -> Result<Vec<u64>, BackendError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut indices = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let index = name
            .to_str()
            .and_then(|n| n.strip_suffix(CHUNK_SUFFIX))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(index) = index {
            indices.push(index);
        }
    }
    Ok(indices)
}

async fn write_durable(path: &Path, data: &[u8]) -> Result<(), BackendError> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

async fn apply_batch(dir: &Path, batch: &ChunkBatch) -> Result<(), BackendError> {
    if !batch.deletes.is_empty() {
        for index in list_indices(dir).await? {
            if batch.deletes_index(index) {
                remove_optional(&chunk_path(dir, index)).await?;
            }
        }
    }

    for chunk in &batch.puts {
        let path = chunk_path(dir, chunk.index);
        let tmp = path.with_extension("chunk.tmp");
        write_durable(&tmp, &chunk.data).await?;
        fs::rename(&tmp, &path).await?;
    }
    Ok(())
}

/// Batch restoring every chunk `batch` touches to its current content
async fn undo_batch(dir: &Path, batch: &ChunkBatch) -> Result<ChunkBatch, BackendError> {
    let mut previous: BTreeMap<u64, Option<Vec<u8>>> = BTreeMap::new();
    if !batch.deletes.is_empty() {
        for index in list_indices(dir).await? {
            if batch.deletes_index(index) {
                previous.insert(index, read_optional(&chunk_path(dir, index)).await?);
            }
        }
    }
    for chunk in &batch.puts {
        if !previous.contains_key(&chunk.index) {
            let data = read_optional(&chunk_path(dir, chunk.index)).await?;
            previous.insert(chunk.index, data);
        }
    }

    let mut undo = ChunkBatch::new();
    for (index, data) in previous {
        match data {
            Some(data) => undo.put(index, data),
            None => undo.delete(index),
        };
    }
    Ok(undo)
}

async fn replay_journal(dir: &Path, file_name: &str) -> Result<(), BackendError> {
    let path = dir.join(JOURNAL_NAME);
    let Some(frame) = read_optional(&path).await? else {
        return Ok(());
    };

    match decode_journal(&frame, file_name) {
        Ok(batch) => {
            info!(
                "Replaying interrupted batch for {} ({} puts, {} deletes)",
                file_name,
                batch.puts.len(),
                batch.deletes.len()
            );
            apply_batch(dir, &batch).await?;
        }
        Err(e) => warn!("Discarding torn journal for {}: {}", file_name, e),
    }
    remove_optional(&path).await
}

impl FsConnection {
    /// Restore the chunks a failed commit touched
    async fn roll_back(&self, journal: &Path, undo: &ChunkBatch) {
        let restored = async {
            write_durable(journal, &encode_journal(undo)?).await?;
            apply_batch(&self.dir, undo).await?;
            remove_optional(journal).await
        }
        .await;

        match restored {
            Ok(()) => debug!("Rolled back failed commit to {}", self.state.file_name()),
            Err(e) => {
                // The journal left behind is replayed by the next connect
                error!(
                    "Rollback of {} failed, closing connection: {}",
                    self.state.file_name(),
                    e
                );
                self.state.close();
            }
        }
    }
}

#[async_trait]
impl ChunkStore for FsConnection {
    fn file_name(&self) -> &str {
        self.state.file_name()
    }

    async fn get(&self, index: u64) -> Result<Option<Vec<u8>>, BackendError> {
        self.state.ensure_open()?;
        read_optional(&chunk_path(&self.dir, index)).await
    }

    async fn get_range(&self, range: RangeInclusive<u64>) -> Result<Vec<Chunk>, BackendError> {
        self.state.ensure_open()?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let indices: Vec<u64> = if range.end() - range.start() < DIRECT_LOOKUP_SPAN {
            range.collect()
        } else {
            let mut listed: Vec<u64> = list_indices(&self.dir)
                .await?
                .into_iter()
                .filter(|i| range.contains(i))
                .collect();
            listed.sort_unstable();
            listed
        };

        let mut chunks = Vec::with_capacity(indices.len());
        for index in indices {
            // Absent blocks, or a delete from another connection racing the listing
            if let Some(data) = read_optional(&chunk_path(&self.dir, index)).await? {
                chunks.push(Chunk { index, data });
            }
        }
        Ok(chunks)
    }

    async fn commit(&self, batch: ChunkBatch) -> Result<(), BackendError> {
        self.state.ensure_open()?;
        if batch.is_empty() {
            return Ok(());
        }

        let _guard = self.commit_lock.lock().await;
        fs::create_dir_all(&self.dir).await?;
        let undo = undo_batch(&self.dir, &batch).await?;
        let journal = self.dir.join(JOURNAL_NAME);
        write_durable(&journal, &encode_journal(&batch)?).await?;
        if let Err(e) = apply_batch(&self.dir, &batch).await {
            self.roll_back(&journal, &undo).await;
            return Err(e);
        }
        remove_optional(&journal).await?;

        debug!(
            "Committed {} puts and {} delete ranges to {}",
            batch.puts.len(),
            batch.deletes.len(),
            self.file_name()
        );
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
    use tempfile::TempDir;

    fn sample_batch() -> ChunkBatch {
        let mut batch = ChunkBatch::new();
        batch.delete_from(4).put(0, vec![7; 8]).put(2, vec![9; 8]);
        batch
    }

    #[test]
    fn test_journal_frame_round_trip() {
        let batch = sample_batch();
        let frame = encode_journal(&batch).unwrap();
        assert_eq!(&frame[..4], JOURNAL_MAGIC);
        assert_eq!(decode_journal(&frame, "f").unwrap(), batch);
    }

    #[test]
    fn test_torn_or_flipped_journal_is_rejected() {
        let frame = encode_journal(&sample_batch()).unwrap();

        let torn = &frame[..frame.len() - 3];
        assert!(matches!(
            decode_journal(torn, "f"),
            Err(BackendError::CorruptJournal(_))
        ));

        let mut flipped = frame.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert!(matches!(
            decode_journal(&flipped, "f"),
            Err(BackendError::CorruptJournal(_))
        ));

        assert!(decode_journal(b"CF", "f").is_err());
    }

    #[tokio::test]
    async fn test_commit_and_read_back() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path());
        let conn = backend
            .connect("a/b", ConnectionEvents::default())
            .await
            .unwrap();

        let mut batch = ChunkBatch::new();
        batch.put(0, vec![1; 4]).put(5, vec![5; 4]).put(2, vec![2; 4]);
        conn.commit(batch).await.unwrap();

        let indices: Vec<u64> = conn
            .get_range(0..=5)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(indices, vec![0, 2, 5]);

        let mut batch = ChunkBatch::new();
        batch.delete_from(1);
        conn.commit(batch).await.unwrap();
        assert_eq!(conn.get(0).await.unwrap(), Some(vec![1; 4]));
        assert!(conn.get(2).await.unwrap().is_none());
        assert!(!backend.dir_for("a/b").join(JOURNAL_NAME).exists());
    }

    #[tokio::test]
    async fn test_failed_apply_restores_previous_chunks() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path());
        let conn = backend
            .connect("f", ConnectionEvents::default())
            .await
            .unwrap();
        let mut batch = ChunkBatch::new();
        batch.put(0, vec![b'a'; 4]).put(1, vec![b'b'; 4]);
        conn.commit(batch).await.unwrap();

        // Chunk 2 cannot be staged, after 0 and 1 were already replaced
        let dir = backend.dir_for("f");
        std::fs::create_dir(dir.join("2.chunk.tmp")).unwrap();

        let mut batch = ChunkBatch::new();
        batch
            .put(0, vec![b'X'; 4])
            .put(1, vec![b'Y'; 4])
            .put(2, vec![b'Z'; 4]);
        assert!(conn.commit(batch).await.is_err());

        assert_eq!(conn.get(0).await.unwrap(), Some(vec![b'a'; 4]));
        assert_eq!(conn.get(1).await.unwrap(), Some(vec![b'b'; 4]));
        assert!(conn.get(2).await.unwrap().is_none());
        assert!(!dir.join(JOURNAL_NAME).exists());
        assert!(!conn.is_closed());

        // The connection keeps committing normally afterwards
        std::fs::remove_dir(dir.join("2.chunk.tmp")).unwrap();
        let mut batch = ChunkBatch::new();
        batch.put(2, vec![b'c'; 4]);
        conn.commit(batch).await.unwrap();
        assert_eq!(conn.get(2).await.unwrap(), Some(vec![b'c'; 4]));
    }

    #[tokio::test]
    async fn test_failed_apply_with_deletes_restores_deleted_chunks() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path());
        let conn = backend
            .connect("f", ConnectionEvents::default())
            .await
            .unwrap();
        let mut batch = ChunkBatch::new();
        batch.put(0, vec![1; 4]).put(3, vec![3; 4]).put(7, vec![7; 4]);
        conn.commit(batch).await.unwrap();

        let dir = backend.dir_for("f");
        std::fs::create_dir(dir.join("1.chunk.tmp")).unwrap();

        let mut batch = ChunkBatch::new();
        batch.delete_from(2).put(0, vec![0xEE; 4]).put(1, vec![0xEE; 4]);
        assert!(conn.commit(batch).await.is_err());

        let indices: Vec<u64> = conn
            .get_range(0..=u64::MAX - 1)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(indices, vec![0, 3, 7]);
        assert_eq!(conn.get(0).await.unwrap(), Some(vec![1; 4]));
        assert_eq!(conn.get(7).await.unwrap(), Some(vec![7; 4]));
    }

    #[tokio::test]
    async fn test_get_range_small_and_wide_spans() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path());
        let conn = backend
            .connect("f", ConnectionEvents::default())
            .await
            .unwrap();
        let mut batch = ChunkBatch::new();
        batch.put(1, vec![1]).put(3, vec![3]).put(500, vec![5]);
        conn.commit(batch).await.unwrap();

        let small: Vec<u64> = conn
            .get_range(0..=4)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(small, vec![1, 3]);

        let wide: Vec<u64> = conn
            .get_range(2..=10_000)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.index)
            .collect();
        assert_eq!(wide, vec![3, 500]);

        let (start, end) = (4, 2);
        let empty = conn.get_range(start..=end).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_commit_is_replayed_on_connect() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path());
        let dir = backend.dir_for("f");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("4.chunk"), vec![4; 8]).unwrap();
        std::fs::write(
            dir.join(JOURNAL_NAME),
            encode_journal(&sample_batch()).unwrap(),
        )
        .unwrap();

        let conn = backend
            .connect("f", ConnectionEvents::default())
            .await
            .unwrap();
        assert_eq!(conn.get(0).await.unwrap(), Some(vec![7; 8]));
        assert_eq!(conn.get(2).await.unwrap(), Some(vec![9; 8]));
        assert!(conn.get(4).await.unwrap().is_none());
        assert!(!dir.join(JOURNAL_NAME).exists());
    }

    #[tokio::test]
    async fn test_torn_journal_is_discarded_on_connect() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path());
        let dir = backend.dir_for("f");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("4.chunk"), vec![4; 8]).unwrap();
        let frame = encode_journal(&sample_batch()).unwrap();
        std::fs::write(dir.join(JOURNAL_NAME), &frame[..frame.len() / 2]).unwrap();

        let conn = backend
            .connect("f", ConnectionEvents::default())
            .await
            .unwrap();
        assert_eq!(conn.get(4).await.unwrap(), Some(vec![4; 8]));
        assert!(conn.get(0).await.unwrap().is_none());
        assert!(!dir.join(JOURNAL_NAME).exists());
    }

    #[tokio::test]
    async fn test_destroy_removes_directory() {
        let temp = TempDir::new().unwrap();
        let backend = FsBackend::new(temp.path());
        let conn = backend
            .connect("f", ConnectionEvents::default())
            .await
            .unwrap();
        let mut batch = ChunkBatch::new();
        batch.put(0, vec![1]);
        conn.commit(batch).await.unwrap();

        backend.destroy("f", None).await.unwrap();
        assert!(!backend.dir_for("f").exists());
        backend.destroy("f", None).await.unwrap();
    }
}
