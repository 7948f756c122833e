//! Random-access handle over one chunked file
//!
//! Every operation is queued on the handle's [`OperationQueue`] and starts by
//! making sure a connection is open, so reconnecting after a suspend or a
//! backend-initiated close never races another operation.

use crate::config::FileSettings;
use crate::core::backend::{
    Backend, BlockingEvent, BlockingHook, ChunkBatch, ChunkStore, ConnectionEvents,
};
use crate::core::blocks::blocks;
use crate::core::meta::{FileMeta, MetaStore};
use crate::core::queue::{OperationQueue, TaskFuture};
use crate::core::registry::RegistryInner;
use crate::core::validation::validate_chunk_size;
use crate::error::{Result, StorageError};
use futures::future::{self, Either};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 16;

/// Length argument of `read` and `del`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    Len(u64),
    /// Everything from the offset to the current end of file
    ToEnd,
}

impl From<u64> for Extent {
    fn from(len: u64) -> Self {
        Extent::Len(len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Closed,
    Opening,
    Open,
    Suspended,
}

/// Lifecycle notification broadcast to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleEvent {
    Open,
    Close,
    Suspend,
    Unsuspend,
}

/// Snapshot returned by [`StorageHandle::stat`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stat {
    pub file_name: String,
    pub length: u64,
    /// Same as `length`
    pub size: u64,
    pub chunk_size: u64,
}

pub(crate) struct HandleInner {
    file_name: String,
    settings: FileSettings,
    backend: Arc<dyn Backend>,
    meta_store: Arc<dyn MetaStore>,
    queue: OperationQueue,
    state: Mutex<HandleState>,
    connection: Mutex<Option<Arc<dyn ChunkStore>>>,
    meta: Mutex<Option<FileMeta>>,
    retired: AtomicBool,
    registry: Weak<RegistryInner>,
    events: broadcast::Sender<HandleEvent>,
}

/// Byte-addressable view of one stored file
///
/// Cloning is cheap and yields another reference to the same handle. All
/// operations return futures that are already enqueued when the method
/// returns; dropping a future does not cancel its operation.
#[derive(Clone)]
pub struct StorageHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("file_name", &self.inner.file_name)
            .field("state", &self.state())
            .field("length", &self.length())
            .finish()
    }
}

impl StorageHandle {
    pub(crate) fn new(
        file_name: String,
        settings: FileSettings,
        backend: Arc<dyn Backend>,
        meta_store: Arc<dyn MetaStore>,
        registry: Weak<RegistryInner>,
    ) -> Self {
        let queue = OperationQueue::with_stall_threshold(file_name.clone(), settings.stall_threshold);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        StorageHandle {
            inner: Arc::new(HandleInner {
                file_name,
                settings,
                backend,
                meta_store,
                queue,
                state: Mutex::new(HandleState::Closed),
                connection: Mutex::new(None),
                meta: Mutex::new(None),
                retired: AtomicBool::new(false),
                registry,
                events,
            }),
        }
    }

    /// Resolved file name (directory prefix included)
    pub fn file_name(&self) -> &str {
        &self.inner.file_name
    }

    pub fn state(&self) -> HandleState {
        *self.inner.state.lock()
    }

    /// Cached length; 0 before the first open
    pub fn length(&self) -> u64 {
        self.inner.meta.lock().as_ref().map_or(0, FileMeta::length)
    }

    /// Chunk size in effect: the persisted one once opened, the configured one before
    pub fn chunk_size(&self) -> u64 {
        self.inner
            .meta
            .lock()
            .as_ref()
            .map_or(self.inner.settings.chunk_size, FileMeta::chunk_size)
    }

    /// Number of operations waiting to start
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.inner.events.subscribe()
    }

    pub fn ptr_eq(&self, other: &StorageHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True once `close` or `purge` has released this handle's registry slot
    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::SeqCst)
    }

    pub(crate) fn queue(&self) -> &OperationQueue {
        &self.inner.queue
    }

    pub fn open(&self) -> TaskFuture<()> {
        self.submit(|inner| async move {
            inner.ensure_open().await?;
            Ok(())
        })
    }

    /// Read `size` bytes at `offset`
    ///
    /// Fails with `NotFound` on an empty file and with `Range` when the
    /// request extends past the end of file.
    pub fn read(
        &self,
        offset: u64,
        size: impl Into<Extent>,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send + 'static {
        let size = size.into();
        if size == Extent::Len(0) {
            return Either::Left(future::ready(Ok(Vec::new())));
        }
        Either::Right(self.submit(move |inner| async move {
            let conn = inner.ensure_open().await?;
            inner.read_at(conn.as_ref(), offset, size).await
        }))
    }

    /// Write `data` at `offset`, extending the file if needed
    pub fn write(&self, offset: u64, data: impl Into<Vec<u8>>) -> TaskFuture<()> {
        let data = data.into();
        self.submit(move |inner| async move {
            let conn = inner.ensure_open().await?;
            inner.write_at(conn.as_ref(), offset, &data).await
        })
    }

    /// Zero `size` bytes at `offset`; a range reaching end of file truncates instead
    pub fn del(&self, offset: u64, size: impl Into<Extent>) -> TaskFuture<()> {
        let size = size.into();
        self.submit(move |inner| async move {
            let conn = inner.ensure_open().await?;
            inner.del_range(conn.as_ref(), offset, size).await
        })
    }

    /// Shrink or grow the file to exactly `offset` bytes
    pub fn truncate(&self, offset: u64) -> TaskFuture<()> {
        self.submit(move |inner| async move {
            let conn = inner.ensure_open().await?;
            inner.truncate_to(conn.as_ref(), offset).await
        })
    }

    /// Metadata reloaded from the store
    pub fn stat(&self) -> TaskFuture<Stat> {
        self.submit(|inner| async move {
            inner.ensure_open().await?;
            inner.reload_meta().await
        })
    }

    /// Close after every earlier operation has settled
    pub fn close(&self) -> TaskFuture<()> {
        self.submit(|inner| async move {
            inner.close_now();
            Ok(())
        })
    }

    /// Pause the queue now, then drop the connection once the running operation settles
    ///
    /// The next operation reconnects and resumes the queue.
    pub fn suspend(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.inner.queue.pause();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            inner.queue.wait_current().await;
            inner.suspend_now();
        });
        async move { task.await.map_err(|_| StorageError::TaskAborted) }
    }

    /// Delete every chunk and the metadata, leaving a closed zero-length file
    pub fn purge(&self) -> TaskFuture<()> {
        self.submit(|inner| async move { inner.purge_now().await })
    }

    fn submit<F, Fut, T>(&self, op: F) -> TaskFuture<T>
    where
        F: FnOnce(Arc<HandleInner>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.queue.is_paused() {
            debug!("Resuming suspended queue of {}", self.inner.file_name);
            self.inner.queue.resume();
        }
        let inner = Arc::clone(&self.inner);
        self.inner.queue.add_task(move || op(inner))
    }
}

impl HandleInner {
    fn emit(&self, event: HandleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn live_connection(&self) -> Option<Arc<dyn ChunkStore>> {
        self.connection
            .lock()
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    fn drop_connection(&self) {
        if let Some(conn) = self.connection.lock().take() {
            conn.close();
        }
    }

    fn current_meta(&self) -> Result<FileMeta> {
        self.meta
            .lock()
            .clone()
            .ok_or_else(|| StorageError::NotFound(self.file_name.clone()))
    }

    async fn ensure_open(self: &Arc<Self>) -> Result<Arc<dyn ChunkStore>> {
        if let Some(conn) = self.live_connection() {
            return Ok(conn);
        }

        let previous = std::mem::replace(&mut *self.state.lock(), HandleState::Opening);
        match self.connect(previous).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                *self.state.lock() = previous;
                Err(e)
            }
        }
    }

    /// Take back the registry slot released by `close` or `purge`
    ///
    /// Fails with `Superseded` when a newer live handle owns the file name.
    fn reclaim_slot(self: &Arc<Self>) -> Result<()> {
        if self.retired.load(Ordering::SeqCst) {
            if let Some(registry) = self.registry.upgrade() {
                registry.adopt(&StorageHandle {
                    inner: Arc::clone(self),
                })?;
            }
            self.retired.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn connect(self: &Arc<Self>, previous: HandleState) -> Result<Arc<dyn ChunkStore>> {
        self.reclaim_slot()?;

        let conn = self
            .backend
            .connect(&self.file_name, self.connection_events())
            .await?;
        let meta = match self.load_or_create_meta().await {
            Ok(meta) => meta,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        debug!(
            "Connected {} (length {}, chunk size {})",
            self.file_name,
            meta.length(),
            meta.chunk_size()
        );
        *self.meta.lock() = Some(meta);
        *self.connection.lock() = Some(Arc::clone(&conn));
        *self.state.lock() = HandleState::Open;

        match previous {
            HandleState::Suspended => {
                info!("Unsuspended {}", self.file_name);
                self.emit(HandleEvent::Unsuspend);
            }
            HandleState::Closed => {
                info!("Opened {}", self.file_name);
                self.emit(HandleEvent::Open);
            }
            // Reconnect after the backend closed us
            HandleState::Open | HandleState::Opening => {}
        }
        Ok(conn)
    }

    async fn load_or_create_meta(&self) -> Result<FileMeta> {
        match self.meta_store.get(&self.file_name).await? {
            Some(meta) => {
                validate_chunk_size(meta.chunk_size())?;
                if meta.chunk_size() != self.settings.chunk_size {
                    debug!(
                        "{} keeps its stored chunk size {} (configured {})",
                        self.file_name,
                        meta.chunk_size(),
                        self.settings.chunk_size
                    );
                }
                Ok(meta)
            }
            None => {
                let meta = FileMeta::new(self.file_name.clone(), self.settings.chunk_size);
                self.meta_store.set(&meta).await?;
                Ok(meta)
            }
        }
    }

    fn connection_events(self: &Arc<Self>) -> ConnectionEvents {
        let on_blocking = match &self.settings.hooks.on_open_blocking {
            Some(hook) => Arc::clone(hook),
            None => {
                let weak = Arc::downgrade(self);
                Arc::new(move |event: &BlockingEvent| {
                    if let Some(inner) = weak.upgrade() {
                        debug!(
                            "Yielding connection to {} ({:?} requested elsewhere)",
                            event.file_name, event.kind
                        );
                        inner.drop_connection();
                    }
                }) as BlockingHook
            }
        };

        let on_blocked = self
            .settings
            .hooks
            .on_open_blocked
            .clone()
            .unwrap_or_else(|| {
                Arc::new(|event: &BlockingEvent| {
                    warn!(
                        "Open of {} blocked by {} other connection(s)",
                        event.file_name, event.connections
                    );
                }) as BlockingHook
            });

        ConnectionEvents {
            on_blocking: Some(on_blocking),
            on_blocked: Some(on_blocked),
        }
    }

    async fn persist_length(&self, meta: &FileMeta, length: u64) -> Result<()> {
        let updated = meta.with_length(length);
        self.meta_store.set(&updated).await?;
        *self.meta.lock() = Some(updated);
        Ok(())
    }

    async fn read_at(&self, conn: &dyn ChunkStore, offset: u64, size: Extent) -> Result<Vec<u8>> {
        let meta = self.current_meta()?;
        let length = meta.length();
        if length == 0 {
            return Err(StorageError::NotFound(self.file_name.clone()));
        }

        let size = match size {
            Extent::Len(n) => n,
            Extent::ToEnd => length.checked_sub(offset).ok_or(StorageError::Range {
                offset,
                size: 0,
                length,
            })?,
        };
        let end = offset.checked_add(size).ok_or(StorageError::Range {
            offset,
            size,
            length,
        })?;
        if end > length {
            return Err(StorageError::Range {
                offset,
                size,
                length,
            });
        }

        let ranges = blocks(meta.chunk_size(), offset, end);
        let (Some(first), Some(last)) = (ranges.first(), ranges.last()) else {
            return Ok(Vec::new());
        };

        let mut stored: HashMap<u64, Vec<u8>> = conn
            .get_range(first.block..=last.block)
            .await?
            .into_iter()
            .map(|chunk| (chunk.index, chunk.data))
            .collect();

        let mut out = Vec::with_capacity(to_usize(size)?);
        for range in &ranges {
            let target = out.len() + range.len();
            if let Some(data) = stored.remove(&range.block) {
                let available = range.end.min(data.len());
                if available > range.start {
                    out.extend_from_slice(&data[range.start..available]);
                }
            }
            // Missing or short chunks read as zeros
            out.resize(target, 0);
        }

        debug!("Read {} bytes at {} from {}", size, offset, self.file_name);
        Ok(out)
    }

    async fn write_at(&self, conn: &dyn ChunkStore, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let meta = self.current_meta()?;
        let chunk_size = meta.chunk_size();
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| StorageError::InvalidArgument(format!("write at {} overflows", offset)))?;

        let mut batch = ChunkBatch::new();
        let mut cursor = 0;
        for range in blocks(chunk_size, offset, end) {
            let piece = &data[cursor..cursor + range.len()];
            let chunk = if range.is_full(chunk_size) {
                piece.to_vec()
            } else {
                let mut existing = conn.get(range.block).await?.unwrap_or_default();
                existing.resize(to_usize(chunk_size)?, 0);
                existing[range.start..range.end].copy_from_slice(piece);
                existing
            };
            batch.put(range.block, chunk);
            cursor += range.len();
        }
        conn.commit(batch).await?;

        let new_length = meta.length().max(end);
        if new_length != meta.length() {
            self.persist_length(&meta, new_length).await?;
        }
        debug!("Wrote {} bytes at {} to {}", data.len(), offset, self.file_name);
        Ok(())
    }

    /// Zero `[start, end)` of an existing chunk, dropping it if nothing else remains
    async fn zero_in_chunk(
        &self,
        conn: &dyn ChunkStore,
        batch: &mut ChunkBatch,
        block: u64,
        start: usize,
        end: usize,
        chunk_size: u64,
    ) -> Result<()> {
        let Some(mut data) = conn.get(block).await? else {
            return Ok(());
        };
        data.resize(to_usize(chunk_size)?, 0);
        data[start..end].fill(0);
        if data.iter().all(|&b| b == 0) {
            batch.delete(block);
        } else {
            batch.put(block, data);
        }
        Ok(())
    }

    async fn del_range(&self, conn: &dyn ChunkStore, offset: u64, size: Extent) -> Result<()> {
        let meta = self.current_meta()?;
        let length = meta.length();
        let size = match size {
            Extent::Len(0) => return Ok(()),
            Extent::Len(n) => n,
            Extent::ToEnd => return self.truncate_to(conn, offset).await,
        };

        let end = offset.saturating_add(size);
        if end >= length {
            return self.truncate_to(conn, offset).await;
        }

        let chunk_size = meta.chunk_size();
        let ranges = blocks(chunk_size, offset, end);
        let (Some(&first), Some(&last)) = (ranges.first(), ranges.last()) else {
            return Ok(());
        };

        let mut batch = ChunkBatch::new();
        batch.delete_range(first.block + 1..last.block);

        let edges = if first.block == last.block {
            vec![first]
        } else {
            vec![first, last]
        };
        for edge in edges {
            if edge.is_full(chunk_size) {
                batch.delete(edge.block);
            } else {
                self.zero_in_chunk(conn, &mut batch, edge.block, edge.start, edge.end, chunk_size)
                    .await?;
            }
        }

        if !batch.is_empty() {
            conn.commit(batch).await?;
        }
        debug!("Zeroed {} bytes at {} in {}", size, offset, self.file_name);
        Ok(())
    }

    async fn truncate_to(&self, conn: &dyn ChunkStore, offset: u64) -> Result<()> {
        let meta = self.current_meta()?;
        let length = meta.length();
        let chunk_size = meta.chunk_size();
        let mut batch = ChunkBatch::new();

        if offset == length {
            return Ok(());
        } else if offset > length {
            // Grow sparsely: bytes past the old end must read as zeros
            let boundary = length / chunk_size;
            let start = (length % chunk_size) as usize;
            if start > 0 {
                self.zero_in_chunk(conn, &mut batch, boundary, start, to_usize(chunk_size)?, chunk_size)
                    .await?;
            }
            let last = (offset - 1) / chunk_size;
            batch.delete_range(length.div_ceil(chunk_size)..last.saturating_add(1));
        } else {
            let boundary = offset / chunk_size;
            let start = (offset % chunk_size) as usize;
            batch.delete_from(boundary + 1);
            if start == 0 {
                batch.delete(boundary);
            } else {
                self.zero_in_chunk(conn, &mut batch, boundary, start, to_usize(chunk_size)?, chunk_size)
                    .await?;
            }
        }

        if !batch.is_empty() {
            conn.commit(batch).await?;
        }
        self.persist_length(&meta, offset).await?;
        debug!("Truncated {} from {} to {}", self.file_name, length, offset);
        Ok(())
    }

    async fn reload_meta(&self) -> Result<Stat> {
        let meta = self
            .meta_store
            .get(&self.file_name)
            .await?
            .ok_or_else(|| StorageError::NotFound(self.file_name.clone()))?;
        let stat = Stat {
            file_name: meta.file_name().to_string(),
            length: meta.length(),
            size: meta.length(),
            chunk_size: meta.chunk_size(),
        };
        *self.meta.lock() = Some(meta);
        Ok(stat)
    }

    fn release_slot(self: &Arc<Self>) {
        self.retired.store(true, Ordering::SeqCst);
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&StorageHandle {
                inner: Arc::clone(self),
            });
        }
    }

    fn close_now(self: &Arc<Self>) {
        if *self.state.lock() == HandleState::Closed {
            if !self.retired.load(Ordering::SeqCst) {
                self.release_slot();
                debug!("Released never-opened handle of {}", self.file_name);
            }
            return;
        }
        self.drop_connection();
        *self.state.lock() = HandleState::Closed;
        self.release_slot();
        info!("Closed {}", self.file_name);
        self.emit(HandleEvent::Close);
    }

    fn suspend_now(&self) {
        let ran = self.queue.run_while_paused(|| {
            self.drop_connection();
            let mut state = self.state.lock();
            if *state == HandleState::Open {
                *state = HandleState::Suspended;
            }
        });
        if ran {
            info!("Suspended {}", self.file_name);
            self.emit(HandleEvent::Suspend);
        } else {
            debug!("Suspend of {} overtaken by a new operation", self.file_name);
        }
    }

    async fn purge_now(self: &Arc<Self>) -> Result<()> {
        self.reclaim_slot()?;
        self.drop_connection();

        let on_blocked = self
            .settings
            .hooks
            .on_delete_blocking
            .clone()
            .unwrap_or_else(|| {
                Arc::new(|event: &BlockingEvent| {
                    warn!(
                        "Purge of {} proceeding with {} other connection(s) open",
                        event.file_name, event.connections
                    );
                }) as BlockingHook
            });
        self.backend.destroy(&self.file_name, Some(on_blocked)).await?;
        self.meta_store.del(&self.file_name).await?;

        *self.meta.lock() = None;
        *self.state.lock() = HandleState::Closed;
        self.release_slot();
        info!("Purged {}", self.file_name);
        self.emit(HandleEvent::Close);
        Ok(())
    }
}

fn to_usize(n: u64) -> Result<usize> {
    usize::try_from(n)
        .map_err(|_| StorageError::InvalidArgument(format!("{} bytes do not fit in memory", n)))
}
