//! Chunk storage backends
//!
//! A [`Backend`] hands out per-file [`ChunkStore`] connections. A connection
//! reads chunks by index and applies [`ChunkBatch`]es atomically. Backends
//! share a [`ConnectionTracker`] so that opening or destroying a file while
//! other connections to it are live is reported through blocking hooks.

pub mod fs;
pub mod memory;

use crate::error::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Range, RangeInclusive};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub use fs::FsBackend;
pub use memory::MemoryBackend;

/// One stored chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u64,
    pub data: Vec<u8>,
}

/// Chunk mutations committed as one atomic unit
///
/// Deletes are applied before puts, so a batch may clear a range and then
/// rewrite part of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBatch {
    pub deletes: Vec<Range<u64>>,
    pub puts: Vec<Chunk>,
}

impl ChunkBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, index: u64, data: Vec<u8>) -> &mut Self {
        self.puts.push(Chunk { index, data });
        self
    }

    pub fn delete(&mut self, index: u64) -> &mut Self {
        self.delete_range(index..index.saturating_add(1))
    }

    /// Delete every chunk whose index lies in `range`; empty ranges are ignored
    pub fn delete_range(&mut self, range: Range<u64>) -> &mut Self {
        if range.start < range.end {
            self.deletes.push(range);
        }
        self
    }

    /// Delete every chunk at or above `index`
    pub fn delete_from(&mut self, index: u64) -> &mut Self {
        self.delete_range(index..u64::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.puts.is_empty()
    }

    pub(crate) fn deletes_index(&self, index: u64) -> bool {
        self.deletes.iter().any(|r| r.contains(&index))
    }
}

/// A live connection to the chunks of one file
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Resolved name of the file this connection serves
    fn file_name(&self) -> &str;

    async fn get(&self, index: u64) -> Result<Option<Vec<u8>>, BackendError>;

    /// Chunks present in `range`, ordered by index; missing chunks are skipped
    async fn get_range(&self, range: RangeInclusive<u64>) -> Result<Vec<Chunk>, BackendError>;

    /// Apply `batch` atomically: either every mutation lands or none does
    async fn commit(&self, batch: ChunkBatch) -> Result<(), BackendError>;

    /// Close the connection; later calls fail with `ConnectionClosed`
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Source of chunk store connections
#[async_trait]
pub trait Backend: Send + Sync {
    async fn connect(
        &self,
        file_name: &str,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn ChunkStore>, BackendError>;

    /// Delete every chunk of `file_name`
    ///
    /// Other live connections are notified first; `on_blocked` fires if any of
    /// them is still open afterwards. Destruction proceeds either way.
    async fn destroy(
        &self,
        file_name: &str,
        on_blocked: Option<BlockingHook>,
    ) -> Result<(), BackendError>;
}

/// What a blocked or blocking connection is contending with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingKind {
    Open,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingEvent {
    pub file_name: String,
    pub kind: BlockingKind,
    /// Number of other connections involved
    pub connections: usize,
}

pub type BlockingHook = Arc<dyn Fn(&BlockingEvent) + Send + Sync>;

/// Hooks attached to one connection
#[derive(Clone, Default)]
pub struct ConnectionEvents {
    /// Fires on this connection when another party opens or destroys the same file
    pub on_blocking: Option<BlockingHook>,
    /// Fires on the connecting party when other connections stay open
    pub on_blocked: Option<BlockingHook>,
}

impl fmt::Debug for ConnectionEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("on_blocking", &self.on_blocking.is_some())
            .field("on_blocked", &self.on_blocked.is_some())
            .finish()
    }
}

/// Liveness flag and hooks for one registered connection
pub struct ConnectionState {
    file_name: String,
    closed: AtomicBool,
    on_blocking: Option<BlockingHook>,
}

impl ConnectionState {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closed connection to {}", self.file_name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ensure_open(&self) -> Result<(), BackendError> {
        if self.is_closed() {
            return Err(BackendError::ConnectionClosed(self.file_name.clone()));
        }
        Ok(())
    }
}

/// Registry of live connections per file name
///
/// Notification is best effort: hooks run synchronously and nothing waits
/// for a blocking connection to close.
#[derive(Default)]
pub struct ConnectionTracker {
    live: Mutex<HashMap<String, Vec<Arc<ConnectionState>>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection, notifying existing ones
    pub fn register(&self, file_name: &str, events: ConnectionEvents) -> Arc<ConnectionState> {
        let state = Arc::new(ConnectionState {
            file_name: file_name.to_string(),
            closed: AtomicBool::new(false),
            on_blocking: events.on_blocking,
        });

        let others = {
            let mut live = self.live.lock();
            let entry = live.entry(file_name.to_string()).or_default();
            entry.retain(|c| !c.is_closed());
            let others = entry.clone();
            entry.push(Arc::clone(&state));
            others
        };

        Self::notify(file_name, BlockingKind::Open, &others, events.on_blocked.as_ref());
        state
    }

    /// Notify every live connection to `file_name` that it is being destroyed
    pub fn notify_delete(&self, file_name: &str, on_blocked: Option<&BlockingHook>) {
        let others = {
            let mut live = self.live.lock();
            match live.get_mut(file_name) {
                Some(entry) => {
                    entry.retain(|c| !c.is_closed());
                    entry.clone()
                }
                None => Vec::new(),
            }
        };

        Self::notify(file_name, BlockingKind::Delete, &others, on_blocked);
    }

    /// Number of open connections to `file_name`
    pub fn live_connections(&self, file_name: &str) -> usize {
        self.live
            .lock()
            .get(file_name)
            .map(|entry| entry.iter().filter(|c| !c.is_closed()).count())
            .unwrap_or(0)
    }

    fn notify(
        file_name: &str,
        kind: BlockingKind,
        others: &[Arc<ConnectionState>],
        on_blocked: Option<&BlockingHook>,
    ) {
        if others.is_empty() {
            return;
        }

        let event = BlockingEvent {
            file_name: file_name.to_string(),
            kind,
            connections: others.len(),
        };
        for other in others {
            if let Some(hook) = &other.on_blocking {
                hook(&event);
            }
        }

        let still_open = others.iter().filter(|c| !c.is_closed()).count();
        if still_open > 0 {
            debug!(
                "{:?} of {} blocked by {} open connection(s)",
                kind, file_name, still_open
            );
            if let Some(hook) = on_blocked {
                hook(&BlockingEvent {
                    connections: still_open,
                    ..event
                });
            }
        }
    }
}
