//! # chunkfile - Chunked Random-Access File Storage
//!
//! `chunkfile-rs` stores logical byte-addressable files as fixed-size chunks
//! in a transactional key-value backend, with:
//!
//! - **Random access**: read, write, zero and truncate at arbitrary offsets
//! - **Atomic batches**: every mutation commits its chunks as one unit
//! - **Serialized operations**: one FIFO queue per file, so concurrent callers
//!   see a linearizable view
//! - **Pluggable stores**: in-memory and filesystem backends out of the box
//!
//! ## Quick Start
//!
//! ```rust
//! use chunkfile_rs::{Extent, FileConfig, HandleRegistry, Result};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! let registry = HandleRegistry::in_memory();
//! let file = registry.create_file("notes.txt", FileConfig::new().chunk_size(1024))?;
//!
//! file.write(0, b"hello world".to_vec()).await?;
//! assert_eq!(file.read(0, 5u64).await?, b"hello");
//!
//! file.truncate(5).await?;
//! assert_eq!(file.read(0, Extent::ToEnd).await?, b"hello");
//! assert_eq!(file.stat().await?.size, 5);
//!
//! file.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistent Storage
//!
//! ```rust,no_run
//! use chunkfile_rs::{FileConfig, HandleRegistry, RegistryConfig, Result};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let defaults = RegistryConfig::from_path("chunkfile.toml")?;
//! let registry = HandleRegistry::open_dir("/var/lib/chunkfile", defaults)?;
//!
//! let file = registry.create_file("blob.bin", FileConfig::new())?;
//! file.write(4096, vec![0xff; 100]).await?;
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;

pub use crate::config::{FileConfig, FileHooks, RegistryConfig};
pub use crate::core::{
    backend::{
        Backend, BlockingEvent, BlockingHook, BlockingKind, Chunk, ChunkBatch, ChunkStore,
        ConnectionEvents, FsBackend, MemoryBackend,
    },
    blocks::{blocks, ChunkRange},
    handle::{Extent, HandleEvent, HandleState, Stat, StorageHandle},
    meta::{FileMeta, FsMetaStore, MemoryMetaStore, MetaStore},
    queue::{OperationQueue, TaskFuture},
    registry::HandleRegistry,
    validation::{FileName, RESERVED_META_NAME},
};
pub use crate::error::{BackendError, ErrorCode, Result, StorageError};
