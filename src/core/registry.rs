//! Registry of live handles
//!
//! A registry owns the backend and metadata store shared by its files and
//! guarantees at most one live [`StorageHandle`] per resolved file name.

use crate::config::{FileConfig, RegistryConfig};
use crate::core::backend::{Backend, FsBackend, MemoryBackend};
use crate::core::handle::StorageHandle;
use crate::core::meta::{FsMetaStore, MemoryMetaStore, MetaStore};
use crate::core::validation::FileName;
use crate::error::{Result, StorageError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct RegistryInner {
    backend: Arc<dyn Backend>,
    meta_store: Arc<dyn MetaStore>,
    defaults: RwLock<RegistryConfig>,
    handles: Mutex<HashMap<String, StorageHandle>>,
}

impl RegistryInner {
    /// Drop `handle`'s entry if it still owns the slot
    pub(crate) fn release(&self, handle: &StorageHandle) {
        let mut handles = self.handles.lock();
        if handles
            .get(handle.file_name())
            .is_some_and(|current| current.ptr_eq(handle))
        {
            handles.remove(handle.file_name());
            debug!("Released registry slot of {}", handle.file_name());
        }
    }

    /// Put a retired handle back in its slot unless a live handle took it
    pub(crate) fn adopt(&self, handle: &StorageHandle) -> Result<()> {
        let mut handles = self.handles.lock();
        match handles.get(handle.file_name()) {
            Some(current) if current.ptr_eq(handle) => Ok(()),
            Some(current) if !current.is_retired() => {
                Err(StorageError::Superseded(handle.file_name().to_string()))
            }
            _ => {
                handles.insert(handle.file_name().to_string(), handle.clone());
                debug!("Re-adopted registry slot of {}", handle.file_name());
                Ok(())
            }
        }
    }
}

/// Factory and index of storage handles
///
/// Cloning yields another reference to the same registry.
///
/// # Examples
///
/// ```
/// use chunkfile_rs::{FileConfig, HandleRegistry};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> chunkfile_rs::Result<()> {
/// let registry = HandleRegistry::in_memory();
/// let file = registry.create_file("hello.txt", FileConfig::new().chunk_size(4))?;
///
/// file.write(0, b"hello world".to_vec()).await?;
/// assert_eq!(file.read(6, 5u64).await?, b"world");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HandleRegistry {
    inner: Arc<RegistryInner>,
}

impl HandleRegistry {
    pub fn new(
        backend: Arc<dyn Backend>,
        meta_store: Arc<dyn MetaStore>,
        defaults: RegistryConfig,
    ) -> Self {
        HandleRegistry {
            inner: Arc::new(RegistryInner {
                backend,
                meta_store,
                defaults: RwLock::new(defaults),
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registry over fresh in-memory stores
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryMetaStore::new()),
            RegistryConfig::default(),
        )
    }

    /// Registry persisting chunks and metadata under `root`
    pub fn open_dir<P: AsRef<Path>>(root: P, defaults: RegistryConfig) -> Result<Self> {
        defaults.validate()?;
        let root = root.as_ref();
        info!("Opening chunk storage at {}", root.display());
        Ok(Self::new(
            Arc::new(FsBackend::new(root)),
            Arc::new(FsMetaStore::new(root)),
            defaults,
        ))
    }

    /// Return the live handle for `file_name`, creating one if needed
    ///
    /// A live handle is returned as-is and `config` is ignored. A handle
    /// retired by `close` or `purge` is replaced.
    pub fn create_file(&self, file_name: &str, config: FileConfig) -> Result<StorageHandle> {
        let (name, settings) = {
            let defaults = self.inner.defaults.read();
            let name = FileName::resolve(
                config.directory_or(&defaults),
                &defaults.separator,
                file_name,
            )?;
            (name, config.resolve(&defaults)?)
        };

        let mut handles = self.inner.handles.lock();
        if let Some(existing) = handles.get(name.as_str()) {
            if !existing.is_retired() {
                return Ok(existing.clone());
            }
            debug!("Replacing retired handle of {}", name);
        }

        let handle = StorageHandle::new(
            name.clone().into_string(),
            settings,
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.meta_store),
            Arc::downgrade(&self.inner),
        );
        handles.insert(name.into_string(), handle.clone());
        Ok(handle)
    }

    /// Live handle registered under the resolved `file_name`
    pub fn get(&self, file_name: &str) -> Option<StorageHandle> {
        self.inner
            .handles
            .lock()
            .get(file_name)
            .filter(|handle| !handle.is_retired())
            .cloned()
    }

    /// Resolved names of every registered handle, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.handles.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.handles.lock().is_empty()
    }

    pub fn defaults(&self) -> RegistryConfig {
        self.inner.defaults.read().clone()
    }

    /// Replace the defaults used by handles created from now on
    pub fn update_defaults<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(RegistryConfig) -> RegistryConfig,
    {
        let mut defaults = self.inner.defaults.write();
        let updated = f(defaults.clone());
        updated.validate()?;
        *defaults = updated;
        Ok(())
    }

    /// Close every registered handle, then clear its queue
    ///
    /// Close errors are collected rather than stopping the teardown; the first
    /// one is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<StorageHandle> = self.inner.handles.lock().values().cloned().collect();
        info!("Shutting down registry with {} handle(s)", handles.len());

        let mut first_error = None;
        for handle in &handles {
            if let Err(e) = handle.close().await {
                first_error.get_or_insert(e);
            }
        }
        for handle in &handles {
            handle.queue().clear();
        }
        self.inner.handles.lock().clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
