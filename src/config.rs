//! Registry defaults and per-file configuration

use crate::core::backend::{BlockingEvent, BlockingHook};
use crate::core::validation::validate_chunk_size;
use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u64 = 4096;
pub const DEFAULT_SEPARATOR: &str = "/";
pub const DEFAULT_STALL_THRESHOLD_MS: u64 = 5000;

/// Defaults applied to every file a registry creates
///
/// Loadable from TOML; missing keys take their defaults:
///
/// ```
/// use chunkfile_rs::RegistryConfig;
///
/// let config = RegistryConfig::from_toml_str(r#"
///     chunk_size = 1024
///     directory = "cache"
/// "#).unwrap();
/// assert_eq!(config.chunk_size, 1024);
/// assert_eq!(config.separator, "/");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub chunk_size: u64,
    /// Namespace prefix for files that do not set their own
    pub directory: Option<String>,
    pub separator: String,
    /// Stall warning threshold for queued operations; 0 disables the watchdog
    pub stall_threshold_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            directory: None,
            separator: DEFAULT_SEPARATOR.to_string(),
            stall_threshold_ms: DEFAULT_STALL_THRESHOLD_MS,
        }
    }
}

impl RegistryConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: RegistryConfig =
            toml::from_str(s).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StorageError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| StorageError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.chunk_size)?;
        if self.separator.is_empty() {
            return Err(StorageError::Config(
                "separator cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stall_threshold(&self) -> Option<Duration> {
        match self.stall_threshold_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Hooks fired when connections to the same file contend
#[derive(Clone, Default)]
pub struct FileHooks {
    /// This handle's connection is holding up another party's open
    pub on_open_blocking: Option<BlockingHook>,
    /// This handle's open found other connections still open
    pub on_open_blocked: Option<BlockingHook>,
    /// This handle's purge found other connections still open
    pub on_delete_blocking: Option<BlockingHook>,
}

impl fmt::Debug for FileHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHooks")
            .field("on_open_blocking", &self.on_open_blocking.is_some())
            .field("on_open_blocked", &self.on_open_blocked.is_some())
            .field("on_delete_blocking", &self.on_delete_blocking.is_some())
            .finish()
    }
}

/// Per-file settings; unset fields fall back to the registry defaults
///
/// # Examples
///
/// ```
/// use chunkfile_rs::FileConfig;
/// use std::time::Duration;
///
/// let config = FileConfig::new()
///     .chunk_size(1024)
///     .directory("sessions")
///     .stall_threshold(Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    chunk_size: Option<u64>,
    directory: Option<String>,
    stall_threshold: Option<Duration>,
    hooks: FileHooks,
}

impl FileConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk size for a new file; ignored when the file already exists
    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn directory<S: Into<String>>(mut self, directory: S) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// `Duration::ZERO` disables the stall watchdog
    pub fn stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = Some(threshold);
        self
    }

    pub fn on_open_blocking<F>(mut self, hook: F) -> Self
    where
        F: Fn(&BlockingEvent) + Send + Sync + 'static,
    {
        self.hooks.on_open_blocking = Some(Arc::new(hook));
        self
    }

    pub fn on_open_blocked<F>(mut self, hook: F) -> Self
    where
        F: Fn(&BlockingEvent) + Send + Sync + 'static,
    {
        self.hooks.on_open_blocked = Some(Arc::new(hook));
        self
    }

    pub fn on_delete_blocking<F>(mut self, hook: F) -> Self
    where
        F: Fn(&BlockingEvent) + Send + Sync + 'static,
    {
        self.hooks.on_delete_blocking = Some(Arc::new(hook));
        self
    }

    pub(crate) fn directory_or<'a>(&'a self, defaults: &'a RegistryConfig) -> Option<&'a str> {
        self.directory
            .as_deref()
            .or(defaults.directory.as_deref())
    }

    pub(crate) fn resolve(&self, defaults: &RegistryConfig) -> Result<FileSettings> {
        let chunk_size = validate_chunk_size(self.chunk_size.unwrap_or(defaults.chunk_size))?;
        let stall_threshold = match self.stall_threshold {
            Some(Duration::ZERO) => None,
            Some(threshold) => Some(threshold),
            None => defaults.stall_threshold(),
        };
        Ok(FileSettings {
            chunk_size,
            stall_threshold,
            hooks: self.hooks.clone(),
        })
    }
}

/// Effective settings of one handle
#[derive(Debug, Clone)]
pub(crate) struct FileSettings {
    pub chunk_size: u64,
    pub stall_threshold: Option<Duration>,
    pub hooks: FileHooks,
}
