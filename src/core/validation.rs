//! Validation and resolution of logical file names
//!
//! Callers name files relative to an optional directory prefix. The resolved
//! name (prefix + separator + name) is the key used by the registry, the
//! metadata store and the chunk backends.

use crate::error::{Result, StorageError};
use sha2::{Digest, Sha256};

/// Name reserved for the metadata store itself
pub const RESERVED_META_NAME: &str = "###meta";

/// A validated, fully resolved file name
///
/// # Rules
/// - The bare name must not be empty
/// - Neither the bare nor the resolved name may equal [`RESERVED_META_NAME`]
/// - No NUL bytes
///
/// # Examples
///
/// ```
/// use chunkfile_rs::core::validation::FileName;
///
/// let name = FileName::resolve(Some("logs"), "/", "app.log").unwrap();
/// assert_eq!(name.as_str(), "logs/app.log");
///
/// assert!(FileName::resolve(None, "/", "###meta").is_err());
/// assert!(FileName::resolve(None, "/", "").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileName(String);

impl FileName {
    /// Resolve `name` against an optional directory prefix
    pub fn resolve(directory: Option<&str>, separator: &str, name: &str) -> Result<Self> {
        Self::validate_bare(name)?;

        let resolved = match directory {
            Some(dir) if !dir.is_empty() => {
                let dir = dir.strip_suffix(separator).unwrap_or(dir);
                format!("{}{}{}", dir, separator, name)
            }
            _ => name.to_string(),
        };

        if resolved == RESERVED_META_NAME {
            return Err(StorageError::ReservedName(resolved));
        }
        Ok(FileName(resolved))
    }

    fn validate_bare(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(StorageError::InvalidArgument(
                "file name cannot be empty".to_string(),
            ));
        }

        if name == RESERVED_META_NAME {
            return Err(StorageError::ReservedName(name.to_string()));
        }

        if name.contains('\0') {
            return Err(StorageError::InvalidArgument(format!(
                "file name '{}' contains a NUL byte",
                name.escape_default()
            )));
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for FileName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate a chunk size supplied by configuration
pub fn validate_chunk_size(chunk_size: u64) -> Result<u64> {
    if chunk_size == 0 {
        return Err(StorageError::InvalidArgument(
            "chunk size must be greater than zero".to_string(),
        ));
    }
    if usize::try_from(chunk_size).is_err() {
        return Err(StorageError::InvalidArgument(format!(
            "chunk size {} does not fit in memory",
            chunk_size
        )));
    }
    Ok(chunk_size)
}

/// Filesystem-safe key for a resolved file name (hex SHA-256)
pub fn storage_key(file_name: &str) -> String {
    let digest = Sha256::digest(file_name.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_resolve_with_directory() {
        let name = FileName::resolve(Some("data"), "/", "a.bin").unwrap();
        assert_eq!(name.as_str(), "data/a.bin");

        // Trailing separator is not doubled
        let name = FileName::resolve(Some("data/"), "/", "a.bin").unwrap();
        assert_eq!(name.as_str(), "data/a.bin");

        let name = FileName::resolve(Some("ns"), "::", "x").unwrap();
        assert_eq!(name.to_string(), "ns::x");

        let name = FileName::resolve(Some(""), "/", "plain").unwrap();
        assert_eq!(name.as_str(), "plain");
    }

    #[test]
    fn test_invalid_names() {
        let err = FileName::resolve(None, "/", "").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = FileName::resolve(None, "/", "###meta").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReservedName);

        let err = FileName::resolve(Some("dir"), "/", "###meta").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReservedName);

        assert!(FileName::resolve(None, "/", "bad\0name").is_err());
    }

    #[test]
    fn test_chunk_size_validation() {
        assert_eq!(validate_chunk_size(4096).unwrap(), 4096);
        assert_eq!(validate_chunk_size(1).unwrap(), 1);
        assert_eq!(
            validate_chunk_size(0).unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn test_storage_key_is_stable_hex() {
        let a = storage_key("data/a.bin");
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, storage_key("data/a.bin"));
        assert_ne!(a, storage_key("data/b.bin"));
    }
}
