//! Storage interface.
//!
//! Sessions fetch and persist payload bytes through two injected operations,
//! mirroring the read/write callback seam of the server API. The default
//! implementation is filesystem-backed. Storage is never handed a
//! user-controlled path; it always receives the canonical path produced by
//! the path safety layer.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("file not found")]
    NotFound,

    #[error("access denied: {0}")]
    Denied(String),
}

/// Read half of the storage seam: `canonical path -> bytes`.
pub type ReadFn = dyn Fn(&Path) -> Result<Vec<u8>, StorageError> + Send + Sync;

/// Write half of the storage seam: `canonical path + bytes -> ()`.
pub type WriteFn = dyn Fn(&Path, &[u8]) -> Result<(), StorageError> + Send + Sync;

/// Pluggable payload storage.
pub trait Storage: Send + Sync {
    /// Fetch the full contents of a stored object.
    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError>;

    /// Persist an object. After `Ok` the object exists with exactly the given
    /// bytes.
    fn write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError>;
}

/// Filesystem-backed storage: whole-file reads, atomic writes.
#[derive(Debug, Default, Clone)]
pub struct FsStorage;

impl FsStorage {
    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".kestrel-tmp");
        path.with_file_name(name)
    }
}

impl Storage for FsStorage {
    fn read(&self, path: &Path) -> Result<Vec<u8>, StorageError> {
        match std::fs::read(path) {
            Ok(data) => {
                debug!(path = %path.display(), bytes = data.len(), "file read");
                Ok(data)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => {
                error!(path = %path.display(), error = %e, "file read failed");
                Err(StorageError::Denied(e.to_string()))
            }
        }
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Denied(format!("create directory: {}", e)))?;
            }
        }

        // Write to a sibling temp file and rename so a crash mid-write never
        // leaves a truncated object under the final name.
        let temp = Self::temp_path(path);
        std::fs::write(&temp, data)
            .map_err(|e| StorageError::Denied(format!("write: {}", e)))?;
        std::fs::rename(&temp, path).map_err(|e| {
            let _ = std::fs::remove_file(&temp);
            StorageError::Denied(format!("rename: {}", e))
        })?;

        debug!(path = %path.display(), bytes = data.len(), "file written");
        Ok(())
    }
}

/// Package a [`Storage`] implementation as the callback pair the server holds.
pub(crate) fn callbacks_for(storage: Arc<dyn Storage>) -> (Arc<ReadFn>, Arc<WriteFn>) {
    let read_storage = storage.clone();
    let read: Arc<ReadFn> = Arc::new(move |path: &Path| read_storage.read(path));
    let write: Arc<WriteFn> = Arc::new(move |path: &Path, data: &[u8]| storage.write(path, data));
    (read, write)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"payload").unwrap();
        assert_eq!(FsStorage.read(&path).unwrap(), b"payload");
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FsStorage.read(&dir.path().join("missing")),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.bin");
        FsStorage.write(&path, b"deep").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"deep");
    }

    #[test]
    fn write_replaces_existing_content_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj");
        FsStorage.write(&path, b"first version").unwrap();
        FsStorage.write(&path, b"v2").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"v2");
    }

    #[test]
    fn write_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obj");
        FsStorage.write(&path, b"data").unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("obj")]);
    }

    #[test]
    fn empty_write_produces_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        FsStorage.write(&path, b"").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn callbacks_delegate_to_storage() {
        let dir = tempfile::tempdir().unwrap();
        let (read, write) = callbacks_for(Arc::new(FsStorage));
        let path = dir.path().join("via-callback");
        write(&path, b"cb").unwrap();
        assert_eq!(read(&path).unwrap(), b"cb");
    }
}
