//! File Storage
//!
//! The transfer state machine reads files from and writes files into a
//! [`Store`]. Two implementations ship with the crate: an in-memory map and a
//! directory on disk confined to a root.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Errors returned by a [`Store`]
#[derive(Debug, Error)]
pub enum StoreError {
    /// The name is absolute, contains `..`, or resolves outside the store
    #[error("invalid file name '{0}'")]
    InvalidName(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Key to bytes storage consumed by the transfer state machine
///
/// Callers serialize access: the registry only touches its store while holding
/// the registry lock, so a lookup and a later update of the same key never
/// interleave with another peer's.
pub trait Store: Send + 'static {
    /// Fetch a file, `None` if it does not exist
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store a complete file, replacing any previous content
    fn put(&mut self, name: &str, data: Vec<u8>) -> Result<(), StoreError>;

    /// Check whether a file exists
    fn contains(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.get(name)?.is_some())
    }
}

/// Store backed by a `HashMap`
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for seeding a store
    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), data.into());
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.files.get(name).cloned())
    }

    fn put(&mut self, name: &str, data: Vec<u8>) -> Result<(), StoreError> {
        self.files.insert(name.to_string(), data);
        Ok(())
    }

    fn contains(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.files.contains_key(name))
    }
}

/// Store backed by a directory tree
///
/// Filenames are resolved relative to the root. Absolute names, `..`
/// components and symlinks pointing outside the root are rejected.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a TFTP filename to a path below the root
    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(name);
        let plain = relative.components().all(|c| matches!(c, Component::Normal(_)));
        if name.is_empty() || !plain {
            return Err(StoreError::InvalidName(name.to_string()));
        }

        // A symlink inside the root may still point elsewhere, or nowhere yet.
        // Every link on the way down must resolve to a path under the root.
        let root_canon = self.root.canonicalize()?;
        let mut path = self.root.clone();
        for component in relative.components() {
            path.push(component);
            let Ok(meta) = path.symlink_metadata() else {
                break;
            };
            if meta.file_type().is_symlink() {
                let inside = path.canonicalize().is_ok_and(|target| target.starts_with(&root_canon));
                if !inside {
                    return Err(StoreError::InvalidName(name.to_string()));
                }
            }
        }

        Ok(self.root.join(relative))
    }
}

impl Store for DirStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(&path)?))
    }

    fn put(&mut self, name: &str, data: Vec<u8>) -> Result<(), StoreError> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        Ok(())
    }

    fn contains(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.resolve(name)?.exists())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new().with_file("a", b"alpha".to_vec());
        assert_eq!(store.get("a").unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(store.get("b").unwrap(), None);
        assert!(store.contains("a").unwrap());

        store.put("b", b"beta".to_vec()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("b").unwrap(), Some(b"beta".to_vec()));
    }

    #[test]
    fn test_dir_store_read_write() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("test.txt"), b"test content").unwrap();

        let mut store = DirStore::new(temp_dir.path());
        assert_eq!(store.get("test.txt").unwrap(), Some(b"test content".to_vec()));
        assert_eq!(store.get("missing.txt").unwrap(), None);
        assert!(!store.contains("missing.txt").unwrap());

        store.put("sub/new.bin", vec![1, 2, 3]).unwrap();
        assert_eq!(std::fs::read(temp_dir.path().join("sub/new.bin")).unwrap(), vec![1, 2, 3]);
        assert!(store.contains("sub/new.bin").unwrap());
    }

    #[test]
    fn test_dir_store_rejects_traversal() {
        let temp_dir = tempdir().unwrap();
        let mut store = DirStore::new(temp_dir.path());

        for name in ["../../../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(store.get(name), Err(StoreError::InvalidName(_))),
                "get accepted {name:?}"
            );
            assert!(
                matches!(store.put(name, Vec::new()), Err(StoreError::InvalidName(_))),
                "put accepted {name:?}"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_store_rejects_symlink_escape() {
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();

        let root = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), root.path().join("link")).unwrap();

        let store = DirStore::new(root.path());
        assert!(matches!(store.get("link"), Err(StoreError::InvalidName(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_store_rejects_dangling_symlink() {
        let outside = tempdir().unwrap();
        let root = tempdir().unwrap();
        let target = outside.path().join("planted.bin");
        std::os::unix::fs::symlink(&target, root.path().join("evil")).unwrap();

        let mut store = DirStore::new(root.path());
        assert!(matches!(store.contains("evil"), Err(StoreError::InvalidName(_))));
        assert!(matches!(store.put("evil", b"x".to_vec()), Err(StoreError::InvalidName(_))));
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_store_follows_links_inside_root() {
        let root = tempdir().unwrap();
        std::fs::create_dir(root.path().join("real")).unwrap();
        std::os::unix::fs::symlink(root.path().join("real"), root.path().join("alias")).unwrap();

        let mut store = DirStore::new(root.path());
        store.put("alias/f.txt", b"ok".to_vec()).unwrap();
        assert_eq!(std::fs::read(root.path().join("real/f.txt")).unwrap(), b"ok");
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_store_rejects_upload_through_symlinked_dir() {
        let outside = tempdir().unwrap();
        let root = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("out")).unwrap();

        let mut store = DirStore::new(root.path());
        let result = store.put("out/new.bin", b"x".to_vec());
        assert!(matches!(result, Err(StoreError::InvalidName(_))));
        assert!(!outside.path().join("new.bin").exists());
    }
}
