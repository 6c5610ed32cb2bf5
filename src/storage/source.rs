//! Blob transport
//!
//! A `Source` addresses one path (a file, or a directory of keyed blobs) on
//! some storage backend. The engine only ever talks to this trait; the local
//! filesystem implementation ships here, remote backends plug in from
//! outside. Keys are flat strings relative to the source root.

use crate::error::{IndexError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait Source: Send + Sync {
    /// Whether blobs live behind a network transport. Remote sources get
    /// staged to a local tmp path before decoding.
    fn is_remote(&self) -> bool;

    /// Local filesystem path of the root. Only meaningful when not remote.
    fn path(&self) -> &str;

    /// Full path of a key under this source.
    fn resolve(&self, key: &str) -> String;

    /// Fetch the bytes stored under `key`.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Fetch the root path itself (used when the source addresses a single
    /// input file).
    fn get_root(&self) -> Result<Vec<u8>>;

    fn get_as_string(&self, key: &str) -> Result<String> {
        let bytes = self.get(key)?;
        String::from_utf8(bytes).map_err(|e| IndexError::Source(format!("not UTF-8: {}", e)))
    }

    /// Store `data` under `key`, creating parent directories as needed.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Remove the blob under `key`. Missing blobs are an error: removal is
    /// only requested for blobs this build wrote.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Paths carrying a URL scheme belong to a remote backend.
pub fn is_remote_path(path: &str) -> bool {
    path.contains("://")
}

/// Plain filesystem source rooted at a directory or file.
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Create the root directory if it does not exist yet.
    pub fn mkdirp(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| IndexError::Config(format!("cannot create {}: {}", self.root.display(), e)))
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Source for LocalSource {
    fn is_remote(&self) -> bool {
        false
    }

    fn path(&self) -> &str {
        self.root.to_str().unwrap_or("")
    }

    fn resolve(&self, key: &str) -> String {
        self.key_path(key).to_string_lossy().into_owned()
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.key_path(key);
        if !path.exists() {
            return Err(IndexError::BlobNotFound(path.to_string_lossy().into_owned()));
        }
        Ok(fs::read(path)?)
    }

    fn get_root(&self) -> Result<Vec<u8>> {
        Ok(fs::read(&self.root)?)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write the full blob to a sibling tmp file, fsync, then rename over
        // the key. rename() is the commit point: readers see the old blob or
        // the new one, never a partial write.
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        Ok(fs::remove_file(self.key_path(key))?)
    }
}
