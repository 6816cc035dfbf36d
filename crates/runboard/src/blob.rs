//! Content-addressed storage for replay files.
//!
//! Blobs are keyed by the SHA-256 hex digest of their bytes; the digest doubles
//! as the run hash used for duplicate detection.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::RunboardError;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(&self, content_hash: &str, bytes: &[u8]) -> Result<(), RunboardError>;
    async fn get(&self, content_hash: &str) -> Result<Vec<u8>, RunboardError>;
    async fn has(&self, content_hash: &str) -> Result<bool, RunboardError>;

    /// Store `bytes` under their own digest and return it as the file reference.
    async fn put_bytes(&self, bytes: &[u8]) -> Result<String, RunboardError> {
        let content_hash = sha256_hex(bytes);
        self.put(&content_hash, bytes).await?;
        Ok(content_hash)
    }
}

fn validate_hash(content_hash: &str) -> Result<(), RunboardError> {
    if content_hash.len() != 64 || !content_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(RunboardError::validation(format!(
            "invalid content hash {content_hash:?}"
        )));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, content_hash: &str, bytes: &[u8]) -> Result<(), RunboardError> {
        validate_hash(content_hash)?;
        self.blobs
            .lock()
            .entry(content_hash.to_string())
            .or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    async fn get(&self, content_hash: &str) -> Result<Vec<u8>, RunboardError> {
        self.blobs
            .lock()
            .get(content_hash)
            .cloned()
            .ok_or_else(|| RunboardError::not_found(format!("replay {content_hash}")))
    }

    async fn has(&self, content_hash: &str) -> Result<bool, RunboardError> {
        Ok(self.blobs.lock().contains_key(content_hash))
    }
}

/// Replays as `<root>/<hash>.replay` files.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self, content_hash: &str) -> Result<PathBuf, RunboardError> {
        validate_hash(content_hash)?;
        Ok(self.root.join(format!("{content_hash}.replay")))
    }
}

fn io_err<'a>(
    op: &'static str,
    path: &'a Path,
) -> impl FnOnce(std::io::Error) -> RunboardError + 'a {
    move |e| RunboardError::persistence(format!("{op} {} failed: {e}", path.display()), e)
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, content_hash: &str, bytes: &[u8]) -> Result<(), RunboardError> {
        let path = self.blob_path(content_hash)?;
        if tokio::fs::try_exists(&path)
            .await
            .map_err(io_err("stat", &path))?
        {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(io_err("create", &self.root))?;

        // write-then-rename so readers never observe a partial file; every
        // writer gets its own temp file in the same directory
        let root = self.root.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut tmp =
                NamedTempFile::new_in(&root).map_err(io_err("create temp file in", &root))?;
            tmp.write_all(&bytes)
                .map_err(io_err("write", tmp.path()))?;
            tmp.persist(&path)
                .map_err(|e| io_err("rename", &path)(e.error))?;
            Ok::<(), RunboardError>(())
        })
        .await
        .map_err(|e| RunboardError::persistence("replay write task failed", e))?
    }

    async fn get(&self, content_hash: &str) -> Result<Vec<u8>, RunboardError> {
        let path = self.blob_path(content_hash)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RunboardError::not_found(format!("replay {content_hash}")))
            }
            Err(e) => Err(io_err("read", &path)(e)),
        }
    }

    async fn has(&self, content_hash: &str) -> Result<bool, RunboardError> {
        let path = self.blob_path(content_hash)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(io_err("stat", &path))
    }
}
