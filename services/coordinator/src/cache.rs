//! Persistent SBOM cache.
//!
//! One artifact per digest. The cache is authoritative for presence: the
//! coordinator never invalidates entries, it only reads them and writes
//! fetched SBOMs back. Writes land under a temporary name and rename into
//! place so a concurrent reader sees either the old bytes or the new ones.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use scanhub_imageref::sanitize_for_filename;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Digest-keyed SBOM store.
#[async_trait]
pub trait SbomCache: Send + Sync {
    /// Look up the SBOM for a digest.
    async fn get(&self, digest: &str) -> Result<Option<Bytes>, CacheError>;

    /// Store the SBOM for a digest, overwriting any previous entry.
    async fn put(&self, digest: &str, sbom: &[u8]) -> Result<(), CacheError>;
}

/// Filesystem-backed cache, one JSON file per digest.
pub struct FsSbomCache {
    dir: PathBuf,
}

impl FsSbomCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, digest: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_for_filename(digest)))
    }
}

#[async_trait]
impl SbomCache for FsSbomCache {
    async fn get(&self, digest: &str) -> Result<Option<Bytes>, CacheError> {
        match tokio::fs::read(self.path_for(digest)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn put(&self, digest: &str, sbom: &[u8]) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(digest);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, sbom).await?;
        tokio::fs::rename(&staging, &path).await?;

        debug!(digest, path = %path.display(), size = sbom.len(), "Cached SBOM");
        Ok(())
    }
}

/// In-memory cache for tests.
#[derive(Default)]
pub struct MemorySbomCache {
    entries: tokio::sync::RwLock<std::collections::HashMap<String, Bytes>>,
}

impl MemorySbomCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SbomCache for MemorySbomCache {
    async fn get(&self, digest: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.entries.read().await.get(digest).cloned())
    }

    async fn put(&self, digest: &str, sbom: &[u8]) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(digest.to_string(), Bytes::copy_from_slice(sbom));
        Ok(())
    }
}
