//! Filesystem backend: one JSON file per key, expiry by file mtime.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use prerender_core_types::{Artifact, CacheKey};

use crate::{CacheBackend, CacheError};

pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Open (and create if needed) the cache directory.
    pub async fn create(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.storage_id())
    }
}

#[async_trait]
impl CacheBackend for DiskCache {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn get(&self, key: &CacheKey, ttl: Duration) -> Result<Option<Artifact>, CacheError> {
        let path = self.entry_path(key);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if !ttl.is_zero() {
            let age = metadata
                .modified()?
                .elapsed()
                .unwrap_or(Duration::ZERO);
            if age > ttl {
                debug!(target: "artifact-cache", %key, "expired entry removed");
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(None);
            }
        }

        let bytes = tokio::fs::read(&path).await?;
        match serde_json::from_slice::<Artifact>(&bytes) {
            Ok(artifact) => Ok(Some(artifact)),
            Err(err) => {
                // Unreadable entries are dropped rather than surfaced.
                warn!(target: "artifact-cache", %key, %err, "corrupt entry removed");
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &CacheKey,
        artifact: &Artifact,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let staging = path.with_extension("tmp");
        let bytes = serde_json::to_vec(artifact)?;

        // Write-then-rename so readers never observe a half-written entry.
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prerender_core_types::RenderFormat;
    use tempfile::tempdir;

    fn key(tag: &str) -> CacheKey {
        CacheKey::new(&format!("http://example.com/{tag}"), RenderFormat::Html, "")
    }

    fn artifact(body: &str) -> Artifact {
        Artifact::new(RenderFormat::Html, body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn round_trips_within_ttl() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::create(dir.path()).await.unwrap();
        let ttl = Duration::from_secs(60);

        cache.set(&key("a"), &artifact("<html>a</html>"), ttl).await.unwrap();
        let loaded = cache.get(&key("a"), ttl).await.unwrap().unwrap();
        assert_eq!(loaded.bytes, b"<html>a</html>");
        assert_eq!(loaded.format, RenderFormat::Html);
    }

    #[tokio::test]
    async fn expired_entries_miss_and_are_removed() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::create(dir.path()).await.unwrap();

        cache
            .set(&key("b"), &artifact("stale"), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let loaded = cache.get(&key("b"), Duration::from_millis(10)).await.unwrap();
        assert!(loaded.is_none());
        assert!(!cache.entry_path(&key("b")).exists());
    }

    #[tokio::test]
    async fn zero_ttl_disables_expiry() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::create(dir.path()).await.unwrap();

        cache.set(&key("c"), &artifact("kept"), Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key("c"), Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupt_entries_read_as_miss() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::create(dir.path()).await.unwrap();
        let ttl = Duration::from_secs(60);

        tokio::fs::write(cache.entry_path(&key("d")), b"not json")
            .await
            .unwrap();
        assert!(cache.get(&key("d"), ttl).await.unwrap().is_none());
        assert!(!cache.entry_path(&key("d")).exists());
    }

    #[tokio::test]
    async fn missing_entry_is_a_plain_miss() {
        let dir = tempdir().unwrap();
        let cache = DiskCache::create(dir.path()).await.unwrap();
        assert!(cache
            .get(&key("nothing"), Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }
}
