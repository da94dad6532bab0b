//! Artifact cache: one facade, pluggable backends.
//!
//! The facade is deliberately forgiving. A cache problem is never worth
//! failing a render over, so backend errors are logged and read as a miss on
//! `get` and as success on `set`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use prerender_core_types::{Artifact, CacheKey};

pub mod disk;
pub mod object;

pub use disk::DiskCache;
pub use object::{ObjectStoreCache, ObjectStoreConfig};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache encoding: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("object store: {0}")]
    Http(String),
}

/// Storage contract every backend fulfils. `ttl` bounds freshness on reads;
/// a zero `ttl` means entries never expire.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn get(&self, key: &CacheKey, ttl: Duration) -> Result<Option<Artifact>, CacheError>;
    async fn set(
        &self,
        key: &CacheKey,
        artifact: &Artifact,
        ttl: Duration,
    ) -> Result<(), CacheError>;
}

/// Backend that never hits. The default when caching is not configured.
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn get(&self, _key: &CacheKey, _ttl: Duration) -> Result<Option<Artifact>, CacheError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &CacheKey,
        _artifact: &Artifact,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Facade the render pipeline talks to.
#[derive(Clone)]
pub struct ArtifactCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl ArtifactCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopCache), Duration::ZERO)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Artifact> {
        match self.backend.get(key, self.ttl).await {
            Ok(Some(artifact)) => {
                debug!(target: "artifact-cache", %key, "cache hit");
                Some(artifact)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(target: "artifact-cache", %key, %err, "cache read failed");
                None
            }
        }
    }

    pub async fn set(&self, key: &CacheKey, artifact: &Artifact) {
        if let Err(err) = self.backend.set(key, artifact, self.ttl).await {
            warn!(target: "artifact-cache", %key, %err, "cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prerender_core_types::RenderFormat;

    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn get(&self, _: &CacheKey, _: Duration) -> Result<Option<Artifact>, CacheError> {
            Err(CacheError::Http("boom".into()))
        }

        async fn set(&self, _: &CacheKey, _: &Artifact, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Http("boom".into()))
        }
    }

    fn key() -> CacheKey {
        CacheKey::new("http://example.com/", RenderFormat::Html, "")
    }

    #[tokio::test]
    async fn noop_backend_always_misses() {
        let cache = ArtifactCache::disabled();
        let artifact = Artifact::new(RenderFormat::Html, b"<html></html>".to_vec());
        cache.set(&key(), &artifact).await;
        assert!(cache.get(&key()).await.is_none());
    }

    #[tokio::test]
    async fn backend_failures_read_as_miss_and_silent_set() {
        let cache = ArtifactCache::new(Arc::new(FailingBackend), Duration::from_secs(60));
        let artifact = Artifact::new(RenderFormat::Html, b"x".to_vec());
        // Neither call may propagate the backend error.
        cache.set(&key(), &artifact).await;
        assert!(cache.get(&key()).await.is_none());
    }
}
