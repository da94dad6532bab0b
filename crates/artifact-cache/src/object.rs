//! Object-store backend: artifacts as JSON objects behind plain HTTP GET/PUT
//! with bounded retry on transient upstream trouble.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::debug;

use prerender_core_types::{Artifact, CacheKey};

use crate::{CacheBackend, CacheError};

#[derive(Clone, Debug)]
pub struct ObjectStoreConfig {
    /// Base endpoint, e.g. `http://object-store:9000`.
    pub endpoint: String,
    pub bucket: String,
    /// Optional bearer token sent with every request.
    pub auth_token: Option<String>,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: "prerender".to_string(),
            auth_token: None,
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

pub struct ObjectStoreCache {
    cfg: ObjectStoreConfig,
    http: reqwest::Client,
}

impl ObjectStoreCache {
    pub fn new(cfg: ObjectStoreConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
        }
    }

    fn object_url(&self, key: &CacheKey) -> String {
        format!(
            "{}/{}/{}",
            self.cfg.endpoint.trim_end_matches('/'),
            self.cfg.bucket,
            key.storage_id()
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.cfg.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Run `build` with retry on connect errors and 5xx responses.
    async fn send_with_retry<F>(&self, build: F) -> Result<Response, CacheError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.authorize(build()).send().await;
            let retriable = match &outcome {
                Ok(response) => response.status().is_server_error(),
                Err(_) => true,
            };

            if retriable && attempt <= self.cfg.max_retries {
                debug!(target: "artifact-cache", attempt, "object store retry");
                tokio::time::sleep(self.cfg.retry_backoff * attempt).await;
                continue;
            }

            return match outcome {
                Ok(response) => Ok(response),
                Err(err) => Err(CacheError::Http(err.to_string())),
            };
        }
    }
}

#[async_trait]
impl CacheBackend for ObjectStoreCache {
    fn name(&self) -> &'static str {
        "object-store"
    }

    async fn get(&self, key: &CacheKey, ttl: Duration) -> Result<Option<Artifact>, CacheError> {
        let url = self.object_url(key);
        let response = self.send_with_retry(|| self.http.get(&url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CacheError::Http(format!(
                "unexpected status {} for GET",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| CacheError::Http(err.to_string()))?;
        let artifact: Artifact = serde_json::from_slice(&bytes)?;

        if !ttl.is_zero() {
            let age = chrono::Utc::now()
                .signed_duration_since(artifact.produced_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age > ttl {
                return Ok(None);
            }
        }

        Ok(Some(artifact))
    }

    async fn set(
        &self,
        key: &CacheKey,
        artifact: &Artifact,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        let url = self.object_url(key);
        let body = serde_json::to_vec(artifact)?;
        let response = self
            .send_with_retry(|| {
                self.http
                    .put(&url)
                    .header("content-type", "application/json")
                    .body(body.clone())
            })
            .await?;

        if !response.status().is_success() {
            return Err(CacheError::Http(format!(
                "unexpected status {} for PUT",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use prerender_core_types::RenderFormat;

    #[derive(Clone, Default)]
    struct StoreState {
        objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        failures_to_inject: Arc<AtomicU32>,
    }

    async fn start_store(state: StoreState) -> String {
        let app = Router::new()
            .route(
                "/:bucket/:id",
                get(fetch_object).put(store_object),
            )
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn fetch_object(
        State(state): State<StoreState>,
        Path((_bucket, id)): Path<(String, String)>,
    ) -> Result<Vec<u8>, StatusCode> {
        if state.failures_to_inject.load(Ordering::SeqCst) > 0 {
            state.failures_to_inject.fetch_sub(1, Ordering::SeqCst);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        state
            .objects
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StatusCode::NOT_FOUND)
    }

    async fn store_object(
        State(state): State<StoreState>,
        Path((_bucket, id)): Path<(String, String)>,
        body: axum::body::Bytes,
    ) -> StatusCode {
        state.objects.lock().unwrap().insert(id, body.to_vec());
        StatusCode::OK
    }

    fn cache_for(endpoint: String) -> ObjectStoreCache {
        ObjectStoreCache::new(ObjectStoreConfig {
            endpoint,
            retry_backoff: Duration::from_millis(10),
            ..ObjectStoreConfig::default()
        })
    }

    fn key() -> CacheKey {
        CacheKey::new("http://example.com/page", RenderFormat::Pdf, "p8.5x11l0b1s1")
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let state = StoreState::default();
        let endpoint = start_store(state).await;
        let cache = cache_for(endpoint);
        let ttl = Duration::from_secs(60);

        let artifact = Artifact::new(RenderFormat::Pdf, b"%PDF-1.7".to_vec());
        cache.set(&key(), &artifact, ttl).await.unwrap();

        let loaded = cache.get(&key(), ttl).await.unwrap().unwrap();
        assert_eq!(loaded.bytes, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn missing_object_is_a_miss() {
        let endpoint = start_store(StoreState::default()).await;
        let cache = cache_for(endpoint);
        assert!(cache
            .get(&key(), Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn transient_server_errors_are_retried() {
        let state = StoreState::default();
        state.failures_to_inject.store(2, Ordering::SeqCst);
        let endpoint = start_store(state.clone()).await;
        let cache = cache_for(endpoint);
        let ttl = Duration::from_secs(60);

        let artifact = Artifact::new(RenderFormat::Pdf, b"%PDF-retry".to_vec());
        cache.set(&key(), &artifact, ttl).await.unwrap();

        // Two injected 500s, then the stored object comes back.
        let loaded = cache.get(&key(), ttl).await.unwrap().unwrap();
        assert_eq!(loaded.bytes, b"%PDF-retry");
    }
}
