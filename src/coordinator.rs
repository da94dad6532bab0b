//! Render coordinator: the single pipeline every request flows through.
//!
//! cache lookup → breaker gate → pool acquire → session render → cache store.
//! The coordinator is the only component that reads the clock for deadlines;
//! sessions receive an absolute deadline and budget each CDP call from it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use prerender_cache::ArtifactCache;
use prerender_core_types::{Artifact, RenderError, RenderRequest};
use prerender_pool::{InterceptPolicy, PagePool, RenderPage};

use crate::breaker::CircuitBreaker;
use crate::metrics;

/// Where a served artifact came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RenderSource {
    Cache,
    Browser,
}

pub struct RenderCoordinator<S: RenderPage> {
    pool: Arc<PagePool<S>>,
    cache: ArtifactCache,
    breaker: Arc<CircuitBreaker>,
    policy: InterceptPolicy,
    render_timeout: Duration,
}

impl<S: RenderPage> RenderCoordinator<S> {
    pub fn new(
        pool: Arc<PagePool<S>>,
        cache: ArtifactCache,
        breaker: Arc<CircuitBreaker>,
        policy: InterceptPolicy,
        render_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            breaker,
            policy,
            render_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<PagePool<S>> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Serve one render request. `skip_cache_read` still stores the result,
    /// it only bypasses the lookup (the front door sets it for POST).
    pub async fn render(
        &self,
        request: &RenderRequest,
        skip_cache_read: bool,
    ) -> Result<(Artifact, RenderSource), RenderError> {
        metrics::record_render_started();

        // Domain gate for the primary URL: rejected before any cache or
        // browser work happens.
        let host = request
            .url
            .host_str()
            .ok_or_else(|| RenderError::policy().with_hint("url has no host"))?;
        if !self.policy.allowed_domains.is_empty() && !self.policy.domain_allowed(host) {
            metrics::record_render_failure(prerender_core_types::RenderErrorKind::Policy);
            return Err(RenderError::policy().with_hint(format!("{host} not in allow-list")));
        }

        let key = request.cache_key();
        if !skip_cache_read {
            if let Some(artifact) = self.cache.get(&key).await {
                metrics::record_cache_hit();
                return Ok((artifact, RenderSource::Cache));
            }
            metrics::record_cache_miss();
        }

        if !self.breaker.admit() {
            metrics::record_breaker_rejection();
            return Err(RenderError::upstream_open());
        }

        let deadline = Instant::now() + self.render_timeout;
        let mut lease = match self.pool.acquire(deadline).await {
            Ok(lease) => lease,
            Err(err) => {
                // Failing to even open a page is an upstream signal when the
                // error class says so (e.g. browser connect refused).
                if err.counts_against_upstream() {
                    self.breaker.record_failure();
                }
                metrics::record_render_failure(err.kind);
                return Err(err);
            }
        };

        match lease.render(request, deadline).await {
            Ok(artifact) => {
                lease.release(true);
                self.breaker.record_success();
                self.cache.set(&key, &artifact).await;
                metrics::record_render_success();
                Ok((artifact, RenderSource::Browser))
            }
            Err(err) => {
                let keep = !err.condemns_session();
                debug!(target: "coordinator", %err, keep_session = keep, "render failed");
                lease.release(keep);
                if err.counts_against_upstream() {
                    self.breaker.record_failure();
                } else {
                    // The browser held up its end; only the page content or
                    // the request itself was at fault.
                    self.breaker.record_success();
                }
                metrics::record_render_failure(err.kind);
                if err.kind == prerender_core_types::RenderErrorKind::Timeout {
                    warn!(target: "coordinator", url = %request.url, "render deadline exceeded");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::breaker::BreakerConfig;
    use prerender_core_types::{NavigateFault, RenderErrorKind, RenderFormat, Url};
    use prerender_pool::{PageFactory, PooledPage};

    /// Scripted outcomes, shared by every session the factory builds.
    #[derive(Clone)]
    struct Script {
        outcomes: Arc<Mutex<Vec<Result<(), RenderErrorKind>>>>,
        created: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        renders: Arc<AtomicUsize>,
    }

    impl Script {
        fn new(outcomes: Vec<Result<(), RenderErrorKind>>) -> Self {
            Self {
                outcomes: Arc::new(Mutex::new(outcomes)),
                created: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicUsize::new(0)),
                renders: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn next_outcome(&self) -> Result<(), RenderErrorKind> {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(())
            } else {
                outcomes.remove(0)
            }
        }
    }

    struct StubSession {
        script: Script,
        condemned: bool,
    }

    #[async_trait]
    impl PooledPage for StubSession {
        fn usable(&self) -> bool {
            !self.condemned
        }

        async fn close(&mut self) {
            self.script.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RenderPage for StubSession {
        async fn render(
            &mut self,
            request: &RenderRequest,
            _deadline: Instant,
        ) -> Result<Artifact, RenderError> {
            self.script.renders.fetch_add(1, Ordering::SeqCst);
            match self.script.next_outcome() {
                Ok(()) => Ok(Artifact::new(
                    request.format,
                    format!("<html>{}</html>", request.url).into_bytes(),
                )),
                Err(kind) => {
                    let err = RenderError::new(kind);
                    if err.condemns_session() {
                        self.condemned = true;
                    }
                    Err(err)
                }
            }
        }
    }

    fn factory_for(script: &Script) -> PageFactory<StubSession> {
        let script = script.clone();
        Arc::new(move || {
            let script = script.clone();
            Box::pin(async move {
                script.created.fetch_add(1, Ordering::SeqCst);
                Ok(StubSession {
                    script,
                    condemned: false,
                })
            })
        })
    }

    fn coordinator(
        script: &Script,
        breaker_cfg: BreakerConfig,
        policy: InterceptPolicy,
    ) -> RenderCoordinator<StubSession> {
        RenderCoordinator::new(
            PagePool::new(2, factory_for(script)),
            ArtifactCache::disabled(),
            Arc::new(CircuitBreaker::new(breaker_cfg)),
            policy,
            Duration::from_secs(5),
        )
    }

    fn request(raw: &str) -> RenderRequest {
        RenderRequest::new(Url::parse(raw).unwrap(), RenderFormat::Html)
    }

    #[tokio::test]
    async fn successful_render_comes_from_the_browser() {
        let script = Script::new(vec![]);
        let coordinator = coordinator(&script, BreakerConfig::default(), InterceptPolicy::default());

        let (artifact, source) = coordinator
            .render(&request("http://example.com/"), false)
            .await
            .unwrap();
        assert_eq!(source, RenderSource::Browser);
        assert!(!artifact.is_empty());
        assert_eq!(coordinator.pool().snapshot().idle, 1);
    }

    #[tokio::test]
    async fn disallowed_domain_is_rejected_before_any_session_work() {
        let script = Script::new(vec![]);
        let policy = InterceptPolicy {
            allowed_domains: vec!["allowed.example".to_string()],
            block_fonts: false,
        };
        let coordinator = coordinator(&script, BreakerConfig::default(), policy);

        let err = coordinator
            .render(&request("http://blocked.example/"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RenderErrorKind::Policy);
        assert_eq!(script.created.load(Ordering::SeqCst), 0);
        assert_eq!(script.renders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn allowed_domain_suffix_passes_the_gate() {
        let script = Script::new(vec![]);
        let policy = InterceptPolicy {
            allowed_domains: vec!["allowed.example".to_string()],
            block_fonts: false,
        };
        let coordinator = coordinator(&script, BreakerConfig::default(), policy);

        coordinator
            .render(&request("http://www.allowed.example/"), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn timeout_destroys_the_session_and_counts_against_upstream() {
        let script = Script::new(vec![Err(RenderErrorKind::Timeout)]);
        let coordinator = coordinator(&script, BreakerConfig::default(), InterceptPolicy::default());

        let err = coordinator
            .render(&request("http://slow.example/"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RenderErrorKind::Timeout);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(script.closed.load(Ordering::SeqCst), 1);
        let snap = coordinator.pool().snapshot();
        assert_eq!(snap.in_use, 0);
        assert_eq!(snap.idle, 0);
    }

    #[tokio::test]
    async fn extract_failure_keeps_the_session() {
        let script = Script::new(vec![Err(RenderErrorKind::Extract)]);
        let coordinator = coordinator(&script, BreakerConfig::default(), InterceptPolicy::default());

        let err = coordinator
            .render(&request("http://odd.example/"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RenderErrorKind::Extract);

        assert_eq!(script.closed.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.pool().snapshot().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_consecutive_upstream_failures() {
        let outcomes = vec![
            Err(RenderErrorKind::Navigate {
                fault: NavigateFault::Upstream,
            });
            5
        ];
        let script = Script::new(outcomes);
        let coordinator = coordinator(&script, BreakerConfig::default(), InterceptPolicy::default());

        for _ in 0..5 {
            let err = coordinator
                .render(&request("http://down.example/"), false)
                .await
                .unwrap_err();
            assert!(matches!(err.kind, RenderErrorKind::Navigate { .. }));
        }

        // Sixth request is rejected without touching the pool.
        let renders_before = script.renders.load(Ordering::SeqCst);
        let err = coordinator
            .render(&request("http://down.example/"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RenderErrorKind::UpstreamOpen);
        assert_eq!(script.renders.load(Ordering::SeqCst), renders_before);

        // After the reset window a probe is admitted and succeeds.
        tokio::time::advance(Duration::from_secs(61)).await;
        let (_, source) = coordinator
            .render(&request("http://down.example/"), false)
            .await
            .unwrap();
        assert_eq!(source, RenderSource::Browser);
    }

    #[tokio::test]
    async fn cached_artifact_short_circuits_the_pool() {
        let script = Script::new(vec![]);
        let dir = tempfile::tempdir().unwrap();
        let disk = prerender_cache::DiskCache::create(dir.path()).await.unwrap();
        let cache = ArtifactCache::new(Arc::new(disk), Duration::from_secs(60));
        let coordinator = RenderCoordinator::new(
            PagePool::new(2, factory_for(&script)),
            cache,
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            InterceptPolicy::default(),
            Duration::from_secs(5),
        );

        let req = request("http://cacheable.example/");
        let (first, source) = coordinator.render(&req, false).await.unwrap();
        assert_eq!(source, RenderSource::Browser);

        let (second, source) = coordinator.render(&req, false).await.unwrap();
        assert_eq!(source, RenderSource::Cache);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(script.renders.load(Ordering::SeqCst), 1);

        // POST semantics: skip the read but refresh the entry.
        let (_, source) = coordinator.render(&req, true).await.unwrap();
        assert_eq!(source, RenderSource::Browser);
        assert_eq!(script.renders.load(Ordering::SeqCst), 2);
    }
}
