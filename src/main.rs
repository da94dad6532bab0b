use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prerender::config::{CacheBackendKind, Cli};
use prerender::server::{build_router, AppState, ServeHealth};
use prerender::{BreakerRegistry, RenderCoordinator};
use prerender_cache::{ArtifactCache, CacheBackend, DiskCache, NoopCache, ObjectStoreCache};
use prerender_cdp::BrowserClient;
use prerender_pool::{PageFactory, PagePool, PageSession};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let config = cli.into_config();
    info!(
        "starting prerender gateway v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.host,
        config.port
    );

    // The browser must be reachable before the gateway accepts traffic.
    let browser = match BrowserClient::connect(&config.cdp_host, config.cdp_port).await {
        Ok(browser) => Arc::new(browser),
        Err(err) => {
            error!(
                %err,
                host = %config.cdp_host,
                port = config.cdp_port,
                "cannot reach the browser debugging endpoint; start Chrome first"
            );
            std::process::exit(1);
        }
    };
    let version = browser
        .version()
        .await
        .context("browser version probe failed")?;
    info!(product = %version.product, protocol = %version.protocol_version, "browser attached");

    let cache = build_cache(&config).await?;
    info!(backend = cache.backend_name(), "artifact cache ready");

    let session_cfg = config.session_config();
    let factory_browser = Arc::clone(&browser);
    let factory: PageFactory<PageSession> = Arc::new(move || {
        let browser = Arc::clone(&factory_browser);
        let cfg = session_cfg.clone();
        Box::pin(async move {
            prerender::metrics::record_session_opened();
            PageSession::open(browser, cfg).await
        })
    });
    let pool = PagePool::new(config.concurrency, factory);
    info!(capacity = config.concurrency, "page pool ready");

    let breakers = BreakerRegistry::new(config.breaker);
    let breaker = breakers.for_upstream(&config.upstream_key());

    let coordinator = Arc::new(RenderCoordinator::new(
        pool,
        cache.clone(),
        breaker,
        config.intercept_policy(),
        config.render_timeout,
    ));

    let health = Arc::new(ServeHealth::new());
    health.mark_live();
    health.mark_ready();

    let state = AppState {
        coordinator,
        health,
        browser_product: version.product,
        cache_backend: cache.backend_name(),
        started_at: std::time::Instant::now(),
    };

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    info!("shutdown complete");
    Ok(())
}

fn init_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

async fn build_cache(config: &prerender::Config) -> Result<ArtifactCache> {
    let backend: Arc<dyn CacheBackend> = match config.cache_backend {
        CacheBackendKind::None => Arc::new(NoopCache),
        CacheBackendKind::Disk => Arc::new(
            DiskCache::create(&config.cache_root)
                .await
                .with_context(|| {
                    format!("cannot open cache root {}", config.cache_root.display())
                })?,
        ),
        CacheBackendKind::ObjectStore => {
            anyhow::ensure!(
                !config.object_store.endpoint.is_empty(),
                "object-store cache selected but no endpoint configured"
            );
            Arc::new(ObjectStoreCache::new(config.object_store.clone()))
        }
    };
    Ok(ArtifactCache::new(backend, config.cache_ttl))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to install shutdown handler");
    } else {
        info!("shutdown signal received");
    }
}
