//! Service configuration: clap flags with environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use prerender_cache::ObjectStoreConfig;
use prerender_pool::{InterceptPolicy, SessionConfig};

use crate::breaker::BreakerConfig;

/// Prerender gateway: render URLs to HTML, MHTML, PDF, PNG or JPEG through
/// a headless Chrome instance.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// HTTP bind host
    #[arg(long, env = "PRERENDER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP bind port
    #[arg(long, env = "PRERENDER_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Per-render deadline in seconds
    #[arg(long, env = "PRERENDER_TIMEOUT", default_value_t = 30)]
    pub render_timeout: u64,

    /// Readiness poll interval in milliseconds
    #[arg(long, env = "PRERENDER_CHECK_INTERVAL_MS", default_value_t = 200)]
    pub check_interval_ms: u64,

    /// Quiet-network settle window in milliseconds, used when the page never
    /// sets an explicit ready signal
    #[arg(long, env = "PRERENDER_SETTLE_WINDOW_MS", default_value_t = 500)]
    pub settle_window_ms: u64,

    /// Page pool capacity; defaults to 2x the CPU count
    #[arg(long, env = "CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Renders served by one page before it is recycled
    #[arg(long, env = "MAX_ITERATIONS", default_value_t = 200)]
    pub max_iterations: u32,

    /// Chrome remote debugging host
    #[arg(long, env = "CHROME_HOST", default_value = "localhost")]
    pub cdp_host: String,

    /// Chrome remote debugging port
    #[arg(long, env = "CHROME_PORT", default_value_t = 9222)]
    pub cdp_port: u16,

    /// User agent override applied to every page
    #[arg(long, env = "USER_AGENT")]
    pub user_agent: Option<String>,

    /// Drop web font requests during rendering
    #[arg(long, env = "BLOCK_FONTS", default_value_t = true, action = clap::ArgAction::Set)]
    pub block_fonts: bool,

    /// Comma-separated domain suffixes allowed to render; empty allows all
    #[arg(long, env = "ALLOWED_DOMAINS", default_value = "")]
    pub allowed_domains: String,

    /// Cache backend
    #[arg(long, env = "CACHE_BACKEND", value_enum, default_value = "none")]
    pub cache_backend: CacheBackendKind,

    /// Cache entry lifetime in seconds; zero disables expiry
    #[arg(long, env = "CACHE_LIVE_TIME", default_value_t = 3600)]
    pub cache_ttl: u64,

    /// Root directory for the disk cache
    #[arg(long, env = "CACHE_ROOT_DIR", default_value = "/tmp/prerender")]
    pub cache_root: PathBuf,

    /// Object store endpoint, e.g. http://object-store:9000
    #[arg(long, env = "OBJECT_STORE_ENDPOINT", default_value = "")]
    pub object_store_endpoint: String,

    /// Object store bucket
    #[arg(long, env = "OBJECT_STORE_BUCKET", default_value = "prerender")]
    pub object_store_bucket: String,

    /// Bearer token for the object store
    #[arg(long, env = "OBJECT_STORE_TOKEN")]
    pub object_store_token: Option<String>,

    /// Enable the browser circuit breaker
    #[arg(long, env = "BREAKER_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub breaker_enabled: bool,

    /// Consecutive failures before the circuit opens
    #[arg(long, env = "BREAKER_FAIL_MAX", default_value_t = 5)]
    pub breaker_fail_max: u32,

    /// Seconds the circuit stays open before probing
    #[arg(long, env = "BREAKER_RESET_TIMEOUT", default_value_t = 60)]
    pub breaker_reset_timeout: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CacheBackendKind {
    None,
    Disk,
    ObjectStore,
}

/// Resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub render_timeout: Duration,
    pub check_interval: Duration,
    pub settle_window: Duration,
    pub concurrency: usize,
    pub max_iterations: u32,
    pub cdp_host: String,
    pub cdp_port: u16,
    pub user_agent: Option<String>,
    pub block_fonts: bool,
    pub allowed_domains: Vec<String>,
    pub cache_backend: CacheBackendKind,
    pub cache_ttl: Duration,
    pub cache_root: PathBuf,
    pub object_store: ObjectStoreConfig,
    pub breaker: BreakerConfig,
}

impl Cli {
    pub fn into_config(self) -> Config {
        let concurrency = self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(4)
        });

        let allowed_domains = self
            .allowed_domains
            .split(',')
            .map(str::trim)
            .filter(|domain| !domain.is_empty())
            .map(str::to_string)
            .collect();

        Config {
            host: self.host,
            port: self.port,
            render_timeout: Duration::from_secs(self.render_timeout),
            check_interval: Duration::from_millis(self.check_interval_ms),
            settle_window: Duration::from_millis(self.settle_window_ms),
            concurrency: concurrency.max(1),
            max_iterations: self.max_iterations.max(1),
            cdp_host: self.cdp_host,
            cdp_port: self.cdp_port,
            user_agent: self.user_agent,
            block_fonts: self.block_fonts,
            allowed_domains,
            cache_backend: self.cache_backend,
            cache_ttl: Duration::from_secs(self.cache_ttl),
            cache_root: self.cache_root,
            object_store: ObjectStoreConfig {
                endpoint: self.object_store_endpoint,
                bucket: self.object_store_bucket,
                auth_token: self.object_store_token,
                ..ObjectStoreConfig::default()
            },
            breaker: BreakerConfig {
                enabled: self.breaker_enabled,
                fail_max: self.breaker_fail_max.max(1),
                reset_timeout: Duration::from_secs(self.breaker_reset_timeout),
            },
        }
    }
}

impl Config {
    pub fn intercept_policy(&self) -> InterceptPolicy {
        InterceptPolicy {
            allowed_domains: self.allowed_domains.clone(),
            block_fonts: self.block_fonts,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            user_agent: self.user_agent.clone(),
            max_iterations: self.max_iterations,
            check_interval: self.check_interval,
            settle_window: self.settle_window,
            policy: self.intercept_policy(),
            ..SessionConfig::default()
        }
    }

    pub fn upstream_key(&self) -> String {
        format!("{}:{}", self.cdp_host, self.cdp_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(args: &[&str]) -> Config {
        let mut argv = vec!["prerender"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().into_config()
    }

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = config_from(&[]);
        assert_eq!(config.port, 8000);
        assert_eq!(config.render_timeout, Duration::from_secs(30));
        assert_eq!(config.check_interval, Duration::from_millis(200));
        assert_eq!(config.max_iterations, 200);
        assert_eq!(config.cdp_port, 9222);
        assert!(config.block_fonts);
        assert!(config.allowed_domains.is_empty());
        assert_eq!(config.cache_backend, CacheBackendKind::None);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert!(config.breaker.enabled);
        assert_eq!(config.breaker.fail_max, 5);
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(60));
        assert!(config.concurrency >= 1);
    }

    #[test]
    fn allowed_domains_parse_as_a_trimmed_list() {
        let config = config_from(&["--allowed-domains", "a.example, b.example,,c.example "]);
        assert_eq!(config.allowed_domains, ["a.example", "b.example", "c.example"]);
    }

    #[test]
    fn session_config_carries_the_policy() {
        let config = config_from(&["--allowed-domains", "site.example", "--user-agent", "bot/1"]);
        let session = config.session_config();
        assert_eq!(session.user_agent.as_deref(), Some("bot/1"));
        assert_eq!(session.policy.allowed_domains, ["site.example"]);
        assert!(session.policy.block_fonts);
    }
}
