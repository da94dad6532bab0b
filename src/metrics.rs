//! Process-wide render counters, exposed on the status endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use prerender_core_types::RenderErrorKind;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub renders_started: u64,
    pub renders_succeeded: u64,
    pub renders_failed: u64,
    pub render_timeouts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub breaker_rejections: u64,
    pub sessions_opened: u64,
}

static RENDERS_STARTED: AtomicU64 = AtomicU64::new(0);
static RENDERS_SUCCEEDED: AtomicU64 = AtomicU64::new(0);
static RENDERS_FAILED: AtomicU64 = AtomicU64::new(0);
static RENDER_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static CACHE_MISSES: AtomicU64 = AtomicU64::new(0);
static BREAKER_REJECTIONS: AtomicU64 = AtomicU64::new(0);
static SESSIONS_OPENED: AtomicU64 = AtomicU64::new(0);

pub fn record_render_started() {
    RENDERS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_render_success() {
    RENDERS_SUCCEEDED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_render_failure(kind: RenderErrorKind) {
    RENDERS_FAILED.fetch_add(1, Ordering::Relaxed);
    if kind == RenderErrorKind::Timeout {
        RENDER_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_cache_hit() {
    CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cache_miss() {
    CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_breaker_rejection() {
    BREAKER_REJECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_opened() {
    SESSIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        renders_started: RENDERS_STARTED.load(Ordering::Relaxed),
        renders_succeeded: RENDERS_SUCCEEDED.load(Ordering::Relaxed),
        renders_failed: RENDERS_FAILED.load(Ordering::Relaxed),
        render_timeouts: RENDER_TIMEOUTS.load(Ordering::Relaxed),
        cache_hits: CACHE_HITS.load(Ordering::Relaxed),
        cache_misses: CACHE_MISSES.load(Ordering::Relaxed),
        breaker_rejections: BREAKER_REJECTIONS.load(Ordering::Relaxed),
        sessions_opened: SESSIONS_OPENED.load(Ordering::Relaxed),
    }
}
