//! Shared HTTP state and process health flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use prerender_pool::PageSession;

use crate::coordinator::RenderCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RenderCoordinator<PageSession>>,
    pub health: Arc<ServeHealth>,
    pub browser_product: String,
    pub cache_backend: &'static str,
    pub started_at: Instant,
}

#[derive(Default)]
pub struct ServeHealth {
    live: AtomicBool,
    ready: AtomicBool,
    last_error: Mutex<Option<String>>,
}

pub struct HealthSnapshot {
    pub live: bool,
    pub ready: bool,
    pub last_error: Option<String>,
}

impl ServeHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_live(&self) {
        self.live.store(true, Ordering::SeqCst);
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        *self.last_error.lock() = None;
    }

    pub fn mark_unready(&self, error: impl Into<String>) {
        self.ready.store(false, Ordering::SeqCst);
        *self.last_error.lock() = Some(error.into());
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            live: self.live.load(Ordering::SeqCst),
            ready: self.ready.load(Ordering::SeqCst),
            last_error: self.last_error.lock().clone(),
        }
    }
}
