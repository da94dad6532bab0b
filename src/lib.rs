//! Prerender gateway: an HTTP service that renders URLs to HTML, MHTML, PDF,
//! PNG or JPEG artifacts by driving headless Chrome over the DevTools
//! protocol.
//!
//! The rendering core lives in the workspace crates (`prerender-cdp`,
//! `prerender-pool`, `prerender-cache`); this crate wires them together
//! behind an axum front door and a render coordinator.

pub mod breaker;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod metrics;
pub mod server;

pub use breaker::{BreakerConfig, BreakerPhase, BreakerRegistry, CircuitBreaker};
pub use config::{CacheBackendKind, Cli, Config};
pub use coordinator::{RenderCoordinator, RenderSource};
