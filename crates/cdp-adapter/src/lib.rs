//! Chrome DevTools Protocol plumbing for the prerender gateway.
//!
//! Two layers live here: [`transport::CdpConnection`], a multiplexed
//! request/response + event stream over a single websocket, and
//! [`browser::BrowserClient`], the browser-level peer used to create and
//! close page targets. Page-level behavior (navigation, extraction) belongs
//! to the pool crate; this one only moves frames.

pub mod browser;
pub mod error;
pub mod transport;

pub use browser::{BrowserClient, BrowserVersion};
pub use error::TransportError;
pub use transport::{CdpConnection, CdpEvent, EventStream};
