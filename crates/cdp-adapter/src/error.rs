use thiserror::Error;

/// Failures raised by the CDP transport and browser endpoint client.
///
/// `Command` is the browser answering a call with an `error` frame; every
/// other variant means the connection itself is unusable.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("browser endpoint unreachable: {0}")]
    Endpoint(String),
    #[error("cdp socket lost: {0}")]
    Socket(String),
    #[error("cdp connection closed")]
    Closed,
    #[error("cdp call {method} timed out")]
    CallTimeout { method: String },
    #[error("cdp error {code}: {message}")]
    Command { code: i64, message: String },
    #[error("malformed cdp payload: {0}")]
    Protocol(String),
}

impl TransportError {
    /// True when the connection is gone and the owning session must be
    /// discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Connect(_)
                | TransportError::Endpoint(_)
                | TransportError::Socket(_)
                | TransportError::Closed
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::CallTimeout { .. })
    }
}
