//! Browser-level CDP peer: target lifecycle and version probing.
//!
//! The browser exposes an HTTP discovery endpoint (`/json/version`) whose
//! `webSocketDebuggerUrl` leads to the browser-scope websocket. Page targets
//! created there are each driven over their own `/devtools/page/{id}` socket.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;

use crate::error::TransportError;
use crate::transport::CdpConnection;

/// Timeout for browser-scope control calls; these are local and fast.
const CONTROL_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct BrowserVersion {
    pub product: String,
    pub protocol_version: String,
    pub user_agent: String,
}

/// Client for one running browser instance.
pub struct BrowserClient {
    host: String,
    port: u16,
    conn: CdpConnection,
}

impl BrowserClient {
    /// Discover the browser websocket via `GET /json/version` and attach.
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let discovery_url = format!("http://{host}:{port}/json/version");
        let info: Value = reqwest::Client::new()
            .get(&discovery_url)
            .send()
            .await
            .map_err(|err| TransportError::Endpoint(err.to_string()))?
            .json()
            .await
            .map_err(|err| TransportError::Endpoint(err.to_string()))?;

        let ws_url = info
            .get("webSocketDebuggerUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TransportError::Protocol("version payload missing webSocketDebuggerUrl".into())
            })?;

        let conn = CdpConnection::connect(ws_url).await?;
        info!(
            target: "cdp-browser",
            product = info.get("Browser").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "attached to browser endpoint"
        );

        Ok(Self {
            host: host.to_string(),
            port,
            conn,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.conn.is_alive()
    }

    pub async fn version(&self) -> Result<BrowserVersion, TransportError> {
        let result = self
            .conn
            .call("Browser.getVersion", json!({}), CONTROL_CALL_TIMEOUT)
            .await?;
        Ok(BrowserVersion {
            product: string_field(&result, "product"),
            protocol_version: string_field(&result, "protocolVersion"),
            user_agent: string_field(&result, "userAgent"),
        })
    }

    /// Open a fresh page target on `about:blank` and return its id.
    pub async fn create_target(&self) -> Result<String, TransportError> {
        let result = self
            .conn
            .call(
                "Target.createTarget",
                json!({ "url": "about:blank" }),
                CONTROL_CALL_TIMEOUT,
            )
            .await?;
        result
            .get("targetId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::Protocol("createTarget missing targetId".into()))
    }

    pub async fn close_target(&self, target_id: &str) -> Result<(), TransportError> {
        self.conn
            .call(
                "Target.closeTarget",
                json!({ "targetId": target_id }),
                CONTROL_CALL_TIMEOUT,
            )
            .await
            .map(|_| ())
    }

    /// Websocket URL for driving one page target.
    pub fn page_ws_url(&self, target_id: &str) -> String {
        format!("ws://{}:{}/devtools/page/{target_id}", self.host, self.port)
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
