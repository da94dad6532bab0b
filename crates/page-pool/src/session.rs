//! One browser page and the render state machine that drives it.
//!
//! A session walks configure → navigate → intercept/await-readiness →
//! extract → reset for every render, against an absolute deadline. Event
//! subscriptions live only for the duration of one render; session-scoped
//! configuration (enabled domains, user agent, viewport) is applied once and
//! re-applied only when it changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use url::Url;

use prerender_cdp::{BrowserClient, CdpConnection, CdpEvent, EventStream, TransportError};
use prerender_core_types::{
    Artifact, NavigateFault, RenderError, RenderFormat, RenderRequest, Viewport,
};

use crate::policy::{Decision, InterceptPolicy, InterceptedRequest};
use crate::pool::{PooledPage, RenderPage};

/// Ceiling for ordinary CDP calls; the remaining render deadline always wins
/// when it is shorter.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Extraction calls move whole documents and screenshots.
const EXTRACT_CALL_TIMEOUT: Duration = Duration::from_secs(20);
/// Post-render cleanup runs outside any render deadline.
const RESET_CALL_TIMEOUT: Duration = Duration::from_secs(5);

const READY_PROBE: &str = "window.prerenderReady === true ? 'ready' : \
                           (window.prerenderReady === false ? 'blocked' : 'unset')";

/// Session-scoped settings shared by every render on one page.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub user_agent: Option<String>,
    /// Successful renders served before the session is recycled.
    pub max_iterations: u32,
    /// Readiness poll period.
    pub check_interval: Duration,
    /// Quiet-network window required when the page never sets
    /// `window.prerenderReady`.
    pub settle_window: Duration,
    /// How long the main frame may take to start loading after navigate.
    pub nav_start_timeout: Duration,
    pub policy: InterceptPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            max_iterations: 200,
            check_interval: Duration::from_millis(200),
            settle_window: Duration::from_millis(500),
            nav_start_timeout: Duration::from_secs(2),
            policy: InterceptPolicy::default(),
        }
    }
}

enum Readiness {
    Ready,
    Blocked,
    Unset,
}

/// One CDP page target, alive across many renders until recycled.
pub struct PageSession {
    conn: CdpConnection,
    target_id: String,
    browser: Option<Arc<BrowserClient>>,
    cfg: SessionConfig,
    iterations: u32,
    condemned: bool,
    closed: bool,
    base_configured: bool,
    applied_viewport: Option<Viewport>,
    intercepting: bool,
}

impl PageSession {
    /// Open a fresh target on the browser and attach to it.
    pub async fn open(
        browser: Arc<BrowserClient>,
        cfg: SessionConfig,
    ) -> Result<Self, RenderError> {
        let target_id = browser
            .create_target()
            .await
            .map_err(|err| RenderError::transport().with_hint(err.to_string()))?;
        let conn = CdpConnection::connect(&browser.page_ws_url(&target_id))
            .await
            .map_err(|err| RenderError::transport().with_hint(err.to_string()))?;
        info!(target: "page-session", %target_id, "page session opened");

        let mut session = Self::attach(conn, target_id, cfg);
        session.browser = Some(browser);
        Ok(session)
    }

    /// Attach to an already-established page connection. Used by [`open`] and
    /// by tests that speak CDP from an in-process peer.
    pub fn attach(conn: CdpConnection, target_id: String, cfg: SessionConfig) -> Self {
        Self {
            conn,
            target_id,
            browser: None,
            cfg,
            iterations: 0,
            condemned: false,
            closed: false,
            base_configured: false,
            applied_viewport: None,
            intercepting: false,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    async fn drive(
        &mut self,
        request: &RenderRequest,
        deadline: Instant,
    ) -> Result<Artifact, RenderError> {
        self.configure(request, deadline).await?;

        // Subscriptions must exist before navigate so no event is missed.
        let mut frame_started = self.subscribe("Page.frameStartedLoading").await?;
        let mut load_events = self.subscribe("Page.loadEventFired").await?;
        let mut network_events = self.subscribe("Network.*").await?;
        let mut paused_requests = if self.intercepting {
            Some(self.subscribe("Fetch.requestPaused").await?)
        } else {
            None
        };

        let main_frame = self.navigate(request, deadline, &mut frame_started).await?;
        self.await_ready(
            request,
            deadline,
            main_frame.as_deref(),
            &mut load_events,
            &mut network_events,
            &mut paused_requests,
        )
        .await?;
        self.extract(request, deadline).await
    }

    async fn configure(
        &mut self,
        request: &RenderRequest,
        deadline: Instant,
    ) -> Result<(), RenderError> {
        if !self.base_configured {
            self.session_call("Page.enable", json!({}), deadline).await?;
            self.session_call("Runtime.enable", json!({}), deadline).await?;
            self.session_call("Network.enable", json!({}), deadline).await?;
            if let Some(agent) = self.cfg.user_agent.clone() {
                self.session_call(
                    "Network.setUserAgentOverride",
                    json!({ "userAgent": agent }),
                    deadline,
                )
                .await?;
            }
            self.base_configured = true;
        }

        let wanted = request
            .options
            .viewport
            .or_else(|| request.format.is_image().then(Viewport::default));
        if let Some(vp) = wanted {
            if self.applied_viewport != Some(vp) {
                self.session_call(
                    "Emulation.setDeviceMetricsOverride",
                    json!({
                        "width": vp.width,
                        "height": vp.height,
                        "deviceScaleFactor": vp.device_scale_factor,
                        "mobile": vp.mobile,
                    }),
                    deadline,
                )
                .await?;
                self.applied_viewport = Some(vp);
            }
        }

        // Interception is re-armed per render and torn down in reset so a
        // paused request can never outlive its consumer.
        if self.cfg.policy.active() {
            self.session_call(
                "Fetch.enable",
                json!({ "patterns": [{ "urlPattern": "*", "requestStage": "Request" }] }),
                deadline,
            )
            .await?;
            self.intercepting = true;
        }

        Ok(())
    }

    async fn navigate(
        &mut self,
        request: &RenderRequest,
        deadline: Instant,
        frame_started: &mut EventStream,
    ) -> Result<Option<String>, RenderError> {
        let budget = remaining(deadline)?.min(DEFAULT_CALL_TIMEOUT);
        let nav = match self
            .conn
            .call("Page.navigate", json!({ "url": request.url.as_str() }), budget)
            .await
        {
            Ok(value) => value,
            Err(TransportError::Command { message, .. }) => {
                // The browser refused the URL outright.
                return Err(RenderError::navigate(NavigateFault::Client).with_hint(message));
            }
            Err(err) => return Err(self.map_transport(err, "Page.navigate")),
        };

        if let Some(error_text) = nav
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
        {
            return Err(
                RenderError::navigate(classify_net_error(error_text)).with_hint(error_text)
            );
        }

        let main_frame = nav.get("frameId").and_then(Value::as_str).map(str::to_string);

        let bound = deadline.min(Instant::now() + self.cfg.nav_start_timeout);
        loop {
            match tokio::time::timeout_at(bound, frame_started.next()).await {
                Ok(Some(event)) => {
                    let frame_ok = main_frame.as_deref().map_or(true, |id| {
                        event.params.get("frameId").and_then(Value::as_str) == Some(id)
                    });
                    if frame_ok {
                        return Ok(main_frame);
                    }
                }
                Ok(None) => return Err(self.stream_lost()),
                Err(_) => {
                    return if Instant::now() >= deadline {
                        self.condemned = true;
                        Err(RenderError::timeout().with_hint("waiting for navigation start"))
                    } else {
                        Err(RenderError::navigate(NavigateFault::Upstream)
                            .with_hint("main frame never started loading"))
                    };
                }
            }
        }
    }

    async fn await_ready(
        &mut self,
        request: &RenderRequest,
        deadline: Instant,
        main_frame: Option<&str>,
        load_events: &mut EventStream,
        network_events: &mut EventStream,
        paused_requests: &mut Option<EventStream>,
    ) -> Result<(), RenderError> {
        let primary_host = request.url.host_str().unwrap_or_default().to_string();
        let mut load_fired = false;
        let mut last_activity = Instant::now();
        let mut poll = tokio::time::interval(self.cfg.check_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    self.condemned = true;
                    return Err(RenderError::timeout().with_hint("page never became ready"));
                }
                event = load_events.next() => match event {
                    Some(_) => load_fired = true,
                    None => return Err(self.stream_lost()),
                },
                event = network_events.next() => match event {
                    Some(_) => last_activity = Instant::now(),
                    None => return Err(self.stream_lost()),
                },
                event = next_paused(paused_requests) => match event {
                    Some(paused) => {
                        self.settle_paused_request(paused, &primary_host, main_frame, deadline)
                            .await?;
                    }
                    None => return Err(self.stream_lost()),
                },
                _ = poll.tick() => {
                    match self.probe_ready(deadline).await? {
                        Readiness::Ready => return Ok(()),
                        Readiness::Blocked => {}
                        Readiness::Unset => {
                            if load_fired && last_activity.elapsed() >= self.cfg.settle_window {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Evaluate the readiness probe in the page. Evaluation errors are
    /// transient mid-navigation and read as "not ready yet".
    async fn probe_ready(&mut self, deadline: Instant) -> Result<Readiness, RenderError> {
        let budget = remaining(deadline)?.min(DEFAULT_CALL_TIMEOUT);
        match self
            .conn
            .call(
                "Runtime.evaluate",
                json!({ "expression": READY_PROBE, "returnByValue": true }),
                budget,
            )
            .await
        {
            Ok(value) => {
                let state = value
                    .pointer("/result/value")
                    .and_then(Value::as_str)
                    .unwrap_or("unset");
                Ok(match state {
                    "ready" => Readiness::Ready,
                    "blocked" => Readiness::Blocked,
                    _ => Readiness::Unset,
                })
            }
            Err(TransportError::Command { message, .. }) => {
                debug!(target: "page-session", %message, "readiness probe rejected");
                Ok(Readiness::Unset)
            }
            Err(err) => Err(self.map_transport(err, "Runtime.evaluate")),
        }
    }

    async fn settle_paused_request(
        &mut self,
        event: CdpEvent,
        primary_host: &str,
        main_frame: Option<&str>,
        deadline: Instant,
    ) -> Result<(), RenderError> {
        let params = event.params;
        let request_id = match params.get("requestId").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => return Ok(()),
        };

        let url = params
            .pointer("/request/url")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let resource_type = params
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let frame = params.get("frameId").and_then(Value::as_str);
        let is_main_document = resource_type.eq_ignore_ascii_case("document")
            && main_frame.map_or(true, |main| frame == Some(main));

        let decision = self.cfg.policy.decide(
            primary_host,
            &InterceptedRequest {
                host: &host,
                resource_type,
                is_main_document,
            },
        );

        let (method, payload) = match decision {
            Decision::Continue => (
                "Fetch.continueRequest",
                json!({ "requestId": request_id }),
            ),
            Decision::Fail => {
                debug!(target: "page-session", %url, resource_type, "request blocked");
                (
                    "Fetch.failRequest",
                    json!({ "requestId": request_id, "errorReason": "BlockedByClient" }),
                )
            }
        };

        let budget = remaining(deadline)?.min(DEFAULT_CALL_TIMEOUT);
        match self.conn.call(method, payload, budget).await {
            Ok(_) => Ok(()),
            Err(TransportError::Command { message, .. }) => {
                // The request finished or vanished before our verdict landed.
                debug!(target: "page-session", %message, "stale intercepted request");
                Ok(())
            }
            Err(err) => Err(self.map_transport(err, method)),
        }
    }

    async fn extract(
        &mut self,
        request: &RenderRequest,
        deadline: Instant,
    ) -> Result<Artifact, RenderError> {
        let bytes = match request.format {
            RenderFormat::Html => {
                let doc = self
                    .extract_call("DOM.getDocument", json!({ "depth": 0 }), deadline)
                    .await?;
                let node_id = doc
                    .pointer("/root/nodeId")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| RenderError::extract().with_hint("document root missing"))?;
                let html = self
                    .extract_call("DOM.getOuterHTML", json!({ "nodeId": node_id }), deadline)
                    .await?;
                let markup = html
                    .get("outerHTML")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RenderError::extract().with_hint("outerHTML missing"))?;
                strip_script_tags(markup).into_bytes()
            }
            RenderFormat::Mhtml => {
                let snapshot = self
                    .extract_call("Page.captureSnapshot", json!({ "format": "mhtml" }), deadline)
                    .await?;
                snapshot
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RenderError::extract().with_hint("snapshot data missing"))?
                    .as_bytes()
                    .to_vec()
            }
            RenderFormat::Pdf => {
                let paper = request.options.paper.unwrap_or_default();
                let pdf = self
                    .extract_call(
                        "Page.printToPDF",
                        json!({
                            "landscape": paper.landscape,
                            "printBackground": paper.print_background,
                            "paperWidth": paper.width_in,
                            "paperHeight": paper.height_in,
                            "scale": paper.scale,
                        }),
                        deadline,
                    )
                    .await?;
                decode_base64_payload(&pdf)?
            }
            RenderFormat::Png => {
                let shot = self
                    .extract_call("Page.captureScreenshot", json!({ "format": "png" }), deadline)
                    .await?;
                decode_base64_payload(&shot)?
            }
            RenderFormat::Jpeg => {
                let quality = request.options.jpeg_quality.unwrap_or(90);
                let shot = self
                    .extract_call(
                        "Page.captureScreenshot",
                        json!({ "format": "jpeg", "quality": quality }),
                        deadline,
                    )
                    .await?;
                decode_base64_payload(&shot)?
            }
        };

        Ok(Artifact::new(request.format, bytes))
    }

    /// Return the page to `about:blank` so the rendered document and its
    /// memory are dropped before the session goes back to the pool.
    async fn reset(&mut self) -> Result<(), RenderError> {
        if !self.conn.is_alive() {
            return Err(RenderError::transport());
        }

        if self.intercepting {
            self.conn
                .call("Fetch.disable", json!({}), RESET_CALL_TIMEOUT)
                .await
                .map_err(|err| self.map_transport(err, "Fetch.disable"))?;
            self.intercepting = false;
        }

        self.conn
            .call(
                "Page.navigate",
                json!({ "url": "about:blank" }),
                RESET_CALL_TIMEOUT,
            )
            .await
            .map_err(|err| self.map_transport(err, "Page.navigate"))?;
        Ok(())
    }

    async fn subscribe(&mut self, pattern: &str) -> Result<EventStream, RenderError> {
        self.conn
            .subscribe(pattern)
            .await
            .map_err(|err| self.map_transport(err, pattern))
    }

    async fn session_call(
        &mut self,
        method: &str,
        params: Value,
        deadline: Instant,
    ) -> Result<Value, RenderError> {
        let budget = remaining(deadline)?.min(DEFAULT_CALL_TIMEOUT);
        match self.conn.call(method, params, budget).await {
            Ok(value) => Ok(value),
            Err(err) => Err(self.map_transport(err, method)),
        }
    }

    async fn extract_call(
        &mut self,
        method: &str,
        params: Value,
        deadline: Instant,
    ) -> Result<Value, RenderError> {
        let budget = remaining(deadline)?.min(EXTRACT_CALL_TIMEOUT);
        match self.conn.call(method, params, budget).await {
            Ok(value) => Ok(value),
            Err(TransportError::Command { message, .. }) => {
                Err(RenderError::extract().with_hint(format!("{method}: {message}")))
            }
            Err(err) => Err(self.map_transport(err, method)),
        }
    }

    fn map_transport(&mut self, err: TransportError, context: &str) -> RenderError {
        if err.is_fatal() {
            self.condemned = true;
            RenderError::transport().with_hint(format!("{context}: {err}"))
        } else if err.is_timeout() {
            self.condemned = true;
            RenderError::timeout().with_hint(context.to_string())
        } else {
            RenderError::extract().with_hint(format!("{context}: {err}"))
        }
    }

    fn stream_lost(&mut self) -> RenderError {
        self.condemned = true;
        RenderError::transport().with_hint("event stream closed")
    }
}

#[async_trait]
impl PooledPage for PageSession {
    fn usable(&self) -> bool {
        !self.condemned
            && !self.closed
            && self.conn.is_alive()
            && self.iterations < self.cfg.max_iterations
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(browser) = &self.browser {
            if let Err(err) = browser.close_target(&self.target_id).await {
                debug!(target: "page-session", %err, "closing target failed");
            }
        }
        info!(
            target: "page-session",
            target_id = %self.target_id,
            iterations = self.iterations,
            "page session closed"
        );
    }
}

#[async_trait]
impl RenderPage for PageSession {
    async fn render(
        &mut self,
        request: &RenderRequest,
        deadline: Instant,
    ) -> Result<Artifact, RenderError> {
        let result = self.drive(request, deadline).await;
        match &result {
            Ok(artifact) => {
                self.iterations += 1;
                debug!(
                    target: "page-session",
                    target_id = %self.target_id,
                    iteration = self.iterations,
                    size = artifact.len(),
                    "render complete"
                );
                if self.reset().await.is_err() {
                    self.condemned = true;
                }
            }
            Err(err) if err.condemns_session() => {
                self.condemned = true;
            }
            Err(_) => {
                // Recoverable failure; clear the page so the session can be
                // loaned out again.
                if self.reset().await.is_err() {
                    self.condemned = true;
                }
            }
        }
        result
    }
}

async fn next_paused(paused: &mut Option<EventStream>) -> Option<CdpEvent> {
    match paused {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn remaining(deadline: Instant) -> Result<Duration, RenderError> {
    let now = Instant::now();
    if now >= deadline {
        Err(RenderError::timeout())
    } else {
        Ok(deadline - now)
    }
}

fn decode_base64_payload(value: &Value) -> Result<Vec<u8>, RenderError> {
    let data = value
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| RenderError::extract().with_hint("payload data missing"))?;
    BASE64
        .decode(data.as_bytes())
        .map_err(|err| RenderError::extract().with_hint(format!("invalid base64 payload: {err}")))
}

/// Net error strings that point at the network/upstream rather than at the
/// requested URL itself.
fn classify_net_error(error_text: &str) -> NavigateFault {
    const UPSTREAM: [&str; 8] = [
        "ERR_NAME_NOT_RESOLVED",
        "ERR_CONNECTION_REFUSED",
        "ERR_CONNECTION_RESET",
        "ERR_CONNECTION_TIMED_OUT",
        "ERR_ADDRESS_UNREACHABLE",
        "ERR_INTERNET_DISCONNECTED",
        "ERR_PROXY_CONNECTION_FAILED",
        "ERR_TIMED_OUT",
    ];
    if UPSTREAM.iter().any(|code| error_text.contains(code)) {
        NavigateFault::Upstream
    } else {
        NavigateFault::Client
    }
}

static SCRIPT_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script([^>]*)>.*?</script>").expect("script tag regex"));

/// Drop inline and external scripts from serialized HTML so the prerendered
/// document does not re-run its application on the client. Structured-data
/// scripts (`application/ld+json`) are kept.
pub fn strip_script_tags(html: &str) -> String {
    SCRIPT_TAG_RE
        .replace_all(html, |caps: &regex::Captures<'_>| {
            if caps[1].contains("application/ld+json") {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_errors_split_by_fault() {
        assert_eq!(
            classify_net_error("net::ERR_NAME_NOT_RESOLVED"),
            NavigateFault::Upstream
        );
        assert_eq!(
            classify_net_error("net::ERR_CONNECTION_REFUSED"),
            NavigateFault::Upstream
        );
        assert_eq!(classify_net_error("net::ERR_ABORTED"), NavigateFault::Client);
        assert_eq!(
            classify_net_error("net::ERR_UNKNOWN_URL_SCHEME"),
            NavigateFault::Client
        );
    }

    #[test]
    fn script_tags_are_stripped_but_ld_json_survives() {
        let html = concat!(
            "<html><head>",
            "<script src=\"/app.js\"></script>",
            "<script type=\"application/ld+json\">{\"@type\":\"Thing\"}</script>",
            "</head><body><p>hello</p>",
            "<script>window.boot()</script>",
            "</body></html>",
        );
        let cleaned = strip_script_tags(html);
        assert!(!cleaned.contains("app.js"));
        assert!(!cleaned.contains("window.boot"));
        assert!(cleaned.contains("application/ld+json"));
        assert!(cleaned.contains("<p>hello</p>"));
    }
}
