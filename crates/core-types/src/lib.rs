//! Shared vocabulary for the prerender gateway: render requests, finished
//! artifacts, cache keys and the error taxonomy every layer speaks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
pub use url::Url;

/// Output formats a render can produce.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderFormat {
    Html,
    Mhtml,
    Pdf,
    Png,
    Jpeg,
}

impl RenderFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderFormat::Html => "html",
            RenderFormat::Mhtml => "mhtml",
            RenderFormat::Pdf => "pdf",
            RenderFormat::Png => "png",
            RenderFormat::Jpeg => "jpeg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            RenderFormat::Html => "text/html; charset=utf-8",
            RenderFormat::Mhtml => "multipart/related",
            RenderFormat::Pdf => "application/pdf",
            RenderFormat::Png => "image/png",
            RenderFormat::Jpeg => "image/jpeg",
        }
    }

    /// Formats whose bytes depend on the emulated viewport.
    pub fn is_image(&self) -> bool {
        matches!(self, RenderFormat::Png | RenderFormat::Jpeg)
    }
}

impl fmt::Display for RenderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device metrics applied before a screenshot render.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// Paper geometry for PDF output, in inches.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaperOptions {
    pub width_in: f64,
    pub height_in: f64,
    pub landscape: bool,
    pub print_background: bool,
    pub scale: f64,
}

impl Default for PaperOptions {
    fn default() -> Self {
        Self {
            width_in: 8.5,
            height_in: 11.0,
            landscape: false,
            print_background: true,
            scale: 1.0,
        }
    }
}

/// Per-request rendering knobs. All fields are optional; the session falls
/// back to its configured defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub viewport: Option<Viewport>,
    pub paper: Option<PaperOptions>,
    pub jpeg_quality: Option<u8>,
}

impl RenderOptions {
    /// Cache-salt made only of the options that change the produced bytes:
    /// viewport and quality for image formats, paper geometry for PDF.
    /// Options that only influence readiness never enter the salt, so such
    /// requests share a cache entry.
    pub fn cache_salt(&self, format: RenderFormat) -> String {
        match format {
            RenderFormat::Png | RenderFormat::Jpeg => {
                let vp = self.viewport.unwrap_or_default();
                let quality = match format {
                    RenderFormat::Jpeg => self.jpeg_quality.unwrap_or(90),
                    _ => 0,
                };
                format!(
                    "v{}x{}@{}m{}q{}",
                    vp.width, vp.height, vp.device_scale_factor, vp.mobile as u8, quality
                )
            }
            RenderFormat::Pdf => {
                let p = self.paper.unwrap_or_default();
                format!(
                    "p{}x{}l{}b{}s{}",
                    p.width_in, p.height_in, p.landscape as u8, p.print_background as u8, p.scale
                )
            }
            RenderFormat::Html | RenderFormat::Mhtml => String::new(),
        }
    }
}

/// One render to perform: a target URL, the artifact format and its knobs.
#[derive(Clone, Debug)]
pub struct RenderRequest {
    pub url: Url,
    pub format: RenderFormat,
    pub options: RenderOptions,
}

impl RenderRequest {
    pub fn new(url: Url, format: RenderFormat) -> Self {
        Self {
            url,
            format,
            options: RenderOptions::default(),
        }
    }

    /// Canonical identity of the request for cache purposes: lowercased
    /// scheme and host (the `url` crate normalizes both on parse), path and
    /// query preserved verbatim, fragment dropped.
    pub fn canonical_url(&self) -> String {
        canonical_url(&self.url)
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(
            &self.canonical_url(),
            self.format,
            &self.options.cache_salt(self.format),
        )
    }
}

pub fn canonical_url(url: &Url) -> String {
    let mut out = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(url.path());
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Cache lookup key: canonical URL, format tag and the bytes-affecting salt.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(canonical_url: &str, format: RenderFormat, salt: &str) -> Self {
        Self(format!("{canonical_url}|{}|{salt}", format.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem/object-safe identifier: SHA-256 hex of the key.
    pub fn storage_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The bytes produced by a render, immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub format: RenderFormat,
    #[serde(with = "bytes_base64")]
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub produced_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(format: RenderFormat, bytes: Vec<u8>) -> Self {
        Self {
            format,
            bytes,
            content_type: format.content_type().to_string(),
            produced_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

mod bytes_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Who is to blame when the browser reports a failed navigation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NavigateFault {
    /// DNS, connection refused, unreachable: counts toward the browser
    /// circuit breaker.
    Upstream,
    /// The requested URL itself was bad; the browser is fine.
    Client,
}

/// High-level failure categories surfaced by the render pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error, Serialize, Deserialize)]
pub enum RenderErrorKind {
    #[error("cdp transport lost")]
    Transport,
    #[error("navigation failed")]
    Navigate { fault: NavigateFault },
    #[error("render deadline exceeded")]
    Timeout,
    #[error("artifact extraction refused")]
    Extract,
    #[error("domain not allowed")]
    Policy,
    #[error("no page available before deadline")]
    Pool,
    #[error("browser upstream circuit open")]
    UpstreamOpen,
    #[error("render cancelled")]
    Cancelled,
}

/// Error carried from the rendering core to the front door.
#[derive(Clone, Debug)]
pub struct RenderError {
    pub kind: RenderErrorKind,
    pub hint: Option<String>,
}

impl RenderError {
    pub fn new(kind: RenderErrorKind) -> Self {
        Self { kind, hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn transport() -> Self {
        Self::new(RenderErrorKind::Transport)
    }

    pub fn navigate(fault: NavigateFault) -> Self {
        Self::new(RenderErrorKind::Navigate { fault })
    }

    pub fn timeout() -> Self {
        Self::new(RenderErrorKind::Timeout)
    }

    pub fn extract() -> Self {
        Self::new(RenderErrorKind::Extract)
    }

    pub fn policy() -> Self {
        Self::new(RenderErrorKind::Policy)
    }

    pub fn pool() -> Self {
        Self::new(RenderErrorKind::Pool)
    }

    pub fn upstream_open() -> Self {
        Self::new(RenderErrorKind::UpstreamOpen)
    }

    pub fn cancelled() -> Self {
        Self::new(RenderErrorKind::Cancelled)
    }

    /// True when the session that produced this error must not be reused.
    pub fn condemns_session(&self) -> bool {
        matches!(
            self.kind,
            RenderErrorKind::Transport | RenderErrorKind::Timeout | RenderErrorKind::Cancelled
        )
    }

    /// True when the failure counts against the browser upstream.
    pub fn counts_against_upstream(&self) -> bool {
        matches!(
            self.kind,
            RenderErrorKind::Transport
                | RenderErrorKind::Timeout
                | RenderErrorKind::Navigate {
                    fault: NavigateFault::Upstream
                }
        )
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, ": {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RenderError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str, format: RenderFormat) -> RenderRequest {
        RenderRequest::new(Url::parse(raw).unwrap(), format)
    }

    #[test]
    fn canonical_url_lowercases_scheme_and_host_and_drops_fragment() {
        let req = request(
            "HTTP://EXAMPLE.com/Some/Path?q=Value#section",
            RenderFormat::Html,
        );
        assert_eq!(req.canonical_url(), "http://example.com/Some/Path?q=Value");
    }

    #[test]
    fn canonical_url_keeps_explicit_port() {
        let req = request("http://example.com:8080/a", RenderFormat::Html);
        assert_eq!(req.canonical_url(), "http://example.com:8080/a");
    }

    #[test]
    fn cache_key_distinguishes_formats() {
        let html = request("http://example.com/", RenderFormat::Html).cache_key();
        let pdf = request("http://example.com/", RenderFormat::Pdf).cache_key();
        assert_ne!(html, pdf);
    }

    #[test]
    fn viewport_salts_images_but_not_html() {
        let mut a = request("http://example.com/", RenderFormat::Png);
        let mut b = a.clone();
        b.options.viewport = Some(Viewport {
            width: 800,
            height: 600,
            ..Viewport::default()
        });
        assert_ne!(a.cache_key(), b.cache_key());

        a.format = RenderFormat::Html;
        b.format = RenderFormat::Html;
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn paper_salts_pdf() {
        let a = request("http://example.com/", RenderFormat::Pdf);
        let mut b = a.clone();
        b.options.paper = Some(PaperOptions {
            landscape: true,
            ..PaperOptions::default()
        });
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn artifact_round_trips_through_json() {
        let artifact = Artifact::new(RenderFormat::Pdf, b"%PDF-1.7 payload".to_vec());
        let encoded = serde_json::to_string(&artifact).unwrap();
        let decoded: Artifact = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.bytes, artifact.bytes);
        assert_eq!(decoded.format, RenderFormat::Pdf);
    }

    #[test]
    fn error_classification_matches_pipeline_rules() {
        assert!(RenderError::timeout().condemns_session());
        assert!(RenderError::transport().condemns_session());
        assert!(!RenderError::extract().condemns_session());
        assert!(RenderError::navigate(NavigateFault::Upstream).counts_against_upstream());
        assert!(!RenderError::navigate(NavigateFault::Client).counts_against_upstream());
        assert!(!RenderError::extract().counts_against_upstream());
    }
}
