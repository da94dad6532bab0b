//! HTTP front door.
//!
//! The render surface is the whole path space: `GET /{url}` renders HTML and
//! `GET /{format}/{url}` picks another artifact format, with `{url}` being
//! the remainder of the path plus the original query string, reconstructed
//! verbatim. Everything else (`/healthz`, `/status`) is a fixed route; the
//! render handler is the router fallback.

use std::time::Instant;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use prerender_core_types::{RenderFormat, RenderRequest, Url};

use crate::coordinator::RenderSource;
use crate::errors::status_for;
use crate::metrics;
use crate::server::state::AppState;

const CACHE_HEADER: &str = "x-prerender-cache";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/status", get(status_handler))
        .fallback(render_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.health.snapshot();
    let status = if snapshot.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "live": snapshot.live,
            "ready": snapshot.ready,
            "last_error": snapshot.last_error,
        })),
    )
        .into_response()
}

async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "browser": state.browser_product,
        "cache_backend": state.cache_backend,
        "pool": state.coordinator.pool().snapshot(),
        "breaker": state.coordinator.breaker().phase(),
        "metrics": metrics::snapshot(),
    }))
}

async fn render_handler(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
    }

    let started = Instant::now();
    let (format, target) = match parse_render_path(uri.path(), uri.query()) {
        Ok(parsed) => parsed,
        Err(reason) => return (StatusCode::BAD_REQUEST, reason).into_response(),
    };

    let url = match Url::parse(&target) {
        Ok(url) if url.host_str().is_some() => url,
        _ => return (StatusCode::BAD_REQUEST, "malformed target url").into_response(),
    };

    let request = RenderRequest::new(url, format);
    let skip_cache_read = method == Method::POST;

    match state.coordinator.render(&request, skip_cache_read).await {
        Ok((artifact, source)) => {
            let cache_state = match source {
                RenderSource::Cache => "hit",
                RenderSource::Browser => "miss",
            };
            info!(
                target: "gateway",
                url = %target,
                format = %format,
                cache = cache_state,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "render served"
            );
            (
                [
                    (CONTENT_TYPE.as_str(), artifact.content_type.as_str()),
                    (CACHE_HEADER, cache_state),
                ],
                artifact.bytes,
            )
                .into_response()
        }
        Err(err) => {
            let status = status_for(&err);
            warn!(
                target: "gateway",
                url = %target,
                format = %format,
                status = status.as_u16(),
                error = %err,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "render failed"
            );
            (status, err.kind.to_string()).into_response()
        }
    }
}

/// Split a request path into the artifact format and the target URL,
/// reattaching the original query string verbatim.
pub fn parse_render_path(path: &str, query: Option<&str>) -> Result<(RenderFormat, String), &'static str> {
    const PREFIXES: [(&str, RenderFormat); 5] = [
        ("html", RenderFormat::Html),
        ("mhtml", RenderFormat::Mhtml),
        ("pdf", RenderFormat::Pdf),
        ("png", RenderFormat::Png),
        ("jpeg", RenderFormat::Jpeg),
    ];

    let trimmed = path.strip_prefix('/').unwrap_or(path);

    let (format, rest) = PREFIXES
        .iter()
        .find_map(|(prefix, format)| {
            trimmed
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .filter(|rest| rest.starts_with("http"))
                .map(|rest| (*format, rest))
        })
        .unwrap_or((RenderFormat::Html, trimmed));

    if !rest.starts_with("http") {
        return Err("target url must start with http");
    }

    let mut target = rest.to_string();
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    Ok((format, target))
}
