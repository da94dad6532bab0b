//! Mapping from render failures to HTTP statuses at the front door.

use axum::http::StatusCode;

use prerender_core_types::{NavigateFault, RenderError, RenderErrorKind};

pub fn status_for(err: &RenderError) -> StatusCode {
    match err.kind {
        RenderErrorKind::Policy => StatusCode::FORBIDDEN,
        RenderErrorKind::Timeout | RenderErrorKind::Pool => StatusCode::GATEWAY_TIMEOUT,
        RenderErrorKind::Transport
        | RenderErrorKind::Extract
        | RenderErrorKind::UpstreamOpen => StatusCode::BAD_GATEWAY,
        RenderErrorKind::Navigate {
            fault: NavigateFault::Upstream,
        } => StatusCode::BAD_GATEWAY,
        RenderErrorKind::Navigate {
            fault: NavigateFault::Client,
        } => StatusCode::BAD_REQUEST,
        RenderErrorKind::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_gateway_contract() {
        assert_eq!(status_for(&RenderError::policy()), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&RenderError::timeout()), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&RenderError::pool()), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for(&RenderError::transport()), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&RenderError::upstream_open()),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&RenderError::navigate(NavigateFault::Upstream)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&RenderError::navigate(NavigateFault::Client)),
            StatusCode::BAD_REQUEST
        );
    }
}
