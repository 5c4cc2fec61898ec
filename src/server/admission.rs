//! Admission middleware
//!
//! Runs every request through [`SecurityGuard::check_rate_limit`] keyed by
//! the client address and the most specific protected endpoint:
//! - `Limited` → 429 with `Retry-After`
//! - `Blocked` → 403
//!
//! The client address is the TCP peer. `X-Forwarded-For` / `X-Real-IP` are
//! honoured only when the peer is a configured trusted proxy.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::warn;

use crate::security::{RateLimitDecision, SecurityGuard, UNKNOWN_CLIENT};

/// Admission middleware state
#[derive(Debug, Clone)]
pub struct Admission {
    guard: Arc<SecurityGuard>,
    trusted_proxies: Arc<[IpAddr]>,
}

impl Admission {
    /// Admit through `guard`, reading forwarded headers only from
    /// `trusted_proxies`
    pub fn new(
        guard: Arc<SecurityGuard>,
        trusted_proxies: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            guard,
            trusted_proxies: trusted_proxies.into_iter().collect(),
        }
    }
}

/// Put `router`'s routes and fallback behind the admission check
pub fn with_admission<S>(router: Router<S>, admission: Admission) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(admission, admission_middleware))
}

/// Admission middleware function
pub async fn admission_middleware(
    State(admission): State<Admission>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let guard = &admission.guard;
    let path = request.uri().path();
    let Some(endpoint) = guard.endpoint_for_path(path) else {
        return next.run(request).await;
    };

    let client = client_id(&request, &admission.trusted_proxies);
    let now = Instant::now();
    match guard.check_rate_limit_at(&client, endpoint, now) {
        RateLimitDecision::Allowed => next.run(request).await,
        decision @ RateLimitDecision::Limited { .. } => {
            let retry_after = decision.retry_after(now).unwrap_or(1);
            warn!(client = %client, endpoint, retry_after, "Rate limit exceeded");
            rate_limited_response(decision.message().unwrap_or_default(), retry_after)
        }
        RateLimitDecision::Blocked { message } => {
            warn!(client = %client, endpoint, "Rejected blocked client");
            blocked_response(&message)
        }
    }
}

/// Identify the caller by its TCP peer address.
///
/// When the peer is one of `trusted_proxies`, the first `X-Forwarded-For`
/// hop (else `X-Real-IP`) names the client instead. Without a peer address
/// the request is attributed to [`UNKNOWN_CLIENT`] and headers are ignored.
pub fn client_id(request: &Request<Body>, trusted_proxies: &[IpAddr]) -> String {
    let Some(peer) = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
    else {
        return UNKNOWN_CLIENT.to_string();
    };

    if trusted_proxies.contains(&peer) {
        forwarded_client(request.headers()).unwrap_or_else(|| peer.to_string())
    } else {
        peer.to_string()
    }
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header_value("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_value("x-real-ip"))
        .map(String::from)
}

/// Create a 429 Too Many Requests response
fn rate_limited_response(message: &str, retry_after: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(json!({
            "error": message,
            "retryAfter": retry_after,
        })),
    )
        .into_response()
}

/// Create a 403 Forbidden response
fn blocked_response(message: &str) -> Response {
    (StatusCode::FORBIDDEN, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROXY: [u8; 4] = [10, 0, 0, 1];

    fn request_from(peer: [u8; 4], headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder()
            .uri("/api/trade")
            .extension(ConnectInfo(SocketAddr::from((peer, 4000))));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn trusted() -> Vec<IpAddr> {
        vec![IpAddr::from(PROXY)]
    }

    #[test]
    fn untrusted_peer_ignores_forwarded_headers() {
        let request = request_from(
            [9, 9, 9, 9],
            &[("x-forwarded-for", "1.2.3.4"), ("x-real-ip", "5.6.7.8")],
        );
        assert_eq!(client_id(&request, &trusted()), "9.9.9.9");
        assert_eq!(client_id(&request, &[]), "9.9.9.9");
    }

    #[test]
    fn trusted_proxy_forwarded_for_takes_first_hop() {
        let request = request_from(PROXY, &[("x-forwarded-for", "1.2.3.4, 10.0.0.1")]);
        assert_eq!(client_id(&request, &trusted()), "1.2.3.4");
    }

    #[test]
    fn trusted_proxy_real_ip_used_without_forwarded_for() {
        let request = request_from(PROXY, &[("x-real-ip", "5.6.7.8")]);
        assert_eq!(client_id(&request, &trusted()), "5.6.7.8");
    }

    #[test]
    fn trusted_proxy_without_headers_is_the_client() {
        assert_eq!(client_id(&request_from(PROXY, &[]), &trusted()), "10.0.0.1");
    }

    #[test]
    fn unknown_without_peer_address() {
        let request = Request::builder()
            .uri("/api/trade")
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_id(&request, &trusted()), UNKNOWN_CLIENT);
    }
}
