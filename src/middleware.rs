use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::RETRY_AFTER, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ErrorResponse, ThrottlerError};
use crate::handlers::SharedState;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Access log: one line when a request arrives, one when it completes.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    info!(
        target: "redis_throttler::middleware",
        %method,
        %path,
        client_ip = %get_client_ip(&request),
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "redis_throttler::middleware",
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}

/// Admission control: one `check_limit` per request, keyed by client IP.
pub async fn rate_limit_middleware(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = get_client_ip(&request);

    let checked = tokio::time::timeout(state.store_timeout, state.limiter.check_limit(&client_ip))
        .await
        .unwrap_or_else(|_| Err(ThrottlerError::Timeout(state.store_timeout)));

    let decision = match checked {
        Ok(decision) => decision,
        Err(err) => {
            warn!(
                client_ip = %client_ip,
                strategy = %state.limiter.strategy(),
                error = %err,
                fail_open = state.fail_open,
                "Error checking rate limit"
            );
            if state.fail_open {
                return next.run(request).await;
            }
            return err.into_response();
        }
    };

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        debug!(client_ip = %client_ip, "Rate limit exceeded");
        let mut rejected = ErrorResponse::rate_limited().into_response();
        rejected
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        rejected
    };

    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(state.capacity));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    response
}

/// Rate limit key for a request: the first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the peer address.
pub fn get_client_ip(request: &Request) -> String {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    };

    let forwarded = header("x-forwarded-for")
        .and_then(|hops| hops.split(',').next())
        .map(str::trim);
    let real_ip = header("x-real-ip").map(str::trim);

    if let Some(ip) = forwarded.or(real_ip).filter(|ip| !ip.is_empty()) {
        return ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(headers: &[(&'static str, &'static str)]) -> Request {
        let mut request = Request::new(Body::empty());
        for (name, value) in headers {
            request
                .headers_mut()
                .insert(*name, HeaderValue::from_static(*value));
        }
        request
    }

    #[test]
    fn test_forwarded_for_uses_first_hop() {
        let request = request_with(&[
            ("x-forwarded-for", " 192.168.1.1 , 10.0.0.1"),
            ("x-real-ip", "203.0.113.1"),
        ]);
        assert_eq!(get_client_ip(&request), "192.168.1.1");
    }

    #[test]
    fn test_real_ip_when_not_forwarded() {
        let request = request_with(&[("x-real-ip", "203.0.113.1")]);
        assert_eq!(get_client_ip(&request), "203.0.113.1");
    }

    #[test]
    fn test_peer_address_fallback() {
        let mut request = request_with(&[]);
        let peer: SocketAddr = "198.51.100.7:52000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(get_client_ip(&request), "198.51.100.7");
    }

    #[test]
    fn test_unknown_without_any_source() {
        assert_eq!(get_client_ip(&request_with(&[])), "unknown");
    }
}
