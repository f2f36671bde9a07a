//! Authentication middleware — bearer-token gate for everything outside
//! `/auth/*`.
//!
//! Invalid and expired sessions are distinguishable on the wire so a
//! client knows whether to re-authenticate. The resolved identity is
//! injected into request extensions for the handlers, and every
//! authenticated request stamps the inactivity tracker.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

use super::AppState;
use crate::auth::SessionError;
use crate::error::ApiError;

pub async fn require_session(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }

    let token = bearer_token(request.headers()).ok_or(ApiError::Unauthorized)?;
    let identity = state.sessions.validate(token).map_err(|err| {
        let ip = client_ip(request.headers(), connect.map(|c| c.0));
        warn!(event = "session_rejected", client_ip = %ip, "Bearer token rejected");
        match err {
            SessionError::Expired => ApiError::SessionExpired,
            SessionError::Malformed | SessionError::Invalid => ApiError::SessionInvalid,
        }
    })?;

    state.inactivity.touch();
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Client address for rate limiting: first `X-Forwarded-For` entry when
/// present and parseable, else the peer address minus port.
pub fn client_ip(headers: &HeaderMap, connect: Option<SocketAddr>) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return ip;
            }
        }
    }
    connect
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "203.0.113.9:51000".parse().unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.168.1.100, 10.0.0.1"),
        );
        assert_eq!(
            client_ip(&headers, Some(peer())),
            "192.168.1.100".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        assert_eq!(
            client_ip(&HeaderMap::new(), Some(peer())),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(
            client_ip(&headers, Some(peer())),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_client_ip_without_peer() {
        assert_eq!(
            client_ip(&HeaderMap::new(), None),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok.sig"),
        );
        assert_eq!(bearer_token(&headers), Some("tok.sig"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(bearer_token(&headers).is_none());
    }
}
