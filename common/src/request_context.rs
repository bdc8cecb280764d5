use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, Request, StatusCode, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    time::SystemTime,
};
use uuid::Uuid;

use crate::response;

/// Per-request metadata carried in `request.extensions()`. The request id
/// is what admission stamps onto the state-change events it emits, so an
/// operator can correlate an event back to the HTTP call that caused it.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub client_ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub received_at: SystemTime,
}

/// Extractor form of [`RequestContext`] for handlers that require it to
/// be present; rejects with a 500 when the middleware was never
/// installed, since that is a wiring mistake rather than a bad request.
pub struct RequestContextExtractor(pub RequestContext);

impl std::ops::Deref for RequestContextExtractor {
    type Target = RequestContext;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> FromRequestParts<S> for RequestContextExtractor
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let ctx = parts.extensions.get::<RequestContext>().cloned();

        async move {
            ctx.map(RequestContextExtractor).ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                "request context middleware is not installed on this route",
            ))
        }
    }
}

pub mod middleware {
    use super::*;

    /// Honors an `x-request-id` supplied by the caller (rejecting ones
    /// that don't parse), generating a fresh id otherwise.
    pub async fn extract_context(req: Request<Body>, next: Next) -> Response {
        with_request_context(req, next, false).await
    }

    /// Always generates a fresh request id, for surfaces where callers
    /// are not trusted to supply their own.
    pub async fn create_context(req: Request<Body>, next: Next) -> Response {
        with_request_context(req, next, true).await
    }

    async fn with_request_context(
        mut req: Request<Body>,
        next: Next,
        always_generate: bool,
    ) -> Response {
        let headers = req.headers();
        let request_id = if always_generate {
            Uuid::new_v4()
        } else {
            match request_id_from_headers(headers) {
                Ok(id) => id,
                Err(e) => return response::bad_request(e),
            }
        };
        let client_ip = client_ip_from_headers(headers).or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        });
        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        req.extensions_mut().insert(RequestContext {
            request_id,
            client_ip,
            user_agent,
            received_at: SystemTime::now(),
        });

        let mut res = next.run(req).await;
        // echoed back so a client can quote the id when reporting issues
        res.headers_mut()
            .insert("x-request-id", request_id.to_string().parse().unwrap());
        res
    }
}

fn request_id_from_headers(headers: &HeaderMap) -> Result<Uuid> {
    Ok(headers
        .get("x-request-id")
        .map(|v| v.to_str())
        .transpose()
        .context("x-request-id header is not valid ASCII")?
        .map(|s| Uuid::parse_str(s.trim()))
        .transpose()
        .context("x-request-id header is not a UUID")?
        .unwrap_or_else(Uuid::new_v4))
}

fn client_ip_from_headers(headers: &HeaderMap) -> Option<IpAddr> {
    // X-Forwarded-For lists the original client first
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(ip) = forwarded
            .split(',')
            .map(|s| s.trim())
            .find_map(|s| s.parse::<IpAddr>().ok())
    {
        return Some(ip);
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok())
        && let Ok(ip) = real_ip.trim().parse::<IpAddr>()
    {
        return Some(ip);
    }

    None
}
