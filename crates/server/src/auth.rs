//! Optional shared-token middleware for the relay.
//!
//! When `--auth-token` is configured, room sockets under `/chat/` must carry
//! `Authorization: Bearer <token>` or `?token=<token>` (browsers cannot set
//! headers on WebSocket upgrades). `/health` stays open.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::warn;

pub async fn auth_middleware(
    State(expected_token): State<Arc<str>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    if presented_tokens(&req).any(|token| token == *expected_token) {
        return Ok(next.run(req).await);
    }

    warn!(
        component = "auth",
        event = "auth.rejected",
        path = %req.uri().path(),
        "Rejected request without a valid token"
    );
    Err(StatusCode::UNAUTHORIZED)
}

/// Tokens carried by the request: bearer header first, then `token=` query params.
fn presented_tokens<B>(req: &Request<B>) -> impl Iterator<Item = String> + '_ {
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    let query = req
        .uri()
        .query()
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.strip_prefix("token="))
        .filter_map(|raw| urlencoding::decode(raw).ok().map(|t| t.into_owned()));

    bearer.into_iter().chain(query)
}
