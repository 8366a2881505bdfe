//! Two-step session reset (C8).
//!
//! When a grant is torn down (refresh token expired, explicit revocation)
//! a downstream browser client may still be holding this proxy's own
//! session cookie. Rather than leave it pointed at a dead session, `/auth`
//! and friends redirect it through `/session/reset`, which clears the
//! cookie server- and client-side, then `/session/reset/done`, which
//! answers with a `WWW-Authenticate` challenge so the client's OAuth
//! library restarts authorization cleanly instead of looping on a stale
//! cookie.

use crate::kv::Kind;
use crate::state::SharedState;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;

const SESSION_COOKIE_NAME: &str = "authproxy_session";

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/session/reset", get(reset))
        .route("/session/reset/done", get(reset_done))
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn clear_cookie_header() -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{}=; Path=/; Max-Age=0; HttpOnly; Secure; SameSite=Lax",
        SESSION_COOKIE_NAME
    ))
    .expect("static cookie-clearing header is always valid")
}

/// Step one: destroy the server-side session record (if any) and clear the
/// cookie, then hand off to step two.
async fn reset(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Some(session_id) = read_cookie(&headers, SESSION_COOKIE_NAME) {
        let _ = state.kv.destroy(Kind::Session, &session_id).await;
    }
    let mut response = Redirect::to("/session/reset/done").into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, clear_cookie_header());
    response
}

/// Step two: no valid session remains, so every subsequent request from
/// this client must be treated as unauthenticated until it re-authorizes
/// (§4.7's terminal response, used verbatim as the `destroy_access` /
/// step-4 landing page by C7).
async fn reset_done(State(state): State<SharedState>) -> Response {
    let authorization_uri = format!("{}/auth", state.config.base_url.trim_end_matches('/'));
    let mut response = (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({
            "error": "session_expired",
            "error_description": "Session reset",
            "error_uri": authorization_uri,
        })),
    )
        .into_response();
    let challenge = format!(
        "Bearer error=\"invalid_client\", error_description=\"Session reset\", authorization_uri=\"{}\"",
        authorization_uri
    );
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_named_cookie_among_several() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=1; authproxy_session=abc123; another=2".parse().unwrap(),
        );
        assert_eq!(
            read_cookie(&headers, SESSION_COOKIE_NAME),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn missing_cookie_header_returns_none() {
        let headers = HeaderMap::new();
        assert_eq!(read_cookie(&headers, SESSION_COOKIE_NAME), None);
    }
}
