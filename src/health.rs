//! Liveness/readiness probes.
//!
//! Both endpoints support content negotiation:
//! - `Accept: application/json` returns `{"status": "live|ready|not live|not ready"}`
//! - Default returns plain text `"live"`, `"ready"`, `"not live"`, or `"not ready"`

use axum::{extract::State, response::Response};
use hyper::{HeaderMap, StatusCode};
use serde_json::json;

use crate::state::SharedState;

fn negotiated_response(accept: &str, status: StatusCode, text: &str) -> Response {
    let wants_json = accept.contains("application/json");
    let body = if wants_json {
        json!({ "status": text }).to_string()
    } else {
        text.to_string()
    };
    Response::builder()
        .status(status)
        .header(
            "Content-Type",
            if wants_json { "application/json" } else { "text/plain" },
        )
        .body(body.into())
        .unwrap()
}

/// `GET /livez`: the process is running and able to respond at all.
pub async fn livez(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let accept = headers.get("accept").and_then(|v| v.to_str().ok()).unwrap_or("");
    let (status, text) = if state.is_alive() {
        (StatusCode::OK, "live")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not live")
    };
    negotiated_response(accept, status, text)
}

/// `GET /readyz`: the process has finished startup (config loaded, IdP
/// discovered, signer ready, KV store migrated) and can serve traffic.
pub async fn readyz(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let accept = headers.get("accept").and_then(|v| v.to_str().ok()).unwrap_or("");
    let ready = state.is_ready() && state.is_signer_ready();
    let (status, text) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    };
    negotiated_response(accept, status, text)
}
