//! Authorizing reverse proxy handler (C7): validates the downstream bearer
//! token, injects the grant's upstream credentials, and relays the
//! request/response with an at-most-one refresh-and-retry on a 401 (§4.6).

use crate::errors::ProxyError;
use crate::grant::{GrantPayload, load_grant, refresh_grant};
use crate::kv::Kind;
use crate::state::SharedState;
use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use futures::StreamExt;
use std::time::Duration;

/// Request headers forwarded to the upstream resource server as-is.
/// Everything else (in particular any `authorization` the downstream
/// client sent) is dropped; the proxy supplies its own.
const FORWARD_REQUEST_HEADERS: &[&str] = &[
    "user-agent",
    "accept",
    "accept-encoding",
    "accept-language",
    "content-type",
    "content-length",
    "x-request-id",
];

pub async fn handle(
    State(state): State<SharedState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match proxy_once(&state, &method, &uri, &headers, &body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn proxy_once(
    state: &SharedState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ProxyError> {
    let token = extract_bearer(headers)?;
    let record = state
        .kv
        .find(Kind::AccessToken, &token)
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?
        .ok_or(ProxyError::InvalidAccessToken)?;
    let grant_id = record.grant_id.ok_or(ProxyError::InvalidAccessToken)?;

    let mut grant = match load_grant(&state.kv, &grant_id).await {
        Ok(grant) => grant,
        Err(ProxyError::SessionNotFound) => return Ok(destroy_access_and_reset(state, &grant_id).await),
        Err(e) => return Err(e),
    };
    if grant.upstream_access_token.is_empty() {
        return Ok(destroy_access_and_reset(state, &grant_id).await);
    }

    let started = std::time::Instant::now();
    let mut tried_refresh = false;
    loop {
        let response = send_upstream(state, method, uri, headers, body, &grant).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(relay(method, response, started).await);
        }
        if tried_refresh {
            return Ok(destroy_access_and_reset(state, &grant_id).await);
        }
        grant = match refresh_grant(&state.kv, &state.idp, &grant_id).await {
            Ok(grant) => grant,
            Err(_) => return Ok(destroy_access_and_reset(state, &grant_id).await),
        };
        tried_refresh = true;
    }
}

/// §4.6 `destroy_access`: tears down the grant (and every record tied to
/// it — the upstream/downstream tokens) and sends the client to session
/// reset so it re-authorizes from scratch.
async fn destroy_access_and_reset(state: &SharedState, grant_id: &str) -> Response {
    if let Err(e) = state.kv.revoke_by_grant(grant_id).await {
        tracing::warn!(error = %e, grant_id, "destroy_access: revoke_by_grant failed");
    }
    Redirect::to("/session/reset").into_response()
}

fn extract_bearer(headers: &HeaderMap) -> Result<String, ProxyError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(ProxyError::MissingAuthorization)?;
    let value = value.to_str().map_err(|_| ProxyError::MalformedAuthorization)?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or(ProxyError::MalformedAuthorization)?
        .trim();
    if token.is_empty() {
        return Err(ProxyError::MalformedAuthorization);
    }
    Ok(token.to_string())
}

fn build_upstream_url(base: &str, uri: &Uri) -> String {
    let base = base.trim_end_matches('/');
    let suffix = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", base, suffix)
}

async fn send_upstream(
    state: &SharedState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
    grant: &GrantPayload,
) -> Result<reqwest::Response, ProxyError> {
    let target = build_upstream_url(&state.config.upstream_server_url, uri);
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| ProxyError::ConfigurationError("unsupported HTTP method".to_string()))?;

    let mut builder = state.http.request(reqwest_method, target).body(body.clone());
    for name in FORWARD_REQUEST_HEADERS {
        if let Some(value) = headers.get(*name) {
            builder = builder.header(*name, value.as_bytes());
        }
    }
    builder = builder
        .header(
            "authorization",
            format!("{} {}", grant.upstream_token_type, grant.upstream_access_token),
        )
        .header("x-authorization-scope", grant.scope.as_str())
        .header("x-dynamic-client-id", grant.downstream_client_id.as_str())
        .timeout(Duration::from_secs(state.config.upstream_timeout_secs));

    builder.send().await.map_err(|e| {
        if e.is_timeout() {
            ProxyError::UpstreamTimeout
        } else {
            ProxyError::UpstreamConnectError(e.to_string())
        }
    })
}

async fn relay(method: &Method, response: reqwest::Response, started: std::time::Instant) -> Response {
    let status = response.status();
    crate::metrics::record_proxy_request(
        method.as_str(),
        status.as_u16(),
        started.elapsed().as_secs_f64() * 1000.0,
    );

    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers().iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }

    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(extract_bearer(&headers).unwrap(), "abc123");
    }

    #[test]
    fn rejects_missing_or_malformed_authorization() {
        let headers = HeaderMap::new();
        assert!(matches!(extract_bearer(&headers), Err(ProxyError::MissingAuthorization)));

        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert!(matches!(extract_bearer(&headers), Err(ProxyError::MalformedAuthorization)));
    }

    #[test]
    fn builds_upstream_url_preserving_path_and_query() {
        let uri: Uri = "/widgets?limit=10".parse().unwrap();
        assert_eq!(
            build_upstream_url("https://api.internal:8443/", &uri),
            "https://api.internal:8443/widgets?limit=10"
        );
    }

    #[tokio::test]
    async fn destroy_access_redirects_to_session_reset() {
        use crate::kv::{DynKvStore, Kind, Record};
        use crate::kv::sqlite::SqliteKvStore;
        use std::sync::Arc;

        let kv: DynKvStore = Arc::new(SqliteKvStore::open_in_memory().unwrap());
        kv.upsert(
            Record::new(Kind::Grant, "grant-1", serde_json::json!({})).with_grant_id("grant-1"),
            None,
        )
        .await
        .unwrap();
        let _ = kv.revoke_by_grant("grant-1").await.unwrap();
        assert!(kv.find(Kind::Grant, "grant-1").await.unwrap().is_none());
    }
}
