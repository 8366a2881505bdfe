use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Fatal errors raised while the process is still starting up (before a
/// listener is bound). These map to the non-zero exit codes in spec §6.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Token signing misconfigured: {0}")]
    SigningMisconfigured(String),

    #[error("Key/Cert mismatch: {0}")]
    KeyCertMismatch(String),

    #[error("Other startup error: {0}")]
    Other(String),
}

/// Runtime error taxonomy for request handling (spec §7).
///
/// Each variant implements `IntoResponse` directly so a handler can simply
/// return `Err(ProxyError::...)` and have the status/body follow from the
/// error itself, the way the teacher's handlers map `AuthError` to responses.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing Authorization header")]
    MissingAuthorization,

    #[error("malformed Authorization header")]
    MalformedAuthorization,

    #[error("invalid or expired access token")]
    InvalidAccessToken,

    #[error("missing upstream authorization for this grant")]
    MissingUpstreamAuthorization,

    #[error("upstream server rejected the injected credentials")]
    UpstreamUnauthorized,

    #[error("upstream refresh token is expired or revoked")]
    RefreshTokenExpired,

    #[error("network error contacting the upstream identity provider: {0}")]
    RefreshNetworkError(String),

    #[error("upstream identity provider returned a server error: {0}")]
    RefreshServerError(String),

    #[error("unrecognized response from the upstream identity provider: {0}")]
    RefreshUnknownError(String),

    #[error("interaction not found or expired")]
    InteractionNotFound,

    #[error("session not found or expired")]
    SessionNotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("timed out waiting for upstream")]
    UpstreamTimeout,

    #[error("could not connect to upstream: {0}")]
    UpstreamConnectError(String),
}

impl ProxyError {
    /// OAuth error code per RFC 6749 §5.2 / RFC 6750 §3, used both in
    /// `WWW-Authenticate` challenges and JSON error bodies.
    fn oauth_error_code(&self) -> &'static str {
        match self {
            ProxyError::MissingAuthorization
            | ProxyError::MalformedAuthorization
            | ProxyError::InvalidAccessToken => "invalid_token",
            ProxyError::MissingUpstreamAuthorization | ProxyError::UpstreamUnauthorized => {
                "invalid_token"
            }
            ProxyError::RefreshTokenExpired => "invalid_grant",
            ProxyError::AccessDenied => "access_denied",
            ProxyError::InteractionNotFound | ProxyError::SessionNotFound => "invalid_request",
            ProxyError::ConfigurationError(_) => "server_error",
            ProxyError::StoreUnavailable(_) => "temporarily_unavailable",
            ProxyError::UpstreamTimeout | ProxyError::UpstreamConnectError(_) => {
                "temporarily_unavailable"
            }
            ProxyError::RefreshNetworkError(_)
            | ProxyError::RefreshServerError(_)
            | ProxyError::RefreshUnknownError(_) => "temporarily_unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingAuthorization
            | ProxyError::MalformedAuthorization
            | ProxyError::InvalidAccessToken
            | ProxyError::MissingUpstreamAuthorization
            | ProxyError::RefreshTokenExpired => StatusCode::UNAUTHORIZED,
            ProxyError::UpstreamUnauthorized => StatusCode::BAD_GATEWAY,
            ProxyError::AccessDenied => StatusCode::FORBIDDEN,
            ProxyError::InteractionNotFound | ProxyError::SessionNotFound => {
                StatusCode::NOT_FOUND
            }
            ProxyError::ConfigurationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamConnectError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::RefreshNetworkError(_)
            | ProxyError::RefreshServerError(_)
            | ProxyError::RefreshUnknownError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// True for the unauthenticated/invalid-token family that must carry a
    /// `WWW-Authenticate: Bearer` challenge header (session reset, C8).
    fn wants_bearer_challenge(&self) -> bool {
        matches!(
            self,
            ProxyError::MissingAuthorization
                | ProxyError::MalformedAuthorization
                | ProxyError::InvalidAccessToken
                | ProxyError::MissingUpstreamAuthorization
                | ProxyError::RefreshTokenExpired
        )
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.oauth_error_code();
        let body = json!({
            "error": code,
            "error_description": self.to_string(),
        });
        let mut response = (status, axum::Json(body)).into_response();
        if self.wants_bearer_challenge() {
            let challenge = format!(
                "Bearer error=\"{}\", error_description=\"{}\"",
                code, self
            );
            if let Ok(value) = axum::http::HeaderValue::from_str(&challenge) {
                response
                    .headers_mut()
                    .insert(axum::http::header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}
