//! Upstream identity provider client (C3): discovery-or-static metadata,
//! authorization URL construction, code exchange, and token refresh with
//! the success/expired/network/server/unknown classification from §4.2.

use crate::config::IdpConfig;
use anyhow::{Context, Result};
use openidconnect::core::CoreProviderMetadata;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Normalized upstream token response. Token fields the proxy acts on
/// directly are typed; everything else the IdP attached rides along in
/// `user_data` untouched, since different upstream IdPs attach different
/// extra claims (`signature`/`instance_url`/`session_nonce`, or plain
/// `id`/`user_id`) and the proxy has no business guessing a schema for
/// data it only needs to pass through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(flatten)]
    pub user_data: serde_json::Value,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Refresh-attempt outcome classification (§4.2).
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh token expired or revoked")]
    Expired,
    #[error("network error contacting identity provider: {0}")]
    Network(String),
    #[error("identity provider returned a server error: {0}")]
    Server(String),
    #[error("unrecognized identity provider response: {0}")]
    Unknown(String),
}

impl RefreshError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RefreshError::Expired => "expired",
            RefreshError::Network(_) => "network",
            RefreshError::Server(_) => "server",
            RefreshError::Unknown(_) => "unknown",
        }
    }
}

pub struct IdpClient {
    http: Client,
    config: IdpConfig,
    metadata: CoreProviderMetadata,
}

impl IdpClient {
    /// Initialize from either a static metadata file (`IDP_SERVER_METADATA_FILE`)
    /// or live discovery against `IDP_SERVER_URL` (§4.2).
    pub async fn discover(config: IdpConfig, http: Client) -> Result<Self> {
        let metadata = if let Some(path) = &config.metadata_file {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read IDP_SERVER_METADATA_FILE {}", path))?;
            serde_json::from_str(&text).context("parse static IdP metadata file")?
        } else {
            Self::discover_metadata(&http, &config.server_url).await?
        };
        Ok(Self {
            http,
            config,
            metadata,
        })
    }

    async fn discover_metadata(http: &Client, server_url: &str) -> Result<CoreProviderMetadata> {
        let well_known = format!(
            "{}/.well-known/openid-configuration",
            server_url.trim_end_matches('/')
        );
        let resp = http
            .get(&well_known)
            .send()
            .await
            .context("fetch upstream IdP discovery document")?
            .error_for_status()
            .context("upstream IdP discovery document request failed")?;
        resp.json::<CoreProviderMetadata>()
            .await
            .context("parse upstream IdP discovery document")
    }

    fn token_endpoint(&self) -> Result<&str> {
        self.metadata
            .token_endpoint()
            .map(|u| u.as_str())
            .context("upstream IdP metadata has no token_endpoint")
    }

    pub fn authorization_endpoint(&self) -> &str {
        self.metadata.authorization_endpoint().as_str()
    }

    /// Scopes as configured (`IDP_SCOPE`), split on whitespace/commas.
    pub fn scopes(&self) -> Vec<String> {
        self.config
            .scope
            .split([' ', ','])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Build the redirect URL to the upstream authorization endpoint for a
    /// single interaction (C5).
    pub fn build_authorize_url(
        &self,
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> Result<Url> {
        let mut url = Url::parse(self.authorization_endpoint()).context("invalid authorization_endpoint")?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("response_type", "code");
            qp.append_pair("client_id", &self.config.client_id);
            qp.append_pair("redirect_uri", redirect_uri);
            qp.append_pair("scope", &self.scopes().join(" "));
            qp.append_pair("state", state);
            qp.append_pair("code_challenge", code_challenge);
            qp.append_pair("code_challenge_method", "S256");
        }
        Ok(url)
    }

    /// Exchange an authorization code (with PKCE verifier) for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("code_verifier", code_verifier),
        ];
        let resp = self
            .http
            .post(self.token_endpoint()?)
            .form(&params)
            .send()
            .await
            .context("code exchange request to upstream IdP failed")?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("upstream IdP rejected code exchange ({}): {}", status, body);
        }
        serde_json::from_str(&body).with_context(|| format!("parse token response: {}", body))
    }

    /// Refresh an upstream access token, classifying the failure mode so
    /// the caller can decide whether to retry, propagate, or force
    /// downstream re-authorization (§4.2, §4.6).
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, RefreshError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ];
        let token_endpoint = self
            .token_endpoint()
            .map_err(|e| RefreshError::Unknown(e.to_string()))?;

        let resp = self
            .http
            .post(token_endpoint)
            .form(&params)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    RefreshError::Network(e.to_string())
                } else {
                    RefreshError::Unknown(e.to_string())
                }
            })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| RefreshError::Unknown(format!("{}: {}", e, body)));
        }

        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            if let Ok(err) = serde_json::from_str::<OAuthErrorBody>(&body)
                && (err.error == "invalid_grant" || err.error == "invalid_token")
            {
                return Err(RefreshError::Expired);
            }
            return Err(RefreshError::Unknown(body));
        }

        if status.is_server_error() {
            return Err(RefreshError::Server(body));
        }

        Err(RefreshError::Unknown(format!("{}: {}", status, body)))
    }
}
