//! Grant record helpers shared by the authorization server (C6) and the
//! proxy (C7): the upstream access/refresh token pair obtained for a
//! downstream authorization lives inside its `Grant` record.

use crate::errors::ProxyError;
use crate::idp::{IdpClient, RefreshError};
use crate::kv::{DynKvStore, Kind, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantPayload {
    pub downstream_client_id: String,
    pub scope: String,
    pub upstream_access_token: String,
    #[serde(default)]
    pub upstream_refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub upstream_token_type: String,
    pub upstream_expires_at: DateTime<Utc>,
    #[serde(default)]
    pub upstream_user_data: serde_json::Value,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl GrantPayload {
    pub fn is_upstream_token_expired(&self) -> bool {
        Utc::now() >= self.upstream_expires_at
    }
}

pub async fn load_grant(kv: &DynKvStore, grant_id: &str) -> Result<GrantPayload, ProxyError> {
    let record = kv
        .find(Kind::Grant, grant_id)
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?
        .ok_or(ProxyError::SessionNotFound)?;
    serde_json::from_value(record.payload).map_err(|_| ProxyError::SessionNotFound)
}

pub async fn save_grant(
    kv: &DynKvStore,
    grant_id: &str,
    payload: &GrantPayload,
) -> Result<(), ProxyError> {
    let value =
        serde_json::to_value(payload).map_err(|e| ProxyError::ConfigurationError(e.to_string()))?;
    kv.upsert(
        Record::new(Kind::Grant, grant_id, value).with_grant_id(grant_id),
        None,
    )
    .await
    .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))
}

/// At-most-one-refresh-then-retry (§4.6): refresh the upstream token tied
/// to `grant_id`, persist the result, and classify failure per §4.2. A
/// `RefreshTokenExpired` result means the grant has been revoked and the
/// caller should drive the downstream client through session reset (C8).
pub async fn refresh_grant(
    kv: &DynKvStore,
    idp: &IdpClient,
    grant_id: &str,
) -> Result<GrantPayload, ProxyError> {
    let mut grant = load_grant(kv, grant_id).await?;
    let refresh_token = grant
        .upstream_refresh_token
        .clone()
        .ok_or(ProxyError::RefreshTokenExpired)?;

    match idp.refresh(&refresh_token).await {
        Ok(tokens) => {
            crate::metrics::record_refresh_outcome("success");
            grant.upstream_access_token = tokens.access_token;
            if tokens.refresh_token.is_some() {
                grant.upstream_refresh_token = tokens.refresh_token;
            }
            let expires_in = tokens.expires_in.unwrap_or(3600).max(0);
            grant.upstream_expires_at = Utc::now() + chrono::Duration::seconds(expires_in);
            grant.upstream_user_data = tokens.user_data;
            save_grant(kv, grant_id, &grant).await?;
            Ok(grant)
        }
        Err(RefreshError::Expired) => {
            crate::metrics::record_refresh_outcome("expired");
            let _ = kv.revoke_by_grant(grant_id).await;
            Err(ProxyError::RefreshTokenExpired)
        }
        Err(RefreshError::Network(msg)) => {
            crate::metrics::record_refresh_outcome("network");
            Err(ProxyError::RefreshNetworkError(msg))
        }
        Err(RefreshError::Server(msg)) => {
            crate::metrics::record_refresh_outcome("server");
            Err(ProxyError::RefreshServerError(msg))
        }
        Err(RefreshError::Unknown(msg)) => {
            crate::metrics::record_refresh_outcome("unknown");
            Err(ProxyError::RefreshUnknownError(msg))
        }
    }
}
