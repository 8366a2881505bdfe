//! Interaction state machine (C5): confirm-login → upstream login →
//! callback, keyed by `state = interaction_id` the whole way through.

use crate::errors::ProxyError;
use crate::idp::{IdpClient, TokenResponse};
use crate::kv::{DynKvStore, Kind, Record};
use crate::pkce::PkceStore;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

const INTERACTION_TTL: Duration = Duration::from_secs(15 * 60);
const AUTH_CODE_TTL: Duration = Duration::from_secs(60);

/// One in-flight downstream authorization request awaiting upstream login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub uid: String,
    pub downstream_client_id: String,
    pub downstream_redirect_uri: String,
    pub downstream_state: Option<String>,
    pub downstream_scope: String,
    pub downstream_code_challenge: String,
    pub downstream_code_challenge_method: String,
    /// §4.3: once the browser has confirmed login for this downstream
    /// client, later requests for the same interaction skip straight past
    /// the confirm-login prompt to the upstream redirect.
    #[serde(default)]
    pub login_confirmed: bool,
}

/// A downstream authorization code minted once the upstream round trip
/// completes, redeemable once at `/token` (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamAuthCode {
    pub grant_id: String,
    pub downstream_client_id: String,
    pub downstream_redirect_uri: String,
    pub downstream_code_challenge: String,
    pub downstream_code_challenge_method: String,
}

pub fn random_id(num_bytes: usize) -> String {
    let mut bytes = vec![0u8; num_bytes];
    rand::rng().fill_bytes(&mut bytes);
    B64.encode(bytes)
}

pub struct InteractionManager {
    kv: DynKvStore,
    idp: Arc<IdpClient>,
    pkce: Arc<PkceStore>,
    base_url: String,
}

impl InteractionManager {
    pub fn new(kv: DynKvStore, idp: Arc<IdpClient>, pkce: Arc<PkceStore>, base_url: String) -> Self {
        Self {
            kv,
            idp,
            pkce,
            base_url,
        }
    }

    /// Begin an interaction for a downstream `/auth` request.
    pub async fn start(&self, interaction: Interaction) -> Result<(), ProxyError> {
        let uid = interaction.uid.clone();
        let payload = serde_json::to_value(&interaction)
            .map_err(|e| ProxyError::ConfigurationError(e.to_string()))?;
        let record = Record::new(Kind::Interaction, uid.clone(), payload).with_uid(uid);
        self.kv
            .upsert(record, Some(INTERACTION_TTL))
            .await
            .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    pub async fn find(&self, uid: &str) -> Result<Interaction, ProxyError> {
        let record = self
            .kv
            .find_by_uid(Kind::Interaction, uid)
            .await
            .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?
            .ok_or(ProxyError::InteractionNotFound)?;
        serde_json::from_value(record.payload).map_err(|_| ProxyError::InteractionNotFound)
    }

    /// §4.3: mark the browser as having confirmed login for this
    /// interaction's downstream client, so the next `GET /interaction/{uid}`
    /// skips the confirm-login prompt.
    pub async fn confirm_login(&self, uid: &str) -> Result<(), ProxyError> {
        let mut interaction = self.find(uid).await?;
        interaction.login_confirmed = true;
        let payload = serde_json::to_value(&interaction)
            .map_err(|e| ProxyError::ConfigurationError(e.to_string()))?;
        let record = Record::new(Kind::Interaction, uid, payload).with_uid(uid);
        self.kv
            .upsert(record, Some(INTERACTION_TTL))
            .await
            .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))
    }

    fn idp_callback_path(&self, uid: &str) -> String {
        format!("/interaction/{}/identity/callback", uid)
    }

    /// Build the redirect to the upstream IdP's authorization endpoint,
    /// generating the proxy's own PKCE pair for that hop (independent of
    /// whatever PKCE pair the downstream client used against us). The OAuth
    /// `state` sent to the IdP is the interaction uid itself.
    pub async fn build_upstream_redirect(&self, uid: &str) -> Result<url::Url, ProxyError> {
        let code_verifier = random_id(32);
        let mut hasher = Sha256::new();
        hasher.update(code_verifier.as_bytes());
        let code_challenge = B64.encode(hasher.finalize());

        self.pkce
            .store(uid, uid, &code_verifier, INTERACTION_TTL)
            .await
            .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?;

        let redirect_uri = format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.idp_callback_path(uid)
        );
        self.idp
            .build_authorize_url(&redirect_uri, uid, &code_challenge)
            .map_err(|e| ProxyError::ConfigurationError(e.to_string()))
    }

    /// Look an interaction up by the `state` the upstream IdP echoed back
    /// on its callback (§4.3's generic `IDP_CALLBACK_PATH` handler). In this
    /// implementation `state` is the interaction uid, so this is a thin
    /// wrapper kept distinct so callers read as following the spec's
    /// by-state lookup rather than happening to reuse the uid.
    pub async fn find_by_state(&self, state: &str) -> Result<Interaction, ProxyError> {
        self.find(state).await
    }

    /// Handle the upstream IdP callback: exchange the code, persist the
    /// resulting upstream tokens under a new grant, and mint a downstream
    /// authorization code for the caller to redirect back with. `state` is
    /// the OAuth `state` query parameter the IdP echoed back, checked
    /// against what PKCE storage recorded for this interaction (§4.4(b)).
    pub async fn complete_upstream_callback(
        &self,
        uid: &str,
        state: &str,
        upstream_code: &str,
    ) -> Result<(Interaction, String), ProxyError> {
        let interaction = self.find(uid).await?;
        let code_verifier = self
            .pkce
            .retrieve(uid, state)
            .await
            .map_err(|_| ProxyError::InteractionNotFound)?;
        let redirect_uri = format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.idp_callback_path(uid)
        );

        let tokens = self
            .idp
            .exchange_code(upstream_code, &redirect_uri, &code_verifier)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "upstream code exchange failed");
                ProxyError::UpstreamUnauthorized
            })?;

        let grant_id = random_id(20);
        self.persist_grant(&grant_id, &interaction, &tokens).await?;

        let downstream_code = random_id(24);
        let auth_code = DownstreamAuthCode {
            grant_id,
            downstream_client_id: interaction.downstream_client_id.clone(),
            downstream_redirect_uri: interaction.downstream_redirect_uri.clone(),
            downstream_code_challenge: interaction.downstream_code_challenge.clone(),
            downstream_code_challenge_method: interaction.downstream_code_challenge_method.clone(),
        };
        let payload = serde_json::to_value(&auth_code)
            .map_err(|e| ProxyError::ConfigurationError(e.to_string()))?;
        let record = Record::new(Kind::AuthorizationCode, downstream_code.clone(), payload)
            .with_grant_id(auth_code.grant_id.clone());
        self.kv
            .upsert(record, Some(AUTH_CODE_TTL))
            .await
            .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?;

        self.kv
            .destroy(Kind::Interaction, uid)
            .await
            .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?;

        Ok((interaction, downstream_code))
    }

    /// Persist the grant that links this downstream authorization to the
    /// upstream credentials obtained for it. The upstream access/refresh
    /// tokens live inside the grant itself (C7 reads/refreshes them from
    /// here); the downstream-facing access/refresh tokens this
    /// authorization server hands its own clients are separate records
    /// (`Kind::AccessToken`/`Kind::RefreshToken`) minted at `/token`.
    async fn persist_grant(
        &self,
        grant_id: &str,
        interaction: &Interaction,
        tokens: &TokenResponse,
    ) -> Result<(), ProxyError> {
        let expires_in = tokens.expires_in.unwrap_or(3600).max(0);
        let upstream_expires_at = chrono::Utc::now() + chrono::Duration::seconds(expires_in);
        let grant_payload = serde_json::json!({
            "downstream_client_id": interaction.downstream_client_id,
            "scope": interaction.downstream_scope,
            "upstream_access_token": tokens.access_token,
            "upstream_refresh_token": tokens.refresh_token,
            "upstream_token_type": tokens.token_type,
            "upstream_expires_at": upstream_expires_at,
            "upstream_user_data": tokens.user_data,
        });
        self.kv
            .upsert(
                Record::new(Kind::Grant, grant_id, grant_payload).with_grant_id(grant_id),
                None,
            )
            .await
            .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}
