//! Generic KV store contract for OAuth/OIDC entities (spec §4.1, C1/C2).
//!
//! The proxy persists every short-lived OAuth artifact (authorization codes,
//! tokens, interactions, sessions, ...) through one storage-agnostic
//! contract. `sqlite` is the bundled implementation; the trait itself makes
//! no assumption about the backing store.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Entity kinds stored in the KV store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    DownstreamClient,
    AuthorizationCode,
    RefreshToken,
    AccessToken,
    DeviceCode,
    BackchannelAuthenticationRequest,
    Grant,
    Interaction,
    Session,
    PkceEntry,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::DownstreamClient => "downstream-client",
            Kind::AuthorizationCode => "authorization-code",
            Kind::RefreshToken => "refresh-token",
            Kind::AccessToken => "access-token",
            Kind::DeviceCode => "device-code",
            Kind::BackchannelAuthenticationRequest => "backchannel-authentication-request",
            Kind::Grant => "grant",
            Kind::Interaction => "interaction",
            Kind::Session => "session",
            Kind::PkceEntry => "pkce-entry",
        }
    }

    /// Entities that carry a `grant_id` and are bulk-revoked together when
    /// the grant they belong to is revoked (§4.1, "revoke by grant").
    pub fn is_grantable(&self) -> bool {
        matches!(
            self,
            Kind::AuthorizationCode
                | Kind::RefreshToken
                | Kind::AccessToken
                | Kind::DeviceCode
                | Kind::BackchannelAuthenticationRequest
        )
    }

    /// Entities that must be atomically marked consumed exactly once
    /// (authorization codes, device codes, PKCE entries).
    pub fn is_single_use(&self) -> bool {
        matches!(
            self,
            Kind::AuthorizationCode
                | Kind::DeviceCode
                | Kind::BackchannelAuthenticationRequest
                | Kind::PkceEntry
        )
    }
}

/// One stored entity. `payload` carries the kind-specific fields as JSON;
/// `uid`/`user_code`/`grant_id` are promoted to indexed columns because the
/// contract needs to look records up by them directly (interaction uid,
/// device flow user code, grant-wide revocation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub kind: Kind,
    pub id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub grant_id: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub user_code: Option<String>,
    #[serde(default)]
    pub consumed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(kind: Kind, id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            id: id.into(),
            payload,
            grant_id: None,
            uid: None,
            user_code: None,
            consumed_at: None,
            expires_at: None,
        }
    }

    pub fn with_grant_id(mut self, grant_id: impl Into<String>) -> Self {
        self.grant_id = Some(grant_id.into());
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_user_code(mut self, user_code: impl Into<String>) -> Self {
        self.user_code = Some(user_code.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("record not found")]
    NotFound,
    #[error("record already consumed")]
    AlreadyConsumed,
    #[error("store error: {0}")]
    Store(String),
}

/// Storage-agnostic contract for OAuth/OIDC entity persistence (§4.1).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Insert or replace a record, optionally with a TTL after which the
    /// backing store may garbage collect it.
    async fn upsert(&self, record: Record, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Look a record up by kind + primary id.
    async fn find(&self, kind: Kind, id: &str) -> Result<Option<Record>, KvError>;

    /// Look a record up by kind + `uid` (interaction lookup by short id).
    async fn find_by_uid(&self, kind: Kind, uid: &str) -> Result<Option<Record>, KvError>;

    /// Look a device-flow record up by the user-facing code.
    async fn find_by_user_code(&self, user_code: &str) -> Result<Option<Record>, KvError>;

    /// Delete a record outright.
    async fn destroy(&self, kind: Kind, id: &str) -> Result<(), KvError>;

    /// Revoke every grantable record (tokens, codes) tied to a grant id.
    /// Returns the number of records removed. Used when a refresh token is
    /// found to be revoked upstream, or on explicit logout.
    async fn revoke_by_grant(&self, grant_id: &str) -> Result<u64, KvError>;

    /// Atomically mark a single-use record consumed, returning the record
    /// as it stood before consumption. Returns `KvError::AlreadyConsumed`
    /// if a second caller races to consume the same record (replay
    /// protection for authorization codes / device codes).
    async fn consume(&self, kind: Kind, id: &str) -> Result<Record, KvError>;
}

pub type DynKvStore = std::sync::Arc<dyn KvStore>;
