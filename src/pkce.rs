//! PKCE storage hook (C4).
//!
//! `store`/`retrieve` are keyed by `(interaction_id, state)` (§4.4): `store`
//! first resolves the Interaction the verifier belongs to, writing through
//! the KV store when it exists and falling back to an in-memory map for
//! local development when it doesn't. Invariant I6: the fallback is refused
//! outright in production, so an operator can never accidentally run a
//! durable-looking deployment on an ephemeral map. `retrieve` consumes the
//! record unconditionally and only hands back the verifier if the caller's
//! `state` matches what was stored — a mismatch is treated as absent, the
//! same as an expired or missing entry.

use crate::kv::{DynKvStore, Kind, KvError, Record};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PkceError {
    #[error("fallback storage is disabled in production")]
    FallbackDisabledInProduction,
    #[error("pkce entry not found or already used")]
    NotFound,
    #[error("store error: {0}")]
    Store(String),
}

struct FallbackEntry {
    state: String,
    code_verifier: String,
}

pub struct PkceStore {
    kv: DynKvStore,
    is_production: bool,
    fallback: Mutex<HashMap<String, FallbackEntry>>,
}

impl PkceStore {
    pub fn new(kv: DynKvStore, is_production: bool) -> Self {
        Self {
            kv,
            is_production,
            fallback: Mutex::new(HashMap::new()),
        }
    }

    /// Store a code verifier for `interaction_id`, tagged with the OAuth
    /// `state` it was issued under, for `ttl` (§4.4(a)).
    pub async fn store(
        &self,
        interaction_id: &str,
        state: &str,
        code_verifier: &str,
        ttl: Duration,
    ) -> Result<(), PkceError> {
        let interaction_exists = self
            .kv
            .find_by_uid(Kind::Interaction, interaction_id)
            .await
            .map_err(|e| PkceError::Store(e.to_string()))?
            .is_some();

        if interaction_exists {
            let record = Record::new(
                Kind::PkceEntry,
                interaction_id,
                json!({ "state": state, "code_verifier": code_verifier }),
            );
            return self
                .kv
                .upsert(record, Some(ttl))
                .await
                .map_err(|e| PkceError::Store(e.to_string()));
        }

        if self.is_production {
            return Err(PkceError::FallbackDisabledInProduction);
        }
        tracing::warn!(
            interaction_id,
            "pkce store: no matching interaction, using in-memory fallback"
        );
        self.fallback.lock().unwrap_or_else(|p| p.into_inner()).insert(
            interaction_id.to_string(),
            FallbackEntry {
                state: state.to_string(),
                code_verifier: code_verifier.to_string(),
            },
        );
        Ok(())
    }

    /// Retrieve and consume (single-use) the code verifier for
    /// `interaction_id`, returning absent if no record exists or if its
    /// stored `state` doesn't match the caller's (§4.4(b)).
    pub async fn retrieve(&self, interaction_id: &str, state: &str) -> Result<String, PkceError> {
        match self.kv.consume(Kind::PkceEntry, interaction_id).await {
            Ok(record) => {
                let stored_state = record.payload.get("state").and_then(|v| v.as_str());
                if stored_state != Some(state) {
                    return Err(PkceError::NotFound);
                }
                record
                    .payload
                    .get("code_verifier")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or(PkceError::NotFound)
            }
            Err(KvError::NotFound) | Err(KvError::AlreadyConsumed) => {
                if self.is_production {
                    return Err(PkceError::NotFound);
                }
                let entry = self
                    .fallback
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(interaction_id)
                    .ok_or(PkceError::NotFound)?;
                if entry.state != state {
                    return Err(PkceError::NotFound);
                }
                Ok(entry.code_verifier)
            }
            Err(e) => Err(PkceError::Store(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::sqlite::SqliteKvStore;
    use std::sync::Arc;

    async fn with_interaction(kv: &DynKvStore, uid: &str) {
        kv.upsert(
            Record::new(Kind::Interaction, uid, json!({"uid": uid})).with_uid(uid),
            None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stores_and_consumes_once() {
        let kv: DynKvStore = Arc::new(SqliteKvStore::open_in_memory().unwrap());
        with_interaction(&kv, "uid-1").await;
        let store = PkceStore::new(kv, false);
        store
            .store("uid-1", "state-1", "verifier-abc", Duration::from_secs(60))
            .await
            .unwrap();

        let v = store.retrieve("uid-1", "state-1").await.unwrap();
        assert_eq!(v, "verifier-abc");

        let second = store.retrieve("uid-1", "state-1").await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn mismatched_state_is_treated_as_absent() {
        let kv: DynKvStore = Arc::new(SqliteKvStore::open_in_memory().unwrap());
        with_interaction(&kv, "uid-1").await;
        let store = PkceStore::new(kv, false);
        store
            .store("uid-1", "state-1", "verifier-abc", Duration::from_secs(60))
            .await
            .unwrap();

        let result = store.retrieve("uid-1", "wrong-state").await;
        assert!(matches!(result, Err(PkceError::NotFound)));

        // the mismatch consumed the record, so even the right state now fails.
        let second = store.retrieve("uid-1", "state-1").await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn production_refuses_fallback_without_interaction() {
        let kv: DynKvStore = Arc::new(SqliteKvStore::open_in_memory().unwrap());
        let store = PkceStore::new(kv, true);
        let result = store
            .store("missing-uid", "state-1", "verifier-abc", Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(PkceError::FallbackDisabledInProduction)));
    }

    #[tokio::test]
    async fn development_falls_back_without_interaction() {
        let kv: DynKvStore = Arc::new(SqliteKvStore::open_in_memory().unwrap());
        let store = PkceStore::new(kv, false);
        store
            .store("missing-uid", "state-1", "verifier-abc", Duration::from_secs(60))
            .await
            .unwrap();
        let v = store.retrieve("missing-uid", "state-1").await.unwrap();
        assert_eq!(v, "verifier-abc");
    }
}
