//! Bundled rusqlite-backed implementation of the KV store contract.

use super::{Kind, KvError, KvStore, Record};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

refinery::embed_migrations!("migrations/sqlite");

fn kind_from_str(s: &str) -> Option<Kind> {
    Some(match s {
        "downstream-client" => Kind::DownstreamClient,
        "authorization-code" => Kind::AuthorizationCode,
        "refresh-token" => Kind::RefreshToken,
        "access-token" => Kind::AccessToken,
        "device-code" => Kind::DeviceCode,
        "backchannel-authentication-request" => Kind::BackchannelAuthenticationRequest,
        "grant" => Kind::Grant,
        "interaction" => Kind::Interaction,
        "session" => Kind::Session,
        "pkce-entry" => Kind::PkceEntry,
        _ => return None,
    })
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<Record> {
    let kind_s: String = row.get(0)?;
    let payload_s: String = row.get(5)?;
    Ok(Record {
        kind: kind_from_str(&kind_s).unwrap_or(Kind::Session),
        id: row.get(1)?,
        uid: row.get(2)?,
        user_code: row.get(3)?,
        grant_id: row.get(4)?,
        payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::Value::Null),
        consumed_at: parse_ts(row.get(6)?),
        expires_at: parse_ts(row.get(7)?),
    })
}

/// Records past their `expires_at` are treated as absent by readers; a
/// background sweep (spawned by `state.rs`) physically deletes them.
fn filter_expired(record: Option<Record>) -> Option<Record> {
    record.filter(|r| r.expires_at.is_none_or(|exp| exp > Utc::now()))
}

/// rusqlite-backed KV store. A single connection guarded by a `Mutex` is
/// sufficient: SQLite already serializes writers, and the proxy's request
/// volume does not warrant a connection pool.
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    /// Open (creating if needed) the database at `path`, running pending
    /// migrations under a cross-process lock so that multiple proxy
    /// instances starting concurrently against the same file don't race.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
            crate::utility::set_secure_dir_permissions(parent)?;
        }

        let lock_path = Self::lock_path(path);
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let result = (|| -> anyhow::Result<Connection> {
            let mut conn = Connection::open(path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", true)?;
            migrations::runner().run(&mut conn)?;
            Ok(conn)
        })();

        FileExt::unlock(&lock_file)?;
        let conn = result?;

        crate::utility::set_secure_file_permissions(path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrations::runner().run(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock_path(db_path: &Path) -> PathBuf {
        let mut p = db_path.as_os_str().to_os_string();
        p.push(".migration.lock");
        PathBuf::from(p)
    }

    /// Physically delete every record whose `expires_at` has passed.
    /// Invoked from a periodic background task (`state.rs`).
    pub async fn sweep_expired(&self) -> Result<u64, KvError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let now = Utc::now().to_rfc3339();
            let changed = conn
                .execute(
                    "DELETE FROM kv_records WHERE expires_at IS NOT NULL AND expires_at < ?1",
                    params![now],
                )
                .map_err(|e| KvError::Store(e.to_string()))?;
            Ok(changed as u64)
        })
        .await
        .map_err(|e| KvError::Store(e.to_string()))?
    }
}

fn lock(conn: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>, KvError> {
    conn.lock().map_err(|_| KvError::Store("poisoned lock".to_string()))
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn upsert(&self, record: Record, ttl: Option<Duration>) -> Result<(), KvError> {
        let conn = self.conn.clone();
        let expires_at = ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d)
            .or(record.expires_at);
        let kind_s = record.kind.as_str();
        let payload_s = record.payload.to_string();
        let consumed_s = record.consumed_at.map(|t| t.to_rfc3339());
        let expires_s = expires_at.map(|t| t.to_rfc3339());
        let created_s = Utc::now().to_rfc3339();
        let (id, uid, user_code, grant_id) =
            (record.id, record.uid, record.user_code, record.grant_id);
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "INSERT INTO kv_records (kind, id, uid, user_code, grant_id, payload, consumed_at, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(kind, id) DO UPDATE SET
                    uid = excluded.uid,
                    user_code = excluded.user_code,
                    grant_id = excluded.grant_id,
                    payload = excluded.payload,
                    consumed_at = excluded.consumed_at,
                    expires_at = excluded.expires_at",
                params![kind_s, id, uid, user_code, grant_id, payload_s, consumed_s, expires_s, created_s],
            )
            .map_err(|e| KvError::Store(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| KvError::Store(e.to_string()))?
    }

    async fn find(&self, kind: Kind, id: &str) -> Result<Option<Record>, KvError> {
        let conn = self.conn.clone();
        let kind_s = kind.as_str();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let result = conn
                .query_row(
                    "SELECT kind, id, uid, user_code, grant_id, payload, consumed_at, expires_at
                     FROM kv_records WHERE kind = ?1 AND id = ?2",
                    params![kind_s, id],
                    row_to_record,
                )
                .optional()
                .map_err(|e| KvError::Store(e.to_string()))?;
            Ok(filter_expired(result))
        })
        .await
        .map_err(|e| KvError::Store(e.to_string()))?
    }

    async fn find_by_uid(&self, kind: Kind, uid: &str) -> Result<Option<Record>, KvError> {
        let conn = self.conn.clone();
        let kind_s = kind.as_str();
        let uid = uid.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let result = conn
                .query_row(
                    "SELECT kind, id, uid, user_code, grant_id, payload, consumed_at, expires_at
                     FROM kv_records WHERE kind = ?1 AND uid = ?2",
                    params![kind_s, uid],
                    row_to_record,
                )
                .optional()
                .map_err(|e| KvError::Store(e.to_string()))?;
            Ok(filter_expired(result))
        })
        .await
        .map_err(|e| KvError::Store(e.to_string()))?
    }

    async fn find_by_user_code(&self, user_code: &str) -> Result<Option<Record>, KvError> {
        let conn = self.conn.clone();
        let user_code = user_code.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let result = conn
                .query_row(
                    "SELECT kind, id, uid, user_code, grant_id, payload, consumed_at, expires_at
                     FROM kv_records WHERE kind = ?1 AND user_code = ?2",
                    params![Kind::DeviceCode.as_str(), user_code],
                    row_to_record,
                )
                .optional()
                .map_err(|e| KvError::Store(e.to_string()))?;
            Ok(filter_expired(result))
        })
        .await
        .map_err(|e| KvError::Store(e.to_string()))?
    }

    async fn destroy(&self, kind: Kind, id: &str) -> Result<(), KvError> {
        let conn = self.conn.clone();
        let kind_s = kind.as_str();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            conn.execute(
                "DELETE FROM kv_records WHERE kind = ?1 AND id = ?2",
                params![kind_s, id],
            )
            .map_err(|e| KvError::Store(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| KvError::Store(e.to_string()))?
    }

    async fn revoke_by_grant(&self, grant_id: &str) -> Result<u64, KvError> {
        let conn = self.conn.clone();
        let grant_id = grant_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            let changed = conn
                .execute(
                    "DELETE FROM kv_records WHERE grant_id = ?1",
                    params![grant_id],
                )
                .map_err(|e| KvError::Store(e.to_string()))?;
            Ok(changed as u64)
        })
        .await
        .map_err(|e| KvError::Store(e.to_string()))?
    }

    async fn consume(&self, kind: Kind, id: &str) -> Result<Record, KvError> {
        let conn = self.conn.clone();
        let kind_s = kind.as_str();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            let tx = conn
                .transaction()
                .map_err(|e| KvError::Store(e.to_string()))?;
            let record = tx
                .query_row(
                    "SELECT kind, id, uid, user_code, grant_id, payload, consumed_at, expires_at
                     FROM kv_records WHERE kind = ?1 AND id = ?2",
                    params![kind_s, id],
                    row_to_record,
                )
                .optional()
                .map_err(|e| KvError::Store(e.to_string()))?;
            let record = filter_expired(record).ok_or(KvError::NotFound)?;
            if record.consumed_at.is_some() {
                return Err(KvError::AlreadyConsumed);
            }
            tx.execute(
                "UPDATE kv_records SET consumed_at = ?1 WHERE kind = ?2 AND id = ?3",
                params![Utc::now().to_rfc3339(), kind_s, id],
            )
            .map_err(|e| KvError::Store(e.to_string()))?;
            tx.commit().map_err(|e| KvError::Store(e.to_string()))?;
            Ok(record)
        })
        .await
        .map_err(|e| KvError::Store(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_and_find_round_trips() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let record = Record::new(Kind::AccessToken, "tok-1", json!({"scope": "openid"}))
            .with_grant_id("grant-1");
        store.upsert(record, None).await.unwrap();

        let found = store.find(Kind::AccessToken, "tok-1").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().grant_id.as_deref(), Some("grant-1"));
    }

    #[tokio::test]
    async fn consume_is_single_use() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let record = Record::new(Kind::AuthorizationCode, "code-1", json!({}));
        store.upsert(record, None).await.unwrap();

        store.consume(Kind::AuthorizationCode, "code-1").await.unwrap();
        let second = store.consume(Kind::AuthorizationCode, "code-1").await;
        assert!(matches!(second, Err(KvError::AlreadyConsumed)));
    }

    #[tokio::test]
    async fn revoke_by_grant_removes_every_linked_record() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store
            .upsert(
                Record::new(Kind::AccessToken, "at-1", json!({})).with_grant_id("g1"),
                None,
            )
            .await
            .unwrap();
        store
            .upsert(
                Record::new(Kind::RefreshToken, "rt-1", json!({})).with_grant_id("g1"),
                None,
            )
            .await
            .unwrap();

        let removed = store.revoke_by_grant("g1").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.find(Kind::AccessToken, "at-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_records_read_as_absent() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let mut record = Record::new(Kind::Session, "sess-1", json!({}));
        record.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.upsert(record, None).await.unwrap();

        assert!(store.find(Kind::Session, "sess-1").await.unwrap().is_none());
    }
}
