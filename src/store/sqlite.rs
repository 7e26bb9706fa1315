//! SQLite-backed store
//!
//! Shares the pool opened by [`crate::config::ConfigStore`]. SQLite has no
//! realtime feed, so inserts and updates made through this store are
//! published on in-process broadcast channels.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    CallRecord, CallRecordChange, CallStore, NewCallRecord, SignalingChannel, SignalingRecord,
    FEED_CAPACITY,
};
use crate::call::{CallKind, CallStatus};
use crate::error::{CallError, Result};

type CallRow = (String, String, String, String, String, String, Option<String>);

const CALL_COLUMNS: &str =
    "id, caller_id, receiver_id, call_type, status, started_at, ended_at";

/// Call log and signaling relay in SQLite
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    call_tx: broadcast::Sender<CallRecordChange>,
    signal_tx: broadcast::Sender<SignalingRecord>,
}

impl SqliteStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self> {
        Self::init_schema(&pool).await?;

        let (call_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (signal_tx, _) = broadcast::channel(FEED_CAPACITY);

        Ok(Self {
            pool,
            call_tx,
            signal_tx,
        })
    }

    async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                call_type TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signaling (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                signal_data TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signaling_receiver ON signaling(receiver_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    async fn fetch_call(&self, id: &str) -> Result<Option<CallRecord>> {
        let row: Option<CallRow> =
            sqlx::query_as(&format!("SELECT {} FROM calls WHERE id = ?1", CALL_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(row_to_record).transpose()
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CallError::Storage(format!("Invalid timestamp '{}': {}", value, e)))
}

fn row_to_record(row: CallRow) -> Result<CallRecord> {
    let (id, caller_id, receiver_id, call_type, status, started_at, ended_at) = row;

    let call_type = CallKind::parse(&call_type)
        .ok_or_else(|| CallError::Storage(format!("Invalid call type: {}", call_type)))?;
    let status = CallStatus::parse(&status)
        .ok_or_else(|| CallError::Storage(format!("Invalid call status: {}", status)))?;

    Ok(CallRecord {
        id,
        caller_id,
        receiver_id,
        call_type,
        status,
        started_at: parse_timestamp(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[async_trait]
impl CallStore for SqliteStore {
    async fn insert_call(&self, call: NewCallRecord) -> Result<CallRecord> {
        let record = CallRecord {
            id: uuid::Uuid::new_v4().to_string(),
            caller_id: call.caller_id,
            receiver_id: call.receiver_id,
            call_type: call.call_type,
            status: call.status,
            started_at: call.started_at,
            ended_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO calls (id, caller_id, receiver_id, call_type, status, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&record.id)
        .bind(&record.caller_id)
        .bind(&record.receiver_id)
        .bind(record.call_type.as_str())
        .bind(record.status.as_str())
        .bind(record.started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!("Call record {} inserted ({})", record.id, record.status);
        let _ = self.call_tx.send(CallRecordChange::Inserted(record.clone()));

        Ok(record)
    }

    async fn update_call_status(
        &self,
        id: &str,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        // Forward-only: the stored status must rank below the new one
        let result = sqlx::query(
            r#"
            UPDATE calls SET status = ?1, ended_at = COALESCE(?2, ended_at)
            WHERE id = ?3 AND CASE status
                WHEN 'idle' THEN 0
                WHEN 'ringing' THEN 1
                WHEN 'connecting' THEN 2
                WHEN 'connected' THEN 3
                ELSE 4
            END < ?4
            "#,
        )
        .bind(status.as_str())
        .bind(ended_at.map(|t| t.to_rfc3339()))
        .bind(id)
        .bind(i64::from(status.rank()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.fetch_call(id).await? {
                Some(record) => {
                    debug!(
                        "Call {} stays {}, not moving to {}",
                        id, record.status, status
                    );
                    Ok(false)
                }
                None => Err(CallError::Storage(format!("Call not found: {}", id))),
            };
        }

        if let Some(record) = self.fetch_call(id).await? {
            let _ = self.call_tx.send(CallRecordChange::Updated(record));
        }

        Ok(true)
    }

    async fn get_call(&self, id: &str) -> Result<Option<CallRecord>> {
        self.fetch_call(id).await
    }

    async fn list_calls(&self, user_id: &str, limit: usize) -> Result<Vec<CallRecord>> {
        let rows: Vec<CallRow> = sqlx::query_as(&format!(
            "SELECT {} FROM calls WHERE caller_id = ?1 OR receiver_id = ?1 \
             ORDER BY started_at DESC LIMIT ?2",
            CALL_COLUMNS
        ))
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    fn subscribe_calls(&self) -> broadcast::Receiver<CallRecordChange> {
        self.call_tx.subscribe()
    }
}

#[async_trait]
impl SignalingChannel for SqliteStore {
    async fn insert_signal(&self, record: SignalingRecord) -> Result<()> {
        let signal_data = serde_json::to_string(&record.signal_data)?;

        sqlx::query(
            r#"
            INSERT INTO signaling (id, sender_id, receiver_id, session_id, signal_data)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&record.sender_id)
        .bind(&record.receiver_id)
        .bind(&record.session_id)
        .bind(&signal_data)
        .execute(&self.pool)
        .await?;

        let _ = self.signal_tx.send(record);
        Ok(())
    }

    fn subscribe_signals(&self) -> broadcast::Receiver<SignalingRecord> {
        self.signal_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use serde_json::json;
    use tempfile::tempdir;

    async fn open_store(dir: &std::path::Path) -> SqliteStore {
        let config = ConfigStore::new(&dir.join("voxa.db")).await.unwrap();
        SqliteStore::new(config.pool().clone()).await.unwrap()
    }

    #[tokio::test]
    async fn test_call_lifecycle_rows() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let mut feed = store.subscribe_calls();

        let record = store
            .insert_call(NewCallRecord::ringing("u1", "u2", CallKind::Video))
            .await
            .unwrap();
        assert!(matches!(feed.recv().await.unwrap(), CallRecordChange::Inserted(_)));

        store
            .update_call_status(&record.id, CallStatus::Connected, None)
            .await
            .unwrap();
        let ended_at = Utc::now();
        store
            .update_call_status(&record.id, CallStatus::Ended, Some(ended_at))
            .await
            .unwrap();

        let stored = store.get_call(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert_eq!(stored.call_type, CallKind::Video);
        assert_eq!(
            stored.ended_at.map(|t| t.timestamp_millis()),
            Some(ended_at.timestamp_millis())
        );

        let history = store.list_calls("u2", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(store.list_calls("u9", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ended_call_is_not_reopened() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let record = store
            .insert_call(NewCallRecord::ringing("u1", "u2", CallKind::Audio))
            .await
            .unwrap();
        let ended_at = Utc::now();
        assert!(store
            .update_call_status(&record.id, CallStatus::Ended, Some(ended_at))
            .await
            .unwrap());

        let mut feed = store.subscribe_calls();
        assert!(!store
            .update_call_status(&record.id, CallStatus::Connected, None)
            .await
            .unwrap());
        assert!(!store
            .update_call_status(&record.id, CallStatus::Connecting, None)
            .await
            .unwrap());

        let stored = store.get_call(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ended);
        assert_eq!(
            stored.ended_at.map(|t| t.timestamp_millis()),
            Some(ended_at.timestamp_millis())
        );
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_missing_call() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let err = store
            .update_call_status("nope", CallStatus::Ended, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Storage(_)));
    }

    #[tokio::test]
    async fn test_signal_insert_is_published() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let mut feed = store.subscribe_signals();

        let record = SignalingRecord {
            sender_id: "u1".into(),
            receiver_id: "u2".into(),
            session_id: "call-1".into(),
            signal_data: json!({"type": "ice-candidate", "candidate": {"candidate": "c"}}),
        };
        store.insert_signal(record.clone()).await.unwrap();
        assert_eq!(feed.recv().await.unwrap(), record);
    }
}
