//! Storage collaborator
//!
//! The hosted backend keeps the call log and relays signaling rows through
//! realtime change feeds. The call core only talks to it through
//! [`CallStore`] and [`SignalingChannel`].

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::call::{Call, CallKind, CallStatus};
use crate::error::Result;

/// Change feed capacity
pub(crate) const FEED_CAPACITY: usize = 256;

/// Persisted call row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: CallKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<CallRecord> for Call {
    fn from(record: CallRecord) -> Self {
        Call {
            id: record.id,
            caller_id: record.caller_id,
            receiver_id: record.receiver_id,
            kind: record.call_type,
            status: record.status,
            started_at: record.started_at,
            ended_at: record.ended_at,
        }
    }
}

/// Call row to insert; the id is assigned by the store
#[derive(Debug, Clone)]
pub struct NewCallRecord {
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: CallKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
}

impl NewCallRecord {
    /// A freshly dialled call
    pub fn ringing(caller_id: &str, receiver_id: &str, call_type: CallKind) -> Self {
        Self {
            caller_id: caller_id.to_string(),
            receiver_id: receiver_id.to_string(),
            call_type,
            status: CallStatus::Ringing,
            started_at: Utc::now(),
        }
    }
}

/// Row change published on the call feed
#[derive(Debug, Clone, PartialEq)]
pub enum CallRecordChange {
    Inserted(CallRecord),
    Updated(CallRecord),
}

impl CallRecordChange {
    pub fn record(&self) -> &CallRecord {
        match self {
            CallRecordChange::Inserted(r) | CallRecordChange::Updated(r) => r,
        }
    }
}

/// Signaling row; `signal_data` is opaque to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingRecord {
    pub sender_id: String,
    pub receiver_id: String,
    pub session_id: String,
    pub signal_data: serde_json::Value,
}

/// Call log
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Insert a call and return it with its assigned id
    async fn insert_call(&self, call: NewCallRecord) -> Result<CallRecord>;

    /// Move a call forward to `status` (and set the end timestamp, if given)
    ///
    /// Returns `false` without touching the record when `status` does not
    /// rank above the stored one, e.g. `connected` after `ended`.
    async fn update_call_status(
        &self,
        id: &str,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    async fn get_call(&self, id: &str) -> Result<Option<CallRecord>>;

    /// Calls involving `user_id`, newest first
    async fn list_calls(&self, user_id: &str, limit: usize) -> Result<Vec<CallRecord>>;

    /// Feed of inserted and updated call rows
    fn subscribe_calls(&self) -> broadcast::Receiver<CallRecordChange>;
}

/// Signaling relay
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn insert_signal(&self, record: SignalingRecord) -> Result<()>;

    /// Feed of inserted signaling rows (all receivers)
    fn subscribe_signals(&self) -> broadcast::Receiver<SignalingRecord>;
}
