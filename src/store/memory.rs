//! In-process store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use super::{
    CallRecord, CallRecordChange, CallStore, NewCallRecord, SignalingChannel, SignalingRecord,
    FEED_CAPACITY,
};
use crate::call::CallStatus;
use crate::error::{CallError, Result};

/// Store that keeps everything in memory
///
/// Several participants in one process can share it; the change feeds
/// behave like the hosted backend's realtime channels. `set_offline` and
/// `set_signaling_offline` make writes fail, for exercising error paths.
pub struct MemoryStore {
    calls: RwLock<Vec<CallRecord>>,
    signals: RwLock<Vec<SignalingRecord>>,
    call_tx: broadcast::Sender<CallRecordChange>,
    signal_tx: broadcast::Sender<SignalingRecord>,
    offline: AtomicBool,
    signaling_offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (call_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (signal_tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            calls: RwLock::new(vec![]),
            signals: RwLock::new(vec![]),
            call_tx,
            signal_tx,
            offline: AtomicBool::new(false),
            signaling_offline: AtomicBool::new(false),
        }
    }

    /// Make every write fail
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make only signaling inserts fail
    pub fn set_signaling_offline(&self, offline: bool) {
        self.signaling_offline.store(offline, Ordering::SeqCst);
    }

    /// Every signaling row delivered so far
    pub fn signal_log(&self) -> Vec<SignalingRecord> {
        self.signals.read().clone()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CallError::Storage("backend unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn insert_call(&self, call: NewCallRecord) -> Result<CallRecord> {
        self.check_online()?;

        let record = CallRecord {
            id: uuid::Uuid::new_v4().to_string(),
            caller_id: call.caller_id,
            receiver_id: call.receiver_id,
            call_type: call.call_type,
            status: call.status,
            started_at: call.started_at,
            ended_at: None,
        };
        self.calls.write().push(record.clone());
        let _ = self.call_tx.send(CallRecordChange::Inserted(record.clone()));

        Ok(record)
    }

    async fn update_call_status(
        &self,
        id: &str,
        status: CallStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.check_online()?;

        let updated = {
            let mut calls = self.calls.write();
            let record = calls
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| CallError::Storage(format!("Call not found: {}", id)))?;
            if !record.status.can_advance_to(status) {
                return Ok(false);
            }
            record.status = status;
            if ended_at.is_some() {
                record.ended_at = ended_at;
            }
            record.clone()
        };
        let _ = self.call_tx.send(CallRecordChange::Updated(updated));

        Ok(true)
    }

    async fn get_call(&self, id: &str) -> Result<Option<CallRecord>> {
        Ok(self.calls.read().iter().find(|c| c.id == id).cloned())
    }

    async fn list_calls(&self, user_id: &str, limit: usize) -> Result<Vec<CallRecord>> {
        let mut calls: Vec<CallRecord> = self
            .calls
            .read()
            .iter()
            .filter(|c| c.caller_id == user_id || c.receiver_id == user_id)
            .cloned()
            .collect();
        calls.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        calls.truncate(limit);
        Ok(calls)
    }

    fn subscribe_calls(&self) -> broadcast::Receiver<CallRecordChange> {
        self.call_tx.subscribe()
    }
}

#[async_trait]
impl SignalingChannel for MemoryStore {
    async fn insert_signal(&self, record: SignalingRecord) -> Result<()> {
        self.check_online()?;
        if self.signaling_offline.load(Ordering::SeqCst) {
            return Err(CallError::Storage("signaling channel unavailable".to_string()));
        }

        self.signals.write().push(record.clone());
        let _ = self.signal_tx.send(record);
        Ok(())
    }

    fn subscribe_signals(&self) -> broadcast::Receiver<SignalingRecord> {
        self.signal_tx.subscribe()
    }
}
