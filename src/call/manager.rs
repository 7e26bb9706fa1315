//! Call lifecycle
//!
//! Tracks what the local participant is doing (idle, being called, or in a
//! call), persists the transitions it drives and reacts to the call-record
//! feed: incoming announcements, caller cancellation and remote hang-up.

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::history::CallSummary;
use super::types::{Call, CallStatus, IncomingCall};
use crate::config::{AppConfig, CallConfig, ConfigChange, ConfigStore};
use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventBus, NoticeLevel};
use crate::media::{MediaControlState, MediaStream};
use crate::negotiation::{Backends, NegotiationEngine};
use crate::store::{CallRecord, CallRecordChange, CallStore};

/// What the local participant is doing
#[derive(Debug, Clone, PartialEq)]
pub enum CallPhase {
    Idle,
    /// Someone is calling; not yet answered
    Incoming(IncomingCall),
    /// Dialled or answered; stays here through the end-of-call grace period
    Active(Call),
}

impl CallPhase {
    pub fn status(&self) -> CallStatus {
        match self {
            CallPhase::Idle => CallStatus::Idle,
            CallPhase::Incoming(_) => CallStatus::Ringing,
            CallPhase::Active(call) => call.status,
        }
    }
}

/// Call lifecycle of one local participant
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    local_id: String,
    config: ArcSwap<CallConfig>,
    store: Arc<dyn CallStore>,
    engine: NegotiationEngine,
    events: Arc<EventBus>,
    phase: Mutex<CallPhase>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    config_task: Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
    pub fn new(local_id: impl Into<String>, config: &AppConfig, backends: Backends) -> Self {
        let local_id = local_id.into();
        let events = Arc::new(EventBus::new());
        let store = backends.store.clone();
        let engine = NegotiationEngine::new(local_id.clone(), config, backends, events.clone());

        Self {
            inner: Arc::new(ManagerInner {
                local_id,
                config: ArcSwap::from_pointee(config.call.clone()),
                store,
                engine,
                events,
                phase: Mutex::new(CallPhase::Idle),
                tasks: Mutex::new(vec![]),
                config_task: Mutex::new(None),
            }),
        }
    }

    /// Start listening for signaling, call records and engine events
    pub fn start(&self) {
        let inner = &self.inner;
        // Subscribe before spawning so nothing published from now on is missed
        let records = inner.store.subscribe_calls();
        let events = inner.events.subscribe();
        inner.engine.start();

        let weak = Arc::downgrade(inner);
        let record_task = tokio::spawn(watch_records(weak.clone(), records));
        let event_task = tokio::spawn(watch_events(weak, events));

        let mut tasks = inner.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        tasks.push(record_task);
        tasks.push(event_task);
        info!("Call manager for {} started", inner.local_id);
    }

    /// Apply `config` to calls set up from now on
    pub fn apply_config(&self, config: &AppConfig) {
        self.inner.config.store(Arc::new(config.call.clone()));
        self.inner.engine.apply_config(config);
    }

    /// Keep following changes saved to `store`
    pub fn follow_config(&self, store: &ConfigStore) {
        let changes = store.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(watch_config(weak, store.clone(), changes));
        if let Some(previous) = self.inner.config_task.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn call_config(&self) -> Arc<CallConfig> {
        self.inner.config.load_full()
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.inner.events.clone()
    }

    pub fn engine(&self) -> &NegotiationEngine {
        &self.inner.engine
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.phase.lock().clone()
    }

    pub fn current_call(&self) -> Option<Call> {
        match &*self.inner.phase.lock() {
            CallPhase::Active(call) => Some(call.clone()),
            _ => None,
        }
    }

    pub fn incoming_call(&self) -> Option<IncomingCall> {
        match &*self.inner.phase.lock() {
            CallPhase::Incoming(incoming) => Some(incoming.clone()),
            _ => None,
        }
    }

    /// Dial `remote_id`
    pub async fn start_call(&self, remote_id: &str, wants_video: bool) -> Result<Call> {
        let inner = &self.inner;
        {
            let phase = inner.phase.lock();
            match &*phase {
                CallPhase::Idle => {}
                CallPhase::Incoming(incoming) => {
                    return Err(CallError::CallInProgress(incoming.id.clone()))
                }
                CallPhase::Active(call) => return Err(CallError::CallInProgress(call.id.clone())),
            }
        }

        let outgoing = match inner.engine.initialize_call(remote_id, wants_video).await {
            Ok(outgoing) => outgoing,
            Err(e) => {
                inner.notify_failure("Could not start call", &e);
                return Err(e);
            }
        };
        let call = outgoing.call;

        // An announcement may have slipped in while media was being acquired
        let displaced = {
            let mut phase = inner.phase.lock();
            let previous = std::mem::replace(&mut *phase, CallPhase::Active(call.clone()));
            match previous {
                CallPhase::Incoming(incoming) => Some(incoming),
                _ => None,
            }
        };
        if let Some(incoming) = displaced {
            inner.reject_busy(&incoming).await;
        }

        info!("Calling {} (call {}, {})", remote_id, call.id, call.kind);
        inner.events.publish(CallEvent::CallStatusChanged {
            call_id: call.id.clone(),
            status: CallStatus::Ringing,
        });

        // The callee may have declined before the call became active here
        if let Ok(Some(record)) = inner.store.get_call(&call.id).await {
            if record.status.is_ended() {
                inner.on_updated(record).await;
            }
        }
        Ok(call)
    }

    /// Answer the pending incoming call with the media its kind asks for
    pub async fn answer_call(&self) -> Result<MediaStream> {
        let incoming = self.incoming_call().ok_or(CallError::NoActiveCall)?;
        self.answer_with(incoming.kind.wants_video()).await
    }

    /// Answer the pending incoming call, choosing whether to send video
    pub async fn answer_with(&self, wants_video: bool) -> Result<MediaStream> {
        let inner = &self.inner;
        let incoming = self.incoming_call().ok_or(CallError::NoActiveCall)?;

        let stream = match inner
            .engine
            .answer_call(&incoming.id, &incoming.caller_id, wants_video)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                inner.clear_incoming(&incoming.id);
                inner.notify_failure("Could not answer call", &e);
                return Err(e);
            }
        };

        let started_at = match inner.store.get_call(&incoming.id).await {
            Ok(Some(record)) => record.started_at,
            _ => Utc::now(),
        };
        let call = Call {
            id: incoming.id.clone(),
            caller_id: incoming.caller_id.clone(),
            receiver_id: inner.local_id.clone(),
            kind: incoming.kind,
            status: CallStatus::Connecting,
            started_at,
            ended_at: None,
        };

        let cancelled = {
            let mut phase = inner.phase.lock();
            let still_ringing =
                matches!(&*phase, CallPhase::Incoming(current) if current.id == incoming.id);
            if still_ringing {
                *phase = CallPhase::Active(call.clone());
            }
            !still_ringing
        };
        if cancelled {
            // The caller gave up while media was being set up
            inner.engine.end_remote(&incoming.id).await;
            return Err(CallError::NoActiveCall);
        }

        info!("Answered call {} from {}", call.id, call.caller_id);
        inner.events.publish(CallEvent::CallStatusChanged {
            call_id: call.id,
            status: CallStatus::Connecting,
        });
        Ok(stream)
    }

    /// Decline the pending incoming call
    pub async fn reject_call(&self) -> Result<()> {
        let inner = &self.inner;
        let incoming = self.incoming_call().ok_or(CallError::NoActiveCall)?;
        inner.clear_incoming(&incoming.id);
        inner.engine.discard_early(&incoming.id);

        inner
            .store
            .update_call_status(&incoming.id, CallStatus::Ended, Some(Utc::now()))
            .await?;
        info!("Rejected call {} from {}", incoming.id, incoming.caller_id);
        inner.events.publish(CallEvent::CallStatusChanged {
            call_id: incoming.id,
            status: CallStatus::Ended,
        });
        Ok(())
    }

    /// Hang up. Rejects a pending incoming call; a no-op when idle.
    pub async fn end_call(&self) -> Result<()> {
        match self.phase() {
            CallPhase::Idle => Ok(()),
            CallPhase::Incoming(_) => self.reject_call().await,
            CallPhase::Active(call) => {
                self.inner.engine.end_call().await;
                self.inner.conclude(&call.id);
                Ok(())
            }
        }
    }

    pub fn toggle_mute(&self) -> bool {
        self.inner.engine.toggle_mute()
    }

    pub fn toggle_camera(&self) -> bool {
        self.inner.engine.toggle_camera()
    }

    pub async fn toggle_screen_share(&self) -> bool {
        self.inner.engine.toggle_screen_share().await
    }

    pub fn controls(&self) -> MediaControlState {
        self.inner.engine.controls()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.inner.engine.local_stream()
    }

    pub async fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.engine.remote_stream().await
    }

    /// Most recent calls involving the local participant
    pub async fn history(&self, limit: usize) -> Result<Vec<CallSummary>> {
        let records = self.inner.store.list_calls(&self.inner.local_id, limit).await?;
        Ok(records
            .iter()
            .map(|record| CallSummary::from_record(record, &self.inner.local_id))
            .collect())
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(task) = self.config_task.get_mut().take() {
            task.abort();
        }
    }
}

impl ManagerInner {
    async fn on_record(self: &Arc<Self>, change: CallRecordChange) {
        match change {
            CallRecordChange::Inserted(record) => {
                if record.receiver_id == self.local_id && record.status == CallStatus::Ringing {
                    self.on_incoming(record).await;
                }
            }
            CallRecordChange::Updated(record) => self.on_updated(record).await,
        }
    }

    async fn on_incoming(self: &Arc<Self>, record: CallRecord) {
        let incoming = IncomingCall {
            id: record.id.clone(),
            caller_id: record.caller_id.clone(),
            kind: record.call_type,
        };

        let accepted = {
            let mut phase = self.phase.lock();
            if matches!(*phase, CallPhase::Idle) && !self.engine.is_busy() {
                *phase = CallPhase::Incoming(incoming.clone());
                true
            } else {
                false
            }
        };

        if accepted {
            info!(
                "Incoming {} call {} from {}",
                incoming.kind, incoming.id, incoming.caller_id
            );
            self.events.publish(CallEvent::IncomingCall(incoming));
        } else {
            self.reject_busy(&incoming).await;
        }
    }

    async fn on_updated(self: &Arc<Self>, record: CallRecord) {
        let phase = self.phase.lock().clone();
        match phase {
            CallPhase::Incoming(incoming) if incoming.id == record.id && record.status.is_ended() => {
                self.clear_incoming(&incoming.id);
                self.engine.discard_early(&incoming.id);
                info!("Call {} from {} was cancelled", incoming.id, incoming.caller_id);
                self.events
                    .publish(CallEvent::IncomingCallCancelled { call_id: incoming.id });
            }
            CallPhase::Active(call) if call.id == record.id => {
                if record.status.is_ended() {
                    if self.engine.end_remote(&call.id).await {
                        info!("Call {} ended by {}", call.id, call.peer_of(&self.local_id));
                    }
                    self.conclude(&call.id);
                } else {
                    self.advance(&call.id, record.status);
                }
            }
            _ => {}
        }
    }

    fn on_event(self: &Arc<Self>, event: CallEvent) {
        match event {
            CallEvent::CallStatusChanged { call_id, status } => {
                if status.is_ended() {
                    self.conclude(&call_id);
                } else {
                    self.advance(&call_id, status);
                }
            }
            CallEvent::SessionEnded { call_id, .. } => self.conclude(&call_id),
            _ => {}
        }
    }

    /// Advance the active call's status; never moves backwards
    fn advance(&self, call_id: &str, status: CallStatus) {
        let mut phase = self.phase.lock();
        if let CallPhase::Active(call) = &mut *phase {
            if call.id == call_id && call.advance(status) {
                debug!("Call {} is now {}", call_id, status);
            }
        }
    }

    /// Mark the active call ended and return to idle after the grace period
    fn conclude(self: &Arc<Self>, call_id: &str) {
        {
            let mut phase = self.phase.lock();
            match &mut *phase {
                CallPhase::Active(call) if call.id == call_id => {
                    if !call.advance(CallStatus::Ended) {
                        // Already ended; the grace timer is running
                        return;
                    }
                }
                _ => return,
            }
        }

        let weak = Arc::downgrade(self);
        let call_id = call_id.to_string();
        let grace = self.config.load().end_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else { return };
            let mut phase = inner.phase.lock();
            if matches!(&*phase, CallPhase::Active(call) if call.id == call_id) {
                *phase = CallPhase::Idle;
                debug!("Call {} cleared", call_id);
            }
        });
    }

    fn clear_incoming(&self, call_id: &str) {
        let mut phase = self.phase.lock();
        if matches!(&*phase, CallPhase::Incoming(incoming) if incoming.id == call_id) {
            *phase = CallPhase::Idle;
        }
    }

    /// Auto-reject an announcement that arrived while a call is in progress
    async fn reject_busy(&self, incoming: &IncomingCall) {
        info!(
            "Busy: rejecting call {} from {}",
            incoming.id, incoming.caller_id
        );
        self.engine.discard_early(&incoming.id);
        if let Err(e) = self
            .store
            .update_call_status(&incoming.id, CallStatus::Ended, Some(Utc::now()))
            .await
        {
            warn!("Failed to reject call {}: {}", incoming.id, e);
        }
        self.events.publish(CallEvent::Busy {
            call_id: incoming.id.clone(),
            caller_id: incoming.caller_id.clone(),
            kind: incoming.kind,
        });
    }

    fn notify_failure(&self, what: &str, error: &CallError) {
        self.events.publish(CallEvent::notice(
            NoticeLevel::Error,
            format!("{}: {}", what, error),
        ));
    }
}

async fn watch_records(
    weak: Weak<ManagerInner>,
    mut records: broadcast::Receiver<CallRecordChange>,
) {
    loop {
        let change = match records.recv().await {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Call record feed lagged, {} changes skipped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = weak.upgrade() else { break };
        inner.on_record(change).await;
    }
}

async fn watch_events(weak: Weak<ManagerInner>, mut events: broadcast::Receiver<CallEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Call event stream lagged, {} events skipped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = weak.upgrade() else { break };
        inner.on_event(event);
    }
}

async fn watch_config(
    weak: Weak<ManagerInner>,
    store: ConfigStore,
    mut changes: broadcast::Receiver<ConfigChange>,
) {
    loop {
        match changes.recv().await {
            // Lagging still means the latest config should be read
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
        let Some(inner) = weak.upgrade() else { break };
        let config = store.get();
        inner.config.store(Arc::new(config.call.clone()));
        inner.engine.apply_config(&config);
        info!("Call settings for {} reloaded", inner.local_id);
    }
}
