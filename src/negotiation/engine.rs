//! Session negotiation engine
//!
//! Owns at most one [`NegotiationSession`] per participant and drives it
//! through media acquisition, offer/answer, trickle ICE and teardown.
//!
//! Concurrency: the session lives behind a tokio mutex. Signaling messages
//! are processed one at a time in arrival order by a single listener task;
//! connection events are handled by a per-session pump task; a watchdog ends
//! sessions that never connect. Background tasks hold weak references so an
//! engine that is dropped stops them.

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::inbox::EarlyInbox;
use super::session::{NegotiationPhase, NegotiationSession, Role, SessionSnapshot};
use crate::call::{Call, CallKind, CallStatus};
use crate::config::{AppConfig, CallConfig, IceConfig};
use crate::error::{CallError, Result};
use crate::events::{CallEvent, EndReason, EventBus, NoticeLevel};
use crate::media::{MediaConstraints, MediaControlState, MediaDevices, MediaStream};
use crate::rtc::{ConnectionState, PeerConnection, PeerConnector, PeerEvent, PeerEvents};
use crate::signaling::{SignalingEnvelope, SignalingMessage, SignalingTransport};
use crate::store::{CallStore, NewCallRecord, SignalingChannel};

/// External collaborators of an engine
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn CallStore>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
}

/// Result of dialling a call
#[derive(Debug, Clone)]
pub struct OutgoingCall {
    pub call: Call,
    pub local_stream: MediaStream,
}

/// Negotiation engine for one local participant
#[derive(Clone)]
pub struct NegotiationEngine {
    pub(super) inner: Arc<EngineInner>,
}

pub(super) struct EngineInner {
    pub(super) local_id: String,
    /// Read once per session; updates apply to the next call
    ice: ArcSwap<IceConfig>,
    call_config: ArcSwap<CallConfig>,
    /// Set while a call is being set up or is active
    engaged: AtomicBool,
    store: Arc<dyn CallStore>,
    transport: SignalingTransport,
    pub(super) devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    pub(super) events: Arc<EventBus>,
    pub(super) session: tokio::sync::Mutex<Option<NegotiationSession>>,
    pub(super) controls: Mutex<MediaControlState>,
    /// Local stream of the current session, for the synchronous toggles
    pub(super) active_stream: Mutex<Option<MediaStream>>,
    inbox: Mutex<EarlyInbox>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl NegotiationEngine {
    pub fn new(
        local_id: impl Into<String>,
        config: &AppConfig,
        backends: Backends,
        events: Arc<EventBus>,
    ) -> Self {
        let local_id = local_id.into();
        let transport = SignalingTransport::new(local_id.clone(), backends.signaling);

        Self {
            inner: Arc::new(EngineInner {
                local_id,
                ice: ArcSwap::from_pointee(config.ice.clone()),
                call_config: ArcSwap::from_pointee(config.call.clone()),
                engaged: AtomicBool::new(false),
                store: backends.store,
                transport,
                devices: backends.devices,
                connector: backends.connector,
                events,
                session: tokio::sync::Mutex::new(None),
                controls: Mutex::new(MediaControlState::default()),
                active_stream: Mutex::new(None),
                inbox: Mutex::new(EarlyInbox::new(config.call.early_message_limit)),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.inner.events.clone()
    }

    pub fn ice_config(&self) -> Arc<IceConfig> {
        self.inner.ice.load_full()
    }

    /// Use `config` for calls set up from now on
    pub fn apply_config(&self, config: &AppConfig) {
        self.inner.ice.store(Arc::new(config.ice.clone()));
        self.inner.call_config.store(Arc::new(config.call.clone()));
        debug!(
            "{} now using {} STUN / {} TURN server(s)",
            self.inner.local_id,
            config.ice.stun_servers.len(),
            config.ice.turn_servers.len()
        );
    }

    /// Subscribe to signaling addressed to the local participant
    ///
    /// Calling it again replaces the previous listener.
    pub fn start(&self) {
        let mut messages = self.inner.transport.subscribe();
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            while let Some(envelope) = messages.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_message(envelope).await;
            }
            debug!("Negotiation listener stopped");
        });

        if let Some(previous) = self.inner.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Dial `remote_id`: create the call record, acquire media and send the offer
    pub async fn initialize_call(&self, remote_id: &str, wants_video: bool) -> Result<OutgoingCall> {
        let inner = &self.inner;
        let mut slot = inner.session.lock().await;
        if let Some(active) = slot.as_ref() {
            return Err(CallError::CallInProgress(active.call_id.clone()));
        }
        if remote_id == inner.local_id {
            return Err(CallError::SignalingSetup(
                "Cannot call yourself".to_string(),
            ));
        }
        inner.set_engaged(true);

        let kind = CallKind::from_wants_video(wants_video);
        let record = match inner
            .store
            .insert_call(NewCallRecord::ringing(&inner.local_id, remote_id, kind))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                inner.set_engaged(false);
                return Err(CallError::SignalingSetup(format!(
                    "Failed to create call record: {}",
                    e
                )));
            }
        };
        info!(
            "Call {} created: {} -> {} ({})",
            record.id, inner.local_id, remote_id, kind
        );

        let mut session = NegotiationSession::new(&record.id, remote_id, Role::Initiator);
        let local_stream = match inner.setup_initiator(&mut session, wants_video).await {
            Ok(stream) => stream,
            Err(e) => {
                inner.abandon(session, &e).await;
                return Err(e);
            }
        };

        session.watchdog = Some(inner.spawn_watchdog(record.id.clone()));
        *slot = Some(session);

        Ok(OutgoingCall {
            call: record.into(),
            local_stream,
        })
    }

    /// Answer a ringing call; the offer is expected through signaling
    pub async fn answer_call(
        &self,
        call_id: &str,
        caller_id: &str,
        wants_video: bool,
    ) -> Result<MediaStream> {
        let inner = &self.inner;
        let mut slot = inner.session.lock().await;
        if let Some(active) = slot.as_ref() {
            return Err(CallError::CallInProgress(active.call_id.clone()));
        }
        inner.set_engaged(true);

        if let Err(e) = inner.mark_connecting(call_id, caller_id).await {
            inner.inbox.lock().discard(call_id);
            inner.set_engaged(false);
            return Err(e);
        }

        let mut session = NegotiationSession::new(call_id, caller_id, Role::Responder);
        let result = match inner.prepare(&mut session, wants_video).await {
            Ok(stream) => {
                session.advance(NegotiationPhase::AwaitingOffer);
                inner.replay_early(&mut session).await.map(|_| stream)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(stream) => {
                session.watchdog = Some(inner.spawn_watchdog(call_id.to_string()));
                *slot = Some(session);
                info!("Call {} answered", call_id);
                Ok(stream)
            }
            Err(e) => {
                inner.abandon(session, &e).await;
                Err(e)
            }
        }
    }

    /// Tear down the active session. A no-op when there is none.
    pub async fn end_call(&self) {
        let mut slot = self.inner.session.lock().await;
        match slot.take() {
            Some(session) => self.inner.conclude(session, EndReason::LocalHangup).await,
            None => debug!("end_call with no active session"),
        }
    }

    /// Tear down the session of `call_id` because the peer hung up
    pub async fn end_remote(&self, call_id: &str) -> bool {
        self.inner.finish(call_id, EndReason::RemoteHangup).await
    }

    /// Whether a session exists or is being set up
    pub fn is_busy(&self) -> bool {
        self.inner.engaged.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(SessionSnapshot::from)
    }

    pub async fn connection_state(&self) -> Option<ConnectionState> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.connection.as_ref())
            .map(|c| c.connection_state())
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.inner.active_stream.lock().clone()
    }

    pub async fn remote_stream(&self) -> Option<MediaStream> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.remote_stream.clone())
    }

    pub fn controls(&self) -> MediaControlState {
        *self.inner.controls.lock()
    }

    /// Drop signaling held for a call that will not be answered
    pub fn discard_early(&self, call_id: &str) {
        self.inner.inbox.lock().discard(call_id);
    }

    pub fn early_messages(&self, call_id: &str) -> usize {
        self.inner.inbox.lock().pending(call_id)
    }
}

impl EngineInner {
    async fn setup_initiator(
        self: &Arc<Self>,
        session: &mut NegotiationSession,
        wants_video: bool,
    ) -> Result<MediaStream> {
        let stream = self.prepare(session, wants_video).await?;
        let connection = connection_of(session)?;

        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        session.advance(NegotiationPhase::OfferSent);

        self.deliver(
            &session.remote_id,
            &session.call_id,
            &SignalingMessage::Offer { sdp: offer },
        )
        .await;
        Ok(stream)
    }

    /// Acquire media, create the connection and attach the local tracks
    async fn prepare(
        self: &Arc<Self>,
        session: &mut NegotiationSession,
        wants_video: bool,
    ) -> Result<MediaStream> {
        session.advance(NegotiationPhase::AcquiringMedia);
        let stream = self
            .devices
            .get_user_media(MediaConstraints::call(wants_video))
            .await
            .map_err(|e| match e {
                CallError::MediaAccess(_) => e,
                other => CallError::MediaAccess(other.to_string()),
            })?;
        session.local_stream = Some(stream.clone());

        {
            let controls = self.controls.lock();
            controls.apply_to(&stream);
            *self.active_stream.lock() = Some(stream.clone());
        }
        self.events.publish(CallEvent::LocalStreamReady {
            call_id: session.call_id.clone(),
            stream: stream.clone(),
        });

        let label = format!("{}/{}", self.local_id, session.call_id);
        let ice = self.ice.load_full();
        let (connection, peer_events) = self.connector.connect(&ice, &label).await?;
        session.connection = Some(connection.clone());
        session.advance(NegotiationPhase::ConnectionCreated);

        for track in stream.tracks() {
            connection.add_track(track).await?;
        }

        session.pump = Some(self.spawn_pump(
            session.call_id.clone(),
            session.remote_id.clone(),
            session.remote_stream.clone(),
            peer_events,
        ));
        Ok(stream)
    }

    /// Validate the record of a call being answered and move it to connecting
    async fn mark_connecting(&self, call_id: &str, caller_id: &str) -> Result<()> {
        let record = self
            .store
            .get_call(call_id)
            .await
            .map_err(|e| CallError::SignalingSetup(format!("Failed to load call record: {}", e)))?
            .ok_or_else(|| CallError::SignalingSetup(format!("Call {} not found", call_id)))?;

        if record.caller_id != caller_id || record.receiver_id != self.local_id {
            return Err(CallError::SignalingSetup(format!(
                "Call {} is not from {} to {}",
                call_id, caller_id, self.local_id
            )));
        }
        if !record.status.can_advance_to(CallStatus::Connecting) {
            return Err(CallError::SignalingSetup(format!(
                "Call {} is already {}",
                call_id, record.status
            )));
        }

        let advanced = self
            .store
            .update_call_status(call_id, CallStatus::Connecting, None)
            .await
            .map_err(|e| CallError::SignalingSetup(format!("Failed to update call record: {}", e)))?;
        if !advanced {
            // Cancelled between the read above and the write
            return Err(CallError::SignalingSetup(format!(
                "Call {} ended before it was answered",
                call_id
            )));
        }
        Ok(())
    }

    async fn replay_early(self: &Arc<Self>, session: &mut NegotiationSession) -> Result<()> {
        let early = self.inbox.lock().take(&session.call_id);
        if !early.is_empty() {
            debug!(
                "Replaying {} early messages for call {}",
                early.len(),
                session.call_id
            );
        }
        for envelope in early {
            match self.apply(session, envelope).await {
                Ok(()) => {}
                Err(CallError::ProtocolViolation(reason)) => {
                    warn!("Dropping early message for call {}: {}", session.call_id, reason)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn handle_message(self: &Arc<Self>, envelope: SignalingEnvelope) {
        let mut slot = self.session.lock().await;

        let Some(session) = slot.as_mut() else {
            debug!(
                "No session for call {} yet, holding {} from {}",
                envelope.call_id,
                envelope.message.kind(),
                envelope.sender_id
            );
            self.inbox.lock().stash(envelope);
            return;
        };

        if session.call_id != envelope.call_id {
            warn!(
                "Dropping {} for call {}: active call is {}",
                envelope.message.kind(),
                envelope.call_id,
                session.call_id
            );
            return;
        }

        match self.apply(session, envelope).await {
            Ok(()) => {}
            Err(CallError::ProtocolViolation(reason)) => {
                warn!("Protocol violation on call {}: {}", session.call_id, reason);
            }
            Err(e) => {
                error!("Negotiation failed on call {}: {}", session.call_id, e);
                if let Some(session) = slot.take() {
                    self.conclude(session, EndReason::NegotiationFailed).await;
                }
            }
        }
    }

    /// Apply one signaling message to the session
    async fn apply(
        self: &Arc<Self>,
        session: &mut NegotiationSession,
        envelope: SignalingEnvelope,
    ) -> Result<()> {
        if envelope.sender_id != session.remote_id {
            return Err(CallError::ProtocolViolation(format!(
                "{} from {} who is not part of the call",
                envelope.message.kind(),
                envelope.sender_id
            )));
        }
        let connection = connection_of(session)?;

        match envelope.message {
            SignalingMessage::Offer { sdp } => {
                if session.role != Role::Responder {
                    return Err(CallError::ProtocolViolation(
                        "offer received while initiating".to_string(),
                    ));
                }
                if session.remote_description_set {
                    return Err(CallError::ProtocolViolation("duplicate offer".to_string()));
                }

                connection.set_remote_description(sdp).await?;
                session.remote_description_set = true;
                self.flush_candidates(session, connection.as_ref()).await;

                let answer = connection.create_answer().await?;
                connection.set_local_description(answer.clone()).await?;
                session.advance(NegotiationPhase::DescriptionsExchanged);

                self.deliver(
                    &session.remote_id,
                    &session.call_id,
                    &SignalingMessage::Answer { sdp: answer },
                )
                .await;
            }
            SignalingMessage::Answer { sdp } => {
                if session.role != Role::Initiator || session.phase != NegotiationPhase::OfferSent {
                    return Err(CallError::ProtocolViolation(format!(
                        "answer received in phase {}",
                        session.phase
                    )));
                }

                connection.set_remote_description(sdp).await?;
                session.remote_description_set = true;
                self.flush_candidates(session, connection.as_ref()).await;
                session.advance(NegotiationPhase::DescriptionsExchanged);
            }
            SignalingMessage::Candidate { candidate } => {
                if !session.remote_description_set {
                    debug!(
                        "Buffering candidate for call {} until the remote description is set",
                        session.call_id
                    );
                    session.pending_candidates.push(candidate);
                } else if let Err(e) = connection.add_ice_candidate(candidate).await {
                    warn!("Failed to add ICE candidate on call {}: {}", session.call_id, e);
                }
            }
        }
        Ok(())
    }

    async fn flush_candidates(&self, session: &mut NegotiationSession, connection: &dyn PeerConnection) {
        let pending = std::mem::take(&mut session.pending_candidates);
        if pending.is_empty() {
            return;
        }
        debug!(
            "Applying {} buffered candidates on call {}",
            pending.len(),
            session.call_id
        );
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!(
                    "Failed to add buffered ICE candidate on call {}: {}",
                    session.call_id, e
                );
            }
        }
    }

    /// Send a signaling message; delivery failures are logged, not returned
    async fn deliver(&self, remote_id: &str, call_id: &str, message: &SignalingMessage) {
        if let Err(e) = self.transport.send(remote_id, call_id, message).await {
            warn!(
                "Dropped {} for call {}: {} (the connect timeout will end the call)",
                message.kind(),
                call_id,
                e
            );
        }
    }

    fn spawn_pump(
        self: &Arc<Self>,
        call_id: String,
        remote_id: String,
        remote_stream: MediaStream,
        mut peer_events: PeerEvents,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                let Some(inner) = weak.upgrade() else { break };

                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        inner
                            .deliver(&remote_id, &call_id, &SignalingMessage::Candidate { candidate })
                            .await;
                    }
                    PeerEvent::RemoteTrack(track) => {
                        if remote_stream.add_track(track.clone()) {
                            info!("Remote {} track {} on call {}", track.kind(), track.id(), call_id);
                            inner.events.publish(CallEvent::RemoteStreamUpdated {
                                call_id: call_id.clone(),
                                stream: remote_stream.clone(),
                                track,
                            });
                        }
                    }
                    PeerEvent::StateChanged(state) => {
                        info!("Call {} connection state: {}", call_id, state);
                        inner.events.publish(CallEvent::ConnectionStateChanged {
                            call_id: call_id.clone(),
                            state,
                        });

                        if state.is_terminal() {
                            // Teardown aborts this task, so it runs on its own
                            let call_id = call_id.clone();
                            tokio::spawn(async move {
                                inner.finish(&call_id, EndReason::ConnectionLost(state)).await;
                            });
                            break;
                        }
                        inner.on_connection_state(&call_id, state).await;
                    }
                }
            }
        })
    }

    async fn on_connection_state(&self, call_id: &str, state: ConnectionState) {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut().filter(|s| s.call_id == call_id) else {
            return;
        };

        match state {
            ConnectionState::Connecting => {
                session.advance(NegotiationPhase::IceExchanging);
            }
            ConnectionState::Connected => {
                if !session.advance(NegotiationPhase::Connected) {
                    return;
                }
                if let Some(watchdog) = session.watchdog.take() {
                    watchdog.abort();
                }
                // Persisted under the session lock so it cannot overtake teardown
                match self
                    .store
                    .update_call_status(call_id, CallStatus::Connected, None)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        // The record already ended, e.g. the peer hung up first
                        info!("Call {} connected after its record ended", call_id);
                        return;
                    }
                    Err(e) => {
                        error!("Failed to persist connected status of call {}: {}", call_id, e);
                    }
                }
                info!("Call {} connected", call_id);
                self.events.publish(CallEvent::CallStatusChanged {
                    call_id: call_id.to_string(),
                    status: CallStatus::Connected,
                });
            }
            _ => {}
        }
    }

    fn spawn_watchdog(self: &Arc<Self>, call_id: String) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout = self.call_config.load().connect_timeout();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            warn!("Call {} not connected after {:?}", call_id, timeout);
            tokio::spawn(async move {
                inner.finish(&call_id, EndReason::Timeout).await;
            });
        })
    }

    /// End the session of `call_id` if it is still the active one
    async fn finish(&self, call_id: &str, reason: EndReason) -> bool {
        let mut slot = self.session.lock().await;
        if !matches!(slot.as_ref(), Some(s) if s.call_id == call_id) {
            return false;
        }
        match slot.take() {
            Some(session) => {
                self.conclude(session, reason).await;
                true
            }
            None => false,
        }
    }

    /// Release everything the session holds and persist the end.
    /// Callers hold the session lock.
    async fn conclude(&self, mut session: NegotiationSession, reason: EndReason) {
        let call_id = session.call_id.clone();
        session.advance(closing_phase(reason));

        session.dismantle().release().await;
        self.reset_local_state(&call_id);
        self.persist_ended(&call_id).await;

        info!("Call {} ended: {}", call_id, reason);
        self.events.publish(CallEvent::CallStatusChanged {
            call_id: call_id.clone(),
            status: CallStatus::Ended,
        });
        match reason {
            EndReason::LocalHangup | EndReason::RemoteHangup => {}
            EndReason::ConnectionLost(_) | EndReason::Timeout => {
                let failure = CallError::ConnectionFailure(reason.to_string());
                self.events
                    .publish(CallEvent::notice(NoticeLevel::Warning, failure.to_string()));
            }
            EndReason::NegotiationFailed => {
                self.events.publish(CallEvent::notice(
                    NoticeLevel::Warning,
                    format!("Call ended: {}", reason),
                ));
            }
        }
        self.events.publish(CallEvent::SessionEnded { call_id, reason });
    }

    /// Clean up a session that failed during setup
    async fn abandon(&self, mut session: NegotiationSession, cause: &CallError) {
        let call_id = session.call_id.clone();
        error!("Call {} setup failed: {}", call_id, cause);

        session.dismantle().release().await;
        self.reset_local_state(&call_id);
        self.persist_ended(&call_id).await;

        self.events.publish(CallEvent::notice(
            NoticeLevel::Error,
            format!("Call failed: {}", cause),
        ));
        self.events.publish(CallEvent::CallStatusChanged {
            call_id,
            status: CallStatus::Ended,
        });
    }

    fn set_engaged(&self, engaged: bool) {
        self.engaged.store(engaged, Ordering::SeqCst);
    }

    fn reset_local_state(&self, call_id: &str) {
        self.set_engaged(false);
        *self.active_stream.lock() = None;
        *self.controls.lock() = MediaControlState::default();
        self.inbox.lock().discard(call_id);
    }

    async fn persist_ended(&self, call_id: &str) {
        if let Err(e) = self
            .store
            .update_call_status(call_id, CallStatus::Ended, Some(Utc::now()))
            .await
        {
            error!("Failed to mark call {} ended: {}", call_id, e);
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
        if let Some(mut session) = self.session.get_mut().take() {
            let dismantled = session.dismantle();
            if let Some(stream) = dismantled.screen_stream {
                stream.stop_all();
            }
            if let Some(stream) = dismantled.local_stream {
                stream.stop_all();
            }
        }
    }
}

/// Terminal phase a session settles in when it ends for `reason`
fn closing_phase(reason: EndReason) -> NegotiationPhase {
    match reason {
        EndReason::ConnectionLost(ConnectionState::Disconnected) => NegotiationPhase::Disconnected,
        EndReason::ConnectionLost(ConnectionState::Failed)
        | EndReason::Timeout
        | EndReason::NegotiationFailed => NegotiationPhase::Failed,
        _ => NegotiationPhase::Closed,
    }
}

fn connection_of(session: &NegotiationSession) -> Result<Arc<dyn PeerConnection>> {
    session.connection.clone().ok_or_else(|| {
        CallError::ProtocolViolation(format!("call {} has no connection yet", session.call_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{SyntheticDevices, TrackSource};
    use crate::rtc::SimulatedConnector;
    use crate::signaling::{IceCandidate, SessionDescription};
    use crate::store::MemoryStore;
    use std::future::Future;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Participant {
        engine: NegotiationEngine,
        devices: Arc<SyntheticDevices>,
        connector: Arc<SimulatedConnector>,
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.ice = IceConfig::host_only();
        config.call.end_grace_ms = 20;
        config.call.connect_timeout_ms = 5_000;
        config
    }

    fn participant(id: &str, store: &Arc<MemoryStore>, config: &AppConfig) -> Participant {
        let devices = Arc::new(SyntheticDevices::new());
        let connector = Arc::new(SimulatedConnector::new());
        let engine = NegotiationEngine::new(
            id,
            config,
            Backends {
                store: store.clone(),
                signaling: store.clone(),
                devices: devices.clone(),
                connector: connector.clone(),
            },
            Arc::new(EventBus::new()),
        );
        engine.start();
        Participant {
            engine,
            devices,
            connector,
        }
    }

    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn record_status(store: &MemoryStore, call_id: &str) -> CallStatus {
        store.get_call(call_id).await.unwrap().unwrap().status
    }

    /// u1 dials u2 and u2 answers; returns the call id once both are connected
    async fn connect_pair(
        store: &Arc<MemoryStore>,
        u1: &Participant,
        u2: &Participant,
        wants_video: bool,
    ) -> String {
        let outgoing = u1.engine.initialize_call("u2", wants_video).await.unwrap();
        let call_id = outgoing.call.id.clone();
        assert_eq!(outgoing.call.status, CallStatus::Ringing);
        assert_eq!(record_status(store, &call_id).await, CallStatus::Ringing);

        // The offer reaches u2 before it answers and waits in the inbox
        eventually("offer held by callee", || async {
            u2.engine.early_messages(&call_id) > 0
        })
        .await;

        u2.engine
            .answer_call(&call_id, "u1", wants_video)
            .await
            .unwrap();

        eventually("both sides connected", || async {
            u1.engine.connection_state().await == Some(ConnectionState::Connected)
                && u2.engine.connection_state().await == Some(ConnectionState::Connected)
        })
        .await;
        eventually("record connected", || async {
            record_status(store, &call_id).await == CallStatus::Connected
        })
        .await;
        call_id
    }

    #[tokio::test]
    async fn test_audio_and_video_calls_connect() {
        for wants_video in [false, true] {
            let store = Arc::new(MemoryStore::new());
            let config = test_config();
            let u1 = participant("u1", &store, &config);
            let u2 = participant("u2", &store, &config);

            let call_id = connect_pair(&store, &u1, &u2, wants_video).await;

            let expected_tracks = if wants_video { 2 } else { 1 };
            eventually("remote tracks", || async {
                u2.engine.remote_stream().await.map(|s| s.len()) == Some(expected_tracks)
                    && u1.engine.remote_stream().await.map(|s| s.len()) == Some(expected_tracks)
            })
            .await;

            let snapshot = u1.engine.snapshot().await.unwrap();
            assert_eq!(snapshot.call_id, call_id);
            assert_eq!(snapshot.role, Role::Initiator);
            assert_eq!(snapshot.phase, NegotiationPhase::Connected);
            assert_eq!(snapshot.pending_candidates, 0);
            assert_eq!(
                u2.engine.snapshot().await.unwrap().phase,
                NegotiationPhase::Connected
            );
        }
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent_and_releases_media() {
        let store = Arc::new(MemoryStore::new());
        let config = test_config();
        let u1 = participant("u1", &store, &config);
        let u2 = participant("u2", &store, &config);
        let call_id = connect_pair(&store, &u1, &u2, true).await;

        let mut events = u1.engine.events().subscribe();
        u1.engine.end_call().await;
        let first = store.get_call(&call_id).await.unwrap().unwrap();
        assert_eq!(first.status, CallStatus::Ended);
        assert!(first.ended_at.is_some());

        u1.engine.end_call().await;
        let second = store.get_call(&call_id).await.unwrap().unwrap();
        assert_eq!(second, first);

        assert!(u1.engine.snapshot().await.is_none());
        assert!(u1.engine.local_stream().is_none());
        assert!(u1.devices.live_tracks().is_empty());
        assert!(!u1.devices.issued_tracks().is_empty());
        assert_eq!(
            u1.connector.last_peer().unwrap().connection_state(),
            ConnectionState::Closed
        );

        let mut ended = 0;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::SessionEnded { reason, .. } = event {
                assert_eq!(reason, EndReason::LocalHangup);
                ended += 1;
            }
        }
        assert_eq!(ended, 1);

        u2.engine.end_call().await;
        assert!(u2.devices.live_tracks().is_empty());
    }

    /// Callee side driven by hand, to control what reaches the caller and when
    struct ManualCallee {
        transport: SignalingTransport,
        peer: Arc<dyn PeerConnection>,
        answer: SessionDescription,
        candidates: Vec<IceCandidate>,
        caller_candidates: Vec<IceCandidate>,
    }

    impl ManualCallee {
        async fn send(&self, call_id: &str, message: SignalingMessage) {
            self.transport.send("u1", call_id, &message).await.unwrap();
        }
    }

    /// Take u1's offer and two candidates off `inbox` and prepare an answer
    async fn manual_answer(
        transport: SignalingTransport,
        mut inbox: mpsc::UnboundedReceiver<SignalingEnvelope>,
        call_id: &str,
    ) -> ManualCallee {
        let mut offer = None;
        let mut caller_candidates = vec![];
        while offer.is_none() || caller_candidates.len() < 2 {
            let envelope = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(envelope.call_id, call_id);
            match envelope.message {
                SignalingMessage::Offer { sdp } => offer = Some(sdp),
                SignalingMessage::Candidate { candidate } => caller_candidates.push(candidate),
                SignalingMessage::Answer { .. } => panic!("caller sent an answer"),
            }
        }

        let connector = SimulatedConnector::new();
        let (peer, mut peer_events) = connector
            .connect(&IceConfig::host_only(), "u2")
            .await
            .unwrap();
        peer.add_track(crate::media::MediaTrack::new(
            crate::media::TrackKind::Audio,
            TrackSource::Microphone,
            "u2-mic",
        ))
        .await
        .unwrap();
        peer.set_remote_description(offer.unwrap()).await.unwrap();
        let answer = peer.create_answer().await.unwrap();
        peer.set_local_description(answer.clone()).await.unwrap();

        let mut candidates = vec![];
        while let Ok(event) = peer_events.try_recv() {
            if let PeerEvent::LocalCandidate(candidate) = event {
                candidates.push(candidate);
            }
        }
        assert_eq!(candidates.len(), 2);

        ManualCallee {
            transport,
            peer,
            answer,
            candidates,
            caller_candidates,
        }
    }

    #[tokio::test]
    async fn test_candidates_before_answer_are_buffered() {
        let store = Arc::new(MemoryStore::new());
        let config = test_config();
        let u1 = participant("u1", &store, &config);

        let u2_transport = SignalingTransport::new("u2", store.clone());
        let u2_inbox = u2_transport.subscribe();
        let outgoing = u1.engine.initialize_call("u2", false).await.unwrap();
        let call_id = outgoing.call.id;
        let callee = manual_answer(u2_transport, u2_inbox, &call_id).await;

        // Candidates first, answer last
        for candidate in callee.candidates.clone() {
            callee
                .send(&call_id, SignalingMessage::Candidate { candidate })
                .await;
        }
        eventually("candidates buffered", || async {
            u1.engine.snapshot().await.map(|s| s.pending_candidates) == Some(2)
        })
        .await;
        assert_eq!(
            u1.engine.snapshot().await.unwrap().phase,
            NegotiationPhase::OfferSent
        );

        callee
            .send(&call_id, SignalingMessage::Answer { sdp: callee.answer.clone() })
            .await;
        for candidate in callee.caller_candidates.clone() {
            callee.peer.add_ice_candidate(candidate).await.unwrap();
        }

        eventually("caller connected", || async {
            u1.engine.connection_state().await == Some(ConnectionState::Connected)
        })
        .await;
        assert_eq!(callee.peer.connection_state(), ConnectionState::Connected);
        assert_eq!(
            u1.engine.snapshot().await.unwrap().pending_candidates,
            0
        );
        assert_eq!(
            u1.connector.last_peer().unwrap().remote_candidates().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_late_connect_does_not_reopen_ended_record() {
        let store = Arc::new(MemoryStore::new());
        let config = test_config();
        let u1 = participant("u1", &store, &config);

        let u2_transport = SignalingTransport::new("u2", store.clone());
        let u2_inbox = u2_transport.subscribe();
        let outgoing = u1.engine.initialize_call("u2", false).await.unwrap();
        let call_id = outgoing.call.id;
        let callee = manual_answer(u2_transport, u2_inbox, &call_id).await;

        // The peer hangs up just before the connection comes up
        store
            .update_call_status(&call_id, CallStatus::Ended, Some(Utc::now()))
            .await
            .unwrap();
        let mut feed = store.subscribe_calls();
        let mut events = u1.engine.events().subscribe();

        callee
            .send(&call_id, SignalingMessage::Answer { sdp: callee.answer.clone() })
            .await;
        for candidate in callee.candidates.clone() {
            callee
                .send(&call_id, SignalingMessage::Candidate { candidate })
                .await;
        }
        for candidate in callee.caller_candidates.clone() {
            callee.peer.add_ice_candidate(candidate).await.unwrap();
        }

        // The connected write happens under the session lock, so once the
        // snapshot shows the phase the store has already been asked
        eventually("caller reaches connected", || async {
            u1.engine.snapshot().await.map(|s| s.phase) == Some(NegotiationPhase::Connected)
        })
        .await;

        let record = store.get_call(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());
        assert!(feed.try_recv().is_err());
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(
                event,
                CallEvent::CallStatusChanged { status: CallStatus::Connected, .. }
            ));
        }

        u1.engine.end_call().await;
        assert_eq!(record_status(&store, &call_id).await, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_busy_tracks_session_not_lock() {
        let store = Arc::new(MemoryStore::new());
        let u1 = participant("u1", &store, &test_config());

        {
            // The listener takes this lock for every signaling row
            let _held = u1.engine.inner.session.lock().await;
            assert!(!u1.engine.is_busy());
        }

        u1.engine.initialize_call("u2", false).await.unwrap();
        assert!(u1.engine.is_busy());
        u1.engine.end_call().await;
        assert!(!u1.engine.is_busy());

        store.set_offline(true);
        assert!(u1.engine.initialize_call("u2", false).await.is_err());
        assert!(!u1.engine.is_busy());
    }

    #[tokio::test]
    async fn test_refused_connection_releases_media_when_dialling() {
        let store = Arc::new(MemoryStore::new());
        let u1 = participant("u1", &store, &test_config());
        u1.connector.set_refuse(true);

        let err = u1.engine.initialize_call("u2", true).await.unwrap_err();
        assert!(matches!(err, CallError::WebRtc(_)));

        // Media was acquired before the connection failed
        assert_eq!(u1.devices.issued_tracks().len(), 2);
        assert!(u1.devices.live_tracks().is_empty());
        let calls = store.list_calls("u1", 10).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, CallStatus::Ended);
        assert!(calls[0].ended_at.is_some());
        assert!(u1.engine.snapshot().await.is_none());
        assert!(u1.engine.local_stream().is_none());
        assert!(!u1.engine.is_busy());
    }

    #[tokio::test]
    async fn test_refused_connection_releases_media_when_answering() {
        let store = Arc::new(MemoryStore::new());
        let config = test_config();
        let u1 = participant("u1", &store, &config);
        let u2 = participant("u2", &store, &config);
        u2.connector.set_refuse(true);

        let outgoing = u1.engine.initialize_call("u2", true).await.unwrap();
        let err = u2
            .engine
            .answer_call(&outgoing.call.id, "u1", true)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::WebRtc(_)));

        assert!(!u2.devices.issued_tracks().is_empty());
        assert!(u2.devices.live_tracks().is_empty());
        assert!(u2.engine.snapshot().await.is_none());
        assert!(!u2.engine.is_busy());
        let record = store.get_call(&outgoing.call.id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());

        u1.engine.end_call().await;
    }

    #[tokio::test]
    async fn test_disconnect_ends_call() {
        let store = Arc::new(MemoryStore::new());
        let config = test_config();
        let u1 = participant("u1", &store, &config);
        let u2 = participant("u2", &store, &config);
        let call_id = connect_pair(&store, &u1, &u2, true).await;

        let mut events = u1.engine.events().subscribe();
        u1.connector.last_peer().unwrap().disconnect();

        eventually("session torn down", || async { u1.engine.snapshot().await.is_none() }).await;
        let record = store.get_call(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());
        assert!(u1.devices.live_tracks().is_empty());
        assert!(!u1.engine.is_busy());

        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::SessionEnded { reason: r, .. } = event {
                reason = Some(r);
            }
        }
        let reason = reason.unwrap();
        assert_eq!(reason, EndReason::ConnectionLost(ConnectionState::Disconnected));
        assert_eq!(closing_phase(reason), NegotiationPhase::Disconnected);
        assert_eq!(closing_phase(EndReason::Timeout), NegotiationPhase::Failed);
        assert_eq!(closing_phase(EndReason::LocalHangup), NegotiationPhase::Closed);

        u2.engine.end_call().await;
    }

    #[tokio::test]
    async fn test_media_denied_ends_record_and_holds_nothing() {
        let store = Arc::new(MemoryStore::new());
        let u1 = participant("u1", &store, &test_config());
        u1.devices.set_permission_denied(true);

        let err = u1.engine.initialize_call("u2", true).await.unwrap_err();
        assert!(matches!(err, CallError::MediaAccess(_)));

        let calls = store.list_calls("u1", 10).await.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, CallStatus::Ended);
        assert!(calls[0].ended_at.is_some());
        assert!(u1.devices.live_tracks().is_empty());
        assert!(u1.engine.snapshot().await.is_none());
        assert!(!u1.engine.is_busy());
    }

    #[tokio::test]
    async fn test_answer_without_camera_fails_cleanly() {
        let store = Arc::new(MemoryStore::new());
        let u1 = participant("u1", &store, &test_config());
        let u2 = participant("u2", &store, &test_config());
        u2.devices.set_camera_available(false);

        let outgoing = u1.engine.initialize_call("u2", true).await.unwrap();
        let err = u2
            .engine
            .answer_call(&outgoing.call.id, "u1", true)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::MediaAccess(_)));
        assert!(u2.devices.live_tracks().is_empty());
        assert!(u2.engine.snapshot().await.is_none());
        assert_eq!(
            record_status(&store, &outgoing.call.id).await,
            CallStatus::Ended
        );

        u1.engine.end_call().await;
    }

    #[tokio::test]
    async fn test_record_failure_is_signaling_setup_error() {
        let store = Arc::new(MemoryStore::new());
        let u1 = participant("u1", &store, &test_config());
        store.set_offline(true);

        let err = u1.engine.initialize_call("u2", false).await.unwrap_err();
        assert!(matches!(err, CallError::SignalingSetup(_)));
        assert!(u1.devices.issued_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_second_call_is_rejected_while_active() {
        let store = Arc::new(MemoryStore::new());
        let u1 = participant("u1", &store, &test_config());

        u1.engine.initialize_call("u2", false).await.unwrap();
        assert!(u1.engine.is_busy());
        let err = u1.engine.initialize_call("u3", false).await.unwrap_err();
        assert!(matches!(err, CallError::CallInProgress(_)));

        u1.engine.end_call().await;
    }

    #[tokio::test]
    async fn test_connection_failure_ends_call() {
        let store = Arc::new(MemoryStore::new());
        let config = test_config();
        let u1 = participant("u1", &store, &config);
        let u2 = participant("u2", &store, &config);
        let call_id = connect_pair(&store, &u1, &u2, false).await;

        let mut events = u1.engine.events().subscribe();
        u1.connector.last_peer().unwrap().fail();

        eventually("session torn down", || async { u1.engine.snapshot().await.is_none() }).await;
        let record = store.get_call(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());
        assert!(u1.devices.live_tracks().is_empty());

        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::SessionEnded { reason: r, .. } = event {
                reason = Some(r);
            }
        }
        assert_eq!(
            reason,
            Some(EndReason::ConnectionLost(ConnectionState::Failed))
        );

        u2.engine.end_call().await;
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let store = Arc::new(MemoryStore::new());
        let mut config = test_config();
        config.call.connect_timeout_ms = 100;
        let u1 = participant("u1", &store, &config);

        let outgoing = u1.engine.initialize_call("nobody", false).await.unwrap();
        eventually("timeout teardown", || async { u1.engine.snapshot().await.is_none() }).await;

        assert_eq!(
            record_status(&store, &outgoing.call.id).await,
            CallStatus::Ended
        );
        assert!(u1.devices.live_tracks().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_messages_are_dropped() {
        let store = Arc::new(MemoryStore::new());
        let config = test_config();
        let u1 = participant("u1", &store, &config);
        let u2 = participant("u2", &store, &config);
        let call_id = connect_pair(&store, &u1, &u2, false).await;

        let stranger = SignalingTransport::new("u3", store.clone());
        let u2_raw = SignalingTransport::new("u2", store.clone());

        // Offer to the initiator, a second answer, and a message from outside the call
        u2_raw
            .send("u1", &call_id, &SignalingMessage::Offer {
                sdp: SessionDescription::offer("v=0"),
            })
            .await
            .unwrap();
        u2_raw
            .send("u1", &call_id, &SignalingMessage::Answer {
                sdp: SessionDescription::answer("v=0"),
            })
            .await
            .unwrap();
        stranger
            .send("u1", &call_id, &SignalingMessage::Answer {
                sdp: SessionDescription::answer("v=0"),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = u1.engine.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, NegotiationPhase::Connected);
        assert_eq!(
            u1.engine.connection_state().await,
            Some(ConnectionState::Connected)
        );

        u1.engine.end_call().await;
        u2.engine.end_call().await;
    }

    #[tokio::test]
    async fn test_toggles_before_session_carry_over() {
        let store = Arc::new(MemoryStore::new());
        let u1 = participant("u1", &store, &test_config());

        assert!(u1.engine.toggle_mute());
        assert!(u1.engine.controls().is_muted);

        let outgoing = u1.engine.initialize_call("u2", true).await.unwrap();
        let audio = outgoing.local_stream.audio_tracks();
        assert!(!audio[0].is_enabled());
        assert!(outgoing.local_stream.video_tracks()[0].is_enabled());

        assert!(!u1.engine.toggle_camera());
        assert!(!outgoing.local_stream.video_tracks()[0].is_enabled());

        u1.engine.end_call().await;
        assert_eq!(u1.engine.controls(), MediaControlState::default());
    }
}
