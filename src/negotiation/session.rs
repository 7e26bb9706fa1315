//! Per-call negotiation state

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::media::{MediaStream, MediaTrack};
use crate::rtc::{PeerConnection, SenderId};
use crate::signaling::IceCandidate;

/// Which side of the offer/answer exchange this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Dialled the call and sends the offer
    Initiator,
    /// Answered the call and waits for the offer
    Responder,
}

/// Negotiation progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationPhase {
    Uninitialized,
    AcquiringMedia,
    ConnectionCreated,
    OfferSent,
    AwaitingOffer,
    DescriptionsExchanged,
    IceExchanging,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NegotiationPhase::Disconnected | NegotiationPhase::Failed | NegotiationPhase::Closed
        )
    }

    /// Position along the progression; the two role-specific waits share a rank
    fn rank(&self) -> u8 {
        match self {
            NegotiationPhase::Uninitialized => 0,
            NegotiationPhase::AcquiringMedia => 1,
            NegotiationPhase::ConnectionCreated => 2,
            NegotiationPhase::OfferSent | NegotiationPhase::AwaitingOffer => 3,
            NegotiationPhase::DescriptionsExchanged => 4,
            NegotiationPhase::IceExchanging => 5,
            NegotiationPhase::Connected => 6,
            NegotiationPhase::Disconnected | NegotiationPhase::Failed | NegotiationPhase::Closed => 7,
        }
    }
}

impl std::fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NegotiationPhase::Uninitialized => "uninitialized",
            NegotiationPhase::AcquiringMedia => "acquiring-media",
            NegotiationPhase::ConnectionCreated => "connection-created",
            NegotiationPhase::OfferSent => "offer-sent",
            NegotiationPhase::AwaitingOffer => "awaiting-offer",
            NegotiationPhase::DescriptionsExchanged => "descriptions-exchanged",
            NegotiationPhase::IceExchanging => "ice-exchanging",
            NegotiationPhase::Connected => "connected",
            NegotiationPhase::Disconnected => "disconnected",
            NegotiationPhase::Failed => "failed",
            NegotiationPhase::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Active screen share replacing the camera on the video sender
pub(crate) struct ScreenShare {
    pub stream: MediaStream,
    pub track: Arc<MediaTrack>,
    pub sender: SenderId,
    /// Track the sender carried before sharing started
    pub camera: Arc<MediaTrack>,
    /// Reverts when the capture is stopped from outside
    pub watcher: Option<JoinHandle<()>>,
}

/// Mutable state of one call's negotiation, owned by the engine
pub struct NegotiationSession {
    pub(crate) call_id: String,
    pub(crate) remote_id: String,
    pub(crate) role: Role,
    pub(crate) phase: NegotiationPhase,
    pub(crate) local_stream: Option<MediaStream>,
    pub(crate) remote_stream: MediaStream,
    pub(crate) connection: Option<Arc<dyn PeerConnection>>,
    pub(crate) remote_description_set: bool,
    pub(crate) pending_candidates: Vec<IceCandidate>,
    pub(crate) pump: Option<JoinHandle<()>>,
    pub(crate) watchdog: Option<JoinHandle<()>>,
    pub(crate) screen: Option<ScreenShare>,
}

impl NegotiationSession {
    pub(crate) fn new(call_id: impl Into<String>, remote_id: impl Into<String>, role: Role) -> Self {
        Self {
            call_id: call_id.into(),
            remote_id: remote_id.into(),
            role,
            phase: NegotiationPhase::Uninitialized,
            local_stream: None,
            remote_stream: MediaStream::new(),
            connection: None,
            remote_description_set: false,
            pending_candidates: vec![],
            pump: None,
            watchdog: None,
            screen: None,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Move forward to `next`; earlier phases are ignored
    pub(crate) fn advance(&mut self, next: NegotiationPhase) -> bool {
        if next.rank() <= self.phase.rank() {
            return false;
        }
        tracing::debug!("Call {} negotiation: {} -> {}", self.call_id, self.phase, next);
        self.phase = next;
        true
    }

    /// Stop background tasks and hand back everything that holds resources
    pub(crate) fn dismantle(&mut self) -> Dismantled {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        let screen = self.screen.take().map(|mut share| {
            if let Some(watcher) = share.watcher.take() {
                watcher.abort();
            }
            share.stream
        });
        self.pending_candidates.clear();

        Dismantled {
            connection: self.connection.take(),
            local_stream: self.local_stream.take(),
            screen_stream: screen,
        }
    }
}

/// Resources detached from a session, released by the engine
pub(crate) struct Dismantled {
    pub connection: Option<Arc<dyn PeerConnection>>,
    pub local_stream: Option<MediaStream>,
    pub screen_stream: Option<MediaStream>,
}

impl Dismantled {
    /// Close the connection and stop every local track
    pub async fn release(self) {
        if let Some(connection) = self.connection {
            if let Err(e) = connection.close().await {
                tracing::warn!("Failed to close connection {}: {}", connection.label(), e);
            }
        }
        if let Some(stream) = self.screen_stream {
            stream.stop_all();
        }
        if let Some(stream) = self.local_stream {
            stream.stop_all();
        }
    }
}

/// Read-only view of the session for callers outside the engine
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub call_id: String,
    pub remote_id: String,
    pub role: Role,
    pub phase: NegotiationPhase,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: MediaStream,
    pub pending_candidates: usize,
    pub is_screen_sharing: bool,
}

impl From<&NegotiationSession> for SessionSnapshot {
    fn from(session: &NegotiationSession) -> Self {
        Self {
            call_id: session.call_id.clone(),
            remote_id: session.remote_id.clone(),
            role: session.role,
            phase: session.phase,
            local_stream: session.local_stream.clone(),
            remote_stream: session.remote_stream.clone(),
            pending_candidates: session.pending_candidates.len(),
            is_screen_sharing: session.screen.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{TrackKind, TrackSource};

    #[test]
    fn test_terminal_phases() {
        assert!(!NegotiationPhase::Connected.is_terminal());
        assert!(!NegotiationPhase::OfferSent.is_terminal());
        assert!(NegotiationPhase::Failed.is_terminal());
        assert_eq!(NegotiationPhase::AwaitingOffer.to_string(), "awaiting-offer");
    }

    #[test]
    fn test_phase_only_moves_forward() {
        let mut session = NegotiationSession::new("c1", "u2", Role::Responder);
        assert!(session.advance(NegotiationPhase::AwaitingOffer));
        assert!(session.advance(NegotiationPhase::IceExchanging));
        assert!(!session.advance(NegotiationPhase::DescriptionsExchanged));
        assert_eq!(session.phase(), NegotiationPhase::IceExchanging);
        assert!(session.advance(NegotiationPhase::Connected));
    }

    #[tokio::test]
    async fn test_dismantle_releases_media() {
        let mic = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let mut session = NegotiationSession::new("c1", "u2", Role::Initiator);
        session.local_stream = Some(MediaStream::with_tracks(vec![mic.clone()]));
        session.pending_candidates.push(IceCandidate::new("candidate:0"));

        let snapshot = SessionSnapshot::from(&session);
        assert_eq!(snapshot.pending_candidates, 1);

        session.dismantle().release().await;
        assert!(!mic.is_live());
        assert!(session.local_stream.is_none());
        assert!(session.pending_candidates.is_empty());

        // Nothing left to release the second time
        session.dismantle().release().await;
    }
}
