//! Peer connection layer
//!
//! The negotiation engine drives a connection through the [`PeerConnection`]
//! trait and learns about asynchronous happenings (gathered candidates,
//! arriving remote tracks, state changes) from a [`PeerEvent`] channel.
//!
//! ```text
//! NegotiationEngine --offer/answer/candidates--> PeerConnection
//!        ^                                             |
//!        +------------- PeerEvent channel -------------+
//! ```
//!
//! Two backends:
//! - [`WebRtcConnector`]: real ICE/DTLS/SRTP through the `webrtc` crate
//! - [`SimulatedConnector`]: in-process, deterministic, for tests and demos

mod peer;
mod simulated;

pub use peer::{WebRtcConnector, WebRtcPeer};
pub use simulated::{SimulatedConnector, SimulatedPeer};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::IceConfig;
use crate::error::Result;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SessionDescription};

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Disconnected, failed and closed all end the call
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Handle to an outgoing track slot on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u32);

/// Asynchronous notifications from a connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A usable local network path was discovered
    LocalCandidate(IceCandidate),
    /// The remote peer's track arrived
    RemoteTrack(Arc<MediaTrack>),
    /// Connection state changed
    StateChanged(ConnectionState),
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// One peer-to-peer media connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn label(&self) -> &str;

    /// Attach a local track; returns the sender slot carrying it
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<SenderId>;

    /// Current sender slots and the track each is sending
    fn senders(&self) -> Vec<(SenderId, Arc<MediaTrack>)>;

    /// Swap the track of an existing sender without renegotiation
    async fn replace_track(&self, sender: SenderId, track: Arc<MediaTrack>) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Fails if no remote description has been set yet
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<()>;

    /// First sender currently carrying video
    fn video_sender(&self) -> Option<(SenderId, Arc<MediaTrack>)> {
        self.senders()
            .into_iter()
            .find(|(_, track)| track.kind() == TrackKind::Video)
    }
}

/// Factory for peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        ice: &IceConfig,
        label: &str,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents)>;
}
