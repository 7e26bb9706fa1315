//! In-process peer connection
//!
//! Follows the same ordering rules as a real connection (an answer needs a
//! remote offer, candidates need a remote description) without touching the
//! network. The state reaches `connecting` once both descriptions are set and
//! `connected` after the first remote candidate is applied.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ConnectionState, PeerConnection, PeerConnector, PeerEvent, PeerEvents, SenderId};
use crate::config::IceConfig;
use crate::error::{CallError, Result};
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

const TRACK_ATTR: &str = "a=x-track:";

/// Candidates gathered per local description
const DEFAULT_CANDIDATES: u16 = 2;

/// Creates [`SimulatedPeer`]s and keeps them reachable for fault injection
pub struct SimulatedConnector {
    candidates_per_description: u16,
    refuse: AtomicBool,
    peers: Mutex<Vec<Arc<SimulatedPeer>>>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::with_candidates(DEFAULT_CANDIDATES)
    }

    /// Connector whose peers gather `count` candidates per local description
    pub fn with_candidates(count: u16) -> Self {
        Self {
            candidates_per_description: count,
            refuse: AtomicBool::new(false),
            peers: Mutex::new(vec![]),
        }
    }

    /// Make `connect` fail, as if the connection object could not be built
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Every peer created so far
    pub fn peers(&self) -> Vec<Arc<SimulatedPeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<SimulatedPeer>> {
        self.peers.lock().last().cloned()
    }
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnector for SimulatedConnector {
    async fn connect(
        &self,
        _ice: &IceConfig,
        label: &str,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents)> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(CallError::WebRtc(
                "Failed to create peer connection: refused".to_string(),
            ));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(SimulatedPeer {
            label: label.to_string(),
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            candidates_per_description: self.candidates_per_description,
            state: Mutex::new(SimState::default()),
            events: events_tx,
        });
        self.peers.lock().push(peer.clone());

        Ok((peer, events_rx))
    }
}

struct SimState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<(SenderId, Arc<MediaTrack>)>,
    next_sender: u32,
    remote_candidates: Vec<IceCandidate>,
    gathered: u32,
    connection: ConnectionState,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            local: None,
            remote: None,
            senders: vec![],
            next_sender: 0,
            remote_candidates: vec![],
            gathered: 0,
            connection: ConnectionState::New,
        }
    }
}

impl SimState {
    fn is_finished(&self) -> bool {
        self.connection.is_terminal()
    }

    /// Recompute the connection state; returns the new state if it changed
    fn recompute(&mut self) -> Option<ConnectionState> {
        if self.is_finished() {
            return None;
        }
        let next = match (&self.local, &self.remote) {
            (Some(_), Some(_)) if !self.remote_candidates.is_empty() => ConnectionState::Connected,
            (Some(_), Some(_)) => ConnectionState::Connecting,
            _ => self.connection,
        };
        if next == self.connection {
            return None;
        }
        self.connection = next;
        Some(next)
    }
}

/// Simulated connection
pub struct SimulatedPeer {
    label: String,
    session_id: String,
    candidates_per_description: u16,
    state: Mutex<SimState>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl SimulatedPeer {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, state: Option<ConnectionState>) {
        if let Some(state) = state {
            debug!("Simulated peer {} state: {}", self.label, state);
            self.emit(PeerEvent::StateChanged(state));
        }
    }

    fn ensure_open(state: &SimState) -> Result<()> {
        if state.is_finished() {
            return Err(CallError::WebRtc(format!(
                "Connection is {}",
                state.connection
            )));
        }
        Ok(())
    }

    fn describe(&self, sdp_type: SdpType, senders: &[(SenderId, Arc<MediaTrack>)]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=voxa-simulated\r\nt=0 0\r\na=x-type:{}\r\n",
            self.session_id, sdp_type
        );
        for (_, track) in senders {
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 0\r\n", track.kind()));
            sdp.push_str(&format!("{}{} {}\r\n", TRACK_ATTR, track.kind(), track.id()));
        }
        sdp
    }

    fn remote_tracks(sdp: &str) -> Vec<Arc<MediaTrack>> {
        sdp.lines()
            .filter_map(|line| line.strip_prefix(TRACK_ATTR))
            .filter_map(|rest| {
                let (kind, id) = rest.split_once(' ')?;
                let kind = match kind {
                    "audio" => TrackKind::Audio,
                    "video" => TrackKind::Video,
                    _ => return None,
                };
                Some(MediaTrack::remote(id.trim(), kind))
            })
            .collect()
    }

    /// Candidates applied from the remote side
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn force_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = self.state.lock();
            if state.is_finished() {
                None
            } else {
                state.connection = next;
                Some(next)
            }
        };
        self.emit_state(changed);
    }

    /// Simulate ICE failure
    pub fn fail(&self) {
        self.force_state(ConnectionState::Failed);
    }

    /// Simulate loss of the media path
    pub fn disconnect(&self) {
        self.force_state(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl PeerConnection for SimulatedPeer {
    fn label(&self) -> &str {
        &self.label
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<SenderId> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let id = SenderId(state.next_sender);
        state.next_sender += 1;
        state.senders.push((id, track));
        Ok(id)
    }

    fn senders(&self) -> Vec<(SenderId, Arc<MediaTrack>)> {
        self.state.lock().senders.clone()
    }

    async fn replace_track(&self, sender: SenderId, track: Arc<MediaTrack>) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let slot = state
            .senders
            .iter_mut()
            .find(|(id, _)| *id == sender)
            .ok_or_else(|| CallError::WebRtc(format!("Unknown sender {:?}", sender)))?;
        if slot.1.kind() != track.kind() {
            return Err(CallError::WebRtc(format!(
                "Cannot replace {} track with {} track",
                slot.1.kind(),
                track.kind()
            )));
        }
        slot.1 = track;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        Ok(SessionDescription::offer(
            self.describe(SdpType::Offer, &state.senders),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => Ok(SessionDescription::answer(
                self.describe(SdpType::Answer, &state.senders),
            )),
            _ => Err(CallError::WebRtc(
                "Cannot create answer without a remote offer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let (candidates, changed) = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;

            if description.sdp_type == SdpType::Answer
                && !matches!(&state.remote, Some(r) if r.sdp_type == SdpType::Offer)
            {
                return Err(CallError::WebRtc(
                    "Local answer without a remote offer".to_string(),
                ));
            }
            state.local = Some(description);

            let start = state.gathered;
            let count = u32::from(self.candidates_per_description);
            state.gathered = start.wrapping_add(count);
            let candidates: Vec<IceCandidate> = (0..count)
                .map(|i| {
                    let n = start.wrapping_add(i);
                    IceCandidate::new(format!(
                        "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
                        n,
                        2130706431u32 - (n % 65_536),
                        50_000 + (n % 10_000)
                    ))
                    .with_mid("0", 0)
                })
                .collect();
            (candidates, state.recompute())
        };

        for candidate in candidates {
            self.emit(PeerEvent::LocalCandidate(candidate));
        }
        self.emit_state(changed);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let (tracks, changed) = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;

            let local_type = state.local.as_ref().map(|d| d.sdp_type);
            match (description.sdp_type, local_type) {
                (SdpType::Offer, Some(SdpType::Offer)) => {
                    return Err(CallError::WebRtc(
                        "Remote offer while a local offer is pending".to_string(),
                    ))
                }
                (SdpType::Answer, Some(SdpType::Offer)) | (SdpType::Offer, _) => {}
                (SdpType::Answer, _) => {
                    return Err(CallError::WebRtc(
                        "Remote answer without a local offer".to_string(),
                    ))
                }
            }

            let tracks = Self::remote_tracks(&description.sdp);
            state.remote = Some(description);
            (tracks, state.recompute())
        };

        for track in tracks {
            self.emit(PeerEvent::RemoteTrack(track));
        }
        self.emit_state(changed);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let changed = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.remote.is_none() {
                return Err(CallError::WebRtc(
                    "Cannot add ICE candidate before the remote description".to_string(),
                ));
            }
            state.remote_candidates.push(candidate);
            state.recompute()
        };
        self.emit_state(changed);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn close(&self) -> Result<()> {
        let changed = {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Closed {
                None
            } else {
                state.connection = ConnectionState::Closed;
                Some(ConnectionState::Closed)
            }
        };
        self.emit_state(changed);
        Ok(())
    }
}
