//! WebRTC peer connection backed by the `webrtc` crate

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{ConnectionState, PeerConnection, PeerConnector, PeerEvent, PeerEvents, SenderId};
use crate::config::IceConfig;
use crate::error::{CallError, Result};
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// Stream id advertised for local tracks
const LOCAL_STREAM_ID: &str = "voxa-local";

/// Creates [`WebRtcPeer`] connections
#[derive(Debug, Default, Clone)]
pub struct WebRtcConnector;

impl WebRtcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        ice: &IceConfig,
        label: &str,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents)> {
        let (peer, events) = WebRtcPeer::new(ice, label).await?;
        Ok((Arc::new(peer), events))
    }
}

struct SenderSlot {
    id: SenderId,
    sender: Arc<RTCRtpSender>,
    track: Arc<MediaTrack>,
    // Kept so a capture pipeline can look up the RTP-facing track
    rtc_track: Arc<TrackLocalStaticSample>,
}

/// Peer connection wrapper with event forwarding
pub struct WebRtcPeer {
    label: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<SenderSlot>>,
    next_sender: Mutex<u32>,
    state_rx: watch::Receiver<ConnectionState>,
}

fn codec_capability(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn sample_track(track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        codec_capability(track.kind()),
        track.id().to_string(),
        LOCAL_STREAM_ID.to_string(),
    ))
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| CallError::WebRtc(format!("Invalid SDP: {}", e)))
}

fn build_ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    let mut ice_servers = vec![];

    for stun_url in &ice.stun_servers {
        ice_servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }

    for turn in &ice.turn_servers {
        if !turn.has_credentials() {
            warn!(
                "Skipping TURN server {:?} - credentials required but missing",
                turn.urls
            );
            continue;
        }
        ice_servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    ice_servers
}

impl WebRtcPeer {
    /// Create a new peer connection and wire its callbacks to a [`PeerEvent`] channel
    pub async fn new(ice: &IceConfig, label: &str) -> Result<(Self, PeerEvents)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CallError::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: build_ice_servers(ice),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| CallError::WebRtc(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);

        let peer = Self {
            label: label.to_string(),
            pc,
            senders: Mutex::new(vec![]),
            next_sender: Mutex::new(0),
            state_rx,
        };
        peer.setup_event_handlers(events_tx, Arc::new(state_tx));

        info!("WebRTC peer connection created: {}", label);
        Ok((peer, events_rx))
    }

    fn setup_event_handlers(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
        state: Arc<watch::Sender<ConnectionState>>,
    ) {
        // Connection state change handler
        let label = self.label.clone();
        let state_events = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let new_state = match s {
                    RTCPeerConnectionState::New => Some(ConnectionState::New),
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };

                if let Some(new_state) = new_state {
                    info!("Peer {} connection state: {}", label, new_state);
                    let _ = state.send(new_state);
                    let _ = state_events.send(PeerEvent::StateChanged(new_state));
                }
                Box::pin(async {})
            }));

        // ICE candidate handler (trickle)
        let candidate_events = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            debug!("ICE candidate gathered: {}", init.candidate);
                            let _ = candidate_events.send(PeerEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        // Remote track handler
        let label = self.label.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };

                if let Some(kind) = kind {
                    info!(
                        "Peer {} remote {} track: {} ({})",
                        label,
                        kind,
                        track.id(),
                        track.codec().capability.mime_type
                    );
                    let _ = events.send(PeerEvent::RemoteTrack(MediaTrack::remote(
                        track.id(),
                        kind,
                    )));
                }
                Box::pin(async {})
            },
        ));
    }

    /// RTP-facing track for a local media track, for feeding encoded samples
    pub fn sample_track_for(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.senders
            .lock()
            .iter()
            .find(|slot| slot.track.id() == track_id)
            .map(|slot| slot.rtc_track.clone())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    fn label(&self) -> &str {
        &self.label
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<SenderId> {
        let rtc_track = sample_track(&track);

        let sender = self
            .pc
            .add_track(rtc_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| CallError::WebRtc(format!("Failed to add {} track: {}", track.kind(), e)))?;

        // Drain RTCP so interceptors (NACK, reports) keep working
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let id = {
            let mut next = self.next_sender.lock();
            let id = SenderId(*next);
            *next += 1;
            id
        };

        debug!("Peer {} sending {} track {}", self.label, track.kind(), track.id());
        self.senders.lock().push(SenderSlot {
            id,
            sender,
            track,
            rtc_track,
        });

        Ok(id)
    }

    fn senders(&self) -> Vec<(SenderId, Arc<MediaTrack>)> {
        self.senders
            .lock()
            .iter()
            .map(|slot| (slot.id, slot.track.clone()))
            .collect()
    }

    async fn replace_track(&self, sender: SenderId, track: Arc<MediaTrack>) -> Result<()> {
        let rtp_sender = self
            .senders
            .lock()
            .iter()
            .find(|slot| slot.id == sender)
            .map(|slot| slot.sender.clone())
            .ok_or_else(|| CallError::WebRtc(format!("Unknown sender {:?}", sender)))?;

        let rtc_track = sample_track(&track);
        rtp_sender
            .replace_track(Some(rtc_track.clone() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| CallError::WebRtc(format!("Failed to replace track: {}", e)))?;

        if let Some(slot) = self.senders.lock().iter_mut().find(|slot| slot.id == sender) {
            slot.track = track;
            slot.rtc_track = rtc_track;
        }

        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::WebRtc(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::WebRtc(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|e| CallError::WebRtc(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| CallError::WebRtc(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| CallError::WebRtc(format!("Failed to add ICE candidate: {}", e)))
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| CallError::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServer;
    use crate::media::TrackSource;

    #[test]
    fn test_ice_servers_skip_turn_without_credentials() {
        let ice = IceConfig {
            stun_servers: vec!["stun:stun.l.google.com:19302".into()],
            turn_servers: vec![
                TurnServer::new("turn:a.example.com:3478".into(), "u".into(), "p".into()),
                TurnServer::new("turn:b.example.com:3478".into(), String::new(), String::new()),
            ],
        };
        let servers = build_ice_servers(&ice);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].urls, vec!["turn:a.example.com:3478".to_string()]);
    }

    #[tokio::test]
    async fn test_offer_lists_local_tracks() {
        let (peer, _events) = WebRtcPeer::new(&IceConfig::host_only(), "test").await.unwrap();

        let mic = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        let cam = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        peer.add_track(mic.clone()).await.unwrap();
        let video = peer.add_track(cam).await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        assert_eq!(peer.senders().len(), 2);
        assert_eq!(peer.video_sender().map(|(id, _)| id), Some(video));
        assert!(peer.sample_track_for(mic.id()).is_some());

        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_fails() {
        let (peer, _events) = WebRtcPeer::new(&IceConfig::host_only(), "test").await.unwrap();
        let result = peer
            .add_ice_candidate(IceCandidate::new(
                "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host",
            ))
            .await;
        assert!(result.is_err());
        peer.close().await.unwrap();
    }
}
