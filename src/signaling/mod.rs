//! Signaling: offer/answer/candidate payloads and their transport

mod message;
mod transport;

pub use message::{IceCandidate, SdpType, SessionDescription, SignalingEnvelope, SignalingMessage};
pub use transport::SignalingTransport;
