//! Voxa call core
//!
//! Peer-to-peer call signaling and session negotiation for the Voxa chat
//! client: the signaling transport, the negotiation engine, the call
//! lifecycle state machine and the media controls.

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod rtc;
pub mod signaling;
pub mod store;

pub use error::{CallError, Result};
