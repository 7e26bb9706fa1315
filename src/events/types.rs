//! Call event types
//!
//! The closed set of notifications a participant's UI layer reacts to.

use std::sync::Arc;

use crate::call::{CallKind, CallStatus, IncomingCall};
use crate::media::{MediaStream, MediaTrack};
use crate::rtc::ConnectionState;

/// Why a negotiation session was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `end_call` on this side
    LocalHangup,
    /// The peer marked the call record ended
    RemoteHangup,
    /// The connection reported a terminal state
    ConnectionLost(ConnectionState),
    /// No connection within the connect timeout
    Timeout,
    /// Offer/answer could not be applied
    NegotiationFailed,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::LocalHangup => write!(f, "local hang-up"),
            EndReason::RemoteHangup => write!(f, "remote hang-up"),
            EndReason::ConnectionLost(state) => write!(f, "connection {}", state),
            EndReason::Timeout => write!(f, "connect timeout"),
            EndReason::NegotiationFailed => write!(f, "negotiation failed"),
        }
    }
}

/// Severity of a user-visible notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Event published on a participant's [`EventBus`](super::EventBus)
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Local capture is ready; render it as the self view
    LocalStreamReady { call_id: String, stream: MediaStream },

    /// A remote track arrived; `stream` accumulates every track so far
    RemoteStreamUpdated {
        call_id: String,
        stream: MediaStream,
        track: Arc<MediaTrack>,
    },

    ConnectionStateChanged {
        call_id: String,
        state: ConnectionState,
    },

    CallStatusChanged { call_id: String, status: CallStatus },

    /// The negotiation session is gone and its media released
    SessionEnded { call_id: String, reason: EndReason },

    /// Someone is calling the local participant
    IncomingCall(IncomingCall),

    /// The caller gave up before the call was answered
    IncomingCallCancelled { call_id: String },

    /// An announcement was auto-rejected because a call is in progress
    Busy {
        call_id: String,
        caller_id: String,
        kind: CallKind,
    },

    Notice { level: NoticeLevel, message: String },
}

impl CallEvent {
    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        CallEvent::Notice {
            level,
            message: message.into(),
        }
    }

    /// Call the event refers to, if any
    pub fn call_id(&self) -> Option<&str> {
        match self {
            CallEvent::LocalStreamReady { call_id, .. }
            | CallEvent::RemoteStreamUpdated { call_id, .. }
            | CallEvent::ConnectionStateChanged { call_id, .. }
            | CallEvent::CallStatusChanged { call_id, .. }
            | CallEvent::SessionEnded { call_id, .. }
            | CallEvent::IncomingCallCancelled { call_id }
            | CallEvent::Busy { call_id, .. } => Some(call_id),
            CallEvent::IncomingCall(incoming) => Some(&incoming.id),
            CallEvent::Notice { .. } => None,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::LocalStreamReady { .. } => "local_stream.ready",
            CallEvent::RemoteStreamUpdated { .. } => "remote_stream.updated",
            CallEvent::ConnectionStateChanged { .. } => "connection.state_changed",
            CallEvent::CallStatusChanged { .. } => "call.status_changed",
            CallEvent::SessionEnded { .. } => "session.ended",
            CallEvent::IncomingCall(_) => "call.incoming",
            CallEvent::IncomingCallCancelled { .. } => "call.incoming_cancelled",
            CallEvent::Busy { .. } => "call.busy",
            CallEvent::Notice { .. } => "notice",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_extraction() {
        let event = CallEvent::IncomingCall(IncomingCall {
            id: "c1".into(),
            caller_id: "u1".into(),
            kind: CallKind::Video,
        });
        assert_eq!(event.call_id(), Some("c1"));
        assert_eq!(event.name(), "call.incoming");

        let notice = CallEvent::notice(NoticeLevel::Warning, "camera unavailable");
        assert_eq!(notice.call_id(), None);
    }

    #[test]
    fn test_end_reason_display() {
        assert_eq!(
            EndReason::ConnectionLost(ConnectionState::Failed).to_string(),
            "connection failed"
        );
        assert_eq!(EndReason::Timeout.to_string(), "connect timeout");
    }
}
