//! Call data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Media kind of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn from_wants_video(wants_video: bool) -> Self {
        if wants_video {
            CallKind::Video
        } else {
            CallKind::Audio
        }
    }

    pub fn wants_video(&self) -> bool {
        matches!(self, CallKind::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Audio => "audio",
            CallKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(CallKind::Audio),
            "video" => Some(CallKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call status
///
/// Transitions only move forward: `idle -> ringing -> connecting -> connected -> ended`.
/// The caller skips `connecting`, the receiver skips `ringing` locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Ringing,
    Connecting,
    Connected,
    Ended,
}

impl CallStatus {
    pub(crate) fn rank(&self) -> u8 {
        match self {
            CallStatus::Idle => 0,
            CallStatus::Ringing => 1,
            CallStatus::Connecting => 2,
            CallStatus::Connected => 3,
            CallStatus::Ended => 4,
        }
    }

    /// Whether moving from `self` to `next` respects the forward-only order
    pub fn can_advance_to(&self, next: CallStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, CallStatus::Ended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Ringing => "ringing",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(CallStatus::Idle),
            "ringing" => Some(CallStatus::Ringing),
            "connecting" => Some(CallStatus::Connecting),
            "connected" => Some(CallStatus::Connected),
            "ended" => Some(CallStatus::Ended),
            _ => None,
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call as seen by the local participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Call {
    /// The participant on the other end, from `local_id`'s point of view
    pub fn peer_of(&self, local_id: &str) -> &str {
        if self.caller_id == local_id {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }

    pub fn is_outgoing(&self, local_id: &str) -> bool {
        self.caller_id == local_id
    }

    /// Move to `next` if the transition is forward; returns whether it applied
    pub fn advance(&mut self, next: CallStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        if next.is_ended() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        true
    }
}

/// Announcement of a call addressed to the local participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCall {
    pub id: String,
    pub caller_id: String,
    pub kind: CallKind,
}
