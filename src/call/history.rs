//! Call history as shown in the call list

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::types::{CallKind, CallStatus};
use crate::store::CallRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// One row of a participant's call list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSummary {
    pub call_id: String,
    pub direction: CallDirection,
    pub peer_id: String,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSummary {
    /// Summarise `record` from `local_id`'s point of view
    pub fn from_record(record: &CallRecord, local_id: &str) -> Self {
        let direction = if record.caller_id == local_id {
            CallDirection::Outgoing
        } else {
            CallDirection::Incoming
        };
        let peer_id = match direction {
            CallDirection::Outgoing => record.receiver_id.clone(),
            CallDirection::Incoming => record.caller_id.clone(),
        };

        Self {
            call_id: record.id.clone(),
            direction,
            peer_id,
            kind: record.call_type,
            status: record.status,
            started_at: record.started_at,
            ended_at: record.ended_at,
        }
    }

    /// Time from dialling to hang-up, for finished calls
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at
            .map(|ended| ended - self.started_at)
            .filter(|d| *d >= Duration::zero())
    }

    /// `m:ss` once the call has ended, empty while it is still running
    pub fn duration_label(&self) -> String {
        self.duration().map(format_duration).unwrap_or_default()
    }
}

/// Format as `m:ss`, e.g. `5:22` or `31:15`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    format!("{}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: CallStatus, seconds: Option<i64>) -> CallRecord {
        let started_at = Utc::now() - Duration::hours(1);
        CallRecord {
            id: "c1".into(),
            caller_id: "u1".into(),
            receiver_id: "u2".into(),
            call_type: CallKind::Video,
            status,
            started_at,
            ended_at: seconds.map(|s| started_at + Duration::seconds(s)),
        }
    }

    #[test]
    fn test_direction_and_peer() {
        let record = record(CallStatus::Ended, Some(342));
        let outgoing = CallSummary::from_record(&record, "u1");
        assert_eq!(outgoing.direction, CallDirection::Outgoing);
        assert_eq!(outgoing.peer_id, "u2");
        assert_eq!(outgoing.duration_label(), "5:42");

        let incoming = CallSummary::from_record(&record, "u2");
        assert_eq!(incoming.direction, CallDirection::Incoming);
        assert_eq!(incoming.peer_id, "u1");
    }

    #[test]
    fn test_running_call_has_no_duration() {
        let live = record(CallStatus::Connected, None);
        let summary = CallSummary::from_record(&live, "u1");
        assert_eq!(summary.status, CallStatus::Connected);
        assert!(summary.duration().is_none());
        assert_eq!(summary.duration_label(), "");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(0)), "0:00");
        assert_eq!(format_duration(Duration::seconds(322)), "5:22");
        assert_eq!(format_duration(Duration::seconds(1875)), "31:15");
    }
}
