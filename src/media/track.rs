//! Media track model

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Track media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Where a track's media comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    Remote,
}

/// Track readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Live,
    Ended,
}

/// A single audio or video track
///
/// `enabled` mutes the track without releasing the device; `stop()` releases
/// it for good. Stopping is what the host's native "stop sharing" control
/// does to a screen track, so [`MediaTrack::ended`] is how owners observe it.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Arc<Self> {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, source, label)
    }

    pub fn with_id(
        id: impl Into<String>,
        kind: TrackKind,
        source: TrackSource,
        label: impl Into<String>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(TrackState::Live);
        Arc::new(Self {
            id: id.into(),
            kind,
            source,
            label: label.into(),
            enabled: AtomicBool::new(true),
            state,
        })
    }

    /// Track received from the remote peer
    pub fn remote(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        let id = id.into();
        let label = format!("remote-{}", kind);
        Self::with_id(id, kind, TrackSource::Remote, label)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track; ignored once the track has ended
    pub fn set_enabled(&self, enabled: bool) {
        if self.is_live() {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    pub fn state(&self) -> TrackState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Release the track. Idempotent.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let previous = self.state.send_replace(TrackState::Ended);
        if previous == TrackState::Live {
            debug!("{} track {} ({}) stopped", self.kind, self.id, self.label);
        }
    }

    /// Resolve once the track has ended
    pub async fn ended(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() == TrackState::Ended {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stop_disables_and_ends() {
        let track = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        assert!(track.is_enabled());
        assert!(track.is_live());

        track.stop();
        assert!(!track.is_enabled());
        assert_eq!(track.state(), TrackState::Ended);

        // Stopped tracks cannot be re-enabled
        track.set_enabled(true);
        assert!(!track.is_enabled());

        // Second stop is harmless
        track.stop();
    }

    #[tokio::test]
    async fn test_ended_notifies_waiters() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        track.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_ended_on_already_stopped_track() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        track.stop();
        tokio::time::timeout(Duration::from_millis(100), track.ended())
            .await
            .unwrap();
    }
}
