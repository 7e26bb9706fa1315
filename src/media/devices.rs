//! Local capture devices
//!
//! The host environment owns the real microphone/camera/screen capture; the
//! call core only asks for streams through [`MediaDevices`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::stream::MediaStream;
use super::track::{MediaTrack, TrackKind, TrackSource};
use crate::error::{CallError, Result};

/// Constraints for a user-media request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn call(wants_video: bool) -> Self {
        Self {
            audio: true,
            video: wants_video,
        }
    }
}

/// Host capture capabilities
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire microphone (and camera) tracks
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream>;

    /// Acquire a screen-capture stream with a single video track
    async fn get_display_media(&self) -> Result<MediaStream>;
}

/// Device set that hands out placeholder tracks
///
/// Used by the demo binary and tests. Every track it ever produced is kept so
/// callers can verify nothing was leaked live.
pub struct SyntheticDevices {
    permission_denied: AtomicBool,
    camera_available: AtomicBool,
    screen_available: AtomicBool,
    issued: Mutex<Vec<Arc<MediaTrack>>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            permission_denied: AtomicBool::new(false),
            camera_available: AtomicBool::new(true),
            screen_available: AtomicBool::new(true),
            issued: Mutex::new(vec![]),
        }
    }

    /// Simulate the user denying device permission
    pub fn set_permission_denied(&self, denied: bool) {
        self.permission_denied.store(denied, Ordering::SeqCst);
    }

    pub fn set_camera_available(&self, available: bool) {
        self.camera_available.store(available, Ordering::SeqCst);
    }

    pub fn set_screen_available(&self, available: bool) {
        self.screen_available.store(available, Ordering::SeqCst);
    }

    /// All tracks handed out so far
    pub fn issued_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.issued.lock().clone()
    }

    /// Tracks that are still live
    pub fn live_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.issued
            .lock()
            .iter()
            .filter(|t| t.is_live())
            .cloned()
            .collect()
    }

    fn issue(&self, kind: TrackKind, source: TrackSource, label: &str) -> Arc<MediaTrack> {
        let track = MediaTrack::new(kind, source, label);
        self.issued.lock().push(track.clone());
        track
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        if self.permission_denied.load(Ordering::SeqCst) {
            warn!("Synthetic device permission denied");
            return Err(CallError::MediaAccess("Permission denied".to_string()));
        }
        if constraints.video && !self.camera_available.load(Ordering::SeqCst) {
            return Err(CallError::MediaAccess(
                "Requested device not found: camera".to_string(),
            ));
        }

        let mut tracks = vec![];
        if constraints.audio {
            tracks.push(self.issue(TrackKind::Audio, TrackSource::Microphone, "synthetic-mic"));
        }
        if constraints.video {
            tracks.push(self.issue(TrackKind::Video, TrackSource::Camera, "synthetic-camera"));
        }
        debug!(
            "Synthetic user media acquired (audio={}, video={})",
            constraints.audio, constraints.video
        );

        Ok(MediaStream::with_tracks(tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream> {
        if self.permission_denied.load(Ordering::SeqCst)
            || !self.screen_available.load(Ordering::SeqCst)
        {
            return Err(CallError::MediaAccess(
                "Screen capture not available".to_string(),
            ));
        }
        let track = self.issue(TrackKind::Video, TrackSource::Screen, "synthetic-screen");
        Ok(MediaStream::with_tracks(vec![track]))
    }
}
