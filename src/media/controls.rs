use serde::{Deserialize, Serialize};

use super::stream::MediaStream;

/// Local mute/camera/screen-share flags for the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaControlState {
    pub is_muted: bool,
    pub is_camera_on: bool,
    pub is_screen_sharing: bool,
}

impl Default for MediaControlState {
    fn default() -> Self {
        Self {
            is_muted: false,
            is_camera_on: true,
            is_screen_sharing: false,
        }
    }
}

impl MediaControlState {
    /// Push the mute and camera flags onto the tracks of `stream`
    pub fn apply_to(&self, stream: &MediaStream) {
        for track in stream.audio_tracks() {
            track.set_enabled(!self.is_muted);
        }
        for track in stream.video_tracks() {
            track.set_enabled(self.is_camera_on);
        }
    }
}
