//! Media stream: an ordered set of tracks shared between owners

use parking_lot::RwLock;
use std::sync::Arc;

use super::track::{MediaTrack, TrackKind};

/// A group of tracks
///
/// Clones share the same track list, so the remote stream handed to the
/// UI keeps growing as tracks arrive.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Arc<RwLock<Vec<Arc<MediaTrack>>>>,
}

impl MediaStream {
    pub fn new() -> Self {
        Self::with_tracks(vec![])
    }

    pub fn with_tracks(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks: Arc::new(RwLock::new(tracks)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a track; returns false if a track with the same id is present
    pub fn add_track(&self, track: Arc<MediaTrack>) -> bool {
        let mut tracks = self.tracks.write();
        if tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        tracks.push(track);
        true
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.read().clone()
    }

    fn tracks_of(&self, kind: TrackKind) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .read()
            .iter()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn audio_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks_of(TrackKind::Video)
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    /// Stop every track in the stream
    pub fn stop_all(&self) {
        for track in self.tracks.read().iter() {
            track.stop();
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.read().iter().all(|t| !t.is_live())
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tracks = self.tracks.read();
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field(
                "tracks",
                &tracks
                    .iter()
                    .map(|t| format!("{}:{}", t.kind(), t.id()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::track::TrackSource;

    #[test]
    fn test_clones_share_tracks() {
        let stream = MediaStream::new();
        let view = stream.clone();

        assert!(stream.add_track(MediaTrack::remote("a1", TrackKind::Audio)));
        assert!(stream.add_track(MediaTrack::remote("v1", TrackKind::Video)));
        assert!(!stream.add_track(MediaTrack::remote("a1", TrackKind::Audio)));

        assert_eq!(view.len(), 2);
        assert_eq!(view.audio_tracks().len(), 1);
        assert_eq!(view.video_tracks()[0].id(), "v1");
    }

    #[test]
    fn test_stop_all() {
        let stream = MediaStream::with_tracks(vec![
            MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic"),
            MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam"),
        ]);
        assert!(!stream.all_stopped());
        stream.stop_all();
        assert!(stream.all_stopped());
        assert!(stream.tracks().iter().all(|t| !t.is_enabled()));
    }
}
