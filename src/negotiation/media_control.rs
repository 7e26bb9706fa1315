//! Mute, camera and screen-share controls
//!
//! Mute and camera are local flag flips applied to whatever local tracks
//! exist. Screen share swaps the track on the existing video sender, so the
//! peer keeps seeing one continuous video feed and nothing is renegotiated.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::{EngineInner, NegotiationEngine};
use super::session::{NegotiationSession, ScreenShare};
use crate::events::{CallEvent, NoticeLevel};
use crate::media::MediaTrack;

impl NegotiationEngine {
    /// Flip the mute flag; returns whether audio is now muted
    pub fn toggle_mute(&self) -> bool {
        let mut controls = self.inner.controls.lock();
        controls.is_muted = !controls.is_muted;
        if let Some(stream) = self.inner.active_stream.lock().as_ref() {
            for track in stream.audio_tracks() {
                track.set_enabled(!controls.is_muted);
            }
        }
        debug!("{} muted: {}", self.inner.local_id, controls.is_muted);
        controls.is_muted
    }

    /// Flip the camera flag; returns whether the camera is now on
    pub fn toggle_camera(&self) -> bool {
        let mut controls = self.inner.controls.lock();
        controls.is_camera_on = !controls.is_camera_on;
        if let Some(stream) = self.inner.active_stream.lock().as_ref() {
            for track in stream.video_tracks() {
                track.set_enabled(controls.is_camera_on);
            }
        }
        debug!("{} camera on: {}", self.inner.local_id, controls.is_camera_on);
        controls.is_camera_on
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.inner.controls.lock().is_screen_sharing
    }

    /// Start or stop sharing the screen; returns whether sharing is now on
    ///
    /// Never fails: problems are logged and reported as a notice.
    pub async fn toggle_screen_share(&self) -> bool {
        let inner = &self.inner;
        let mut slot = inner.session.lock().await;
        let Some(session) = slot.as_mut() else {
            warn!("Screen share requested with no active call");
            return false;
        };
        let Some(connection) = session.connection.clone() else {
            warn!("Screen share requested before call {} has a connection", session.call_id);
            return false;
        };

        if let Some(mut share) = session.screen.take() {
            if let Some(watcher) = share.watcher.take() {
                watcher.abort();
            }
            inner.revert_to_camera(session, share).await;
            return false;
        }

        let stream = match inner.devices.get_display_media().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Screen capture unavailable: {}", e);
                inner.events.publish(CallEvent::notice(
                    NoticeLevel::Warning,
                    format!("Could not share screen: {}", e),
                ));
                return false;
            }
        };
        let Some(track) = stream.video_tracks().into_iter().next() else {
            warn!("Screen capture returned no video track");
            stream.stop_all();
            return false;
        };

        let Some((sender, camera)) = connection.video_sender() else {
            warn!(
                "Call {} sends no video, screen share needs a video call",
                session.call_id
            );
            stream.stop_all();
            inner.events.publish(CallEvent::notice(
                NoticeLevel::Warning,
                "Screen sharing requires a video call",
            ));
            return false;
        };

        if let Err(e) = connection.replace_track(sender, track.clone()).await {
            warn!("Failed to switch call {} to the screen: {}", session.call_id, e);
            stream.stop_all();
            return false;
        }

        let watcher = inner.spawn_screen_watcher(session.call_id.clone(), track.clone());
        info!("Call {} now sharing screen track {}", session.call_id, track.id());
        session.screen = Some(ScreenShare {
            stream,
            track,
            sender,
            camera,
            watcher: Some(watcher),
        });
        inner.controls.lock().is_screen_sharing = true;
        true
    }
}

impl EngineInner {
    /// Put the camera back on the video sender and release the capture
    pub(super) async fn revert_to_camera(&self, session: &NegotiationSession, share: ScreenShare) {
        if let Some(connection) = session.connection.as_ref() {
            if share.camera.is_live() {
                match connection.replace_track(share.sender, share.camera.clone()).await {
                    Ok(()) => info!("Call {} back on camera track {}", session.call_id, share.camera.id()),
                    Err(e) => warn!("Failed to restore camera on call {}: {}", session.call_id, e),
                }
            } else {
                warn!("Camera track ended, call {} has no video to restore", session.call_id);
            }
        }
        share.stream.stop_all();
        self.controls.lock().is_screen_sharing = false;
    }

    /// Revert when the capture ends from outside (the "stop sharing" control)
    pub(super) fn spawn_screen_watcher(
        self: &Arc<Self>,
        call_id: String,
        track: Arc<MediaTrack>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            track.ended().await;
            let Some(inner) = weak.upgrade() else { return };

            let mut slot = inner.session.lock().await;
            let Some(session) = slot.as_mut().filter(|s| s.call_id == call_id) else {
                return;
            };
            let still_sharing = session
                .screen
                .as_ref()
                .map(|share| share.track.id() == track.id())
                .unwrap_or(false);
            if !still_sharing {
                return;
            }

            if let Some(mut share) = session.screen.take() {
                // This task; let it finish instead of aborting it
                drop(share.watcher.take());
                info!("Screen capture on call {} stopped externally", call_id);
                inner.revert_to_camera(session, share).await;
            }
        })
    }
}
