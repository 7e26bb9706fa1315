//! Local and remote media
//!
//! - [`MediaTrack`] / [`MediaStream`]: the track model shared by the
//!   negotiation engine and the UI layer
//! - [`MediaDevices`]: how local capture is requested from the host
//! - [`MediaControlState`]: mute/camera/screen-share flags

mod controls;
mod devices;
mod stream;
mod track;

pub use controls::MediaControlState;
pub use devices::{MediaConstraints, MediaDevices, SyntheticDevices};
pub use stream::MediaStream;
pub use track::{MediaTrack, TrackKind, TrackSource, TrackState};
