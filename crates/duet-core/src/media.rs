//! Local capture and remote stream descriptions.
//!
//! Capture and playback live outside this crate. A [`MediaDevice`] hands out
//! a [`LocalMedia`] describing the captured tracks; the session keeps it
//! until teardown and gives the device back with [`MediaDevice::release`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media access denied: {0}")]
    Denied(String),

    #[error("Media device busy")]
    Busy,

    #[error("No media device: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub kind: TrackKind,
    pub enabled: bool,
}

/// Locally captured stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMedia {
    tracks: Vec<MediaTrack>,
    stopped: bool,
}

impl LocalMedia {
    /// Stream with one enabled track per kind given.
    pub fn new(kinds: &[TrackKind]) -> Self {
        Self {
            tracks: kinds
                .iter()
                .map(|&kind| MediaTrack {
                    kind,
                    enabled: true,
                })
                .collect(),
            stopped: false,
        }
    }

    /// Stream with no tracks, used when capture is unavailable.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn kinds(&self) -> Vec<TrackKind> {
        self.tracks.iter().map(|t| t.kind).collect()
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind && t.enabled)
    }

    /// Flip every track of `kind`. Returns the new enabled state, or false
    /// when there is no such track.
    pub fn toggle(&mut self, kind: TrackKind) -> bool {
        let Some(first) = self.tracks.iter().find(|t| t.kind == kind) else {
            return false;
        };
        let enabled = !first.enabled;
        for track in self.tracks.iter_mut().filter(|t| t.kind == kind) {
            track.enabled = enabled;
        }
        enabled
    }

    /// Stop all tracks. Stopped media carries no tracks.
    pub fn stop(&mut self) {
        self.tracks.clear();
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// Stream offered by the counterpart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    pub tracks: Vec<TrackKind>,
}

/// Local capture facility.
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Acquire the capture device. Fails with `Busy` while a previous
    /// acquisition has not been released.
    async fn acquire(&self) -> Result<LocalMedia, MediaError>;

    /// Give the device back.
    fn release(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_flips_and_reports() {
        let mut media = LocalMedia::new(&[TrackKind::Audio, TrackKind::Video]);
        assert!(media.is_enabled(TrackKind::Audio));

        assert!(!media.toggle(TrackKind::Audio));
        assert!(!media.is_enabled(TrackKind::Audio));
        assert!(media.is_enabled(TrackKind::Video));

        assert!(media.toggle(TrackKind::Audio));
    }

    #[test]
    fn test_toggle_missing_track_is_false() {
        let mut media = LocalMedia::new(&[TrackKind::Audio]);
        assert!(!media.toggle(TrackKind::Video));
        assert!(!media.toggle(TrackKind::Video));

        let mut empty = LocalMedia::empty();
        assert!(!empty.toggle(TrackKind::Audio));
    }

    #[test]
    fn test_toggle_applies_to_all_tracks_of_kind() {
        let mut media = LocalMedia::new(&[TrackKind::Audio, TrackKind::Audio]);
        media.toggle(TrackKind::Audio);
        assert!(media.tracks().iter().all(|t| !t.enabled));
    }

    #[test]
    fn test_stop_clears_tracks() {
        let mut media = LocalMedia::new(&[TrackKind::Video]);
        media.stop();
        assert!(media.is_stopped());
        assert!(media.tracks().is_empty());
        assert!(!media.toggle(TrackKind::Video));
    }
}
