//! Virtual capture device for the native client.
//!
//! There is no camera on a headless peer; the device hands out track
//! descriptions so the media call carries something. Only one acquisition
//! can be live at a time.

use async_trait::async_trait;
use duet_core::{LocalMedia, MediaDevice, MediaError, TrackKind};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct VirtualCamera {
    tracks: Vec<TrackKind>,
    held: AtomicBool,
}

impl VirtualCamera {
    /// Device with one audio and one video track.
    pub fn new() -> Self {
        Self::with_tracks(vec![TrackKind::Audio, TrackKind::Video])
    }

    /// Device that reports no hardware, as with `--no-media`.
    pub fn disabled() -> Self {
        Self::with_tracks(Vec::new())
    }

    pub fn with_tracks(tracks: Vec<TrackKind>) -> Self {
        Self {
            tracks,
            held: AtomicBool::new(false),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl Default for VirtualCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevice for VirtualCamera {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        if self.tracks.is_empty() {
            return Err(MediaError::Unavailable("media disabled".to_string()));
        }
        if self.held.swap(true, Ordering::SeqCst) {
            return Err(MediaError::Busy);
        }
        Ok(LocalMedia::new(&self.tracks))
    }

    fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }
}
