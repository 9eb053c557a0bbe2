//! Local media collaborator.
//!
//! Capture devices live outside the engine. The engine only asks for a
//! stream, attaches its tracks to the peer connection and hands it back
//! on teardown.

use crate::error::MediaError;
use crate::utils::random_id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open local capture. May wait on a user permission prompt indefinitely.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError>;

    /// Stop every track of the stream.
    fn release(&self, stream: &LocalStream);

    /// Mute or unmute all tracks of one kind without renegotiating.
    fn set_enabled(&self, stream: &LocalStream, kind: MediaKind, enabled: bool);
}

/// Device-less source: hands out track descriptors whose samples the host
/// writes itself (see `RtcPeer::sample_track`).
#[derive(Default)]
pub struct SampleTrackSource {
    enabled: Mutex<HashMap<String, bool>>,
}

impl SampleTrackSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a track is live and unmuted.
    pub fn is_enabled(&self, track_id: &str) -> bool {
        self.enabled
            .lock()
            .map(|m| m.get(track_id).copied().unwrap_or(false))
            .unwrap_or(false)
    }
}

#[async_trait]
impl MediaSource for SampleTrackSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalStream, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::DeviceUnavailable(
                "no media kind requested".into(),
            ));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack {
                id: format!("audio-{}", random_id()),
                kind: MediaKind::Audio,
            });
        }
        if constraints.video {
            tracks.push(LocalTrack {
                id: format!("video-{}", random_id()),
                kind: MediaKind::Video,
            });
        }
        if let Ok(mut enabled) = self.enabled.lock() {
            for t in &tracks {
                enabled.insert(t.id.clone(), true);
            }
        }
        Ok(LocalStream {
            id: format!("stream-{}", random_id()),
            tracks,
        })
    }

    fn release(&self, stream: &LocalStream) {
        if let Ok(mut enabled) = self.enabled.lock() {
            for t in &stream.tracks {
                enabled.remove(&t.id);
            }
        }
    }

    fn set_enabled(&self, stream: &LocalStream, kind: MediaKind, on: bool) {
        if let Ok(mut enabled) = self.enabled.lock() {
            for t in stream.tracks.iter().filter(|t| t.kind == kind) {
                if let Some(flag) = enabled.get_mut(&t.id) {
                    *flag = on;
                }
            }
        }
    }
}
