use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    media::Sample,
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub(crate) fn from_codec_type(codec_type: RTPCodecType) -> Option<Self> {
        match codec_type {
            RTPCodecType::Audio => Some(MediaKind::Audio),
            RTPCodecType::Video => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// A locally captured track. Clones share the same underlying track and enabled flag.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct LocalTrack {
    pub kind: MediaKind,
    #[derivative(Debug = "ignore")]
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Creates an opus track that the application feeds with [`LocalTrack::write_sample`].
    pub fn audio(stream_id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            format!("audio-{}", Uuid::new_v4()),
            stream_id.to_owned(),
        );
        Self::new(MediaKind::Audio, Arc::new(track))
    }

    /// Creates a VP8 track, used for both camera and screen capture.
    pub fn video(stream_id: &str) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video-{}", Uuid::new_v4()),
            stream_id.to_owned(),
        );
        Self::new(MediaKind::Video, Arc::new(track))
    }

    pub fn id(&self) -> String {
        self.track.id().to_owned()
    }

    pub fn stream_id(&self) -> String {
        self.track.stream_id().to_owned()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Writes a sample to every link this track is attached to. Disabled tracks drop samples.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), Error> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.track.write_sample(sample).await?;
        Ok(())
    }
}

/// Acquires capture tracks. Acquisition may fail per kind, e.g. when a camera is missing.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn capture(&self, kind: MediaKind) -> Result<LocalTrack, Error>;
}

/// [`MediaSource`] that hands out sample tracks the application writes encoded media into.
#[derive(Debug, Clone)]
pub struct SampleSource {
    pub stream_id: String,
}

impl SampleSource {
    pub fn new(stream_id: String) -> Self {
        Self { stream_id }
    }
}

#[async_trait]
impl MediaSource for SampleSource {
    async fn capture(&self, kind: MediaKind) -> Result<LocalTrack, Error> {
        match kind {
            MediaKind::Audio => Ok(LocalTrack::audio(&self.stream_id)),
            MediaKind::Video => Ok(LocalTrack::video(&self.stream_id)),
        }
    }
}

/// The local capture stream shared read-only by every peer link.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    tracks: Arc<RwLock<Vec<LocalTrack>>>,
    ready_sender: Arc<watch::Sender<bool>>,
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMedia {
    pub fn new() -> Self {
        let (ready_sender, _) = watch::channel(false);
        Self {
            tracks: Arc::new(RwLock::new(Vec::new())),
            ready_sender: Arc::new(ready_sender),
        }
    }

    /// Captures every requested kind from `source` and marks the media ready.
    /// Kinds that fail are returned with their error; the remaining tracks are still used.
    pub async fn acquire(
        &self,
        source: &dyn MediaSource,
        kinds: &[MediaKind],
    ) -> Vec<(MediaKind, Error)> {
        let mut failures = Vec::new();
        for kind in kinds {
            match source.capture(*kind).await {
                Ok(track) => {
                    self.set_track(track).await;
                }
                Err(err) => {
                    tracing::error!("Failed to capture {} track: {}", kind, err);
                    failures.push((*kind, err));
                }
            }
        }
        self.mark_ready();
        failures
    }

    /// Installs `track`, replacing and returning the previous track of the same kind.
    pub async fn set_track(&self, track: LocalTrack) -> Option<LocalTrack> {
        let mut tracks = self.tracks.write().await;
        let previous = tracks
            .iter()
            .position(|t| t.kind == track.kind)
            .map(|index| tracks.remove(index));
        tracing::debug!("LocalMedia {} track {} is set", track.kind, track.id());
        tracks.push(track);
        previous
    }

    pub async fn tracks(&self) -> Vec<LocalTrack> {
        self.tracks.read().await.clone()
    }

    pub async fn track(&self, kind: MediaKind) -> Option<LocalTrack> {
        self.tracks
            .read()
            .await
            .iter()
            .find(|t| t.kind == kind)
            .cloned()
    }

    /// Enables or disables the track of `kind`. Returns false when there is no such track.
    pub async fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        match self.track(kind).await {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn mark_ready(&self) {
        self.ready_sender.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_sender.borrow()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_sender.subscribe()
    }

    /// Disables and releases every track.
    pub async fn stop(&self) {
        let mut tracks = self.tracks.write().await;
        for track in tracks.iter() {
            track.set_enabled(false);
        }
        tracks.clear();
        self.ready_sender.send_replace(false);
        tracing::debug!("LocalMedia is stopped");
    }

    /// Non-blocking variant of [`LocalMedia::stop`] for teardown paths that cannot await.
    pub(crate) fn stop_now(&self) {
        match self.tracks.try_write() {
            Ok(mut tracks) => {
                for track in tracks.iter() {
                    track.set_enabled(false);
                }
                tracks.clear();
            }
            Err(_) => {
                let media = self.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move { media.stop().await });
                }
            }
        }
        self.ready_sender.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_track_replaces_same_kind() {
        let media = LocalMedia::new();
        let camera = LocalTrack::video("local");
        let screen = LocalTrack::video("local");
        assert!(media.set_track(camera.clone()).await.is_none());
        let previous = media.set_track(screen.clone()).await;
        assert_eq!(previous.map(|t| t.id()), Some(camera.id()));
        assert_eq!(media.tracks().await.len(), 1);
        assert_eq!(media.track(MediaKind::Video).await.map(|t| t.id()), Some(screen.id()));
    }

    #[tokio::test]
    async fn toggles_only_existing_tracks() {
        let media = LocalMedia::new();
        media.set_track(LocalTrack::audio("local")).await;
        assert!(media.set_enabled(MediaKind::Audio, false).await);
        assert!(!media.set_enabled(MediaKind::Video, false).await);
        let audio = media.track(MediaKind::Audio).await;
        assert_eq!(audio.map(|t| t.is_enabled()), Some(false));
    }

    struct NoCamera;

    #[async_trait]
    impl MediaSource for NoCamera {
        async fn capture(&self, kind: MediaKind) -> Result<LocalTrack, Error> {
            match kind {
                MediaKind::Audio => Ok(LocalTrack::audio("local")),
                MediaKind::Video => Err(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no camera",
                ))),
            }
        }
    }

    #[tokio::test]
    async fn acquire_continues_without_failed_device() {
        let media = LocalMedia::new();
        let failures = media
            .acquire(&NoCamera, &[MediaKind::Audio, MediaKind::Video])
            .await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, MediaKind::Video);
        assert!(media.is_ready());
        assert!(media.track(MediaKind::Audio).await.is_some());
        assert!(media.track(MediaKind::Video).await.is_none());
    }

    #[tokio::test]
    async fn stop_releases_tracks() {
        let media = LocalMedia::new();
        let audio = LocalTrack::audio("local");
        media.set_track(audio.clone()).await;
        media.mark_ready();
        media.stop().await;
        assert!(!audio.is_enabled());
        assert!(media.tracks().await.is_empty());
        assert!(!media.is_ready());
    }
}
