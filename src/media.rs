//! Local and remote media handles
//!
//! Capture itself lives outside this crate. The orchestrator only needs
//! a handle it can attach to each peer transport and a way to flip track
//! enablement for the UI.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{MeshError, Result};

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

/// Track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    fn codec(self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// One captured track. The capture side writes samples into `track()` and
/// checks `is_enabled()` to decide between real and silent/black frames.
#[derive(Debug)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: watch::Sender<bool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track_id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            track_id.to_string(),
            stream_id.to_string(),
        ));
        let (enabled, _) = watch::channel(true);
        Self {
            kind,
            track,
            enabled,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Sample sink for the capture side
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Track as handed to a peer connection
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    pub fn subscribe_enabled(&self) -> watch::Receiver<bool> {
        self.enabled.subscribe()
    }
}

/// Local capture handle, shared read-only by every peer session
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Stream with one track per requested kind
    pub fn from_constraints(id: impl Into<String>, constraints: MediaConstraints) -> Self {
        let mut stream = Self::new(id);
        if constraints.audio {
            stream = stream.with_track(TrackKind::Audio);
        }
        if constraints.video {
            stream = stream.with_track(TrackKind::Video);
        }
        stream
    }

    pub fn with_track(mut self, kind: TrackKind) -> Self {
        let track_id = format!("{}-{}", self.id, kind);
        self.tracks.push(LocalTrack::new(kind, &track_id, &self.id));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Enable or disable every track of `kind`.
    ///
    /// Returns false when the stream has no such track.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let mut found = false;
        for track in self.tracks.iter().filter(|t| t.kind == kind) {
            track.enabled.send_replace(enabled);
            found = true;
        }
        found
    }

    /// Enablement of the first track of `kind`
    pub fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.tracks
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.is_enabled())
    }
}

/// Local capture collaborator
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open capture devices; failure is `MeshError::MediaAcquisition`
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalStream>>;

    /// Release capture devices
    async fn release(&self, _stream: &LocalStream) {}
}

/// Media source handing out sample-fed tracks.
///
/// Each `acquire` builds a fresh stream whose tracks the embedding
/// application writes encoded samples into.
#[derive(Debug, Default)]
pub struct SampleMediaSource;

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<LocalStream>> {
        if !constraints.audio && !constraints.video {
            return Err(MeshError::MediaAcquisition(
                "neither audio nor video requested".to_string(),
            ));
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        Ok(Arc::new(LocalStream::from_constraints(id, constraints)))
    }
}

/// Remote media surfaced to the UI
#[derive(Clone)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub kind: TrackKind,
    track: Option<Arc<TrackRemote>>,
}

impl RemoteStream {
    pub fn from_rtc(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        Self {
            stream_id: track.stream_id(),
            track_id: track.id(),
            kind,
            track: Some(track),
        }
    }

    /// Handle without an RTP source, for transports that deliver media elsewhere
    pub fn detached(
        stream_id: impl Into<String>,
        track_id: impl Into<String>,
        kind: TrackKind,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            track_id: track_id.into(),
            kind,
            track: None,
        }
    }

    /// RTP source for the renderer
    pub fn rtc_track(&self) -> Option<&Arc<TrackRemote>> {
        self.track.as_ref()
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .finish()
    }
}
