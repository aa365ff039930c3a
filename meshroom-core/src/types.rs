//! Session layer types and data structures

use serde::{Deserialize, Serialize};

/// Connection state of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, transport not yet allocated
    New,
    /// Transport allocated, negotiation in progress
    Connecting,
    /// Media is flowing
    Connected,
    /// Remote side went away
    Disconnected,
    /// Transport reached a failed state
    Failed,
    /// Closed locally or after cleanup
    Closed,
}

impl ConnectionState {
    /// Whether the session can no longer carry media
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Offer/answer negotiation state as seen by the local transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    /// No negotiation in flight
    Stable,
    /// Local offer applied, awaiting the remote answer
    HaveLocalOffer,
    /// Remote offer applied, local answer not yet produced
    HaveRemoteOffer,
    /// Transport closed
    Closed,
}

/// Kind of a negotiation descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the initiating side
    Offer,
    /// Answer from the receiving side
    Answer,
}

/// Negotiation descriptor exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer descriptor
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer descriptor
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for a peer transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without media line information
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone or other audio source
    Audio,
    /// Camera or screen capture
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Device selection handed to the media acquisition collaborator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
    /// Preferred microphone
    pub audio_device: Option<String>,
    /// Preferred camera
    pub video_device: Option<String>,
}

impl MediaConstraints {
    /// Audio-only room entry
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            ..Default::default()
        }
    }

    /// Video with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
            ..Default::default()
        }
    }

    /// Pin a device for the given kind
    pub fn with_device(mut self, kind: TrackKind, device_id: impl Into<String>) -> Self {
        match kind {
            TrackKind::Audio => self.audio_device = Some(device_id.into()),
            TrackKind::Video => self.video_device = Some(device_id.into()),
        }
        self
    }

    /// Requested kinds in a stable order
    pub fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        if self.video {
            kinds.push(TrackKind::Video);
        }
        kinds
    }

    /// Device pinned for a kind, if any
    pub fn device_for(&self, kind: TrackKind) -> Option<&str> {
        match kind {
            TrackKind::Audio => self.audio_device.as_deref(),
            TrackKind::Video => self.video_device.as_deref(),
        }
    }
}
