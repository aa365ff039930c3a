//! Local media, device acquisition and raw frame buffers
//!
//! The core never enumerates devices itself. A [`MediaDevices`] collaborator
//! hands out [`LocalTrack`]s, and the room keeps them in one [`LocalMedia`]
//! reference shared by every peer session.

use crate::identity::PeerId;
use crate::types::{MediaConstraints, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Media acquisition errors
///
/// Each variant maps to distinct user guidance so a consumer can tell a
/// denied permission apart from a missing or busy device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Requested device does not exist
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but another process holds it
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Anything else
    #[error("Media unavailable: {0}")]
    Unavailable(String),
}

impl MediaError {
    /// Classify a DOM-style error name as reported by capture backends
    pub fn from_error_name(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            "NotAllowedError" | "SecurityError" | "PermissionDeniedError" => {
                MediaError::PermissionDenied(message)
            }
            "NotFoundError" | "OverconstrainedError" | "DevicesNotFoundError" => {
                MediaError::DeviceNotFound(message)
            }
            "NotReadableError" | "AbortError" | "TrackStartError" => {
                MediaError::DeviceBusy(message)
            }
            _ => MediaError::Unavailable(message),
        }
    }

    /// Actionable text for the end user
    pub fn guidance(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied(_) => {
                "Camera or microphone access was denied. \
                 Allow access in your browser or system settings and rejoin."
            }
            MediaError::DeviceNotFound(_) => {
                "No camera or microphone was found. Connect a device and rejoin."
            }
            MediaError::DeviceBusy(_) => {
                "Your camera or microphone is in use by another application. Close it and rejoin."
            }
            MediaError::Unavailable(_) => "Media devices are unavailable right now.",
        }
    }
}

/// One local outbound track
///
/// Clones share the enabled flag, so muting through any clone mutes the
/// track every session is sending.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Device that produces the track
    pub device_id: Option<String>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    /// New enabled track with a random id
    pub fn new(kind: TrackKind, device_id: Option<String>) -> Self {
        Self {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            kind,
            device_id,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Track with an explicit id
    pub fn with_id(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            device_id: None,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether media is being sent
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Mute or unmute
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.kind == other.kind
    }
}

/// Set of local tracks, at most one per kind
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    /// Build from tracks; a later track replaces an earlier one of the same kind
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        let mut stream = Self::default();
        for track in tracks {
            stream.replace(track);
        }
        stream
    }

    /// All tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Track of a kind
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    /// Put a track in place of the one with the same kind, returning the old one
    pub fn replace(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        match self.tracks.iter_mut().find(|t| t.kind == track.kind) {
            Some(slot) => Some(std::mem::replace(slot, track)),
            None => {
                self.tracks.push(track);
                None
            }
        }
    }

    /// Whether no tracks are present
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Local outbound media shared by every peer session
///
/// Holding the lock is the device-switch critical section: a session that
/// attaches tracks while a switch is in progress waits and sees the new track.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    inner: Arc<Mutex<LocalStream>>,
}

impl LocalMedia {
    /// Wrap an acquired stream
    pub fn new(stream: LocalStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    /// Copy of the current tracks
    pub async fn snapshot(&self) -> Vec<LocalTrack> {
        self.inner.lock().await.tracks().to_vec()
    }

    /// Current track of a kind
    pub async fn track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.inner.lock().await.track(kind).cloned()
    }

    /// Replace the whole stream
    pub async fn set(&self, stream: LocalStream) {
        *self.inner.lock().await = stream;
    }

    /// Enter the critical section
    pub async fn lock(&self) -> MutexGuard<'_, LocalStream> {
        self.inner.lock().await
    }
}

/// A capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identifier
    pub id: String,
    /// Human readable name
    pub label: String,
    /// What the device captures
    pub kind: TrackKind,
}

/// Device acquisition collaborator
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire tracks for the requested constraints
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;

    /// Acquire one track, used for live device switching
    async fn acquire_track(
        &self,
        kind: TrackKind,
        device_id: Option<&str>,
    ) -> Result<LocalTrack, MediaError>;
}

/// In-process devices producing synthetic tracks
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    devices: Vec<DeviceInfo>,
    failure: parking_lot::Mutex<Option<MediaError>>,
}

impl SyntheticDevices {
    /// One default microphone and camera
    pub fn new() -> Self {
        Self::with_devices(vec![
            DeviceInfo {
                id: "default-audio".to_string(),
                label: "Default Audio Device".to_string(),
                kind: TrackKind::Audio,
            },
            DeviceInfo {
                id: "default-video".to_string(),
                label: "Default Video Device".to_string(),
                kind: TrackKind::Video,
            },
        ])
    }

    /// Explicit device list
    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            failure: parking_lot::Mutex::new(None),
        }
    }

    /// Make every following acquisition fail
    pub fn fail_with(&self, error: MediaError) {
        *self.failure.lock() = Some(error);
    }

    /// Known devices
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    fn pick(&self, kind: TrackKind, device_id: Option<&str>) -> Result<&DeviceInfo, MediaError> {
        if let Some(err) = self.failure.lock().clone() {
            return Err(err);
        }
        let mut candidates = self.devices.iter().filter(|d| d.kind == kind);
        match device_id {
            Some(id) => candidates
                .find(|d| d.id == id)
                .ok_or_else(|| MediaError::DeviceNotFound(id.to_string())),
            None => candidates
                .next()
                .ok_or_else(|| MediaError::DeviceNotFound(format!("no {kind} device"))),
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        let mut tracks = Vec::new();
        for kind in constraints.kinds() {
            tracks.push(self.acquire_track(kind, constraints.device_for(kind)).await?);
        }
        tracing::debug!(tracks = tracks.len(), "Synthetic media acquired");
        Ok(LocalStream::new(tracks))
    }

    async fn acquire_track(
        &self,
        kind: TrackKind,
        device_id: Option<&str>,
    ) -> Result<LocalTrack, MediaError> {
        let device = self.pick(kind, device_id)?;
        Ok(LocalTrack::new(kind, Some(device.id.clone())))
    }
}

/// Raw RGBA frame buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// RGBA bytes, row major
    pub data: Bytes,
}

impl Frame {
    /// Wrap a buffer; `None` if its length does not match the dimensions
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Option<Self> {
        let data = data.into();
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(4)?;
        (data.len() == expected).then_some(Self {
            width,
            height,
            data,
        })
    }

    /// Frame filled with one colour
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = width as usize * height as usize;
        let data: Vec<u8> = rgba.iter().copied().cycle().take(pixels * 4).collect();
        Self {
            width,
            height,
            data: Bytes::from(data),
        }
    }

    /// Number of pixels
    pub fn pixel_count(&self) -> usize {
        self.data.len() / 4
    }

    /// Whether both frames have the same pixel dimensions
    pub fn same_dimensions(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }
}

/// Grabs the most recent local frame
pub trait FrameGrabber: Send + Sync {
    /// Current frame, if the source is producing
    fn grab(&self) -> Option<Frame>;
}

/// Captures the remote frame rendered for a peer, on demand
pub trait RemoteFrameSource: Send + Sync {
    /// Frame currently rendered for `peer`
    fn capture(&self, peer: &PeerId) -> Option<Frame>;
}

/// Remote source that never has a frame
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemoteFrames;

impl RemoteFrameSource for NoRemoteFrames {
    fn capture(&self, _peer: &PeerId) -> Option<Frame> {
        None
    }
}

/// Continuously running local capture loop
///
/// Runs on its own interval, independent of the metrics tick, and keeps only
/// the latest frame.
pub struct LocalFrameCapture {
    latest: Arc<RwLock<Option<Frame>>>,
    task: JoinHandle<()>,
}

impl LocalFrameCapture {
    /// Start grabbing every `interval`
    pub fn start(grabber: Arc<dyn FrameGrabber>, interval: Duration) -> Self {
        let latest = Arc::new(RwLock::new(None));
        let slot = Arc::clone(&latest);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Some(frame) = grabber.grab() {
                    *slot.write() = Some(frame);
                }
            }
        });
        Self { latest, task }
    }

    /// Most recent frame
    pub fn latest(&self) -> Option<Frame> {
        self.latest.read().clone()
    }

    /// Stop capturing; the last frame stays readable
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl FrameGrabber for LocalFrameCapture {
    fn grab(&self) -> Option<Frame> {
        self.latest()
    }
}

impl Drop for LocalFrameCapture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// Compile-time assertion that the shared handles are Send + Sync
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<LocalMedia>();
    assert_send_sync::<LocalFrameCapture>();
};
