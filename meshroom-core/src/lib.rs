//! Meshroom - peer-to-peer mesh sessions for a shared room
//!
//! This library implements the session layer of a mesh video room: one direct
//! peer transport per pair of participants, negotiated over a relay-only
//! signaling bus, with a chunked and hash-verified file transfer protocol and
//! a periodic quality measurement loop on top. It features:
//!
//! - **Peer Sessions**: offer/answer state machine that tolerates duplicate,
//!   early and out-of-state negotiation messages
//! - **Session Registry**: one live session per identity with a fixed
//!   initiator tie-break
//! - **Typed Relay Messages**: tagged payloads validated on receipt
//! - **Chunked File Transfer**: out-of-order reassembly with SHA-256 and size
//!   verification
//! - **Quality Metrics**: outbound counters plus PSNR/SSIM frame similarity
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshroom_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = MemoryRelayHub::new();
//! let network = LoopbackNetwork::new();
//!
//! let room = Room::builder(
//!     Arc::new(hub.connect("alice")),
//!     RoomId::new("standup"),
//!     Arc::new(network.factory("alice")),
//!     Arc::new(SyntheticDevices::new()),
//! )
//! .build()?;
//!
//! room.enter(MediaConstraints::video_call()).await?;
//! room.run().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Peer and room identities
pub mod identity;

/// Core types shared across modules
pub mod types;

/// Room configuration
pub mod config;

/// Local media, devices and frame capture
pub mod media;

/// Peer transport capability interface
pub mod transport;

/// In-memory transport pair
pub mod loopback;

/// webrtc-rs transport (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

/// Peer session state machine
pub mod session;

/// Session registry
pub mod registry;

/// Relay signaling
pub mod signaling;

/// Chunked file transfer
pub mod file_transfer;

/// Quality metrics loop
pub mod metrics;

/// Room orchestration
pub mod room;

// Re-export main types at crate root
pub use config::{ConfigError, RoomConfig, DEFAULT_CHUNK_SIZE};
pub use file_transfer::{
    content_hash, verify_against, FileMeta, FileSender, IncomingTransfer, OutgoingFile,
    ReceivedFile, TransferError, TransferManager, TransferReport, TransferSink, Verification,
};
pub use identity::{PeerId, RoomId};
pub use loopback::{LoopbackFactory, LoopbackNetwork, LoopbackOptions, LoopbackTransport};
pub use media::{
    DeviceInfo, Frame, FrameGrabber, LocalFrameCapture, LocalMedia, LocalStream, LocalTrack,
    MediaDevices, MediaError, NoRemoteFrames, RemoteFrameSource, SyntheticDevices,
};
pub use metrics::{psnr, ssim, QualityHistory, QualityMonitor, QualitySample};
pub use registry::{RegistryError, SessionRegistry};
#[cfg(feature = "webrtc-backend")]
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use room::{Flow, Room, RoomBuilder, RoomError, RoomEvent, TransferDirection};
pub use session::{
    AnswerRetry, PeerSession, RemoteDescriptionOutcome, RemoteStream, SessionError, SessionEvent,
    SessionEventKind, SessionOptions,
};
pub use signaling::{
    Envelope, MemoryRelay, MemoryRelayHub, RelayBus, RelayError, RelayPayload, SignalingError,
    SignalingMediator,
};
pub use transport::{
    PeerTransport, RemoteTrack, TransportError, TransportEvent, TransportFactory, TransportStats,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::RoomConfig;
    pub use crate::file_transfer::{FileSender, OutgoingFile, ReceivedFile};
    pub use crate::identity::{PeerId, RoomId};
    pub use crate::loopback::LoopbackNetwork;
    pub use crate::media::{LocalTrack, MediaDevices, SyntheticDevices};
    pub use crate::metrics::QualitySample;
    pub use crate::room::{Room, RoomBuilder, RoomEvent};
    pub use crate::signaling::{MemoryRelayHub, RelayBus, SignalingMediator};
    pub use crate::types::{ConnectionState, MediaConstraints, TrackKind};
}
