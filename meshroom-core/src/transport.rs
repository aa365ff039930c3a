//! Peer transport abstraction layer
//!
//! A [`PeerTransport`] is the one direct connection a peer session owns. The
//! session talks to it only through this trait, so the webrtc-rs backend and
//! the in-memory loopback are interchangeable.
//!
//! Transports report asynchronous happenings (local ICE candidates, arriving
//! remote tracks, connection state changes) through the [`TransportEvent`]
//! sender handed to them at creation.

use crate::identity::PeerId;
use crate::media::LocalTrack;
use crate::types::{
    ConnectionState, IceCandidate, NegotiationState, SdpType, SessionDescription, TrackKind,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The operation is not legal in the current negotiation state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The transport has been closed
    #[error("Transport closed")]
    Closed,

    /// Offer/answer or description handling failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Track could not be attached or swapped
    #[error("Track error: {0}")]
    Track(String),

    /// Stats could not be read
    #[error("Stats unavailable: {0}")]
    Stats(String),

    /// Transport could not be created
    #[error("Setup failed: {0}")]
    Setup(String),
}

impl TransportError {
    /// Whether the error only says the call came at the wrong time
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, TransportError::InvalidState(_) | TransportError::Closed)
    }
}

/// Remote track announced by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
}

/// Asynchronous notifications from a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Local ICE candidate gathered
    IceCandidate(IceCandidate),
    /// Remote track arrived
    RemoteTrack(RemoteTrack),
    /// Connection state changed
    StateChanged(ConnectionState),
}

/// Sender half given to a transport at creation
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Outbound RTP counters for one track kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundRtpStats {
    /// Audio or video
    pub kind: Option<TrackKind>,
    /// Cumulative bytes sent
    pub bytes_sent: u64,
    /// Cumulative packets sent
    pub packets_sent: u64,
    /// Encoded frame width, video only
    pub frame_width: Option<u32>,
    /// Encoded frame height, video only
    pub frame_height: Option<u32>,
}

/// Snapshot of transport counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    /// One entry per outbound RTP stream
    pub outbound: Vec<OutboundRtpStats>,
}

impl TransportStats {
    /// The outbound video stream, if any
    pub fn outbound_video(&self) -> Option<&OutboundRtpStats> {
        self.outbound
            .iter()
            .find(|s| s.kind == Some(TrackKind::Video))
    }
}

/// One direct transport to a remote participant
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and apply it as the local description
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if an offer cannot be made now
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer and apply it as the local description
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no remote offer is applied
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a remote offer or answer
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the descriptor does not fit the current state
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Type of the applied remote description
    async fn remote_description_type(&self) -> Option<SdpType>;

    /// Current offer/answer state
    fn negotiation_state(&self) -> NegotiationState;

    /// Add a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Attach a local track as a new outgoing sender
    ///
    /// # Errors
    ///
    /// Returns error if the track cannot be attached
    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Swap the track on the sender of the same kind, without renegotiation
    ///
    /// Returns `false` if no sender of that kind exists.
    ///
    /// # Errors
    ///
    /// Returns error if the swap fails
    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError>;

    /// Read transport counters
    ///
    /// # Errors
    ///
    /// Returns error if stats are unavailable
    async fn stats(&self) -> Result<TransportStats, TransportError>;

    /// Close the transport
    ///
    /// # Errors
    ///
    /// Returns error if shutdown fails
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates one transport per peer session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Allocate a transport to `remote`, reporting events on `events`
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be created
    async fn create(
        &self,
        remote: &PeerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_classification() {
        assert!(TransportError::InvalidState("have-local-offer".into()).is_invalid_state());
        assert!(TransportError::Closed.is_invalid_state());
        assert!(!TransportError::Negotiation("bad sdp".into()).is_invalid_state());
    }

    #[test]
    fn test_outbound_video_lookup() {
        let stats = TransportStats {
            outbound: vec![
                OutboundRtpStats {
                    kind: Some(TrackKind::Audio),
                    bytes_sent: 10,
                    ..Default::default()
                },
                OutboundRtpStats {
                    kind: Some(TrackKind::Video),
                    bytes_sent: 2048,
                    frame_width: Some(640),
                    frame_height: Some(480),
                    ..Default::default()
                },
            ],
        };
        let video = stats.outbound_video().unwrap();
        assert_eq!(video.bytes_sent, 2048);
        assert_eq!(video.frame_width, Some(640));
        assert!(TransportStats::default().outbound_video().is_none());
    }
}
