//! Relay signaling for a room
//!
//! The relay bus is external to the core. Every message on it is an
//! [`Envelope`] carrying a room id, the sender identity, an optional target
//! and one tagged [`RelayPayload`]. Frames are validated on receipt; unknown
//! or malformed shapes are logged and dropped instead of trusted.

use crate::file_transfer::{FileMeta, TransferError, TransferSink};
use crate::identity::{PeerId, RoomId};
use crate::types::{IceCandidate, SdpType, SessionDescription, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Frame is not a valid envelope
    #[error("Malformed relay frame: {0}")]
    Malformed(String),

    /// Envelope parsed but violates its payload's shape
    #[error("Invalid relay message: {0}")]
    Invalid(String),

    /// Underlying bus failed
    #[error("Relay bus error: {0}")]
    Bus(String),

    /// Bus has shut down
    #[error("Relay bus closed")]
    Closed,
}

/// Payload of a relay message, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayPayload {
    /// Sender entered the room
    Join,

    /// Peers already present when the receiver joined
    MembershipSnapshot {
        /// Present identities
        peers: Vec<PeerId>,
    },

    /// Sender left the room
    Leave,

    /// Remove `target` from the room
    Kick {
        /// Identity being removed
        target: PeerId,
    },

    /// Negotiation offer
    Offer {
        /// Offer descriptor
        description: SessionDescription,
    },

    /// Negotiation answer
    Answer {
        /// Answer descriptor
        description: SessionDescription,
    },

    /// Trickled ICE candidate
    IceCandidate {
        /// Candidate
        candidate: IceCandidate,
    },

    /// Hand raised or lowered
    HandRaise {
        /// Current state
        raised: bool,
    },

    /// Local track enabled or muted
    MediaToggle {
        /// Track kind
        kind: TrackKind,
        /// Current state
        enabled: bool,
    },

    /// Screen share started or stopped
    ScreenShare {
        /// Current state
        active: bool,
    },

    /// Chat line
    Chat {
        /// Message text
        text: String,
    },

    /// Opens a file transfer
    FileStart(FileMeta),

    /// One chunk of a file transfer
    FileChunk {
        /// Chunk index
        index: u32,
        /// Chunk bytes, base64 on the wire
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },

    /// Closes a file transfer
    FileEnd,
}

impl RelayPayload {
    /// Name for tracing
    pub fn message_type(&self) -> &'static str {
        match self {
            // Membership
            Self::Join => "Join",
            Self::MembershipSnapshot { .. } => "MembershipSnapshot",
            Self::Leave => "Leave",
            Self::Kick { .. } => "Kick",
            // Negotiation
            Self::Offer { .. } => "Offer",
            Self::Answer { .. } => "Answer",
            Self::IceCandidate { .. } => "IceCandidate",
            // Room presence
            Self::HandRaise { .. } => "HandRaise",
            Self::MediaToggle { .. } => "MediaToggle",
            Self::ScreenShare { .. } => "ScreenShare",
            Self::Chat { .. } => "Chat",
            // File transfer
            Self::FileStart(_) => "FileStart",
            Self::FileChunk { .. } => "FileChunk",
            Self::FileEnd => "FileEnd",
        }
    }

    /// Whether the payload must name a target identity
    pub fn is_targeted(&self) -> bool {
        matches!(
            self,
            Self::Offer { .. } | Self::Answer { .. } | Self::IceCandidate { .. }
        )
    }

    /// Whether the payload is originated by the relay rather than a peer
    pub fn is_relay_originated(&self) -> bool {
        matches!(self, Self::MembershipSnapshot { .. } | Self::Kick { .. })
    }
}

/// One relay message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Room the message belongs to
    pub room: RoomId,
    /// Sender identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    /// Target identity; absent for broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    /// Payload
    pub payload: RelayPayload,
}

impl Envelope {
    /// Broadcast envelope
    pub fn broadcast(room: RoomId, from: PeerId, payload: RelayPayload) -> Self {
        Self {
            room,
            from: Some(from),
            to: None,
            payload,
        }
    }

    /// Targeted envelope
    pub fn targeted(room: RoomId, from: PeerId, to: PeerId, payload: RelayPayload) -> Self {
        Self {
            room,
            from: Some(from),
            to: Some(to),
            payload,
        }
    }

    /// Serialize to a wire frame
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if serialization fails
    pub fn encode(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    /// Parse and validate a wire frame
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for unparseable JSON and `Invalid` for shape violations
    pub fn decode(frame: &str) -> Result<Self, SignalingError> {
        let envelope: Envelope =
            serde_json::from_str(frame).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Check the fixed field shape for this payload
    ///
    /// # Errors
    ///
    /// Returns `Invalid` naming the violated rule
    pub fn validate(&self) -> Result<(), SignalingError> {
        let invalid = |reason: &str| {
            Err(SignalingError::Invalid(format!(
                "{}: {reason}",
                self.payload.message_type()
            )))
        };

        let has_sender = matches!(&self.from, Some(id) if !id.is_empty());
        if !has_sender && !self.payload.is_relay_originated() {
            return invalid("missing sender");
        }
        let has_target = matches!(&self.to, Some(id) if !id.is_empty());
        if self.payload.is_targeted() && !has_target {
            return invalid("missing target");
        }

        match &self.payload {
            RelayPayload::Offer { description } if description.sdp_type != SdpType::Offer => {
                invalid("description is not an offer")
            }
            RelayPayload::Answer { description } if description.sdp_type != SdpType::Answer => {
                invalid("description is not an answer")
            }
            RelayPayload::Offer { description } | RelayPayload::Answer { description }
                if description.sdp.trim().is_empty() =>
            {
                invalid("empty sdp")
            }
            RelayPayload::IceCandidate { candidate } if candidate.candidate.trim().is_empty() => {
                invalid("empty candidate")
            }
            RelayPayload::Kick { target } if target.is_empty() => invalid("empty target"),
            RelayPayload::FileStart(meta) if meta.filename.trim().is_empty() => {
                invalid("empty filename")
            }
            _ => Ok(()),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// External relay message bus
///
/// Implement this for the deployment's signaling server connection. Frames
/// are JSON-encoded [`Envelope`]s; the relay stamps `from` with the
/// sender's assigned identity.
#[async_trait]
pub trait RelayBus: Send + Sync + 'static {
    /// Bus error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Identity the relay assigned to this endpoint
    fn local_id(&self) -> PeerId;

    /// Publish one frame
    async fn publish(&self, frame: String) -> Result<(), Self::Error>;

    /// Next inbound frame; `None` once the bus has shut down
    ///
    /// Must be cancel-safe: the room drops this future whenever another
    /// `select!` branch wins, and a frame must not be consumed unless it is
    /// returned.
    async fn next(&self) -> Result<Option<String>, Self::Error>;
}

/// Typed send and validated receive over a [`RelayBus`]
pub struct SignalingMediator<B: RelayBus> {
    bus: Arc<B>,
    room: RoomId,
    error_count: AtomicU32,
}

impl<B: RelayBus> SignalingMediator<B> {
    /// Mediator for one room
    pub fn new(bus: Arc<B>, room: RoomId) -> Self {
        Self {
            bus,
            room,
            error_count: AtomicU32::new(0),
        }
    }

    /// Local identity
    pub fn local_id(&self) -> PeerId {
        self.bus.local_id()
    }

    /// Room
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Underlying bus
    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    /// Publish a payload, broadcast when `to` is `None`
    ///
    /// # Errors
    ///
    /// Returns `Bus` if publishing fails
    #[tracing::instrument(
        skip(self, payload),
        fields(room = %self.room, message_type = payload.message_type())
    )]
    pub async fn send(
        &self,
        to: Option<&PeerId>,
        payload: RelayPayload,
    ) -> Result<(), SignalingError> {
        let envelope = Envelope {
            room: self.room.clone(),
            from: Some(self.bus.local_id()),
            to: to.cloned(),
            payload,
        };
        let frame = envelope.encode()?;
        tracing::trace!(to = ?to, "Sending relay message");
        self.bus
            .publish(frame)
            .await
            .map_err(|e| SignalingError::Bus(e.to_string()))
    }

    /// Announce presence
    pub async fn join(&self) -> Result<(), SignalingError> {
        self.send(None, RelayPayload::Join).await
    }

    /// Announce departure
    pub async fn leave(&self) -> Result<(), SignalingError> {
        self.send(None, RelayPayload::Leave).await
    }

    /// Send an offer to `to`
    pub async fn send_offer(
        &self,
        to: &PeerId,
        description: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.send(Some(to), RelayPayload::Offer { description }).await
    }

    /// Send an answer to `to`
    pub async fn send_answer(
        &self,
        to: &PeerId,
        description: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.send(Some(to), RelayPayload::Answer { description }).await
    }

    /// Trickle a candidate to `to`
    pub async fn send_ice_candidate(
        &self,
        to: &PeerId,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.send(Some(to), RelayPayload::IceCandidate { candidate }).await
    }

    /// Broadcast hand state
    pub async fn raise_hand(&self, raised: bool) -> Result<(), SignalingError> {
        self.send(None, RelayPayload::HandRaise { raised }).await
    }

    /// Broadcast a mute or unmute
    pub async fn toggle_media(&self, kind: TrackKind, enabled: bool) -> Result<(), SignalingError> {
        self.send(None, RelayPayload::MediaToggle { kind, enabled }).await
    }

    /// Broadcast screen share state
    pub async fn screen_share(&self, active: bool) -> Result<(), SignalingError> {
        self.send(None, RelayPayload::ScreenShare { active }).await
    }

    /// Broadcast a chat line
    pub async fn chat(&self, text: impl Into<String>) -> Result<(), SignalingError> {
        self.send(None, RelayPayload::Chat { text: text.into() }).await
    }

    /// Ask the relay to remove `target`
    pub async fn kick(&self, target: &PeerId) -> Result<(), SignalingError> {
        self.send(None, RelayPayload::Kick { target: target.clone() }).await
    }

    /// Open a file transfer
    pub async fn file_start(
        &self,
        to: Option<&PeerId>,
        meta: FileMeta,
    ) -> Result<(), SignalingError> {
        self.send(to, RelayPayload::FileStart(meta)).await
    }

    /// Send one chunk
    pub async fn file_chunk(
        &self,
        to: Option<&PeerId>,
        index: u32,
        data: Bytes,
    ) -> Result<(), SignalingError> {
        self.send(to, RelayPayload::FileChunk { index, data }).await
    }

    /// Close a file transfer
    pub async fn file_end(&self, to: Option<&PeerId>) -> Result<(), SignalingError> {
        self.send(to, RelayPayload::FileEnd).await
    }

    /// Transfer sink addressed to `to`, or the whole room
    pub fn transfer_sink(&self, to: Option<PeerId>) -> RelayTransferSink<'_, B> {
        RelayTransferSink { mediator: self, to }
    }

    /// Consecutive bus failures since the last good frame
    pub fn consecutive_errors(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Next valid envelope for this room
    ///
    /// Malformed frames, other rooms and messages addressed elsewhere are
    /// skipped. Returns `Ok(None)` once the bus shuts down. Cancel-safe as
    /// long as the bus is: no await follows a received frame.
    ///
    /// # Errors
    ///
    /// Returns `Bus` after backing off when the bus fails
    pub async fn recv(&self) -> Result<Option<Envelope>, SignalingError> {
        let local = self.bus.local_id();
        loop {
            let frame = match self.bus.next().await {
                Ok(Some(frame)) => {
                    self.error_count.store(0, Ordering::Relaxed);
                    frame
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    let count = self.error_count.fetch_add(1, Ordering::Relaxed).saturating_add(1);

                    let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                    tracing::warn!(
                        error = %e,
                        error_count = count,
                        backoff_ms = backoff_duration.as_millis(),
                        "Error receiving relay frame, backing off"
                    );
                    sleep(backoff_duration).await;
                    return Err(SignalingError::Bus(e.to_string()));
                }
            };

            let envelope = match Envelope::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping relay frame");
                    continue;
                }
            };
            if envelope.room != self.room {
                tracing::debug!(room = %envelope.room, "Ignoring message for another room");
                continue;
            }
            if envelope.to.as_ref().is_some_and(|to| *to != local) {
                tracing::debug!(to = ?envelope.to, "Ignoring message addressed elsewhere");
                continue;
            }

            tracing::debug!(
                from = ?envelope.from,
                message_type = envelope.payload.message_type(),
                "Received relay message"
            );
            return Ok(Some(envelope));
        }
    }
}

/// [`TransferSink`] that publishes file messages through a mediator
pub struct RelayTransferSink<'a, B: RelayBus> {
    mediator: &'a SignalingMediator<B>,
    to: Option<PeerId>,
}

fn channel_closed(err: SignalingError) -> TransferError {
    match err {
        SignalingError::Malformed(reason) | SignalingError::Invalid(reason) => {
            TransferError::Malformed(reason)
        }
        SignalingError::Bus(_) | SignalingError::Closed => TransferError::ChannelClosed,
    }
}

#[async_trait]
impl<'a, B: RelayBus> TransferSink for RelayTransferSink<'a, B> {
    async fn send_start(&self, meta: &FileMeta) -> Result<(), TransferError> {
        self.mediator
            .file_start(self.to.as_ref(), meta.clone())
            .await
            .map_err(channel_closed)
    }

    async fn send_chunk(&self, index: u32, data: Bytes) -> Result<(), TransferError> {
        self.mediator
            .file_chunk(self.to.as_ref(), index, data)
            .await
            .map_err(channel_closed)
    }

    async fn send_end(&self) -> Result<(), TransferError> {
        self.mediator
            .file_end(self.to.as_ref())
            .await
            .map_err(channel_closed)
    }
}

/// In-process relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Endpoint disconnected
    #[error("Relay endpoint closed")]
    Closed,

    /// Frame could not be routed
    #[error("Unroutable frame: {0}")]
    Malformed(String),
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<String>>,
    rooms: HashMap<RoomId, Vec<PeerId>>,
}

impl HubState {
    fn deliver(&self, to: &PeerId, envelope: &Envelope) {
        let Some(endpoint) = self.endpoints.get(to) else {
            tracing::debug!(to = %to, "No endpoint for delivery");
            return;
        };
        match serde_json::to_string(envelope) {
            Ok(frame) => {
                let _ = endpoint.send(frame);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode relay frame"),
        }
    }

    fn deliver_others(&self, room: &RoomId, except: &PeerId, envelope: &Envelope) {
        if let Some(members) = self.rooms.get(room) {
            for member in members.iter().filter(|m| *m != except) {
                self.deliver(member, envelope);
            }
        }
    }

    fn depart(&mut self, room: &RoomId, peer: &PeerId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let before = members.len();
        members.retain(|m| m != peer);
        let removed = members.len() != before;
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }
}

/// In-process relay with room membership
///
/// Join answers the joiner with a membership snapshot and notifies the
/// others. Kick delivers the notice to its target, removes it and tells the
/// rest of the room it left. Authorization of kicks is not checked here.
#[derive(Default)]
pub struct MemoryRelayHub {
    state: Mutex<HubState>,
}

impl MemoryRelayHub {
    /// Empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach an endpoint with an assigned identity
    pub fn connect(self: &Arc<Self>, id: impl Into<PeerId>) -> MemoryRelay {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        if self.state.lock().endpoints.insert(id.clone(), tx).is_some() {
            tracing::warn!(peer = %id, "Replacing relay endpoint");
        }
        MemoryRelay {
            id,
            hub: Arc::clone(self),
            inbox: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Current members of a room in join order
    pub fn members(&self, room: &RoomId) -> Vec<PeerId> {
        self.state.lock().rooms.get(room).cloned().unwrap_or_default()
    }

    /// Push a raw frame to an endpoint, bypassing routing
    pub fn inject(&self, to: &PeerId, frame: impl Into<String>) -> bool {
        self.state
            .lock()
            .endpoints
            .get(to)
            .is_some_and(|endpoint| endpoint.send(frame.into()).is_ok())
    }

    fn route(&self, from: &PeerId, frame: &str) -> Result<(), RelayError> {
        let mut envelope: Envelope =
            serde_json::from_str(frame).map_err(|e| RelayError::Malformed(e.to_string()))?;
        envelope.from = Some(from.clone());
        let room = envelope.room.clone();
        let mut state = self.state.lock();

        match &envelope.payload {
            RelayPayload::Join => {
                let members = state.rooms.entry(room.clone()).or_default();
                let peers: Vec<PeerId> = members.iter().filter(|m| *m != from).cloned().collect();
                if !members.contains(from) {
                    members.push(from.clone());
                }
                let snapshot = Envelope {
                    room: room.clone(),
                    from: None,
                    to: Some(from.clone()),
                    payload: RelayPayload::MembershipSnapshot { peers },
                };
                state.deliver(from, &snapshot);
                state.deliver_others(&room, from, &envelope);
            }
            RelayPayload::Leave => {
                if state.depart(&room, from) {
                    state.deliver_others(&room, from, &envelope);
                }
            }
            RelayPayload::Kick { target } => {
                let target = target.clone();
                state.deliver(&target, &envelope);
                if state.depart(&room, &target) {
                    let left =
                        Envelope::broadcast(room.clone(), target.clone(), RelayPayload::Leave);
                    state.deliver_others(&room, &target, &left);
                }
            }
            _ => match &envelope.to {
                Some(to) => state.deliver(to, &envelope),
                None => state.deliver_others(&room, from, &envelope),
            },
        }
        Ok(())
    }

    fn disconnect(&self, id: &PeerId) {
        let mut state = self.state.lock();
        state.endpoints.remove(id);
        let rooms: Vec<RoomId> = state
            .rooms
            .iter()
            .filter(|(_, members)| members.contains(id))
            .map(|(room, _)| room.clone())
            .collect();
        for room in rooms {
            if state.depart(&room, id) {
                let left = Envelope::broadcast(room.clone(), id.clone(), RelayPayload::Leave);
                state.deliver_others(&room, id, &left);
            }
        }
    }
}

/// One endpoint of a [`MemoryRelayHub`]
pub struct MemoryRelay {
    id: PeerId,
    hub: Arc<MemoryRelayHub>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    closed: AtomicBool,
}

impl MemoryRelay {
    /// Drop off the hub; the rest of the room sees a leave
    pub fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(peer = %self.id, "Relay endpoint disconnected");
            self.hub.disconnect(&self.id);
        }
    }

    /// Whether `disconnect` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayBus for MemoryRelay {
    type Error = RelayError;

    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn publish(&self, frame: String) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.hub.route(&self.id, &frame)
    }

    async fn next(&self) -> Result<Option<String>, RelayError> {
        Ok(self.inbox.lock().await.recv().await)
    }
}

// Compile-time assertions that the mediator and hub are Send + Sync
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<SignalingMediator<MemoryRelay>>();
    assert_send_sync::<MemoryRelayHub>();
};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::file_transfer::{content_hash, FileSender, OutgoingFile};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn mediator(hub: &Arc<MemoryRelayHub>, id: &str) -> SignalingMediator<MemoryRelay> {
        SignalingMediator::new(Arc::new(hub.connect(id)), RoomId::new("r1"))
    }

    async fn next(m: &SignalingMediator<MemoryRelay>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(1), m.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_offer_wire_shape() {
        let envelope = Envelope::targeted(
            RoomId::new("r1"),
            PeerId::new("a"),
            PeerId::new("b"),
            RelayPayload::Offer {
                description: SessionDescription::offer("v=0"),
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "room": "r1",
                "from": "a",
                "to": "b",
                "payload": {"type": "offer", "description": {"type": "offer", "sdp": "v=0"}}
            })
        );
    }

    #[test]
    fn test_file_messages_wire_shape() {
        let start = serde_json::to_value(RelayPayload::FileStart(FileMeta {
            filename: "a.txt".into(),
            size: 3,
            mime_type: "text/plain".into(),
            total_chunks: 1,
            hash: content_hash(b"abc"),
        }))
        .unwrap();
        assert_eq!(start["type"], "file_start");
        assert_eq!(start["mimeType"], "text/plain");
        assert_eq!(start["totalChunks"], 1);

        let chunk = RelayPayload::FileChunk {
            index: 4,
            data: Bytes::from_static(b"abc"),
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value, json!({"type": "file_chunk", "index": 4, "data": "YWJj"}));
        assert_eq!(serde_json::from_value::<RelayPayload>(value).unwrap(), chunk);
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let room = RoomId::new("r1");
        let mismatched = Envelope::targeted(
            room.clone(),
            PeerId::new("a"),
            PeerId::new("b"),
            RelayPayload::Offer {
                description: SessionDescription::answer("v=0"),
            },
        );
        assert!(matches!(mismatched.validate(), Err(SignalingError::Invalid(_))));

        let untargeted = Envelope::broadcast(
            room.clone(),
            PeerId::new("a"),
            RelayPayload::IceCandidate {
                candidate: IceCandidate::new("candidate:1"),
            },
        );
        assert!(untargeted.validate().is_err());

        let anonymous = Envelope {
            room: room.clone(),
            from: None,
            to: None,
            payload: RelayPayload::Join,
        };
        assert!(anonymous.validate().is_err());

        let snapshot = Envelope {
            room,
            from: None,
            to: Some(PeerId::new("a")),
            payload: RelayPayload::MembershipSnapshot { peers: vec![] },
        };
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let frame = r#"{"room":"r1","from":"a","payload":{"type":"teleport"}}"#;
        let err = Envelope::decode(frame).unwrap_err();
        assert!(matches!(err, SignalingError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_join_snapshot_and_notification() {
        let hub = MemoryRelayHub::new();
        let a = mediator(&hub, "a");
        let b = mediator(&hub, "b");

        a.join().await.unwrap();
        let snapshot = next(&a).await;
        assert_eq!(snapshot.payload, RelayPayload::MembershipSnapshot { peers: vec![] });

        b.join().await.unwrap();
        let snapshot = next(&b).await;
        assert_eq!(
            snapshot.payload,
            RelayPayload::MembershipSnapshot {
                peers: vec![PeerId::new("a")]
            }
        );
        let joined = next(&a).await;
        assert_eq!(joined.payload, RelayPayload::Join);
        assert_eq!(joined.from, Some(PeerId::new("b")));
        assert_eq!(hub.members(&RoomId::new("r1")).len(), 2);
    }

    #[tokio::test]
    async fn test_targeted_delivery_and_skipping() {
        let hub = MemoryRelayHub::new();
        let a = mediator(&hub, "a");
        let b = mediator(&hub, "b");
        a.join().await.unwrap();
        b.join().await.unwrap();
        next(&a).await;
        next(&a).await;
        next(&b).await;

        hub.inject(&PeerId::new("b"), "not json");
        hub.inject(
            &PeerId::new("b"),
            r#"{"room":"other","from":"a","payload":{"type":"chat","text":"hi"}}"#,
        );
        a.send_offer(&PeerId::new("b"), SessionDescription::offer("v=0"))
            .await
            .unwrap();

        let offer = next(&b).await;
        assert!(matches!(offer.payload, RelayPayload::Offer { .. }));
        assert_eq!(offer.from, Some(PeerId::new("a")));
    }

    #[tokio::test]
    async fn test_kick_notifies_target_and_room() {
        let hub = MemoryRelayHub::new();
        let a = mediator(&hub, "a");
        let b = mediator(&hub, "b");
        let c = mediator(&hub, "c");
        for m in [&a, &b, &c] {
            m.join().await.unwrap();
        }
        // drain snapshots and join notices
        for _ in 0..3 {
            next(&a).await;
        }
        for _ in 0..2 {
            next(&b).await;
        }
        next(&c).await;

        a.kick(&PeerId::new("b")).await.unwrap();
        let kicked = next(&b).await;
        assert_eq!(
            kicked.payload,
            RelayPayload::Kick {
                target: PeerId::new("b")
            }
        );
        let left = next(&c).await;
        assert_eq!(left.payload, RelayPayload::Leave);
        assert_eq!(left.from, Some(PeerId::new("b")));
        assert_eq!(
            hub.members(&RoomId::new("r1")),
            vec![PeerId::new("a"), PeerId::new("c")]
        );
    }

    #[tokio::test]
    async fn test_disconnect_closes_publish_and_notifies() {
        let hub = MemoryRelayHub::new();
        let relay = Arc::new(hub.connect("a"));
        let a = SignalingMediator::new(Arc::clone(&relay), RoomId::new("r1"));
        let b = mediator(&hub, "b");
        a.join().await.unwrap();
        b.join().await.unwrap();
        next(&b).await;

        relay.disconnect();
        assert!(matches!(a.chat("hello").await, Err(SignalingError::Bus(_))));
        let left = next(&b).await;
        assert_eq!(left.payload, RelayPayload::Leave);
    }

    /// Fails a set number of times, then yields a fixed chat frame
    struct FlakyBus {
        failures: AtomicU32,
    }

    #[async_trait]
    impl RelayBus for FlakyBus {
        type Error = RelayError;

        fn local_id(&self) -> PeerId {
            PeerId::new("a")
        }

        async fn publish(&self, _frame: String) -> Result<(), RelayError> {
            Ok(())
        }

        async fn next(&self) -> Result<Option<String>, RelayError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(RelayError::Closed);
            }
            let frame = r#"{"room":"r1","from":"b","payload":{"type":"chat","text":"hi"}}"#;
            Ok(Some(frame.to_string()))
        }
    }

    #[tokio::test]
    async fn test_bus_errors_counted_until_a_frame_arrives() {
        let bus = Arc::new(FlakyBus {
            failures: AtomicU32::new(2),
        });
        let m = SignalingMediator::new(bus, RoomId::new("r1"));

        assert!(matches!(m.recv().await, Err(SignalingError::Bus(_))));
        assert!(matches!(m.recv().await, Err(SignalingError::Bus(_))));
        assert_eq!(m.consecutive_errors(), 2);

        let envelope = m.recv().await.unwrap().unwrap();
        assert_eq!(envelope.payload, RelayPayload::Chat { text: "hi".into() });
        assert_eq!(m.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_recv_loses_no_frame() {
        let hub = MemoryRelayHub::new();
        let a = mediator(&hub, "a");
        let b = mediator(&hub, "b");
        a.join().await.unwrap();
        b.join().await.unwrap();
        next(&a).await;
        next(&a).await;
        next(&b).await;

        // recv loses the race repeatedly, as in the room's select loop
        for _ in 0..5 {
            let raced = tokio::time::timeout(Duration::from_millis(5), b.recv()).await;
            assert!(raced.is_err());
        }
        a.chat("after the race").await.unwrap();
        let raced = tokio::select! {
            biased;
            received = b.recv() => received.unwrap(),
            () = sleep(Duration::from_secs(1)) => None,
        };
        assert_eq!(
            raced.map(|e| e.payload),
            Some(RelayPayload::Chat {
                text: "after the race".into()
            })
        );
    }

    #[tokio::test]
    async fn test_file_transfer_over_relay() {
        let hub = MemoryRelayHub::new();
        let a = mediator(&hub, "a");
        let b = mediator(&hub, "b");
        a.join().await.unwrap();
        b.join().await.unwrap();
        next(&a).await;
        next(&a).await;
        next(&b).await;

        let file = OutgoingFile::new("n.bin", "application/octet-stream", vec![7u8; 40]);
        let sender = FileSender::new(16, Duration::ZERO);
        let sink = a.transfer_sink(Some(PeerId::new("b")));
        let report = sender.send(&file, &sink, |_| {}).await.unwrap();
        assert_eq!(report.meta.total_chunks, 3);

        assert!(matches!(next(&b).await.payload, RelayPayload::FileStart(_)));
        for expected in 0..3u32 {
            let index = match next(&b).await.payload {
                RelayPayload::FileChunk { index, .. } => Some(index),
                _ => None,
            };
            assert_eq!(index, Some(expected));
        }
        assert_eq!(next(&b).await.payload, RelayPayload::FileEnd);
    }
}
