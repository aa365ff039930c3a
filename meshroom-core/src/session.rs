//! Peer session state machine
//!
//! A [`PeerSession`] owns exactly one transport to one remote participant.
//! Connection state moves `new -> connecting -> connected` and leaves through
//! `disconnected`, `failed` or `closed`. Transitions come only from transport
//! callbacks and from explicit calls on the session.
//!
//! Everything the outside world learns about a session (candidates, remote
//! media, closure, failure) arrives as a [`SessionEvent`] on the channel
//! handed to [`PeerSession::new`]. A closed session is never reused; the
//! registry builds a new one to reconnect to the same identity.

use crate::config::RoomConfig;
use crate::identity::PeerId;
use crate::media::{LocalMedia, LocalTrack};
use crate::transport::{
    PeerTransport, RemoteTrack, TransportError, TransportEvent, TransportFactory, TransportStats,
};
use crate::types::{ConnectionState, IceCandidate, NegotiationState, SdpType, SessionDescription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No transport has been allocated yet
    #[error("Session not connected")]
    NotConnected,

    /// `connect` was already called on this session
    #[error("Session already connected")]
    AlreadyConnected,

    /// The session was closed and cannot be reused
    #[error("Session closed")]
    Closed,

    /// Only the initiating side creates offers
    #[error("Only the initiator can create an offer")]
    NotInitiator,

    /// An answer needs a recorded remote offer
    #[error("No remote offer recorded")]
    NoRemoteOffer,

    /// Transport failure that is not a signaling race
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Remote media owned by a session, created on the first remote track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    /// Stream identifier
    pub id: String,
    /// Tracks received so far
    pub tracks: Vec<RemoteTrack>,
}

/// What happened in a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// Local ICE candidate to relay to the peer
    IceCandidate(IceCandidate),
    /// First remote track arrived and the remote stream now exists
    RemoteStream(RemoteStream),
    /// A further remote track joined the existing stream
    RemoteTrackAdded(RemoteTrack),
    /// Connection state changed
    StateChanged(ConnectionState),
    /// Remote side went away; the session has cleaned up
    Closed,
    /// Transport failed
    Error(String),
}

/// Lifecycle notification from one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    /// Remote identity
    pub peer: PeerId,
    /// Generation of the emitting session
    pub generation: Uuid,
    /// Payload
    pub kind: SessionEventKind,
}

/// Result of applying a remote descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDescriptionOutcome {
    /// Descriptor applied
    Applied,
    /// An answer was already recorded
    IgnoredDuplicateAnswer,
    /// This side is the answerer and never consumes an answer
    IgnoredAnswerAsAnswerer,
    /// Offer arrived while a negotiation was in flight
    IgnoredOfferNotStable,
    /// The local offer never became visible within the retry budget
    DroppedNotReady,
    /// The transport refused the descriptor as out of state
    IgnoredInvalidState,
}

impl RemoteDescriptionOutcome {
    /// Whether the descriptor took effect
    pub fn is_applied(&self) -> bool {
        matches!(self, RemoteDescriptionOutcome::Applied)
    }
}

/// Tunables for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Checks for a local offer before an early answer is dropped
    pub answer_retry_attempts: u32,
    /// Delay between those checks
    pub answer_retry_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&RoomConfig::default())
    }
}

impl SessionOptions {
    /// Take the retry budget from room config
    pub fn from_config(config: &RoomConfig) -> Self {
        Self {
            answer_retry_attempts: config.answer_retry_attempts,
            answer_retry_delay: config.answer_retry_delay(),
        }
    }
}

/// Bounded wait for the local offer to land before an answer is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRetry {
    /// Attempts made so far
    pub attempt: u32,
    /// Attempts allowed
    pub max_attempts: u32,
    /// Fixed delay per attempt
    pub delay: Duration,
}

impl AnswerRetry {
    /// Fresh budget
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            delay,
        }
    }

    /// Sleep once; `false` when the budget is spent
    pub async fn wait(&mut self) -> bool {
        if self.attempt >= self.max_attempts {
            return false;
        }
        self.attempt += 1;
        tokio::time::sleep(self.delay).await;
        true
    }
}

struct SessionInner {
    state: ConnectionState,
    transport: Option<Arc<dyn PeerTransport>>,
    remote_stream: Option<RemoteStream>,
    pump: Option<JoinHandle<()>>,
    connect_called: bool,
    closed: bool,
}

/// One direct transport to one remote participant
pub struct PeerSession {
    peer: PeerId,
    generation: Uuid,
    initiator: bool,
    options: SessionOptions,
    local_media: LocalMedia,
    events: mpsc::UnboundedSender<SessionEvent>,
    inner: Arc<Mutex<SessionInner>>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.peer)
            .field("generation", &self.generation)
            .field("initiator", &self.initiator)
            .field("state", &self.connection_state())
            .finish()
    }
}

/// Whether a connection state change is legal
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (New, Connecting)
            | (Connecting, Connected)
            | (New, Connected)
            // Transport-level drops
            | (Connecting, Disconnected)
            | (Connected, Disconnected)
            // ICE may recover
            | (Disconnected, Connected)
            | (Disconnected, Connecting)
            // Failures can happen from any active state
            | (New, Failed)
            | (Connecting, Failed)
            | (Connected, Failed)
            | (Disconnected, Failed)
    ) || (from == to && from != Closed)
        || (to == Closed && from != Closed)
}

impl PeerSession {
    /// New session in the `new` state; nothing is allocated until [`connect`](Self::connect)
    pub fn new(
        peer: PeerId,
        initiator: bool,
        local_media: LocalMedia,
        options: SessionOptions,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            peer,
            generation: Uuid::new_v4(),
            initiator,
            options,
            local_media,
            events,
            inner: Arc::new(Mutex::new(SessionInner {
                state: ConnectionState::New,
                transport: None,
                remote_stream: None,
                pump: None,
                connect_called: false,
                closed: false,
            })),
        }
    }

    /// Remote identity
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Unique id of this session object
    pub fn generation(&self) -> Uuid {
        self.generation
    }

    /// Whether this side sends the offer
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Offer/answer state of the transport
    pub fn negotiation_state(&self) -> NegotiationState {
        let inner = self.inner.lock();
        match &inner.transport {
            Some(transport) => transport.negotiation_state(),
            None if inner.closed => NegotiationState::Closed,
            None => NegotiationState::Stable,
        }
    }

    /// Remote media, once the first remote track arrived
    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.inner.lock().remote_stream.clone()
    }

    /// Allocate the transport and attach local tracks
    ///
    /// With `tracks` set to `None` the current tracks of the shared local
    /// media are attached.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyConnected` on a second call, `Closed` after
    /// `disconnect`, or the transport error that stopped setup.
    #[tracing::instrument(
        skip(self, factory, tracks),
        fields(peer = %self.peer, initiator = self.initiator)
    )]
    pub async fn connect(
        &self,
        factory: &dyn TransportFactory,
        tracks: Option<Vec<LocalTrack>>,
    ) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(SessionError::Closed);
            }
            if inner.connect_called {
                return Err(SessionError::AlreadyConnected);
            }
            inner.connect_called = true;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = factory.create(&self.peer, tx).await?;

        let tracks = match tracks {
            Some(tracks) => tracks,
            None => self.local_media.snapshot().await,
        };
        for track in &tracks {
            if let Err(e) = transport.add_track(track).await {
                let _ = transport.close().await;
                return Err(e.into());
            }
        }

        let pump = tokio::spawn(pump_events(
            self.peer.clone(),
            self.generation,
            Arc::clone(&self.inner),
            self.events.clone(),
            rx,
        ));

        let raced_close = {
            let mut inner = self.inner.lock();
            if inner.closed {
                Some(pump)
            } else {
                inner.transport = Some(Arc::clone(&transport));
                inner.pump = Some(pump);
                None
            }
        };
        if let Some(pump) = raced_close {
            // disconnect() ran while the transport was being built
            pump.abort();
            let _ = transport.close().await;
            return Err(SessionError::Closed);
        }

        self.set_state(ConnectionState::Connecting);
        tracing::debug!(tracks = tracks.len(), "Peer session connecting");
        Ok(())
    }

    /// Create the offer; initiator only
    ///
    /// # Errors
    ///
    /// Returns `NotInitiator`, `NotConnected`, or the transport error
    #[tracing::instrument(skip(self), fields(peer = %self.peer))]
    pub async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        if !self.initiator {
            return Err(SessionError::NotInitiator);
        }
        let transport = self.transport()?;
        let offer = transport.create_offer().await?;
        tracing::debug!("Local offer created");
        Ok(offer)
    }

    /// Create the answer to a recorded remote offer
    ///
    /// # Errors
    ///
    /// Returns `NoRemoteOffer` if no offer has been applied, `NotConnected`,
    /// or the transport error
    #[tracing::instrument(skip(self), fields(peer = %self.peer))]
    pub async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let transport = self.transport()?;
        if transport.negotiation_state() != NegotiationState::HaveRemoteOffer
            || transport.remote_description_type().await != Some(SdpType::Offer)
        {
            return Err(SessionError::NoRemoteOffer);
        }
        let answer = transport.create_answer().await?;
        tracing::debug!("Local answer created");
        Ok(answer)
    }

    /// Apply a remote offer or answer
    ///
    /// Signaling races resolve to an ignoring [`RemoteDescriptionOutcome`]
    /// rather than an error.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, or a transport error that is not an
    /// invalid-state refusal
    #[tracing::instrument(skip(self, desc), fields(peer = %self.peer, sdp_type = ?desc.sdp_type))]
    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<RemoteDescriptionOutcome, SessionError> {
        let transport = self.transport()?;

        match desc.sdp_type {
            SdpType::Offer => {
                let state = transport.negotiation_state();
                if state != NegotiationState::Stable {
                    tracing::warn!(state = ?state, "Ignoring offer while negotiation is in flight");
                    return Ok(RemoteDescriptionOutcome::IgnoredOfferNotStable);
                }
            }
            SdpType::Answer => {
                if transport.remote_description_type().await == Some(SdpType::Answer)
                    && transport.negotiation_state() == NegotiationState::Stable
                {
                    tracing::warn!("Ignoring duplicate answer");
                    return Ok(RemoteDescriptionOutcome::IgnoredDuplicateAnswer);
                }
                if !self.initiator {
                    tracing::warn!("Ignoring answer on the answering side");
                    return Ok(RemoteDescriptionOutcome::IgnoredAnswerAsAnswerer);
                }
                let mut retry = AnswerRetry::new(
                    self.options.answer_retry_attempts,
                    self.options.answer_retry_delay,
                );
                while transport.negotiation_state() != NegotiationState::HaveLocalOffer {
                    let closed = self.inner.lock().closed;
                    if closed || !retry.wait().await {
                        tracing::warn!(
                            attempts = retry.attempt,
                            state = ?transport.negotiation_state(),
                            "Dropping answer, local offer not in place"
                        );
                        return Ok(RemoteDescriptionOutcome::DroppedNotReady);
                    }
                    tracing::debug!(attempt = retry.attempt, "Answer waiting for local offer");
                }
            }
        }

        match transport.set_remote_description(desc).await {
            Ok(()) => Ok(RemoteDescriptionOutcome::Applied),
            Err(e) if e.is_invalid_state() => {
                tracing::warn!(error = %e, "Remote description refused in current state");
                Ok(RemoteDescriptionOutcome::IgnoredInvalidState)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Add a remote ICE candidate; failures are logged only
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(_) => {
                tracing::debug!(peer = %self.peer, "Dropping ICE candidate, no transport");
                return;
            }
        };
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            tracing::debug!(peer = %self.peer, error = %e, "ICE candidate not added");
        }
    }

    /// Swap the outgoing track of the same kind without renegotiation
    ///
    /// Returns whether a sender was swapped; a missing sender is a logged no-op.
    pub async fn replace_track(&self, track: &LocalTrack) -> bool {
        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(_) => {
                tracing::warn!(
                    peer = %self.peer,
                    kind = %track.kind,
                    "No transport for track replacement"
                );
                return false;
            }
        };
        match transport.replace_track(track).await {
            Ok(true) => {
                tracing::debug!(
                    peer = %self.peer,
                    kind = %track.kind,
                    track_id = %track.id,
                    "Track replaced"
                );
                true
            }
            Ok(false) => {
                tracing::warn!(
                    peer = %self.peer,
                    kind = %track.kind,
                    "No outgoing sender of this kind"
                );
                false
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "Track replacement failed");
                false
            }
        }
    }

    /// Transport counters
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` without a transport, or the stats error
    pub async fn get_stats(&self) -> Result<TransportStats, SessionError> {
        let transport = self.transport()?;
        Ok(transport.stats().await?)
    }

    /// Release the transport and clear remote media; safe to call repeatedly
    pub async fn disconnect(&self) {
        let (transport, pump, was_closed) = {
            let mut inner = self.inner.lock();
            let was_closed = inner.closed;
            inner.closed = true;
            inner.state = ConnectionState::Closed;
            inner.remote_stream = None;
            (inner.transport.take(), inner.pump.take(), was_closed)
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                tracing::warn!(peer = %self.peer, error = %e, "Transport close failed");
            }
        }
        if !was_closed {
            tracing::debug!(
                peer = %self.peer,
                generation = %self.generation,
                "Peer session disconnected"
            );
        }
    }

    fn transport(&self) -> Result<Arc<dyn PeerTransport>, SessionError> {
        let inner = self.inner.lock();
        match &inner.transport {
            Some(transport) => Ok(Arc::clone(transport)),
            None if inner.closed => Err(SessionError::Closed),
            None => Err(SessionError::NotConnected),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        if apply_state(&self.peer, &self.inner, state) {
            let _ = self.events.send(SessionEvent {
                peer: self.peer.clone(),
                generation: self.generation,
                kind: SessionEventKind::StateChanged(state),
            });
        }
    }
}

fn apply_state(peer: &PeerId, inner: &Mutex<SessionInner>, new_state: ConnectionState) -> bool {
    let mut inner = inner.lock();
    let old_state = inner.state;
    if old_state == new_state {
        return false;
    }
    if !is_valid_transition(old_state, new_state) {
        tracing::warn!(
            peer = %peer,
            old_state = ?old_state,
            new_state = ?new_state,
            "Ignoring invalid state transition"
        );
        return false;
    }
    inner.state = new_state;
    tracing::debug!(
        peer = %peer,
        old_state = ?old_state,
        new_state = ?new_state,
        "Peer session state transition"
    );
    true
}

async fn pump_events(
    peer: PeerId,
    generation: Uuid,
    inner: Arc<Mutex<SessionInner>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let emit = |kind: SessionEventKind| {
        let _ = events.send(SessionEvent {
            peer: peer.clone(),
            generation,
            kind,
        });
    };

    while let Some(event) = rx.recv().await {
        if inner.lock().closed {
            break;
        }
        match event {
            TransportEvent::IceCandidate(candidate) => {
                emit(SessionEventKind::IceCandidate(candidate));
            }
            TransportEvent::RemoteTrack(track) => {
                let created = {
                    let mut guard = inner.lock();
                    match guard.remote_stream.as_mut() {
                        Some(stream) => {
                            stream.tracks.push(track.clone());
                            None
                        }
                        None => {
                            let stream = RemoteStream {
                                id: format!("{peer}-{generation}"),
                                tracks: vec![track.clone()],
                            };
                            guard.remote_stream = Some(stream.clone());
                            Some(stream)
                        }
                    }
                };
                match created {
                    Some(stream) => emit(SessionEventKind::RemoteStream(stream)),
                    None => emit(SessionEventKind::RemoteTrackAdded(track)),
                }
            }
            TransportEvent::StateChanged(state) => match state {
                ConnectionState::Disconnected | ConnectionState::Closed => {
                    let transport = {
                        let mut guard = inner.lock();
                        guard.closed = true;
                        guard.state = ConnectionState::Closed;
                        guard.remote_stream = None;
                        guard.pump = None;
                        guard.transport.take()
                    };
                    if let Some(transport) = transport {
                        let _ = transport.close().await;
                    }
                    tracing::info!(
                        peer = %peer,
                        remote_state = ?state,
                        "Peer session closed by transport"
                    );
                    emit(SessionEventKind::StateChanged(ConnectionState::Closed));
                    emit(SessionEventKind::Closed);
                    break;
                }
                ConnectionState::Failed => {
                    if apply_state(&peer, &inner, ConnectionState::Failed) {
                        tracing::warn!(peer = %peer, "Peer transport failed");
                        emit(SessionEventKind::StateChanged(ConnectionState::Failed));
                        emit(SessionEventKind::Error("transport failed".to_string()));
                    }
                }
                ConnectionState::New => {}
                other => {
                    if apply_state(&peer, &inner, other) {
                        emit(SessionEventKind::StateChanged(other));
                    }
                }
            },
        }
    }
}

// Compile-time assertion that PeerSession is Send + Sync
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<PeerSession>();
};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackNetwork, LoopbackOptions};
    use crate::types::TrackKind;

    fn session(
        peer: &str,
        initiator: bool,
        options: SessionOptions,
    ) -> (PeerSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let media = LocalMedia::new(crate::media::LocalStream::new(vec![LocalTrack::with_id(
            format!("cam-{peer}"),
            TrackKind::Video,
        )]));
        (PeerSession::new(PeerId::new(peer), initiator, media, options, tx), rx)
    }

    fn fast_retry() -> SessionOptions {
        SessionOptions {
            answer_retry_attempts: 3,
            answer_retry_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(is_valid_transition(New, Connecting));
        assert!(is_valid_transition(Connecting, Connected));
        assert!(is_valid_transition(Connected, Failed));
        assert!(is_valid_transition(Connected, Closed));
        assert!(!is_valid_transition(Closed, Connecting));
        assert!(!is_valid_transition(Failed, Connected));
        assert!(!is_valid_transition(Closed, Closed));
    }

    #[tokio::test]
    async fn test_answer_retry_budget() {
        let mut retry = AnswerRetry::new(2, Duration::from_millis(1));
        assert!(retry.wait().await);
        assert!(retry.wait().await);
        assert!(!retry.wait().await);
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn test_offer_requires_transport_and_initiator() {
        let (a, _rx) = session("b", true, fast_retry());
        assert_eq!(a.create_offer().await.unwrap_err(), SessionError::NotConnected);

        let (b, _rx) = session("a", false, fast_retry());
        assert_eq!(b.create_offer().await.unwrap_err(), SessionError::NotInitiator);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let network = LoopbackNetwork::new();
        let factory = network.factory("a");
        let (a, _rx) = session("b", true, fast_retry());
        a.connect(&factory, None).await.unwrap();
        assert_eq!(a.connection_state(), ConnectionState::Connecting);
        assert_eq!(
            a.connect(&factory, None).await.unwrap_err(),
            SessionError::AlreadyConnected
        );
    }

    #[tokio::test]
    async fn test_answer_before_offer_is_error() {
        let network = LoopbackNetwork::new();
        let (b, _rx) = session("a", false, fast_retry());
        b.connect(&network.factory("b"), None).await.unwrap();
        assert_eq!(b.create_answer().await.unwrap_err(), SessionError::NoRemoteOffer);
    }

    #[tokio::test]
    async fn test_answerer_ignores_answer() {
        let network = LoopbackNetwork::new();
        let (b, _rx) = session("a", false, fast_retry());
        b.connect(&network.factory("b"), None).await.unwrap();
        let outcome = b
            .set_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(outcome, RemoteDescriptionOutcome::IgnoredAnswerAsAnswerer);
    }

    #[tokio::test]
    async fn test_early_answer_is_dropped_after_retries() {
        let network = LoopbackNetwork::new();
        let (a, _rx) = session("b", true, fast_retry());
        a.connect(&network.factory("a"), None).await.unwrap();
        let outcome = a
            .set_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(outcome, RemoteDescriptionOutcome::DroppedNotReady);
        assert_eq!(a.negotiation_state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_answer_waits_for_slow_offer() {
        let network = LoopbackNetwork::new();
        let factory = network.factory("a").with_options(LoopbackOptions {
            offer_latency: Duration::from_millis(30),
            ..Default::default()
        });
        let options = SessionOptions {
            answer_retry_attempts: 10,
            answer_retry_delay: Duration::from_millis(10),
        };
        let (a, _rx) = session("b", true, options);
        a.connect(&factory, None).await.unwrap();
        let a = Arc::new(a);

        let offering = Arc::clone(&a);
        let offer_task = tokio::spawn(async move { offering.create_offer().await });
        let outcome = a
            .set_remote_description(SessionDescription::answer("v=0 remote"))
            .await
            .unwrap();
        offer_task.await.unwrap().unwrap();

        assert_eq!(outcome, RemoteDescriptionOutcome::Applied);
        assert_eq!(a.negotiation_state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let network = LoopbackNetwork::new();
        let (a, _rx) = session("b", true, fast_retry());
        a.connect(&network.factory("a"), None).await.unwrap();

        a.disconnect().await;
        let first = (a.connection_state(), a.negotiation_state(), a.remote_stream());
        a.disconnect().await;
        let second = (a.connection_state(), a.negotiation_state(), a.remote_stream());

        assert_eq!(first, second);
        assert_eq!(second.0, ConnectionState::Closed);
        assert_eq!(a.connect(&network.factory("a"), None).await.unwrap_err(), SessionError::Closed);
        assert_eq!(a.get_stats().await.unwrap_err(), SessionError::Closed);
    }

    #[tokio::test]
    async fn test_replace_track_without_sender_is_noop() {
        let network = LoopbackNetwork::new();
        let (a, _rx) = session("b", true, fast_retry());
        a.connect(&network.factory("a"), Some(Vec::new())).await.unwrap();
        assert!(!a.replace_track(&LocalTrack::with_id("mic", TrackKind::Audio)).await);
        a.disconnect().await;
        assert!(!a.replace_track(&LocalTrack::with_id("mic", TrackKind::Audio)).await);
    }
}
