//! In-memory transport pair
//!
//! Two [`LoopbackTransport`]s registered on the same [`LoopbackNetwork`] under
//! mirrored `(local, remote)` keys behave like the two ends of one peer
//! connection. Descriptor handling follows the offer/answer state rules a
//! browser enforces. Once both ends hold a local and a remote description
//! they report `connecting`, announce each other's tracks and then report
//! `connected`. Closing one end makes the other observe `disconnected`.
//!
//! Used by the CLI demo and the test suites; it carries no media.

use crate::identity::PeerId;
use crate::media::LocalTrack;
use crate::transport::{
    OutboundRtpStats, PeerTransport, RemoteTrack, TransportError, TransportEvent,
    TransportEventSender, TransportFactory, TransportStats,
};
use crate::types::{
    ConnectionState, IceCandidate, NegotiationState, SdpType, SessionDescription, TrackKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Tunables for loopback transports
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Artificial delay before an offer is applied locally
    pub offer_latency: Duration,
    /// Video bytes added to the counter on each stats read while connected
    pub bytes_per_stats_read: u64,
    /// Reported encoded frame width
    pub frame_width: u32,
    /// Reported encoded frame height
    pub frame_height: u32,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            offer_latency: Duration::ZERO,
            bytes_per_stats_read: 62_500,
            frame_width: 640,
            frame_height: 480,
        }
    }
}

/// Registry pairing loopback ends
#[derive(Debug)]
pub struct LoopbackNetwork {
    links: Mutex<HashMap<(PeerId, PeerId), Weak<LoopbackTransport>>>,
    next_port: AtomicU16,
    next_session: AtomicU64,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(50_000),
            next_session: AtomicU64::new(1),
        }
    }
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Factory for transports owned by `local`
    pub fn factory(self: &Arc<Self>, local: impl Into<PeerId>) -> LoopbackFactory {
        LoopbackFactory {
            network: Arc::clone(self),
            local: local.into(),
            options: LoopbackOptions::default(),
        }
    }

    /// The live end `local` holds towards `remote`
    pub fn transport(&self, local: &PeerId, remote: &PeerId) -> Option<Arc<LoopbackTransport>> {
        self.links
            .lock()
            .get(&(local.clone(), remote.clone()))
            .and_then(Weak::upgrade)
    }

    fn register(&self, transport: &Arc<LoopbackTransport>) {
        let key = (transport.local.clone(), transport.remote.clone());
        self.links.lock().insert(key, Arc::downgrade(transport));
    }

    fn unregister(&self, transport: &LoopbackTransport) {
        let mut links = self.links.lock();
        let key = (transport.local.clone(), transport.remote.clone());
        let same = links
            .get(&key)
            .map(|w| std::ptr::eq(w.as_ptr(), transport))
            .unwrap_or(false);
        if same {
            links.remove(&key);
        }
    }

    fn counterpart(&self, transport: &LoopbackTransport) -> Option<Arc<LoopbackTransport>> {
        self.transport(&transport.remote, &transport.local)
    }
}

/// Creates loopback transports for one local identity
#[derive(Debug, Clone)]
pub struct LoopbackFactory {
    network: Arc<LoopbackNetwork>,
    local: PeerId,
    options: LoopbackOptions,
}

impl LoopbackFactory {
    /// Override the options for transports created from now on
    pub fn with_options(mut self, options: LoopbackOptions) -> Self {
        self.options = options;
        self
    }

    /// The network this factory registers on
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        remote: &PeerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if *remote == self.local {
            return Err(TransportError::Setup("cannot connect to self".to_string()));
        }
        let transport = Arc::new(LoopbackTransport {
            local: self.local.clone(),
            remote: remote.clone(),
            network: Arc::clone(&self.network),
            options: self.options.clone(),
            events,
            state: Mutex::new(LinkState::default()),
        });
        self.network.register(&transport);
        tracing::debug!(local = %self.local, remote = %remote, "Loopback transport created");
        Ok(transport)
    }
}

#[derive(Debug)]
struct LinkState {
    negotiation: NegotiationState,
    connection: ConnectionState,
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    senders: Vec<LocalTrack>,
    remote_candidates: Vec<IceCandidate>,
    bytes_sent: u64,
    packets_sent: u64,
    fail_stats: bool,
    stats_delay: Option<Duration>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            negotiation: NegotiationState::Stable,
            connection: ConnectionState::New,
            local_desc: None,
            remote_desc: None,
            senders: Vec::new(),
            remote_candidates: Vec::new(),
            bytes_sent: 0,
            packets_sent: 0,
            fail_stats: false,
            stats_delay: None,
        }
    }
}

impl LinkState {
    fn negotiated(&self) -> bool {
        self.negotiation == NegotiationState::Stable
            && self.local_desc.is_some()
            && self.remote_desc.is_some()
    }

    fn is_closed(&self) -> bool {
        self.negotiation == NegotiationState::Closed
    }
}

/// One end of an in-memory peer connection
#[derive(Debug)]
pub struct LoopbackTransport {
    local: PeerId,
    remote: PeerId,
    network: Arc<LoopbackNetwork>,
    options: LoopbackOptions,
    events: TransportEventSender,
    state: Mutex<LinkState>,
}

impl LoopbackTransport {
    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    /// Remote candidates accepted so far
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    /// Tracks currently attached to senders
    pub fn senders(&self) -> Vec<LocalTrack> {
        self.state.lock().senders.clone()
    }

    /// Make subsequent stats reads fail
    pub fn set_stats_failure(&self, fail: bool) {
        self.state.lock().fail_stats = fail;
    }

    /// Delay subsequent stats reads
    pub fn set_stats_delay(&self, delay: Option<Duration>) {
        self.state.lock().stats_delay = delay;
    }

    /// Drive the connection into `failed`, as a lost ICE path would
    pub fn fail(&self) {
        self.state.lock().connection = ConnectionState::Failed;
        self.emit(TransportEvent::StateChanged(ConnectionState::Failed));
    }

    fn emit(&self, event: TransportEvent) {
        // The receiver is gone once the owning session has shut down
        let _ = self.events.send(event);
    }

    fn render_sdp(&self, kind: SdpType, senders: &[LocalTrack]) -> String {
        let session = self.network.next_session.fetch_add(1, Ordering::Relaxed);
        let mut sdp = format!(
            "v=0\r\no=- {session} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=x-loopback:{}:{:?}\r\n",
            self.local, kind
        );
        for track in senders {
            let (media, pt) = match track.kind {
                TrackKind::Audio => ("audio", 111),
                TrackKind::Video => ("video", 96),
            };
            sdp.push_str(&format!(
                "m={media} 9 UDP/TLS/RTP/SAVPF {pt}\r\na=msid:{} {}\r\n",
                self.local, track.id
            ));
        }
        sdp
    }

    fn gather_candidate(&self) {
        let port = self.network.next_port.fetch_add(1, Ordering::Relaxed);
        self.emit(TransportEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {port} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
    }

    fn try_connect(&self) {
        if !self.state.lock().negotiated() {
            return;
        }
        let Some(peer) = self.network.counterpart(self) else {
            return;
        };
        if !peer.state.lock().negotiated() {
            return;
        }
        self.mark_connected(&peer.senders());
        peer.mark_connected(&self.senders());
    }

    fn mark_connected(&self, remote_tracks: &[LocalTrack]) {
        {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Connected || state.is_closed() {
                return;
            }
            state.connection = ConnectionState::Connected;
        }
        self.emit(TransportEvent::StateChanged(ConnectionState::Connecting));
        for track in remote_tracks {
            self.emit(TransportEvent::RemoteTrack(RemoteTrack {
                id: track.id.clone(),
                kind: track.kind,
            }));
        }
        self.emit(TransportEvent::StateChanged(ConnectionState::Connected));
        tracing::debug!(local = %self.local, remote = %self.remote, "Loopback connected");
    }

    fn remote_closed(&self) {
        {
            let mut state = self.state.lock();
            if state.connection.is_terminal() {
                return;
            }
            state.connection = ConnectionState::Disconnected;
        }
        self.emit(TransportEvent::StateChanged(ConnectionState::Disconnected));
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if !self.options.offer_latency.is_zero() {
            tokio::time::sleep(self.options.offer_latency).await;
        }
        let offer = {
            let mut state = self.state.lock();
            if state.is_closed() {
                return Err(TransportError::Closed);
            }
            if state.negotiation != NegotiationState::Stable {
                return Err(TransportError::InvalidState(format!(
                    "cannot create offer in {:?}",
                    state.negotiation
                )));
            }
            let offer = SessionDescription::offer(self.render_sdp(SdpType::Offer, &state.senders));
            state.negotiation = NegotiationState::HaveLocalOffer;
            state.local_desc = Some(offer.clone());
            offer
        };
        self.gather_candidate();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = {
            let mut state = self.state.lock();
            if state.is_closed() {
                return Err(TransportError::Closed);
            }
            if state.negotiation != NegotiationState::HaveRemoteOffer {
                return Err(TransportError::InvalidState(format!(
                    "cannot create answer in {:?}",
                    state.negotiation
                )));
            }
            let answer =
                SessionDescription::answer(self.render_sdp(SdpType::Answer, &state.senders));
            state.negotiation = NegotiationState::Stable;
            state.local_desc = Some(answer.clone());
            answer
        };
        self.gather_candidate();
        self.try_connect();
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        if desc.sdp.trim().is_empty() {
            return Err(TransportError::Negotiation("empty SDP".to_string()));
        }
        let answered = {
            let mut state = self.state.lock();
            if state.is_closed() {
                return Err(TransportError::Closed);
            }
            let next = match (state.negotiation, desc.sdp_type) {
                (NegotiationState::Stable, SdpType::Offer) => NegotiationState::HaveRemoteOffer,
                (NegotiationState::HaveLocalOffer, SdpType::Answer) => NegotiationState::Stable,
                (current, sdp_type) => {
                    return Err(TransportError::InvalidState(format!(
                        "cannot apply remote {sdp_type:?} in {current:?}"
                    )))
                }
            };
            state.negotiation = next;
            state.remote_desc = Some(desc);
            next == NegotiationState::Stable
        };
        if answered {
            self.try_connect();
        }
        Ok(())
    }

    async fn remote_description_type(&self) -> Option<SdpType> {
        self.state.lock().remote_desc.as_ref().map(|d| d.sdp_type)
    }

    fn negotiation_state(&self) -> NegotiationState {
        self.state.lock().negotiation
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.is_closed() {
            return Err(TransportError::Closed);
        }
        if state.remote_desc.is_none() {
            return Err(TransportError::InvalidState(
                "remote description not set".to_string(),
            ));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.is_closed() {
            return Err(TransportError::Closed);
        }
        state.senders.push(track.clone());
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError> {
        let mut state = self.state.lock();
        if state.is_closed() {
            return Err(TransportError::Closed);
        }
        match state.senders.iter_mut().find(|t| t.kind == track.kind) {
            Some(slot) => {
                *slot = track.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        let delay = self.state.lock().stats_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.is_closed() {
            return Err(TransportError::Closed);
        }
        if state.fail_stats {
            return Err(TransportError::Stats("stats report unavailable".to_string()));
        }
        if state.connection == ConnectionState::Connected {
            state.bytes_sent += self.options.bytes_per_stats_read;
            state.packets_sent += 1;
        }
        let outbound = state
            .senders
            .iter()
            .map(|track| match track.kind {
                TrackKind::Video => OutboundRtpStats {
                    kind: Some(TrackKind::Video),
                    bytes_sent: state.bytes_sent,
                    packets_sent: state.packets_sent,
                    frame_width: Some(self.options.frame_width),
                    frame_height: Some(self.options.frame_height),
                },
                TrackKind::Audio => OutboundRtpStats {
                    kind: Some(TrackKind::Audio),
                    bytes_sent: state.bytes_sent / 8,
                    packets_sent: state.packets_sent,
                    frame_width: None,
                    frame_height: None,
                },
            })
            .collect();
        Ok(TransportStats { outbound })
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.is_closed() {
                return Ok(());
            }
            state.negotiation = NegotiationState::Closed;
            state.connection = ConnectionState::Closed;
        }
        let peer = self.network.counterpart(self);
        self.network.unregister(self);
        if let Some(peer) = peer {
            peer.remote_closed();
        }
        tracing::debug!(local = %self.local, remote = %self.remote, "Loopback transport closed");
        Ok(())
    }
}

// Compile-time assertion that LoopbackTransport is Send + Sync
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<LoopbackTransport>();
};
