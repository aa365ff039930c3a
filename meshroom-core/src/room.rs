//! Room orchestration
//!
//! A [`Room`] ties one visit together: the mediator feeds membership and
//! negotiation messages into the session registry, session lifecycle events
//! flow back out to the relay, file messages go through the transfer
//! manager, and quality samples are forwarded. Everything is surfaced to the
//! consumer as [`RoomEvent`]s on a broadcast channel.

use crate::config::{ConfigError, RoomConfig};
use crate::file_transfer::{
    FileSender, OutgoingFile, ReceivedFile, TransferError, TransferManager, TransferReport,
};
use crate::identity::{PeerId, RoomId};
use crate::media::{
    FrameGrabber, LocalFrameCapture, LocalMedia, LocalStream, LocalTrack, MediaDevices, MediaError,
    NoRemoteFrames, RemoteFrameSource,
};
use crate::metrics::{QualityMonitor, QualitySample};
use crate::registry::{RegistryError, SessionRegistry};
use crate::session::{PeerSession, RemoteStream, SessionError, SessionEvent, SessionEventKind};
use crate::signaling::{Envelope, RelayBus, RelayPayload, SignalingError, SignalingMediator};
use crate::transport::{RemoteTrack, TransportFactory};
use crate::types::{ConnectionState, MediaConstraints, TrackKind};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};

/// Room errors
#[derive(Error, Debug)]
pub enum RoomError {
    /// Local media could not be acquired
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Relay failure
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Session registry refused
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Negotiation failed
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// File transfer failed
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Operation needs `enter` first
    #[error("Room not entered")]
    NotEntered,

    /// The local participant left or was removed
    #[error("Room closed")]
    Closed,

    /// Screen share needs a video track
    #[error("Screen share requires a video track")]
    NotVideo,
}

/// Direction of a file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// We are sending
    Outgoing,
    /// We are receiving
    Incoming,
}

/// Everything a consumer of the room observes
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A participant is in the room
    PeerJoined(PeerId),
    /// A participant left or was removed
    PeerLeft(PeerId),
    /// First remote media from a peer
    RemoteStream {
        /// Peer
        peer: PeerId,
        /// Stream
        stream: RemoteStream,
    },
    /// Another remote track from a peer
    RemoteTrackAdded {
        /// Peer
        peer: PeerId,
        /// Track
        track: RemoteTrack,
    },
    /// Session connection state changed
    ConnectionStateChanged {
        /// Peer
        peer: PeerId,
        /// New state
        state: ConnectionState,
    },
    /// Session to a peer failed and was torn down
    SessionFailed {
        /// Peer
        peer: PeerId,
        /// Failure text
        reason: String,
    },
    /// Hand raised or lowered
    HandRaised {
        /// Peer
        peer: PeerId,
        /// State
        raised: bool,
    },
    /// A peer muted or unmuted
    MediaToggled {
        /// Peer
        peer: PeerId,
        /// Track kind
        kind: TrackKind,
        /// State
        enabled: bool,
    },
    /// A peer started or stopped sharing its screen
    ScreenShare {
        /// Peer
        peer: PeerId,
        /// State
        active: bool,
    },
    /// Chat line
    Chat {
        /// Sender
        peer: PeerId,
        /// Text
        text: String,
    },
    /// The local participant was removed from the room
    Kicked,
    /// Room entry failed; `guidance` is user-facing
    Fatal {
        /// Error text
        reason: String,
        /// What the user can do about it
        guidance: String,
    },
    /// Progress of a transfer in percent
    TransferProgress {
        /// Remote side
        peer: Option<PeerId>,
        /// Direction
        direction: TransferDirection,
        /// File name
        filename: String,
        /// Percent done
        percent: f64,
    },
    /// A verified incoming file
    TransferCompleted(ReceivedFile),
    /// An incoming transfer was rejected
    TransferRejected {
        /// Sender
        peer: PeerId,
        /// Why
        reason: String,
    },
    /// A quality measurement
    QualitySample(QualitySample),
}

/// Whether the run loop continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep processing
    Continue,
    /// Stop; the room is closed
    Stop,
}

#[derive(Debug, Default)]
struct RoomState {
    entered: bool,
    closed: bool,
    hand_raised: bool,
    camera_before_share: Option<LocalTrack>,
}

/// One visit to one room
pub struct Room<B: RelayBus> {
    local: PeerId,
    config: RoomConfig,
    mediator: SignalingMediator<B>,
    registry: Arc<SessionRegistry>,
    devices: Arc<dyn MediaDevices>,
    transfers: Mutex<TransferManager>,
    monitor: QualityMonitor,
    local_frames: Option<Arc<dyn FrameGrabber>>,
    capture: Mutex<Option<Arc<LocalFrameCapture>>>,
    event_sender: broadcast::Sender<RoomEvent>,
    session_events: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
    state: Mutex<RoomState>,
    closed_tx: watch::Sender<bool>,
}

impl<B: RelayBus> Room<B> {
    /// Create a builder
    #[must_use]
    pub fn builder(
        bus: Arc<B>,
        room: RoomId,
        factory: Arc<dyn TransportFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> RoomBuilder<B> {
        RoomBuilder::new(bus, room, factory, devices)
    }

    /// Local identity
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Room id
    pub fn room_id(&self) -> &RoomId {
        self.mediator.room()
    }

    /// Effective configuration
    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Quality monitor
    pub fn monitor(&self) -> &QualityMonitor {
        &self.monitor
    }

    /// Shared local media
    pub fn local_media(&self) -> &LocalMedia {
        self.registry.local_media()
    }

    /// Subscribe to room events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.event_sender.subscribe()
    }

    /// Rolling quality history
    pub fn quality_history(&self) -> Vec<QualitySample> {
        self.monitor.history()
    }

    /// Acquire local media and announce presence
    ///
    /// # Errors
    ///
    /// A media failure is fatal: a single [`RoomEvent::Fatal`] is emitted
    /// and `Media` returned. Relay failures return `Signaling`.
    #[tracing::instrument(skip(self), fields(local = %self.local, room = %self.room_id()))]
    pub async fn enter(&self, constraints: MediaConstraints) -> Result<(), RoomError> {
        if self.state.lock().closed {
            return Err(RoomError::Closed);
        }
        let stream = match self.devices.acquire(&constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "Cannot enter room, media unavailable");
                self.emit(RoomEvent::Fatal {
                    reason: e.to_string(),
                    guidance: e.guidance().to_string(),
                });
                return Err(e.into());
            }
        };
        let tracks = stream.tracks().len();
        self.local_media().set(stream).await;
        self.mediator.join().await?;
        self.state.lock().entered = true;
        self.start_capture();
        tracing::info!(tracks, "Entered room");
        Ok(())
    }

    /// The monitor scores against the capture's latest frame, never the device
    fn start_capture(&self) {
        let Some(grabber) = &self.local_frames else {
            return;
        };
        let mut capture = self.capture.lock();
        if capture.is_none() {
            let started = Arc::new(LocalFrameCapture::start(
                Arc::clone(grabber),
                self.config.frame_capture_interval(),
            ));
            self.monitor.set_local_frames(Some(Arc::clone(&started) as Arc<dyn FrameGrabber>));
            *capture = Some(started);
        }
    }

    /// Process relay messages, session events and quality samples until the
    /// relay closes or the local participant is removed
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the room was already closed
    pub async fn run(&self) -> Result<(), RoomError> {
        let mut closed_rx = self.closed_tx.subscribe();
        if self.state.lock().closed {
            return Err(RoomError::Closed);
        }
        let mut session_events = self.session_events.lock().await;
        let mut samples = self.monitor.subscribe();

        loop {
            tokio::select! {
                _ = closed_rx.changed() => break,
                message = self.mediator.recv() => match message {
                    Ok(Some(envelope)) => match self.handle_envelope(envelope).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break,
                        Err(e) => tracing::warn!(error = %e, "Relay message handling failed"),
                    },
                    Ok(None) => {
                        tracing::info!("Relay closed, leaving room");
                        self.teardown().await;
                        break;
                    }
                    Err(e) => tracing::debug!(error = %e, "Relay receive failed"),
                },
                Some(event) = session_events.recv() => self.handle_session_event(event).await,
                sample = samples.recv() => match sample {
                    Ok(sample) => self.emit(RoomEvent::QualitySample(sample)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Quality samples lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        }
        Ok(())
    }

    /// Apply one relay message
    ///
    /// # Errors
    ///
    /// Returns the registry, session or relay error that stopped handling
    #[tracing::instrument(
        skip(self, envelope),
        fields(local = %self.local, message_type = envelope.payload.message_type())
    )]
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<Flow, RoomError> {
        if self.state.lock().closed {
            return Ok(Flow::Stop);
        }
        let from = envelope.from.clone().unwrap_or_else(|| PeerId::new(String::new()));

        match envelope.payload {
            RelayPayload::MembershipSnapshot { peers } => {
                let peers: Vec<PeerId> = peers.into_iter().filter(|p| *p != self.local).collect();
                tracing::info!(count = peers.len(), "Membership snapshot");
                self.registry.note_present(peers.iter().cloned());
                for peer in peers {
                    self.emit(RoomEvent::PeerJoined(peer));
                }
            }
            RelayPayload::Join => {
                if from == self.local {
                    return Ok(Flow::Continue);
                }
                self.emit(RoomEvent::PeerJoined(from.clone()));
                let session = self.registry.create_initiator(&from).await?;
                self.monitor.start(Arc::clone(&self.registry));
                if let Err(e) = self.offer_to(&from, &session).await {
                    if self.registry.remove_session(&from, session.generation()).await {
                        self.monitor.forget(&from);
                        self.emit(RoomEvent::SessionFailed {
                            peer: from,
                            reason: e.to_string(),
                        });
                    }
                    return Err(e);
                }
            }
            RelayPayload::Offer { description } => {
                let session = self.registry.session_for_offer(&from).await?;
                self.monitor.start(Arc::clone(&self.registry));
                let outcome = session.set_remote_description(description).await?;
                if outcome.is_applied() {
                    let answer = session.create_answer().await?;
                    self.mediator.send_answer(&from, answer).await?;
                } else {
                    tracing::debug!(peer = %from, outcome = ?outcome, "Offer not applied");
                }
            }
            RelayPayload::Answer { description } => match self.registry.get(&from) {
                Some(session) => {
                    let outcome = session.set_remote_description(description).await?;
                    tracing::debug!(peer = %from, outcome = ?outcome, "Answer processed");
                }
                None => tracing::debug!(peer = %from, "Answer without a session"),
            },
            RelayPayload::IceCandidate { candidate } => match self.registry.get(&from) {
                Some(session) => session.add_ice_candidate(candidate).await,
                None => tracing::debug!(peer = %from, "ICE candidate without a session"),
            },
            RelayPayload::Leave => {
                self.drop_peer(&from).await;
                self.emit(RoomEvent::PeerLeft(from));
            }
            RelayPayload::Kick { target } => {
                if target == self.local {
                    tracing::warn!(by = %from, "Removed from room");
                    self.teardown().await;
                    self.emit(RoomEvent::Kicked);
                    return Ok(Flow::Stop);
                }
                self.drop_peer(&target).await;
                self.emit(RoomEvent::PeerLeft(target));
            }
            RelayPayload::HandRaise { raised } => {
                self.emit(RoomEvent::HandRaised { peer: from, raised });
            }
            RelayPayload::MediaToggle { kind, enabled } => self.emit(RoomEvent::MediaToggled {
                peer: from,
                kind,
                enabled,
            }),
            RelayPayload::ScreenShare { active } => {
                self.emit(RoomEvent::ScreenShare { peer: from, active });
            }
            RelayPayload::Chat { text } => self.emit(RoomEvent::Chat { peer: from, text }),
            RelayPayload::FileStart(meta) => {
                let filename = meta.filename.clone();
                let started = self.transfers.lock().on_start(from.clone(), meta);
                match started {
                    Ok(()) => self.emit(RoomEvent::TransferProgress {
                        peer: Some(from),
                        direction: TransferDirection::Incoming,
                        filename,
                        percent: 0.0,
                    }),
                    Err(e) => self.reject_transfer(from, &e),
                }
            }
            RelayPayload::FileChunk { index, data } => {
                let accepted = {
                    let mut transfers = self.transfers.lock();
                    transfers.on_chunk(&from, index, data)
                };
                match accepted {
                    Ok(percent) => {
                        let filename = self.incoming_filename(&from);
                        self.emit(RoomEvent::TransferProgress {
                            peer: Some(from),
                            direction: TransferDirection::Incoming,
                            filename,
                            percent,
                        });
                    }
                    Err(TransferError::UnknownTransfer(_)) => {
                        tracing::debug!(peer = %from, index, "Chunk without a transfer");
                    }
                    Err(e) => self.reject_transfer(from, &e),
                }
            }
            RelayPayload::FileEnd => {
                let finished = self.transfers.lock().on_end(&from);
                match finished {
                    Ok(file) => {
                        tracing::info!(
                            peer = %from,
                            filename = %file.meta.filename,
                            size = file.meta.size,
                            "File received and verified"
                        );
                        self.emit(RoomEvent::TransferCompleted(file));
                    }
                    Err(TransferError::UnknownTransfer(_)) => {
                        tracing::debug!(peer = %from, "File end without a transfer");
                    }
                    Err(e) => self.reject_transfer(from, &e),
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn offer_to(&self, peer: &PeerId, session: &PeerSession) -> Result<(), RoomError> {
        let offer = session.create_offer().await?;
        self.mediator.send_offer(peer, offer).await?;
        Ok(())
    }

    /// Apply one session lifecycle event
    pub async fn handle_session_event(&self, event: SessionEvent) {
        let SessionEvent {
            peer,
            generation,
            kind,
        } = event;
        let current = self
            .registry
            .get(&peer)
            .is_some_and(|s| s.generation() == generation);

        match kind {
            SessionEventKind::IceCandidate(candidate) => {
                if !current {
                    return;
                }
                if let Err(e) = self.mediator.send_ice_candidate(&peer, candidate).await {
                    tracing::debug!(peer = %peer, error = %e, "Failed to relay ICE candidate");
                }
            }
            SessionEventKind::RemoteStream(stream) => {
                if current {
                    self.emit(RoomEvent::RemoteStream { peer, stream });
                }
            }
            SessionEventKind::RemoteTrackAdded(track) => {
                if current {
                    self.emit(RoomEvent::RemoteTrackAdded { peer, track });
                }
            }
            SessionEventKind::StateChanged(state) => {
                if current {
                    self.emit(RoomEvent::ConnectionStateChanged { peer, state });
                }
            }
            SessionEventKind::Closed => {
                if self.registry.remove_session(&peer, generation).await {
                    self.transfers.lock().discard(&peer);
                    self.monitor.forget(&peer);
                }
            }
            SessionEventKind::Error(reason) => {
                if self.registry.remove_session(&peer, generation).await {
                    self.transfers.lock().discard(&peer);
                    self.monitor.forget(&peer);
                    self.emit(RoomEvent::SessionFailed { peer, reason });
                }
            }
        }
    }

    /// Send a file to `to`, or to the whole room
    ///
    /// # Errors
    ///
    /// Returns `NotEntered`/`Closed`, or `Transfer` if the relay went away
    #[tracing::instrument(skip(self, file), fields(filename = %file.filename, to = ?to))]
    pub async fn send_file(
        &self,
        file: OutgoingFile,
        to: Option<PeerId>,
    ) -> Result<TransferReport, RoomError> {
        self.ensure_active()?;
        let sender = FileSender::from_config(&self.config);
        let sink = self.mediator.transfer_sink(to.clone());
        let events = self.event_sender.clone();
        let filename = file.filename.clone();
        let report = sender
            .send(&file, &sink, |percent| {
                let _ = events.send(RoomEvent::TransferProgress {
                    peer: to.clone(),
                    direction: TransferDirection::Outgoing,
                    filename: filename.clone(),
                    percent,
                });
            })
            .await?;
        Ok(report)
    }

    /// Raise or lower the local hand
    ///
    /// # Errors
    ///
    /// Returns `NotEntered`/`Closed` or the relay error
    pub async fn raise_hand(&self, raised: bool) -> Result<(), RoomError> {
        self.ensure_active()?;
        self.mediator.raise_hand(raised).await?;
        self.state.lock().hand_raised = raised;
        Ok(())
    }

    /// Whether the local hand is raised
    pub fn hand_raised(&self) -> bool {
        self.state.lock().hand_raised
    }

    /// Mute or unmute the local track of `kind`; `false` if there is none
    ///
    /// # Errors
    ///
    /// Returns `NotEntered`/`Closed` or the relay error
    pub async fn toggle_media(&self, kind: TrackKind, enabled: bool) -> Result<bool, RoomError> {
        self.ensure_active()?;
        let Some(track) = self.local_media().track(kind).await else {
            tracing::warn!(kind = %kind, "No local track to toggle");
            return Ok(false);
        };
        track.set_enabled(enabled);
        self.mediator.toggle_media(kind, enabled).await?;
        Ok(true)
    }

    /// Switch the device feeding `kind`; returns how many sessions swapped
    ///
    /// # Errors
    ///
    /// Returns `Media` if the device cannot be acquired
    #[tracing::instrument(skip(self))]
    pub async fn switch_device(
        &self,
        kind: TrackKind,
        device_id: &str,
    ) -> Result<usize, RoomError> {
        self.ensure_active()?;
        let track = self.devices.acquire_track(kind, Some(device_id)).await?;
        if let Some(current) = self.local_media().track(kind).await {
            track.set_enabled(current.is_enabled());
        }
        let (_, swapped) = self.registry.switch_track(track).await;
        Ok(swapped)
    }

    /// Replace the outgoing video with a screen capture track
    ///
    /// # Errors
    ///
    /// Returns `NotVideo` for an audio track, or the relay error
    pub async fn start_screen_share(&self, track: LocalTrack) -> Result<usize, RoomError> {
        self.ensure_active()?;
        if track.kind != TrackKind::Video {
            return Err(RoomError::NotVideo);
        }
        let (previous, swapped) = self.registry.switch_track(track).await;
        {
            let mut state = self.state.lock();
            if state.camera_before_share.is_none() {
                state.camera_before_share = previous;
            }
        }
        self.mediator.screen_share(true).await?;
        Ok(swapped)
    }

    /// Restore the camera; `false` if no share was active
    ///
    /// # Errors
    ///
    /// Returns the relay error
    pub async fn stop_screen_share(&self) -> Result<bool, RoomError> {
        self.ensure_active()?;
        let camera = self.state.lock().camera_before_share.take();
        let Some(camera) = camera else {
            return Ok(false);
        };
        self.registry.switch_track(camera).await;
        self.mediator.screen_share(false).await?;
        Ok(true)
    }

    /// Set the target bitrate reported in quality samples
    pub fn set_target_bitrate(&self, kbps: u32) -> u32 {
        self.monitor.set_target_bitrate(kbps)
    }

    /// Ask the relay to remove `peer` and drop its session locally
    ///
    /// # Errors
    ///
    /// Returns `NotEntered`/`Closed` or the relay error
    pub async fn kick(&self, peer: &PeerId) -> Result<(), RoomError> {
        self.ensure_active()?;
        self.mediator.kick(peer).await?;
        self.drop_peer(peer).await;
        Ok(())
    }

    /// Announce departure and tear everything down
    pub async fn leave(&self) {
        if self.state.lock().closed {
            return;
        }
        if let Err(e) = self.mediator.leave().await {
            tracing::warn!(error = %e, "Failed to announce departure");
        }
        self.teardown().await;
        tracing::info!(local = %self.local, "Left room");
    }

    /// Whether the room has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn drop_peer(&self, peer: &PeerId) {
        self.registry.remove(peer).await;
        self.transfers.lock().discard(peer);
        self.monitor.forget(peer);
    }

    async fn teardown(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.hand_raised = false;
            state.camera_before_share = None;
        }
        let _ = self.closed_tx.send(true);
        self.monitor.stop();
        if let Some(capture) = self.capture.lock().take() {
            capture.stop();
        }
        self.registry.clear().await;
        self.transfers.lock().clear();
    }

    fn ensure_active(&self) -> Result<(), RoomError> {
        let state = self.state.lock();
        if state.closed {
            Err(RoomError::Closed)
        } else if !state.entered {
            Err(RoomError::NotEntered)
        } else {
            Ok(())
        }
    }

    fn incoming_filename(&self, from: &PeerId) -> String {
        self.transfers
            .lock()
            .filename(from)
            .unwrap_or_default()
    }

    fn reject_transfer(&self, peer: PeerId, error: &TransferError) {
        tracing::warn!(peer = %peer, error = %error, "Incoming transfer rejected");
        self.emit(RoomEvent::TransferRejected {
            peer,
            reason: error.to_string(),
        });
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.event_sender.send(event);
    }
}

/// Room builder
pub struct RoomBuilder<B: RelayBus> {
    bus: Arc<B>,
    room: RoomId,
    factory: Arc<dyn TransportFactory>,
    devices: Arc<dyn MediaDevices>,
    config: RoomConfig,
    local_frames: Option<Arc<dyn FrameGrabber>>,
    remote_frames: Arc<dyn RemoteFrameSource>,
}

impl<B: RelayBus> RoomBuilder<B> {
    /// Create new builder
    #[must_use]
    pub fn new(
        bus: Arc<B>,
        room: RoomId,
        factory: Arc<dyn TransportFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        Self {
            bus,
            room,
            factory,
            devices,
            config: RoomConfig::default(),
            local_frames: None,
            remote_frames: Arc::new(NoRemoteFrames),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: RoomConfig) -> Self {
        self.config = config;
        self
    }

    /// Frame sources for the fidelity scores
    ///
    /// The local grabber is sampled on its own interval once the room is
    /// entered.
    #[must_use]
    pub fn with_frames(
        mut self,
        local: Option<Arc<dyn FrameGrabber>>,
        remote: Arc<dyn RemoteFrameSource>,
    ) -> Self {
        self.local_frames = local;
        self.remote_frames = remote;
        self
    }

    /// Build the room
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid
    pub fn build(self) -> Result<Room<B>, RoomError> {
        self.config.validate()?;
        let local = self.bus.local_id();
        let (event_sender, _) = broadcast::channel(self.config.event_channel_capacity);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let registry = Arc::new(SessionRegistry::new(
            local.clone(),
            self.factory,
            LocalMedia::new(LocalStream::default()),
            &self.config,
            session_tx,
        ));
        let monitor = QualityMonitor::new(&self.config);
        monitor.set_remote_frames(self.remote_frames);

        tracing::debug!(local = %local, room = %self.room, "Room built");
        Ok(Room {
            local,
            mediator: SignalingMediator::new(self.bus, self.room),
            config: self.config,
            registry,
            devices: self.devices,
            transfers: Mutex::new(TransferManager::new()),
            monitor,
            local_frames: self.local_frames,
            capture: Mutex::new(None),
            event_sender,
            session_events: tokio::sync::Mutex::new(session_rx),
            state: Mutex::new(RoomState::default()),
            closed_tx,
        })
    }
}
