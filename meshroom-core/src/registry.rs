//! Session registry for one room visit
//!
//! Keeps at most one live [`PeerSession`] per remote identity. Sessions are
//! created from two entry points with a fixed tie-break: a peer learned from
//! the membership snapshot (already present) is answered lazily on its first
//! offer, while a peer learned from a later join is initiated immediately.
//! The side that sees a peer as already present never initiates, so a pair
//! never produces two offers.

use crate::config::RoomConfig;
use crate::identity::PeerId;
use crate::media::{LocalMedia, LocalTrack};
use crate::session::{PeerSession, SessionError, SessionEvent, SessionOptions};
use crate::transport::TransportFactory;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Mesh is at its configured size
    #[error("Room is full ({max} peers)")]
    Full {
        /// Configured limit
        max: usize,
    },

    /// Attempted to open a session to the local identity
    #[error("Cannot open a session to self")]
    SelfSession,

    /// Session setup failed
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Live sessions keyed by remote identity
pub struct SessionRegistry {
    local: PeerId,
    sessions: RwLock<HashMap<PeerId, Arc<PeerSession>>>,
    present: RwLock<HashSet<PeerId>>,
    factory: Arc<dyn TransportFactory>,
    local_media: LocalMedia,
    events: mpsc::UnboundedSender<SessionEvent>,
    options: SessionOptions,
    max_peers: usize,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("local", &self.local)
            .field("peers", &self.peers())
            .field("max_peers", &self.max_peers)
            .finish()
    }
}

impl SessionRegistry {
    /// Registry for `local`; session events from every session go to `events`
    pub fn new(
        local: PeerId,
        factory: Arc<dyn TransportFactory>,
        local_media: LocalMedia,
        config: &RoomConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            local,
            sessions: RwLock::new(HashMap::new()),
            present: RwLock::new(HashSet::new()),
            factory,
            local_media,
            events,
            options: SessionOptions::from_config(config),
            max_peers: config.max_peers,
        }
    }

    /// Shared local media
    pub fn local_media(&self) -> &LocalMedia {
        &self.local_media
    }

    /// Record peers from a membership snapshot; they will offer to us
    pub fn note_present(&self, peers: impl IntoIterator<Item = PeerId>) {
        let mut present = self.present.write();
        for peer in peers.into_iter().filter(|p| *p != self.local && !p.is_empty()) {
            tracing::debug!(peer = %peer, "Peer already present, awaiting offer");
            present.insert(peer);
        }
    }

    /// Whether `peer` was seen in the membership snapshot or has a session
    pub fn is_present(&self, peer: &PeerId) -> bool {
        self.present.read().contains(peer) || self.sessions.read().contains_key(peer)
    }

    /// Open an initiating session to a newly joined peer
    ///
    /// Any previous session for the same identity is disconnected first.
    ///
    /// # Errors
    ///
    /// Returns `SelfSession`, `Full`, or the session setup error
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn create_initiator(
        &self,
        peer: &PeerId,
    ) -> Result<Arc<PeerSession>, RegistryError> {
        if let Some(stale) = self.take(peer) {
            tracing::info!(
                peer = %peer,
                generation = %stale.generation(),
                "Evicting stale session before initiating"
            );
            stale.disconnect().await;
        }
        self.open(peer, true).await
    }

    /// Session that should consume an offer from `peer`
    ///
    /// Reuses a live session, otherwise creates the answering side lazily.
    ///
    /// # Errors
    ///
    /// Returns `SelfSession`, `Full`, or the session setup error
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn session_for_offer(
        &self,
        peer: &PeerId,
    ) -> Result<Arc<PeerSession>, RegistryError> {
        if let Some(existing) = self.get(peer) {
            if !existing.connection_state().is_terminal() {
                return Ok(existing);
            }
            if let Some(stale) = self.take(peer) {
                stale.disconnect().await;
            }
        }
        self.open(peer, false).await
    }

    async fn open(
        &self,
        peer: &PeerId,
        initiator: bool,
    ) -> Result<Arc<PeerSession>, RegistryError> {
        if *peer == self.local {
            return Err(RegistryError::SelfSession);
        }
        if self.len() >= self.max_peers {
            tracing::warn!(
                peer = %peer,
                max_peers = self.max_peers,
                "Refusing session, room is full"
            );
            return Err(RegistryError::Full { max: self.max_peers });
        }

        let session = Arc::new(PeerSession::new(
            peer.clone(),
            initiator,
            self.local_media.clone(),
            self.options,
            self.events.clone(),
        ));

        // Hold the media lock across connect and insert so a concurrent
        // device switch either precedes this session or reaches it.
        let stream = self.local_media.lock().await;
        let tracks = stream.tracks().to_vec();
        if let Err(e) = session.connect(self.factory.as_ref(), Some(tracks)).await {
            drop(stream);
            session.disconnect().await;
            return Err(e.into());
        }
        let replaced = self.sessions.write().insert(peer.clone(), Arc::clone(&session));
        drop(stream);

        self.present.write().insert(peer.clone());
        if let Some(replaced) = replaced {
            replaced.disconnect().await;
        }
        tracing::info!(
            peer = %peer,
            initiator,
            generation = %session.generation(),
            "Peer session registered"
        );
        Ok(session)
    }

    /// Live session for `peer`
    pub fn get(&self, peer: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.read().get(peer).cloned()
    }

    /// Disconnect and evict `peer`; the identity is no longer considered present
    pub async fn remove(&self, peer: &PeerId) -> bool {
        self.present.write().remove(peer);
        match self.take(peer) {
            Some(session) => {
                session.disconnect().await;
                tracing::info!(peer = %peer, "Peer session removed");
                true
            }
            None => false,
        }
    }

    /// Evict `peer` only if its entry is still the session of `generation`
    pub async fn remove_session(&self, peer: &PeerId, generation: Uuid) -> bool {
        let session = {
            let mut sessions = self.sessions.write();
            let matches = sessions.get(peer).map(|s| s.generation() == generation);
            match matches {
                Some(true) => sessions.remove(peer),
                Some(false) => {
                    tracing::debug!(
                        peer = %peer,
                        generation = %generation,
                        "Ignoring close from superseded session"
                    );
                    None
                }
                None => None,
            }
        };
        match session {
            Some(session) => {
                self.present.write().remove(peer);
                session.disconnect().await;
                tracing::info!(
                    peer = %peer,
                    generation = %generation,
                    "Closed peer session evicted"
                );
                true
            }
            None => false,
        }
    }

    /// Disconnect everything
    pub async fn clear(&self) {
        let sessions: Vec<Arc<PeerSession>> = {
            let mut map = self.sessions.write();
            map.drain().map(|(_, s)| s).collect()
        };
        self.present.write().clear();
        for session in &sessions {
            session.disconnect().await;
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "All peer sessions cleared");
        }
    }

    /// Identities with a live entry, sorted
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.sessions.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// All live sessions
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether there are no live entries
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Replace the local track of `track.kind` and fan it out to every session
    ///
    /// Returns the previous track and the number of sessions that swapped.
    #[tracing::instrument(skip(self, track), fields(kind = %track.kind, track_id = %track.id))]
    pub async fn switch_track(&self, track: LocalTrack) -> (Option<LocalTrack>, usize) {
        let mut stream = self.local_media.lock().await;
        let previous = stream.replace(track.clone());
        let mut swapped = 0;
        for session in self.sessions() {
            if session.replace_track(&track).await {
                swapped += 1;
            }
        }
        drop(stream);
        tracing::info!(swapped, "Local track switched");
        (previous, swapped)
    }

    fn take(&self, peer: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.write().remove(peer)
    }
}

// Compile-time assertion that SessionRegistry is Send + Sync
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<SessionRegistry>();
};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;
    use crate::media::LocalStream;
    use crate::types::{ConnectionState, TrackKind};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn registry(local: &str, network: &Arc<LoopbackNetwork>, max_peers: usize) -> SessionRegistry {
        let (tx, _rx) = mpsc::unbounded_channel();
        let media = LocalMedia::new(LocalStream::new(vec![
            LocalTrack::with_id(format!("mic-{local}"), TrackKind::Audio),
            LocalTrack::with_id(format!("cam-{local}"), TrackKind::Video),
        ]));
        let config = RoomConfig {
            max_peers,
            ..RoomConfig::default()
        };
        SessionRegistry::new(
            PeerId::new(local),
            Arc::new(network.factory(local)),
            media,
            &config,
            tx,
        )
    }

    #[tokio::test]
    async fn test_initiator_replaces_stale_session() {
        let network = LoopbackNetwork::new();
        let reg = registry("a", &network, 8);
        let peer = PeerId::new("b");

        let first = reg.create_initiator(&peer).await.unwrap();
        let second = reg.create_initiator(&peer).await.unwrap();
        assert_ne!(first.generation(), second.generation());
        assert_eq!(first.connection_state(), ConnectionState::Closed);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&peer).unwrap().generation(), second.generation());
    }

    #[tokio::test]
    async fn test_offer_reuses_live_session() {
        let network = LoopbackNetwork::new();
        let reg = registry("b", &network, 8);
        let peer = PeerId::new("a");
        reg.note_present([peer.clone()]);
        assert!(reg.is_present(&peer));
        assert!(reg.is_empty());

        let first = reg.session_for_offer(&peer).await.unwrap();
        assert!(!first.is_initiator());
        let again = reg.session_for_offer(&peer).await.unwrap();
        assert_eq!(first.generation(), again.generation());
    }

    #[tokio::test]
    async fn test_remove_session_checks_generation() {
        let network = LoopbackNetwork::new();
        let reg = registry("a", &network, 8);
        let peer = PeerId::new("b");

        let old = reg.create_initiator(&peer).await.unwrap();
        let current = reg.create_initiator(&peer).await.unwrap();
        assert!(!reg.remove_session(&peer, old.generation()).await);
        assert_eq!(reg.len(), 1);
        assert!(reg.remove_session(&peer, current.generation()).await);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_limits_and_self() {
        let network = LoopbackNetwork::new();
        let reg = registry("a", &network, 1);
        assert_eq!(
            reg.create_initiator(&PeerId::new("a")).await.unwrap_err(),
            RegistryError::SelfSession
        );
        reg.create_initiator(&PeerId::new("b")).await.unwrap();
        assert_eq!(
            reg.session_for_offer(&PeerId::new("c")).await.unwrap_err(),
            RegistryError::Full { max: 1 }
        );
    }

    #[tokio::test]
    async fn test_switch_track_fans_out() {
        let network = LoopbackNetwork::new();
        let reg = registry("a", &network, 8);
        reg.create_initiator(&PeerId::new("b")).await.unwrap();
        reg.create_initiator(&PeerId::new("c")).await.unwrap();

        let replacement = LocalTrack::with_id("cam-2", TrackKind::Video);
        let (previous, swapped) = reg.switch_track(replacement.clone()).await;
        assert_eq!(previous.unwrap().id, "cam-a");
        assert_eq!(swapped, 2);
        assert_eq!(reg.local_media().track(TrackKind::Video).await.unwrap().id, "cam-2");

        let link = network
            .transport(&PeerId::new("a"), &PeerId::new("b"))
            .unwrap();
        assert!(link.senders().iter().any(|t| t.id == "cam-2"));

        // sessions opened after the switch carry the new track
        reg.create_initiator(&PeerId::new("d")).await.unwrap();
        let link = network
            .transport(&PeerId::new("a"), &PeerId::new("d"))
            .unwrap();
        assert!(link.senders().iter().any(|t| t.id == "cam-2"));
    }

    #[tokio::test]
    async fn test_clear_disconnects_all() {
        let network = LoopbackNetwork::new();
        let reg = registry("a", &network, 8);
        let b = reg.create_initiator(&PeerId::new("b")).await.unwrap();
        let c = reg.create_initiator(&PeerId::new("c")).await.unwrap();
        reg.clear().await;
        assert!(reg.is_empty());
        assert_eq!(b.connection_state(), ConnectionState::Closed);
        assert_eq!(c.connection_state(), ConnectionState::Closed);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Joined(u8),
        Offer(u8),
        Leave(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4).prop_map(Op::Joined),
            (0u8..4).prop_map(Op::Offer),
            (0u8..4).prop_map(Op::Leave),
        ]
    }

    proptest! {
        #[test]
        fn prop_one_live_session_per_identity(ops in proptest::collection::vec(op(), 1..40)) {
            tokio_test::block_on(async {
                let network = LoopbackNetwork::new();
                let reg = registry("local", &network, 16);
                let mut created: Vec<Arc<PeerSession>> = Vec::new();

                for op in ops {
                    match op {
                        Op::Joined(n) => {
                            let peer = PeerId::new(format!("p{n}"));
                            created.push(reg.create_initiator(&peer).await.unwrap());
                        }
                        Op::Offer(n) => {
                            let peer = PeerId::new(format!("p{n}"));
                            created.push(reg.session_for_offer(&peer).await.unwrap());
                        }
                        Op::Leave(n) => {
                            reg.remove(&PeerId::new(format!("p{n}"))).await;
                        }
                    }

                    let mut live: HashMap<PeerId, usize> = HashMap::new();
                    for session in &created {
                        if session.connection_state() != ConnectionState::Closed {
                            *live.entry(session.peer().clone()).or_default() += 1;
                        }
                    }
                    for (peer, count) in &live {
                        prop_assert_eq!(*count, 1, "two live sessions for {}", peer);
                        prop_assert!(reg.get(peer).is_some());
                    }
                    prop_assert_eq!(live.len(), reg.len());
                }
                Ok(())
            })?;
        }
    }
}
