//! End-to-end room tests
//!
//! Several rooms share one in-memory relay hub and one loopback network, each
//! with its own `run` loop, as separate processes would.

use bytes::Bytes;
use meshroom_core::signaling::{Envelope, RelayPayload};
use meshroom_core::{
    content_hash, ConnectionState, FileMeta, LoopbackNetwork, MediaConstraints, MemoryRelay,
    MemoryRelayHub, OutgoingFile, PeerId, Room, RoomConfig, RoomEvent, RoomId, SyntheticDevices,
    TrackKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct Participant {
    room: Arc<Room<MemoryRelay>>,
    events: broadcast::Receiver<RoomEvent>,
    task: JoinHandle<()>,
}

fn config() -> RoomConfig {
    RoomConfig {
        chunk_size: 4 * 1024,
        chunk_delay_ms: 1,
        metrics_interval_ms: 50,
        answer_retry_delay_ms: 10,
        ..RoomConfig::default()
    }
}

async fn join(
    hub: &Arc<MemoryRelayHub>,
    network: &Arc<LoopbackNetwork>,
    id: &str,
) -> anyhow::Result<Participant> {
    let room = Room::builder(
        Arc::new(hub.connect(id)),
        RoomId::new("integration"),
        Arc::new(network.factory(id)),
        Arc::new(SyntheticDevices::new()),
    )
    .with_config(config())
    .build()?;
    let room = Arc::new(room);
    let events = room.subscribe();
    room.enter(MediaConstraints::video_call()).await?;

    let runner = Arc::clone(&room);
    let task = tokio::spawn(async move {
        let _ = runner.run().await;
    });
    Ok(Participant { room, events, task })
}

/// Wait for the first event matching `wanted`
async fn expect_event(
    events: &mut broadcast::Receiver<RoomEvent>,
    wanted: impl Fn(&RoomEvent) -> bool,
) -> Option<RoomEvent> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

fn completed(event: &RoomEvent) -> bool {
    matches!(event, RoomEvent::TransferCompleted(_))
}

fn connected_to(peer: &str) -> impl Fn(&RoomEvent) -> bool + '_ {
    move |event| {
        matches!(
            event,
            RoomEvent::ConnectionStateChanged { peer: p, state: ConnectionState::Connected }
                if p.as_str() == peer
        )
    }
}

#[tokio::test]
async fn two_participants_connect() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let mut alice = join(&hub, &network, "alice").await?;
    let mut bob = join(&hub, &network, "bob").await?;

    assert!(expect_event(&mut alice.events, connected_to("bob")).await.is_some());
    assert!(expect_event(&mut bob.events, connected_to("alice")).await.is_some());

    // the existing member initiates towards the newcomer
    let to_bob = alice.room.registry().get(&PeerId::new("bob"));
    assert!(to_bob.is_some_and(|s| s.is_initiator()));
    let to_alice = bob.room.registry().get(&PeerId::new("alice"));
    assert!(to_alice.is_some_and(|s| !s.is_initiator()));

    alice.task.abort();
    bob.task.abort();
    Ok(())
}

#[tokio::test]
async fn newcomer_sees_existing_members() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let alice = join(&hub, &network, "alice").await?;
    let mut bob = join(&hub, &network, "bob").await?;

    let joined = expect_event(&mut bob.events, |e| matches!(e, RoomEvent::PeerJoined(_))).await;
    assert!(matches!(joined, Some(RoomEvent::PeerJoined(p)) if p.as_str() == "alice"));
    assert!(bob.room.registry().is_present(&PeerId::new("alice")));

    alice.task.abort();
    bob.task.abort();
    Ok(())
}

#[tokio::test]
async fn file_reaches_every_participant_verified() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let mut alice = join(&hub, &network, "alice").await?;
    let mut bob = join(&hub, &network, "bob").await?;
    let mut carol = join(&hub, &network, "carol").await?;
    assert!(expect_event(&mut alice.events, connected_to("carol")).await.is_some());

    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
    let report = alice
        .room
        .send_file(OutgoingFile::new("notes.txt", "text/plain", data.clone()), None)
        .await?;
    assert_eq!(report.meta.total_chunks, 5);

    for events in [&mut bob.events, &mut carol.events] {
        let completed = expect_event(events, completed).await;
        let Some(RoomEvent::TransferCompleted(file)) = completed else {
            anyhow::bail!("transfer did not complete");
        };
        assert!(file.is_valid());
        assert_eq!(file.from, PeerId::new("alice"));
        assert_eq!(file.data.as_ref(), data.as_slice());
    }

    alice.task.abort();
    bob.task.abort();
    carol.task.abort();
    Ok(())
}

#[tokio::test]
async fn targeted_file_skips_other_participants() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let alice = join(&hub, &network, "alice").await?;
    let mut bob = join(&hub, &network, "bob").await?;
    let mut carol = join(&hub, &network, "carol").await?;

    alice
        .room
        .send_file(
            OutgoingFile::new("memo.txt", "text/plain", b"for bob".to_vec()),
            Some(PeerId::new("bob")),
        )
        .await?;

    let completed = expect_event(&mut bob.events, completed).await;
    assert!(completed.is_some());
    let carol_saw = tokio::time::timeout(
        Duration::from_millis(200),
        expect_event(&mut carol.events, |e| matches!(e, RoomEvent::TransferCompleted(_))),
    )
    .await;
    assert!(matches!(carol_saw, Err(_) | Ok(None)));

    alice.task.abort();
    bob.task.abort();
    carol.task.abort();
    Ok(())
}

#[tokio::test]
async fn kicked_participant_tears_down() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let mut alice = join(&hub, &network, "alice").await?;
    let mut bob = join(&hub, &network, "bob").await?;
    assert!(expect_event(&mut alice.events, connected_to("bob")).await.is_some());

    alice.room.kick(&PeerId::new("bob")).await?;

    assert!(expect_event(&mut bob.events, |e| matches!(e, RoomEvent::Kicked)).await.is_some());
    tokio::time::timeout(Duration::from_secs(5), &mut bob.task).await??;
    assert!(bob.room.is_closed());
    assert!(bob.room.registry().is_empty());

    let left = expect_event(&mut alice.events, |e| matches!(e, RoomEvent::PeerLeft(_))).await;
    assert!(matches!(left, Some(RoomEvent::PeerLeft(p)) if p.as_str() == "bob"));
    assert!(alice.room.registry().get(&PeerId::new("bob")).is_none());
    assert_eq!(hub.members(&RoomId::new("integration")), vec![PeerId::new("alice")]);

    alice.task.abort();
    Ok(())
}

#[tokio::test]
async fn leave_stops_the_run_loop() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let alice = join(&hub, &network, "alice").await?;
    let mut bob = join(&hub, &network, "bob").await?;

    alice.room.leave().await;
    tokio::time::timeout(Duration::from_secs(5), alice.task).await??;

    let left = expect_event(&mut bob.events, |e| matches!(e, RoomEvent::PeerLeft(_))).await;
    assert!(matches!(left, Some(RoomEvent::PeerLeft(p)) if p.as_str() == "alice"));

    bob.task.abort();
    Ok(())
}

#[tokio::test]
async fn presence_events_reach_the_room() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let alice = join(&hub, &network, "alice").await?;
    let mut bob = join(&hub, &network, "bob").await?;

    alice.room.raise_hand(true).await?;
    alice.room.toggle_media(TrackKind::Audio, false).await?;

    let hand = expect_event(&mut bob.events, |e| matches!(e, RoomEvent::HandRaised { .. })).await;
    assert!(matches!(
        hand,
        Some(RoomEvent::HandRaised { peer, raised: true }) if peer.as_str() == "alice"
    ));
    let muted =
        expect_event(&mut bob.events, |e| matches!(e, RoomEvent::MediaToggled { .. })).await;
    assert!(matches!(
        muted,
        Some(RoomEvent::MediaToggled { kind: TrackKind::Audio, enabled: false, .. })
    ));
    assert!(alice.room.hand_raised());

    alice.task.abort();
    bob.task.abort();
    Ok(())
}

#[tokio::test]
async fn quality_samples_flow_once_connected() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let mut alice = join(&hub, &network, "alice").await?;
    let bob = join(&hub, &network, "bob").await?;

    let sample =
        expect_event(&mut alice.events, |e| matches!(e, RoomEvent::QualitySample(_))).await;
    let Some(RoomEvent::QualitySample(sample)) = sample else {
        anyhow::bail!("no quality sample");
    };
    assert_eq!(sample.peer, PeerId::new("bob"));
    assert!(!alice.room.quality_history().is_empty());

    alice.task.abort();
    bob.task.abort();
    Ok(())
}

#[tokio::test]
async fn failed_transport_evicts_the_session() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let mut alice = join(&hub, &network, "alice").await?;
    let bob = join(&hub, &network, "bob").await?;
    assert!(expect_event(&mut alice.events, connected_to("bob")).await.is_some());

    let link = network
        .transport(&PeerId::new("alice"), &PeerId::new("bob"))
        .ok_or_else(|| anyhow::anyhow!("no link to bob"))?;
    link.fail();

    let failed =
        expect_event(&mut alice.events, |e| matches!(e, RoomEvent::SessionFailed { .. })).await;
    assert!(matches!(
        failed,
        Some(RoomEvent::SessionFailed { peer, .. }) if peer.as_str() == "bob"
    ));
    assert!(alice.room.registry().get(&PeerId::new("bob")).is_none());

    alice.task.abort();
    bob.task.abort();
    Ok(())
}

#[tokio::test]
async fn rejoin_gets_a_fresh_session() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let mut alice = join(&hub, &network, "alice").await?;
    let bob = join(&hub, &network, "bob").await?;
    assert!(expect_event(&mut alice.events, connected_to("bob")).await.is_some());
    let first = alice
        .room
        .registry()
        .get(&PeerId::new("bob"))
        .map(|s| s.generation())
        .ok_or_else(|| anyhow::anyhow!("no session for bob"))?;

    bob.room.leave().await;
    tokio::time::timeout(Duration::from_secs(5), bob.task).await??;
    let left = expect_event(&mut alice.events, |e| matches!(e, RoomEvent::PeerLeft(_))).await;
    assert!(matches!(left, Some(RoomEvent::PeerLeft(p)) if p.as_str() == "bob"));

    let mut bob = join(&hub, &network, "bob").await?;
    assert!(expect_event(&mut alice.events, connected_to("bob")).await.is_some());
    assert!(expect_event(&mut bob.events, connected_to("alice")).await.is_some());
    let second = alice.room.registry().get(&PeerId::new("bob")).map(|s| s.generation());
    assert!(second.is_some_and(|g| g != first));

    alice.task.abort();
    bob.task.abort();
    Ok(())
}

#[tokio::test]
async fn out_of_bounds_chunk_is_rejected_once() -> anyhow::Result<()> {
    let hub = MemoryRelayHub::new();
    let network = LoopbackNetwork::new();

    let mut bob = join(&hub, &network, "bob").await?;
    let room = RoomId::new("integration");
    let from = PeerId::new("mallory");
    let to = PeerId::new("bob");
    let frames = [
        RelayPayload::FileStart(FileMeta {
            filename: "bad.bin".into(),
            size: 8,
            mime_type: "application/octet-stream".into(),
            total_chunks: 2,
            hash: content_hash(b"abcdefgh"),
        }),
        RelayPayload::FileChunk {
            index: 0,
            data: Bytes::from_static(b"abcd"),
        },
        RelayPayload::FileChunk {
            index: 5,
            data: Bytes::from_static(b"efgh"),
        },
        RelayPayload::FileChunk {
            index: 1,
            data: Bytes::from_static(b"efgh"),
        },
        RelayPayload::FileEnd,
        RelayPayload::Chat { text: "done".into() },
    ];
    for payload in frames {
        let envelope = Envelope::targeted(room.clone(), from.clone(), to.clone(), payload);
        assert!(hub.inject(&to, envelope.encode()?));
    }

    // messages are handled in order, so the chat marks the end of the transfer
    let mut rejected = 0;
    let mut completed = 0;
    loop {
        let event = expect_event(&mut bob.events, |e| {
            matches!(
                e,
                RoomEvent::TransferRejected { .. }
                    | RoomEvent::TransferCompleted(_)
                    | RoomEvent::Chat { .. }
            )
        })
        .await;
        match event {
            Some(RoomEvent::TransferRejected { peer, .. }) => {
                assert_eq!(peer, from);
                rejected += 1;
            }
            Some(RoomEvent::TransferCompleted(_)) => completed += 1,
            _ => break,
        }
    }
    assert_eq!(rejected, 1);
    assert_eq!(completed, 0);

    bob.task.abort();
    Ok(())
}
