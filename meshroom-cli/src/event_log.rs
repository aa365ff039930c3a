//! Console rendering of room events

use meshroom_core::{RoomEvent, TransferDirection};
use serde::Serialize;

/// How events are written to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    Pretty,
    /// One JSON object per line
    Json,
}

/// One rendered event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventLine {
    /// Short event name
    pub kind: &'static str,
    /// Peer the event concerns, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    /// Free-form detail
    pub detail: String,
}

impl EventLine {
    fn new(kind: &'static str, peer: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            peer,
            detail: detail.into(),
        }
    }

    /// Render in the given format
    pub fn render(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Json => serde_json::to_string(self).unwrap_or_default(),
            LogFormat::Pretty => {
                let icon = icon(self.kind);
                match &self.peer {
                    Some(peer) => format!("{icon} [{peer}] {}", self.detail),
                    None => format!("{icon} {}", self.detail),
                }
            }
        }
    }
}

fn icon(kind: &str) -> &'static str {
    match kind {
        "peer_joined" => "👋",
        "peer_left" => "🚪",
        "connection" => "🔗",
        "session_failed" | "fatal" | "transfer_rejected" => "❌",
        "transfer" => "📦",
        "transfer_completed" => "✅",
        "quality" => "📊",
        "kicked" => "⛔",
        _ => "•",
    }
}

/// Map an event to a line; incoming transfer progress below 100% is dropped
/// so a large file does not flood the console
pub fn describe(event: &RoomEvent) -> Option<EventLine> {
    let line = match event {
        RoomEvent::PeerJoined(peer) => {
            EventLine::new("peer_joined", Some(peer.to_string()), "joined")
        }
        RoomEvent::PeerLeft(peer) => EventLine::new("peer_left", Some(peer.to_string()), "left"),
        RoomEvent::RemoteStream { peer, stream } => EventLine::new(
            "remote_stream",
            Some(peer.to_string()),
            format!("remote stream with {} track(s)", stream.tracks.len()),
        ),
        RoomEvent::RemoteTrackAdded { peer, track } => EventLine::new(
            "remote_track",
            Some(peer.to_string()),
            format!("{} track added", track.kind),
        ),
        RoomEvent::ConnectionStateChanged { peer, state } => EventLine::new(
            "connection",
            Some(peer.to_string()),
            state.to_string(),
        ),
        RoomEvent::SessionFailed { peer, reason } => {
            EventLine::new("session_failed", Some(peer.to_string()), reason.clone())
        }
        RoomEvent::HandRaised { peer, raised } => EventLine::new(
            "hand",
            Some(peer.to_string()),
            if *raised { "raised hand" } else { "lowered hand" },
        ),
        RoomEvent::MediaToggled { peer, kind, enabled } => EventLine::new(
            "media",
            Some(peer.to_string()),
            format!("{kind} {}", if *enabled { "on" } else { "off" }),
        ),
        RoomEvent::ScreenShare { peer, active } => EventLine::new(
            "screen_share",
            Some(peer.to_string()),
            if *active { "sharing screen" } else { "stopped sharing" },
        ),
        RoomEvent::Chat { peer, text } => {
            EventLine::new("chat", Some(peer.to_string()), text.clone())
        }
        RoomEvent::Kicked => EventLine::new("kicked", None, "removed from the room"),
        RoomEvent::Fatal { reason, guidance } => {
            EventLine::new("fatal", None, format!("{reason}. {guidance}"))
        }
        RoomEvent::TransferProgress {
            peer,
            direction,
            filename,
            percent,
        } => {
            if *direction == TransferDirection::Incoming && *percent < 100.0 {
                return None;
            }
            let arrow = match direction {
                TransferDirection::Outgoing => "sending",
                TransferDirection::Incoming => "receiving",
            };
            EventLine::new(
                "transfer",
                peer.as_ref().map(ToString::to_string),
                format!("{arrow} {filename} {percent:.0}%"),
            )
        }
        RoomEvent::TransferCompleted(file) => EventLine::new(
            "transfer_completed",
            Some(file.from.to_string()),
            format!(
                "{} ({} bytes, sha256 {})",
                file.meta.filename,
                file.meta.size,
                short_hash(&file.verification.computed_hash)
            ),
        ),
        RoomEvent::TransferRejected { peer, reason } => {
            EventLine::new("transfer_rejected", Some(peer.to_string()), reason.clone())
        }
        RoomEvent::QualitySample(sample) => {
            let throughput = sample
                .throughput_kbps
                .map(|kbps| format!("{kbps:.0} kbps"))
                .unwrap_or_else(|| "-".to_string());
            let psnr = sample
                .fidelity
                .map(|db| format!("{db:.1} dB"))
                .unwrap_or_else(|| "-".to_string());
            EventLine::new(
                "quality",
                Some(sample.peer.to_string()),
                format!(
                    "{throughput} (target {} kbps), psnr {psnr}",
                    sample.target_bitrate_kbps
                ),
            )
        }
    };
    Some(line)
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
