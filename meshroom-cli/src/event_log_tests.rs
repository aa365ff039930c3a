//! Tests for event rendering

#[cfg(test)]
mod tests {
    use super::super::event_log::*;
    use meshroom_core::{ConnectionState, PeerId, RoomEvent, TransferDirection};

    #[test]
    fn test_connection_line() {
        let event = RoomEvent::ConnectionStateChanged {
            peer: PeerId::new("alice"),
            state: ConnectionState::Connected,
        };
        let line = describe(&event).unwrap();
        assert_eq!(line.kind, "connection");
        assert_eq!(line.peer.as_deref(), Some("alice"));
        assert_eq!(line.render(LogFormat::Pretty), "🔗 [alice] connected");
    }

    #[test]
    fn test_incoming_progress_is_quiet_until_done() {
        let progress = |percent| RoomEvent::TransferProgress {
            peer: Some(PeerId::new("bob")),
            direction: TransferDirection::Incoming,
            filename: "a.bin".to_string(),
            percent,
        };
        assert!(describe(&progress(50.0)).is_none());
        assert!(describe(&progress(100.0)).is_some());
    }

    #[test]
    fn test_outgoing_progress_is_always_shown() {
        let event = RoomEvent::TransferProgress {
            peer: None,
            direction: TransferDirection::Outgoing,
            filename: "a.bin".to_string(),
            percent: 40.0,
        };
        let line = describe(&event).unwrap();
        assert_eq!(line.render(LogFormat::Pretty), "📦 sending a.bin 40%");
    }

    #[test]
    fn test_json_format_omits_missing_peer() {
        let line = describe(&RoomEvent::Kicked).unwrap();
        let json: serde_json::Value = serde_json::from_str(&line.render(LogFormat::Json)).unwrap();
        assert_eq!(json["kind"], "kicked");
        assert!(json.get("peer").is_none());
    }
}
