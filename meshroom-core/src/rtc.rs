//! webrtc-rs backed transport
//!
//! Wraps one `RTCPeerConnection` per peer session. Local tracks become
//! `TrackLocalStaticSample`s (VP8 for video, Opus for audio) so the consuming
//! surface can feed encoded samples into them.

use crate::config::RoomConfig;
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
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Map a webrtc-rs error, separating signaling-state violations
fn classify(err: webrtc::Error) -> TransportError {
    if matches!(err, webrtc::Error::ErrConnectionClosed) {
        return TransportError::Closed;
    }
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("signaling state") || lower.contains("invalid state") {
        TransportError::InvalidState(message)
    } else {
        TransportError::Negotiation(message)
    }
}

fn codec_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

/// Creates webrtc-rs peer connections
pub struct RtcTransportFactory {
    api: Arc<API>,
    configuration: RTCConfiguration,
}

impl RtcTransportFactory {
    /// Build an API with default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new(config: &RoomConfig) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api: Arc::new(api),
            configuration: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        remote: &PeerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration.clone())
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?,
        );

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize ICE candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    if let Some(kind) = codec_kind(track.kind()) {
                        let _ = tx.send(TransportEvent::RemoteTrack(RemoteTrack {
                            id: track.id().to_string(),
                            kind,
                        }));
                    }
                })
            },
        ));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(state) = map_state(state) {
                    let _ = tx.send(TransportEvent::StateChanged(state));
                }
            })
        }));

        tracing::debug!(remote = %remote, "Peer connection created");
        Ok(Arc::new(RtcTransport {
            pc,
            stream_id: format!("meshroom-{remote}"),
        }))
    }
}

/// One webrtc-rs peer connection
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    stream_id: String,
}

impl RtcTransport {
    fn sample_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        let codec = match track.kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        Arc::new(TrackLocalStaticSample::new(
            codec,
            track.id.clone(),
            self.stream_id.clone(),
        ))
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(classify)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(classify)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(classify)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(classify)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        self.pc.set_remote_description(remote).await.map_err(classify)
    }

    async fn remote_description_type(&self) -> Option<SdpType> {
        self.pc
            .remote_description()
            .await
            .and_then(|d| match d.sdp_type {
                RTCSdpType::Offer => Some(SdpType::Offer),
                RTCSdpType::Answer => Some(SdpType::Answer),
                _ => None,
            })
    }

    fn negotiation_state(&self) -> NegotiationState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                NegotiationState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                NegotiationState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => NegotiationState::Closed,
            _ => NegotiationState::Stable,
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc.add_ice_candidate(init).await.map_err(classify)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = self.sample_track(track);
        self.pc
            .add_track(local)
            .await
            .map_err(|e| TransportError::Track(e.to_string()))?;
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError> {
        let wanted = match track.kind {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        for sender in self.pc.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            if current.kind() != wanted {
                continue;
            }
            let replacement: Arc<dyn TrackLocal + Send + Sync> = self.sample_track(track);
            sender
                .replace_track(Some(replacement))
                .await
                .map_err(|e| TransportError::Track(e.to_string()))?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        let report = self.pc.get_stats().await;
        let outbound = report
            .reports
            .values()
            .filter_map(|entry| match entry {
                StatsReportType::OutboundRTP(rtp) => Some(OutboundRtpStats {
                    kind: match &*rtp.kind {
                        "video" => Some(TrackKind::Video),
                        "audio" => Some(TrackKind::Audio),
                        _ => None,
                    },
                    bytes_sent: rtp.bytes_sent,
                    packets_sent: rtp.packets_sent,
                    frame_width: None,
                    frame_height: None,
                }),
                _ => None,
            })
            .collect();
        Ok(TransportStats { outbound })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }
}
