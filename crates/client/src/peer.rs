use crate::error::{Error, Result};
use crate::transport::{EventSender, MediaTransport, PeerState, TransportEvent, TransportFactory};

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use droidlink_protocol::{IceCandidate, RtcConfiguration};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

/// Label of the pre-negotiated control channel.
pub const CONTROL_CHANNEL_LABEL: &str = "control";
/// SCTP stream id both sides agree on for the control channel.
pub const CONTROL_CHANNEL_ID: u16 = 1;

/// Builds [`WebRtcTransport`]s.
#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    pub prefer_h264: bool,
}

impl Default for WebRtcTransportFactory {
    fn default() -> Self {
        Self { prefer_h264: true }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn open(
        &self,
        config: &RtcConfiguration,
        events: EventSender,
    ) -> Result<Box<dyn MediaTransport>> {
        let transport = WebRtcTransport::new(config, self.prefer_h264, events)
            .await
            .map_err(|e| Error::Connection(format!("{e:#}")))?;
        Ok(Box::new(transport))
    }
}

/// Receive-only peer connection with a negotiated control data channel.
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    control: Arc<RTCDataChannel>,
}

fn video_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "goog-remb".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "ccm".into(),
            parameter: "fir".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "pli".into(),
        },
        RTCPFeedback {
            typ: "transport-cc".into(),
            parameter: "".into(),
        },
    ]
}

/// H.264 first so the answerer picks it when it can, then VP8 and Opus.
fn register_preferred_codecs(media_engine: &mut MediaEngine) -> anyhow::Result<()> {
    for (payload_type, profile) in [(125, "42e01f"), (102, "4d001f")] {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: format!(
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={profile}"
                    ),
                    rtcp_feedback: video_feedback(),
                },
                payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
    }

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: video_feedback(),
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(())
}

fn media_engine(prefer_h264: bool) -> anyhow::Result<MediaEngine> {
    if prefer_h264 {
        let mut media_engine = MediaEngine::default();
        match register_preferred_codecs(&mut media_engine) {
            Ok(()) => {
                info!("Registered codecs with H.264 preferred");
                return Ok(media_engine);
            }
            Err(e) => {
                warn!("Could not prefer H.264, using default codec order: {e:#}");
            }
        }
    }
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .context("Failed to register default codecs")?;
    Ok(media_engine)
}

fn rtc_configuration(config: &RtcConfiguration) -> RTCConfiguration {
    let ice_servers = config
        .ice_servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_transport_policy: config
            .ice_transport_policy
            .as_deref()
            .map(RTCIceTransportPolicy::from)
            .unwrap_or_default(),
        ..Default::default()
    }
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

impl WebRtcTransport {
    pub async fn new(
        config: &RtcConfiguration,
        prefer_h264: bool,
        events: EventSender,
    ) -> anyhow::Result<Self> {
        let mut media_engine = media_engine(prefer_h264)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_configuration(config))
                .await
                .context("Failed to create peer connection")?,
        );

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .with_context(|| format!("Failed to add {kind} transceiver"))?;
        }

        let control = peer_connection
            .create_data_channel(
                CONTROL_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    negotiated: Some(CONTROL_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await
            .context("Failed to create control data channel")?;

        let transport = Self {
            peer_connection,
            control,
        };
        transport.wire_events(events);
        info!(
            ice_servers = config.ice_servers.len(),
            "WebRTC peer connection created"
        );
        Ok(transport)
    }

    fn wire_events(&self, events: EventSender) {
        let tx = events.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                match state {
                    RTCPeerConnectionState::Failed => warn!("Peer connection failed"),
                    RTCPeerConnectionState::Disconnected => warn!("Peer connection disconnected"),
                    _ => info!(?state, "Peer connection state changed"),
                }
                let _ = tx.send(TransportEvent::ConnectionState(peer_state(state)));
                Box::pin(async {})
            }));

        let tx = events.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(json) => {
                            let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                    }
                }
                Box::pin(async {})
            }));

        // Remote media is not rendered here; drain RTP so the receive buffers
        // never back up.
        let tx = events.clone();
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let kind = track.kind().to_string();
                info!(%kind, ssrc = track.ssrc(), "Remote track");
                let _ = tx.send(TransportEvent::Track(kind));
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    debug!("Remote track ended");
                });
                Box::pin(async {})
            }));

        let tx = events.clone();
        self.control.on_open(Box::new(move || {
            info!("Control data channel open");
            let _ = tx.send(TransportEvent::ChannelOpen);
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.control.on_close(Box::new(move || {
            info!("Control data channel closed");
            let _ = tx.send(TransportEvent::ChannelClosed);
            Box::pin(async {})
        }));

        self.control.on_message(Box::new(move |msg| {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(TransportEvent::ChannelMessage(text));
                    }
                    Err(e) => warn!("Non UTF-8 text on control channel: {e}"),
                }
            } else {
                debug!(len = msg.data.len(), "Ignoring binary control channel message");
            }
            Box::pin(async {})
        }));
    }
}

fn rtc_error(e: anyhow::Error) -> Error {
    Error::Connection(format!("{e:#}"))
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")
            .map_err(rtc_error)?;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local description")
            .map_err(rtc_error)?;

        for line in offer.sdp.lines() {
            if line.starts_with("m=") || line.starts_with("a=rtpmap:") {
                debug!(sdp_line = line, "Offer SDP");
            }
        }
        Ok(offer.sdp)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .context("Failed to parse SDP answer")
            .map_err(|e| Error::Protocol(format!("{e:#}")))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("Failed to set remote description")
            .map_err(rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")
            .map_err(rtc_error)
    }

    async fn send_control(&self, data: Bytes) -> Result<()> {
        self.control
            .send(&data)
            .await
            .context("Failed to send control message")
            .map_err(rtc_error)?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.control
            .send_text(text.to_string())
            .await
            .context("Failed to send data channel message")
            .map_err(rtc_error)?;
        Ok(())
    }

    fn channel_open(&self) -> bool {
        self.control.ready_state() == RTCDataChannelState::Open
    }

    /// Peer connection first, then the control channel.
    async fn close(&self) -> Result<()> {
        let closed = self
            .peer_connection
            .close()
            .await
            .context("Failed to close peer connection")
            .map_err(rtc_error);
        if let Err(e) = self.control.close().await {
            debug!("Control channel close: {e}");
        }
        closed?;
        info!("Peer connection closed");
        Ok(())
    }
}
