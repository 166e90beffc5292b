//! webrtc-rs peer transport

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::mdns::{mdns_host_name, MdnsMode};
use super::signaling::{IceCandidate, ParticipantId, SdpType, SessionDescription};
use super::transport::{
    ConnectionState, PeerTransport, TransportEventKind, TransportEventSink, TransportFactory,
};
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::media::{LocalStream, RemoteStream};

/// Peer connection wrapper forwarding callbacks to the event loop
pub struct RtcTransport {
    peer: ParticipantId,
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    /// Create a new peer connection
    pub async fn new(
        config: &MeshConfig,
        local_id: &ParticipantId,
        events: TransportEventSink,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            MeshError::NegotiationTransport(format!("Failed to register codecs: {}", e))
        })?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            MeshError::NegotiationTransport(format!("Failed to register interceptors: {}", e))
        })?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_multicast_dns_mode(config.mdns_mode.into());
        if config.mdns_mode == MdnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(mdns_host_name(local_id.as_str()));
        }

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            MeshError::NegotiationTransport(format!("Failed to create peer connection: {}", e))
        })?;

        let transport = Self {
            peer: events.peer().clone(),
            pc: Arc::new(pc),
        };
        transport.setup_event_handlers(events);

        info!(
            "Peer connection created for {} (mDNS {:?})",
            transport.peer, config.mdns_mode
        );
        Ok(transport)
    }

    fn setup_event_handlers(&self, events: TransportEventSink) {
        let sink = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };
                    sink.emit(TransportEventKind::StateChanged(state));
                })
            }));

        let sink = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    // None marks the end of gathering; nothing to trickle
                    let Some(c) = candidate else { return };
                    match c.to_json() {
                        Ok(init) => {
                            debug!("Local ICE candidate for {}: {}", sink.peer(), init.candidate);
                            sink.emit(TransportEventKind::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => debug!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let sink = events;
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let stream = RemoteStream::from_rtc(track);
                    info!(
                        "Remote {} track {} from {}",
                        stream.kind,
                        stream.track_id,
                        sink.peer()
                    );
                    sink.emit(TransportEventKind::RemoteTrack(stream));
                })
            },
        ));
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
        let result = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        };
        result.map_err(|e| MeshError::NegotiationTransport(format!("Invalid SDP: {}", e)))
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn attach_stream(&self, stream: &LocalStream) -> Result<()> {
        for track in stream.tracks() {
            let sender = self.pc.add_track(track.as_track_local()).await.map_err(|e| {
                MeshError::NegotiationTransport(format!(
                    "Failed to add {} track: {}",
                    track.kind(),
                    e
                ))
            })?;

            // RTCP must be read for interceptors (NACK, reports) to run
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
            trace!("{} track attached for {}", track.kind(), self.peer);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(|e| {
            MeshError::NegotiationTransport(format!("Failed to create offer: {}", e))
        })?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(|e| {
            MeshError::NegotiationTransport(format!("Failed to create answer: {}", e))
        })?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(|e| {
                MeshError::NegotiationTransport(format!("Failed to set local description: {}", e))
            })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(|e| {
                MeshError::NegotiationTransport(format!("Failed to set remote description: {}", e))
            })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MeshError::CandidateApply(format!("{}: {}", self.peer, e)))
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(|e| {
            MeshError::NegotiationTransport(format!("Failed to close peer connection: {}", e))
        })
    }
}

/// Builds `RtcTransport`s from the mesh configuration
pub struct RtcTransportFactory {
    config: MeshConfig,
}

impl RtcTransportFactory {
    pub fn new(config: MeshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        local: &ParticipantId,
        _peer: &ParticipantId,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>> {
        let transport = RtcTransport::new(&self.config, local, events).await?;
        Ok(Box::new(transport))
    }
}
