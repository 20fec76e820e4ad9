//! webrtc-rs backed engine
//!
//! Builds one `MediaEngine` per peer from the session's codec preference,
//! adds receive-only transceivers and forwards every peer callback as an
//! [`EngineEvent`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::codec::{default_codec_catalog, CodecDescriptor, MediaKind};
use super::engine::{
    EngineEvent, EngineEventSender, EnginePeer, IceConnectivity, PeerOptions, PeerState,
    RemoteTrack, WebRtcEngine,
};
use super::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::config::IceServerConfig;
use crate::error::{PlayerError, Result};

/// Engine over webrtc-rs, created once per process
#[derive(Debug, Clone)]
pub struct RtcEngine {
    catalog: Vec<CodecDescriptor>,
}

impl Default for RtcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RtcEngine {
    pub fn new() -> Self {
        Self {
            catalog: default_codec_catalog(),
        }
    }

    fn build_media_engine(options: &PeerOptions) -> Result<MediaEngine> {
        let mut media_engine = MediaEngine::default();

        for codec in options.codecs.codecs() {
            let codec_type = match codec.kind {
                MediaKind::Video => RTPCodecType::Video,
                MediaKind::Audio if options.receive_audio => RTPCodecType::Audio,
                MediaKind::Audio => continue,
            };
            let rtcp_feedback = match codec.kind {
                MediaKind::Video => video_rtcp_feedback(),
                MediaKind::Audio => vec![],
            };

            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: codec.mime_type.clone(),
                            clock_rate: codec.clock_rate,
                            channels: codec.channels,
                            sdp_fmtp_line: codec.sdp_fmtp_line.clone(),
                            rtcp_feedback,
                        },
                        payload_type: codec.payload_type,
                        ..Default::default()
                    },
                    codec_type,
                )
                .map_err(|e| {
                    PlayerError::Engine(format!(
                        "Failed to register codec {} (pt {}): {}",
                        codec.mime_type, codec.payload_type, e
                    ))
                })?;
        }

        debug!(
            "Registered {} codecs for session {}",
            options.codecs.len(),
            options.session_id
        );
        Ok(media_engine)
    }
}

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect()
}

fn ice_servers(config: &IceServerConfig) -> Vec<RTCIceServer> {
    let mut servers = vec![];
    for stun_url in &config.stun_servers {
        servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }
    for turn in &config.turn_servers {
        // webrtc-rs rejects TURN entries without credentials
        if !turn.has_credentials() {
            warn!(
                "Skipping TURN server {:?} - credentials required but missing",
                turn.urls
            );
            continue;
        }
        servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }
    servers
}

fn recvonly() -> Option<RTCRtpTransceiverInit> {
    Some(RTCRtpTransceiverInit {
        direction: RTCRtpTransceiverDirection::Recvonly,
        send_encodings: vec![],
    })
}

#[async_trait]
impl WebRtcEngine for RtcEngine {
    fn available_codecs(&self) -> Vec<CodecDescriptor> {
        self.catalog.clone()
    }

    async fn create_peer(
        &self,
        options: PeerOptions,
        events: EngineEventSender,
    ) -> Result<Arc<dyn EnginePeer>> {
        let mut media_engine = Self::build_media_engine(&options)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            PlayerError::Engine(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(&options.ice),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            PlayerError::Engine(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        pc.add_transceiver_from_kind(RTPCodecType::Video, recvonly())
            .await
            .map_err(|e| PlayerError::Engine(format!("Failed to add video transceiver: {}", e)))?;

        if options.receive_audio {
            pc.add_transceiver_from_kind(RTPCodecType::Audio, recvonly())
                .await
                .map_err(|e| {
                    PlayerError::Engine(format!("Failed to add audio transceiver: {}", e))
                })?;
        }

        let peer = RtcPeer {
            session_id: options.session_id.clone(),
            pc,
        };
        peer.register_callbacks(events);

        info!(
            "Peer connection created for session {} (audio: {})",
            options.session_id, options.receive_audio
        );

        Ok(Arc::new(peer))
    }
}

/// webrtc-rs peer connection
struct RtcPeer {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    fn register_callbacks(&self, events: EngineEventSender) {
        let tx = events.clone();
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::New => Some(PeerState::New),
                    RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
                    RTCPeerConnectionState::Connected => Some(PeerState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(PeerState::Failed),
                    RTCPeerConnectionState::Closed => Some(PeerState::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    debug!("Peer {} connection state: {:?}", session_id, state);
                    let _ = tx.send(EngineEvent::PeerState(state));
                }
                Box::pin(async {})
            }));

        let tx = events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let state = match s {
                    RTCIceConnectionState::New => Some(IceConnectivity::New),
                    RTCIceConnectionState::Checking => Some(IceConnectivity::Checking),
                    RTCIceConnectionState::Connected => Some(IceConnectivity::Connected),
                    RTCIceConnectionState::Completed => Some(IceConnectivity::Completed),
                    RTCIceConnectionState::Disconnected => Some(IceConnectivity::Disconnected),
                    RTCIceConnectionState::Failed => Some(IceConnectivity::Failed),
                    RTCIceConnectionState::Closed => Some(IceConnectivity::Closed),
                    _ => None,
                };
                if let Some(state) = state {
                    let _ = tx.send(EngineEvent::IceState(state));
                }
                Box::pin(async {})
            }));

        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let event = match candidate {
                    // None marks the end of gathering
                    None => Some(EngineEvent::GatheringComplete),
                    Some(c) => match c.to_json() {
                        Ok(init) => Some(EngineEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        })),
                        Err(e) => {
                            warn!("Failed to serialize local ICE candidate: {}", e);
                            None
                        }
                    },
                };
                if let Some(event) = event {
                    let _ = tx.send(event);
                }
                Box::pin(async {})
            }));

        let tx = events;
        self.pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let remote = RemoteTrack {
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                    mime_type: track.codec().capability.mime_type.clone(),
                    handle: track,
                };
                let _ = tx.send(EngineEvent::Track(remote));
                Box::pin(async {})
            }));
    }

    fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
        let parsed = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        };
        parsed.map_err(|e| PlayerError::InvalidSdp(e.to_string()))
    }

    fn from_rtc_description(description: RTCSessionDescription) -> Option<SessionDescription> {
        match description.sdp_type {
            RTCSdpType::Offer => Some(SessionDescription::offer(description.sdp)),
            RTCSdpType::Answer | RTCSdpType::Pranswer => {
                Some(SessionDescription::answer(description.sdp))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl EnginePeer for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PlayerError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PlayerError::Negotiation(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        // Our own offer or answer, so a parse failure is a negotiation failure
        let description = Self::to_rtc_description(description).map_err(|e| {
            PlayerError::Negotiation(format!("Invalid local description: {}", e))
        })?;
        self.pc.set_local_description(description).await.map_err(|e| {
            PlayerError::Negotiation(format!("Failed to set local description: {}", e))
        })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = Self::to_rtc_description(description)?;
        self.pc.set_remote_description(description).await.map_err(|e| {
            PlayerError::Negotiation(format!("Failed to set remote description: {}", e))
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
            .map_err(|e| PlayerError::IceApply(e.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(Self::from_rtc_description)
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| PlayerError::Engine(format!("Failed to close peer connection: {}", e)))?;
        info!("Peer connection closed for session {}", self.session_id);
        Ok(())
    }
}
