//! WebRTC playback over WHEP
//!
//! This module provides receive-only WebRTC playback with:
//! - H.265 video (only where a hardware decoder exists and the host is real)
//! - H.264/VP8/VP9/AV1 video
//! - Opus audio (optional)
//! - WHEP signaling with optional trickle ICE
//!
//! Architecture:
//! ```text
//! Host ── play_stream / commands ──► PeerConnectionManager ──► events ──► Host
//!                                        |        ^
//!              CapabilityInspector ──────┤        | EngineEvent channel
//!                                        v        |
//!                                   WebRtcEngine (RtcEngine)
//!                                        |
//!                                        +──── SignalingClient (WhepClient)
//!                                                   |
//!                                              WHEP endpoint
//! ```

pub mod capability;
pub mod codec;
pub mod engine;
pub mod manager;
pub mod rtc_engine;
pub mod signaling;
pub mod state;
pub mod whep;

pub use capability::{CapabilityInspector, FixedCapabilities, OverrideInspector, PlatformInspector};
pub use codec::{
    build_preference_list, default_codec_catalog, CodecDescriptor, CodecPreference, MediaKind,
    VideoCodec,
};
pub use engine::{
    EngineEvent, EnginePeer, IceConnectivity, PeerOptions, PeerState, RemoteTrack, WebRtcEngine,
};
pub use manager::{PeerConnectionManager, StreamTarget};
pub use rtc_engine::RtcEngine;
pub use signaling::{IceCandidate, SdpType, SessionDescription, WhepAnswer};
pub use state::ConnectionState;
pub use whep::{SignalingClient, WhepClient};
