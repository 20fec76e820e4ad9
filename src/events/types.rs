//! Player event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::Serialize;

use crate::error::ErrorKind;
use crate::webrtc::{ConnectionState, RemoteTrack, SdpType};

/// Player event enumeration
///
/// All events are tagged with their event name for serialization.
/// The `serde(tag = "event", content = "data")` attribute creates a
/// JSON structure like:
/// ```json
/// {
///   "event": "connection.state_changed",
///   "data": { "session_id": "...", "stream_url": "https://...", "state": "connected" }
/// }
/// ```
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum PlayerEvent {
    /// Consolidated connection state changed
    #[serde(rename = "connection.state_changed")]
    ConnectionStateChanged {
        session_id: String,
        stream_url: String,
        /// Previous state
        from: ConnectionState,
        state: ConnectionState,
    },

    /// A remote track arrived; hand it to the video sink
    #[serde(rename = "stream.remote_added")]
    RemoteStreamAdded {
        session_id: String,
        stream_url: String,
        track: RemoteTrack,
    },

    /// Local description is set and ready for host-driven signaling
    #[serde(rename = "signaling.local_sdp_ready")]
    LocalSdpReady {
        session_id: String,
        #[serde(rename = "type")]
        sdp_type: SdpType,
        sdp: String,
    },

    /// A local ICE candidate was gathered
    #[serde(rename = "signaling.ice_candidate_ready")]
    IceCandidateReady {
        session_id: String,
        candidate: String,
        sdp_mline_index: Option<u16>,
        sdp_mid: Option<String>,
    },

    /// Session-level error
    #[serde(rename = "connection.error")]
    ConnectionError {
        session_id: String,
        stream_url: String,
        kind: ErrorKind,
        message: String,
    },
}

impl PlayerEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connection.state_changed",
            Self::RemoteStreamAdded { .. } => "stream.remote_added",
            Self::LocalSdpReady { .. } => "signaling.local_sdp_ready",
            Self::IceCandidateReady { .. } => "signaling.ice_candidate_ready",
            Self::ConnectionError { .. } => "connection.error",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::ConnectionStateChanged { session_id, .. }
            | Self::RemoteStreamAdded { session_id, .. }
            | Self::LocalSdpReady { session_id, .. }
            | Self::IceCandidateReady { session_id, .. }
            | Self::ConnectionError { session_id, .. } => session_id,
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `signaling.*` matches all signaling events
    /// - `connection.error` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}
