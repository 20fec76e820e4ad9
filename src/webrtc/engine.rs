//! WebRTC engine abstraction
//!
//! The session manager drives a peer connection only through these traits.
//! Engine callbacks are delivered as [`EngineEvent`]s on an unbounded
//! channel registered once per peer, so they can be serialized with the
//! commands that mutate the session.

use async_trait::async_trait;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::codec::{CodecDescriptor, CodecPreference, MediaKind};
use super::signaling::{IceCandidate, SessionDescription};
use crate::config::IceServerConfig;
use crate::error::Result;

/// Peer connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE connectivity as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectivity {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectivity {
    /// At least one candidate pair works
    pub fn is_established(&self) -> bool {
        matches!(self, IceConnectivity::Connected | IceConnectivity::Completed)
    }
}

/// Remote media track handed to the video sink
///
/// `handle` is the engine's own track object; the sink downcasts it.
#[derive(Clone, Serialize)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(skip)]
    pub handle: Arc<dyn Any + Send + Sync>,
}

impl RemoteTrack {
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.handle.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

/// Callback notifications from a peer connection
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// Local candidate gathering finished
    GatheringComplete,
    /// Aggregate peer connection state changed
    PeerState(PeerState),
    /// ICE connection state changed
    IceState(IceConnectivity),
    /// A remote track started
    Track(RemoteTrack),
    /// Asynchronous engine failure
    Error(String),
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

/// Parameters for one peer connection
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub session_id: String,
    /// Codecs to register, most preferred first
    pub codecs: CodecPreference,
    pub ice: IceServerConfig,
    /// Add a receive-only audio transceiver
    pub receive_audio: bool,
}

/// Process-wide WebRTC engine
#[async_trait]
pub trait WebRtcEngine: Send + Sync {
    /// Receive codecs the engine can negotiate, in default order
    fn available_codecs(&self) -> Vec<CodecDescriptor>;

    /// Create a receive-only peer connection.
    ///
    /// Every callback of the new peer is forwarded to `events`.
    async fn create_peer(
        &self,
        options: PeerOptions,
        events: EngineEventSender,
    ) -> Result<Arc<dyn EnginePeer>>;
}

/// One engine peer connection
#[async_trait]
pub trait EnginePeer: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Current local description, including candidates gathered so far
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self) -> Result<()>;
}
