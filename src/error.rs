use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Player-wide error type
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Invalid stream target: {0}")]
    InvalidTarget(String),

    #[error("A stream session is already active")]
    AlreadyActive,

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Failed to apply ICE candidate: {0}")]
    IceApply(String),

    #[error("Signaling transport error: {0}")]
    SignalingTransport(String),

    #[error("Signaling protocol error{}: {}", http_status_suffix(.status), .message)]
    SignalingProtocol {
        status: Option<u16>,
        message: String,
    },

    #[error("WebRTC engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error discriminant carried in `connection.error` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidTarget,
    AlreadyActive,
    InvalidSdp,
    Negotiation,
    IceApply,
    SignalingTransport,
    SignalingProtocol,
    Engine,
    Config,
    Io,
}

impl PlayerError {
    /// Create a protocol error for an HTTP status
    pub fn protocol(status: u16, message: impl Into<String>) -> Self {
        Self::SignalingProtocol {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PlayerError::InvalidTarget(_) => ErrorKind::InvalidTarget,
            PlayerError::AlreadyActive => ErrorKind::AlreadyActive,
            PlayerError::InvalidSdp(_) => ErrorKind::InvalidSdp,
            PlayerError::Negotiation(_) => ErrorKind::Negotiation,
            PlayerError::IceApply(_) => ErrorKind::IceApply,
            PlayerError::SignalingTransport(_) => ErrorKind::SignalingTransport,
            PlayerError::SignalingProtocol { .. } => ErrorKind::SignalingProtocol,
            PlayerError::Engine(_) => ErrorKind::Engine,
            PlayerError::Config(_) | PlayerError::Serialization(_) => ErrorKind::Config,
            PlayerError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether a caller-side retry policy may restart negotiation as-is.
    ///
    /// Only transport failures qualify; protocol errors mean the server
    /// understood and refused the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlayerError::SignalingTransport(_))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidTarget => "invalid_target",
            ErrorKind::AlreadyActive => "already_active",
            ErrorKind::InvalidSdp => "invalid_sdp",
            ErrorKind::Negotiation => "negotiation",
            ErrorKind::IceApply => "ice_apply",
            ErrorKind::SignalingTransport => "signaling_transport",
            ErrorKind::SignalingProtocol => "signaling_protocol",
            ErrorKind::Engine => "engine",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

fn http_status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" (HTTP {})", s))
        .unwrap_or_default()
}

/// Result type alias
pub type Result<T> = std::result::Result<T, PlayerError>;
