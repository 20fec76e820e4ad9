use serde::{Deserialize, Serialize};

/// Main player configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// ICE server settings
    pub ice: IceServerConfig,
    /// Codec negotiation settings
    pub codecs: CodecConfig,
    /// WHEP signaling settings
    pub signaling: SignalingConfig,
    /// Capability override hook (testing / known hardware)
    pub capability_override: CapabilityOverride,
}

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceServerConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// ICE candidate gathering timeout (ms), used before a non-trickle offer
    pub gathering_timeout_ms: u64,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn_servers: vec![],
            gathering_timeout_ms: 5000,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp", "turn:turn.example.com:3478?transport=tcp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    /// Create a TurnServer with a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }

    /// webrtc-rs refuses TURN entries without credentials
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.credential.is_empty()
    }
}

/// Codec negotiation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Offer H.265 when a hardware decoder is present
    pub enable_h265: bool,
    /// Add a receive-only audio transceiver next to the video one
    pub receive_audio: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            enable_h265: true,
            receive_audio: false,
        }
    }
}

/// WHEP signaling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Upper bound for one WHEP HTTP exchange (ms)
    pub timeout_ms: u64,
    /// Optional Bearer token sent with every WHEP request
    pub auth_token: Option<String>,
    /// User-Agent header for WHEP requests
    pub user_agent: String,
    /// Send the offer before ICE gathering completes and PATCH candidates later
    pub trickle_ice: bool,
    /// DELETE the WHEP resource when the session is disposed
    pub terminate_on_dispose: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            auth_token: None,
            user_agent: format!("whep-player/{}", env!("CARGO_PKG_VERSION")),
            trickle_ice: false,
            terminate_on_dispose: true,
        }
    }
}

/// Forced capability answers, applied on top of platform detection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityOverride {
    /// Force the hardware H.265 decoder verdict
    pub hardware_h265: Option<bool>,
    /// Force the simulated-environment verdict
    pub simulated: Option<bool>,
}

impl CapabilityOverride {
    pub fn is_empty(&self) -> bool {
        self.hardware_h265.is_none() && self.simulated.is_none()
    }
}
