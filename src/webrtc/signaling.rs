//! WebRTC signaling types and SDP helpers

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::PlayerError;

/// Session description type accepted from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

impl FromStr for SdpType {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "offer" => Ok(SdpType::Offer),
            "answer" => Ok(SdpType::Answer),
            other => Err(PlayerError::InvalidSdp(format!(
                "unsupported description type '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session description (offer or answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Validate host input: known type, non-blank body
    pub fn parse(sdp: &str, sdp_type: &str) -> Result<Self, PlayerError> {
        let sdp_type = sdp_type.parse::<SdpType>()?;
        if sdp.trim().is_empty() {
            return Err(PlayerError::InvalidSdp("empty SDP".to_string()));
        }
        Ok(Self {
            sdp_type,
            sdp: sdp.to_string(),
        })
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }

    /// Candidate as an SDP attribute line (`a=candidate:...`)
    pub fn to_sdp_attribute(&self) -> String {
        let c = self.candidate.trim();
        let c = c.strip_prefix("a=").unwrap_or(c);
        if c.starts_with("candidate:") {
            format!("a={}", c)
        } else {
            format!("a=candidate:{}", c)
        }
    }
}

/// Result of one successful WHEP offer/answer round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhepAnswer {
    /// Remote SDP answer
    pub sdp: String,
    /// WHEP session resource (absolute URL), from the `Location` header
    pub resource_url: Option<String>,
    /// Whether trickled candidates can be PATCHed to the resource
    pub trickle_supported: bool,
}

impl WhepAnswer {
    pub fn new(sdp: impl Into<String>, resource_url: Option<String>) -> Self {
        let trickle_supported = resource_url.is_some();
        Self {
            sdp: sdp.into(),
            resource_url,
            trickle_supported,
        }
    }
}

/// ICE credentials of a local description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// Media section of a description: kind and mid
#[derive(Debug, Clone, PartialEq, Eq)]
struct MediaSection {
    kind: String,
    mid: Option<String>,
}

fn media_sections(sdp: &str) -> Vec<MediaSection> {
    let mut sections: Vec<MediaSection> = Vec::new();
    for line in sdp.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("m=") {
            let kind = rest.split_whitespace().next().unwrap_or("video").to_string();
            sections.push(MediaSection { kind, mid: None });
        } else if let Some(mid) = line.strip_prefix("a=mid:") {
            if let Some(section) = sections.last_mut() {
                section.mid = Some(mid.to_string());
            }
        }
    }
    sections
}

/// Extract `ice-ufrag` / `ice-pwd` (session level or first media level)
pub fn ice_credentials(sdp: &str) -> Option<IceCredentials> {
    let mut ufrag = None;
    let mut pwd = None;
    for line in sdp.lines().map(str::trim) {
        if ufrag.is_none() {
            ufrag = line.strip_prefix("a=ice-ufrag:").map(str::to_string);
        }
        if pwd.is_none() {
            pwd = line.strip_prefix("a=ice-pwd:").map(str::to_string);
        }
    }
    Some(IceCredentials {
        ufrag: ufrag?,
        pwd: pwd?,
    })
}

/// Build an `application/trickle-ice-sdpfrag` body (RFC 8840)
///
/// Candidates are grouped under the media section they belong to, matched
/// by mid first and m-line index second. Candidates that match no section
/// go to the first one.
pub fn build_trickle_fragment(
    local_sdp: &str,
    candidates: &[IceCandidate],
    end_of_candidates: bool,
) -> Option<String> {
    let credentials = ice_credentials(local_sdp)?;
    let mut sections = media_sections(local_sdp);
    if sections.is_empty() {
        sections.push(MediaSection {
            kind: "video".to_string(),
            mid: Some("0".to_string()),
        });
    }

    let mut grouped: Vec<Vec<&IceCandidate>> = vec![Vec::new(); sections.len()];
    for candidate in candidates {
        let by_mid = candidate.sdp_mid.as_ref().and_then(|mid| {
            sections
                .iter()
                .position(|s| s.mid.as_deref() == Some(mid.as_str()))
        });
        let by_index = candidate
            .sdp_mline_index
            .map(|i| i as usize)
            .filter(|i| *i < sections.len());
        let slot = by_mid.or(by_index).unwrap_or(0);
        grouped[slot].push(candidate);
    }

    let mut lines = vec![
        format!("a=ice-ufrag:{}", credentials.ufrag),
        format!("a=ice-pwd:{}", credentials.pwd),
    ];
    for (index, section) in sections.iter().enumerate() {
        if grouped[index].is_empty() && !end_of_candidates {
            continue;
        }
        lines.push(format!("m={} 9 UDP/TLS/RTP/SAVPF 0", section.kind));
        let mid = section.mid.clone().unwrap_or_else(|| index.to_string());
        lines.push(format!("a=mid:{}", mid));
        for candidate in &grouped[index] {
            lines.push(candidate.to_sdp_attribute());
        }
        if end_of_candidates {
            lines.push("a=end-of-candidates".to_string());
        }
    }

    let mut fragment = lines.join("\r\n");
    fragment.push_str("\r\n");
    Some(fragment)
}
