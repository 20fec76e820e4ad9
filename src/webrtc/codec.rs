//! Codec catalog and negotiation preference filtering
//!
//! The engine advertises a fixed catalog of receive codecs. Before each
//! session the catalog is filtered into a [`CodecPreference`]: H.265 is
//! only offered when a hardware decoder is present on real hardware,
//! everything else passes through in catalog order.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// H.265/HEVC MIME type (RFC 7798)
pub const MIME_TYPE_H265: &str = "video/H265";
pub const MIME_TYPE_H264: &str = "video/H264";
pub const MIME_TYPE_VP8: &str = "video/VP8";
pub const MIME_TYPE_VP9: &str = "video/VP9";
pub const MIME_TYPE_AV1: &str = "video/AV1";
pub const MIME_TYPE_OPUS: &str = "audio/opus";
pub const MIME_TYPE_G722: &str = "audio/G722";
pub const MIME_TYPE_PCMU: &str = "audio/PCMU";
pub const MIME_TYPE_PCMA: &str = "audio/PCMA";

/// Video codec family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264/AVC
    H264,
    /// H.265/HEVC
    H265,
    /// VP8
    VP8,
    /// VP9
    VP9,
    /// AV1
    AV1,
}

impl VideoCodec {
    /// Get MIME type for SDP
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => MIME_TYPE_H264,
            VideoCodec::H265 => MIME_TYPE_H265,
            VideoCodec::VP8 => MIME_TYPE_VP8,
            VideoCodec::VP9 => MIME_TYPE_VP9,
            VideoCodec::AV1 => MIME_TYPE_AV1,
        }
    }

    /// Parse a MIME type (case-insensitive, `H265` and `HEVC` both accepted)
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let subtype = mime.to_ascii_lowercase();
        let subtype = subtype.strip_prefix("video/")?;
        match subtype {
            "h264" => Some(VideoCodec::H264),
            "h265" | "hevc" => Some(VideoCodec::H265),
            "vp8" => Some(VideoCodec::VP8),
            "vp9" => Some(VideoCodec::VP9),
            "av1" => Some(VideoCodec::AV1),
            _ => None,
        }
    }

    /// Get display name
    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H.264",
            VideoCodec::H265 => "H.265/HEVC",
            VideoCodec::VP8 => "VP8",
            VideoCodec::VP9 => "VP9",
            VideoCodec::AV1 => "AV1",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Media kind of a codec or track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// One negotiable codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecDescriptor {
    pub mime_type: String,
    pub kind: MediaKind,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
    pub payload_type: u8,
    /// Set on entries that are only offered because a hardware decoder exists
    pub hardware_accelerated: bool,
}

impl CodecDescriptor {
    pub fn video(mime_type: &str, payload_type: u8, sdp_fmtp_line: &str) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            kind: MediaKind::Video,
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: sdp_fmtp_line.to_string(),
            payload_type,
            hardware_accelerated: false,
        }
    }

    pub fn audio(mime_type: &str, payload_type: u8, clock_rate: u32, channels: u16, sdp_fmtp_line: &str) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            kind: MediaKind::Audio,
            clock_rate,
            channels,
            sdp_fmtp_line: sdp_fmtp_line.to_string(),
            payload_type,
            hardware_accelerated: false,
        }
    }

    pub fn video_codec(&self) -> Option<VideoCodec> {
        VideoCodec::from_mime_type(&self.mime_type)
    }

    pub fn is_h265(&self) -> bool {
        self.video_codec() == Some(VideoCodec::H265)
    }

    /// Profile parameter from the fmtp line (`profile-id` or `profile-level-id`)
    pub fn profile(&self) -> Option<&str> {
        self.sdp_fmtp_line.split(';').find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            match key {
                "profile-id" | "profile-level-id" => Some(value),
                _ => None,
            }
        })
    }
}

/// Ordered codec list offered during negotiation, most preferred first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecPreference {
    codecs: Vec<CodecDescriptor>,
}

impl CodecPreference {
    pub fn codecs(&self) -> &[CodecDescriptor] {
        &self.codecs
    }

    pub fn of_kind(&self, kind: MediaKind) -> impl Iterator<Item = &CodecDescriptor> {
        self.codecs.iter().filter(move |c| c.kind == kind)
    }

    pub fn contains(&self, codec: VideoCodec) -> bool {
        self.codecs.iter().any(|c| c.video_codec() == Some(codec))
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

/// Filter the engine catalog into the preference list for one session.
///
/// H.265 survives iff `want_h265 && hardware_h265_available && !is_simulated`;
/// software HEVC decode is never offered. Other entries keep their catalog
/// order and contents.
pub fn build_preference_list(
    all_available: &[CodecDescriptor],
    want_h265: bool,
    hardware_h265_available: bool,
    is_simulated: bool,
) -> CodecPreference {
    let allow_h265 = want_h265 && hardware_h265_available && !is_simulated;

    let codecs: Vec<CodecDescriptor> = all_available
        .iter()
        .filter_map(|codec| {
            if !codec.is_h265() {
                return Some(codec.clone());
            }
            allow_h265.then(|| CodecDescriptor {
                hardware_accelerated: true,
                ..codec.clone()
            })
        })
        .collect();

    debug!(
        "Codec preference: {} of {} codecs (H.265 {})",
        codecs.len(),
        all_available.len(),
        if allow_h265 { "enabled" } else { "excluded" }
    );

    CodecPreference { codecs }
}

/// Receive codecs the engine can negotiate, in default preference order.
///
/// Mirrors the webrtc-rs default registrations with the two H.265 profiles
/// (Main, Main 10) placed ahead of the other video codecs.
pub fn default_codec_catalog() -> Vec<CodecDescriptor> {
    vec![
        CodecDescriptor::video(
            MIME_TYPE_H265,
            49,
            "level-id=180;profile-id=1;tier-flag=0;tx-mode=SRST",
        ),
        CodecDescriptor::video(
            MIME_TYPE_H265,
            51,
            "level-id=180;profile-id=2;tier-flag=0;tx-mode=SRST",
        ),
        CodecDescriptor::video(
            MIME_TYPE_H264,
            102,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
        ),
        CodecDescriptor::video(
            MIME_TYPE_H264,
            125,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        ),
        CodecDescriptor::video(
            MIME_TYPE_H264,
            123,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=640032",
        ),
        CodecDescriptor::video(
            MIME_TYPE_H264,
            127,
            "level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42001f",
        ),
        CodecDescriptor::video(MIME_TYPE_VP8, 96, ""),
        CodecDescriptor::video(MIME_TYPE_VP9, 98, "profile-id=0"),
        CodecDescriptor::video(MIME_TYPE_VP9, 100, "profile-id=1"),
        CodecDescriptor::video(MIME_TYPE_AV1, 41, "profile-id=0"),
        CodecDescriptor::audio(MIME_TYPE_OPUS, 111, 48000, 2, "minptime=10;useinbandfec=1"),
        CodecDescriptor::audio(MIME_TYPE_G722, 9, 8000, 0, ""),
        CodecDescriptor::audio(MIME_TYPE_PCMU, 0, 8000, 0, ""),
        CodecDescriptor::audio(MIME_TYPE_PCMA, 8, 8000, 0, ""),
    ]
}
