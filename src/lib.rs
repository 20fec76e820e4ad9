//! whep-player - WebRTC stream playback over WHEP
//!
//! This crate provides a receive-only WebRTC player: it negotiates a peer
//! connection with a WHEP endpoint (or a host-driven signaling channel),
//! picks codecs based on the decoding hardware, and reports connection
//! progress as events.

pub mod config;
pub mod error;
pub mod events;
pub mod webrtc;

pub use error::{PlayerError, Result};
