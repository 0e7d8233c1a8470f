//! Common identifiers and media types used throughout the core

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one transport connection, assigned by the host.
///
/// One logged-in user may own several handles at once (multi-device); the
/// one carrying media for the active call is the session's active handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(u64);

impl HandleId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for HandleId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Audio codec resolved from the negotiated answer. Resolved once per call,
/// never renegotiated mid-call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Opus,
    G722,
    Pcmu,
    Pcma,
}

impl AudioCodec {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::G722 => "g722",
            Self::Pcmu => "pcmu",
            Self::Pcma => "pcma",
        }
    }

    /// Pick the first known audio codec mentioned in an SDP blob. The core
    /// does not parse SDP; it only scans for codec names.
    #[must_use]
    pub fn from_sdp(sdp: &str) -> Option<Self> {
        let lowered = sdp.to_ascii_lowercase();
        [Self::Opus, Self::G722, Self::Pcmu, Self::Pcma]
            .into_iter()
            .filter_map(|codec| lowered.find(codec.name()).map(|pos| (pos, codec)))
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, codec)| codec)
    }
}

/// Video codec resolved from the negotiated answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Vp8,
    Vp9,
    H264,
    Av1,
}

impl VideoCodec {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::H264 => "h264",
            Self::Av1 => "av1",
        }
    }

    #[must_use]
    pub fn from_sdp(sdp: &str) -> Option<Self> {
        let lowered = sdp.to_ascii_lowercase();
        [Self::Vp8, Self::Vp9, Self::H264, Self::Av1]
            .into_iter()
            .filter_map(|codec| lowered.find(codec.name()).map(|pos| (pos, codec)))
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, codec)| codec)
    }
}
