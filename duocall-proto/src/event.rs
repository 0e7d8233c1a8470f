//! Outbound signaling events
//!
//! Every message the core pushes towards a client is an [`Event`] envelope:
//! either a result payload describing what happened, or an error with a
//! numeric code and a human-readable cause.

use serde::{Deserialize, Serialize};

/// Envelope for everything pushed to a transport handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Always `"event"`; identifies the producing plugin family.
    pub duocall: String,
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventBody {
    Error { error_code: u16, error: String },
    Result { result: EventResult },
}

impl Event {
    pub fn result(result: EventResult) -> Self {
        Self {
            duocall: "event".to_string(),
            body: EventBody::Result { result },
        }
    }

    pub fn error(error_code: u16, error: impl Into<String>) -> Self {
        Self {
            duocall: "event".to_string(),
            body: EventBody::Error {
                error_code,
                error: error.into(),
            },
        }
    }
}

/// Result payloads, discriminated by the `event` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum EventResult {
    /// Login succeeded.
    Connected { username: String },
    /// Registered usernames.
    List { list: Vec<String> },
    /// Call attempt accepted for processing; the callee is being alerted.
    Calling,
    /// Someone is calling this user (goes to every one of their handles).
    IncomingCall { username: String },
    /// The callee accepted; on the caller side carries the callee username.
    Accepted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    /// `set` acknowledged.
    Set,
    /// The peer renegotiated (ICE restart); new SDP attached as JSEP.
    Update,
    /// Simulcast substream or temporal layer selection changed.
    Simulcast {
        videocodec: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        substream: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temporal: Option<u8>,
    },
    /// The transport reports sustained packet loss on one direction.
    #[serde(rename = "slow_link")]
    SlowLink {
        media: String,
        #[serde(
            rename = "current-bitrate",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        current_bitrate: Option<u32>,
    },
    /// The call reached a terminal state.
    Stop {
        /// Wire discriminant of the call state at stop time.
        call_state: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_time: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_time: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record_path: Option<String>,
    },
}

/// Per-session recording file paths, as surfaced by introspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Diagnostic snapshot of one session, returned by `query_session`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// `"incall"` or `"idle"`.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(rename = "peer-bitrate", default, skip_serializing_if = "Option::is_none")]
    pub peer_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_link_count: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulcast: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substream: Option<i8>,
    #[serde(rename = "substream-target", default, skip_serializing_if = "Option::is_none")]
    pub substream_target: Option<i8>,
    #[serde(rename = "temporal-layer", default, skip_serializing_if = "Option::is_none")]
    pub temporal_layer: Option<i8>,
    #[serde(
        rename = "temporal-layer-target",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub temporal_layer_target: Option<i8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingInfo>,
    pub in_call: bool,
    pub hanging_up: bool,
    pub destroyed: bool,
}
