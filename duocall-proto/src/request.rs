//! Inbound signaling requests
//!
//! Requests arrive as JSON objects with a mandatory `request` field naming
//! the operation. Parsing distinguishes a missing field from a field of the
//! wrong type so the core can report precise validation errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded signaling request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// List the usernames currently registered.
    List,
    /// Bind this handle to a username.
    Login { username: String },
    /// Start a call attempt towards another registered user.
    Call {
        username: String,
        /// Audio+video call when true, audio-only when false.
        videocall: Option<bool>,
        /// Ask for the call to be recorded once media starts.
        record: Option<bool>,
        /// Maximum call duration in seconds, 0 = unlimited.
        duration: Option<u32>,
    },
    /// Accept the pending incoming call (answer attached as JSEP).
    Accept,
    /// Reject the pending incoming call.
    Reject,
    /// Callee-side notification that ringing started.
    Ringing,
    /// Update local configuration (mute, bitrate cap, simulcast targets...).
    Set(SetUpdate),
    /// Hang up an established call.
    Hangup,
}

/// Optional fields of a `set` request. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<bool>,
    /// Simulcast substream to let through; validated to 0..=2 by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub substream: Option<i64>,
    /// Simulcast temporal layer to let through; validated to 0..=2 by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<i64>,
    /// One-time call duration limit in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u32>,
}

/// SDP attachment travelling with `call`/`accept` requests and with the
/// events that relay them to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jsep {
    /// `"offer"` or `"answer"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
    /// Set when this SDP renegotiates an existing connection (ICE restart).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulcast: Option<SimulcastParams>,
}

/// Simulcast layer description attached to an offer/answer: either up to
/// three SSRCs or a list of RIDs, never both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulcastParams {
    #[serde(rename = "ssrc-0", default, skip_serializing_if = "Option::is_none")]
    pub ssrc_0: Option<u32>,
    #[serde(rename = "ssrc-1", default, skip_serializing_if = "Option::is_none")]
    pub ssrc_1: Option<u32>,
    #[serde(rename = "ssrc-2", default, skip_serializing_if = "Option::is_none")]
    pub ssrc_2: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rids: Option<Vec<String>>,
}

impl SimulcastParams {
    pub fn ssrcs(&self) -> [Option<u32>; 3] {
        [self.ssrc_0, self.ssrc_1, self.ssrc_2]
    }
}

/// Why a request payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestParseError {
    /// The payload is not a JSON object.
    NotAnObject,
    /// The `request` field is absent.
    MissingRequest,
    /// The `request` field names no known operation.
    UnknownRequest(String),
    /// A required field is absent.
    MissingField(&'static str),
    /// A field is present but has the wrong type.
    InvalidField(&'static str),
}

impl std::fmt::Display for RequestParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "JSON error: not an object"),
            Self::MissingRequest => write!(f, "Missing element (request)"),
            Self::UnknownRequest(name) => write!(f, "Unknown request ({name})"),
            Self::MissingField(name) => write!(f, "Missing element ({name})"),
            Self::InvalidField(name) => write!(f, "Invalid element ({name})"),
        }
    }
}

impl std::error::Error for RequestParseError {}

fn required_str(value: &Value, field: &'static str) -> Result<String, RequestParseError> {
    match value.get(field) {
        None | Some(Value::Null) => Err(RequestParseError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(RequestParseError::InvalidField(field)),
    }
}

fn optional_bool(value: &Value, field: &'static str) -> Result<Option<bool>, RequestParseError> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(RequestParseError::InvalidField(field)),
    }
}

fn optional_u32(value: &Value, field: &'static str) -> Result<Option<u32>, RequestParseError> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_u64() {
            Some(n) if n <= u64::from(u32::MAX) => Ok(Some(n as u32)),
            _ => Err(RequestParseError::InvalidField(field)),
        },
    }
}

fn optional_i64(value: &Value, field: &'static str) -> Result<Option<i64>, RequestParseError> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or(RequestParseError::InvalidField(field)),
    }
}

fn optional_str(value: &Value, field: &'static str) -> Result<Option<String>, RequestParseError> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(RequestParseError::InvalidField(field)),
    }
}

impl Request {
    /// Decode a request from its JSON payload, validating field shapes.
    pub fn from_value(value: &Value) -> Result<Self, RequestParseError> {
        if !value.is_object() {
            return Err(RequestParseError::NotAnObject);
        }
        let kind = match value.get("request") {
            None | Some(Value::Null) => return Err(RequestParseError::MissingRequest),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(RequestParseError::InvalidField("request")),
        };
        match kind.to_ascii_lowercase().as_str() {
            "list" => Ok(Self::List),
            "login" => Ok(Self::Login {
                username: required_str(value, "username")?,
            }),
            "call" => Ok(Self::Call {
                username: required_str(value, "username")?,
                videocall: optional_bool(value, "videocall")?,
                record: optional_bool(value, "record")?,
                duration: optional_u32(value, "duration")?,
            }),
            "accept" => Ok(Self::Accept),
            "reject" => Ok(Self::Reject),
            "ringing" => Ok(Self::Ringing),
            "set" => Ok(Self::Set(SetUpdate {
                audio: optional_bool(value, "audio")?,
                video: optional_bool(value, "video")?,
                bitrate: optional_u32(value, "bitrate")?,
                record: optional_bool(value, "record")?,
                filename: optional_str(value, "filename")?,
                restart: optional_bool(value, "restart")?,
                substream: optional_i64(value, "substream")?,
                temporal: optional_i64(value, "temporal")?,
                time: optional_u32(value, "time")?,
            })),
            "hangup" => Ok(Self::Hangup),
            _ => Err(RequestParseError::UnknownRequest(kind)),
        }
    }
}
