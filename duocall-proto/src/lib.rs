//! DuoCall signaling wire schema
//!
//! The JSON object model exchanged between clients and the call core:
//! inbound [`Request`]s, outbound [`Event`]s, and the [`Jsep`] attachment
//! carrying an SDP offer or answer alongside a request or event.
//!
//! The schema is field-based (JSON objects), not a byte format: transports
//! hand the core a decoded `serde_json::Value` and receive typed events to
//! encode however they like.

mod event;
mod request;

pub use event::{Event, EventBody, EventResult, RecordingInfo, SessionInfo};
pub use request::{Jsep, Request, RequestParseError, SetUpdate, SimulcastParams};
