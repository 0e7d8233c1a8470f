//! Collaborator contracts towards the transport host
//!
//! The core never owns a socket, never parses SDP, never touches
//! ICE/DTLS. Everything it needs from the surrounding media gateway goes
//! through [`MediaGateway`]; all callbacks are fire-and-forget and must not
//! block, since several are invoked on the per-packet relay path.

use crate::media::{DataPacket, RtcpPacket, RtpPacket};
use crate::types::HandleId;
use duocall_proto::{Event, Jsep};

/// Callbacks into the transport/media host.
pub trait MediaGateway: Send + Sync {
    /// Push a signaling event to one transport handle. `transaction` echoes
    /// the request being answered, when there is one.
    fn push_event(
        &self,
        handle: HandleId,
        transaction: Option<&str>,
        event: &Event,
        jsep: Option<&Jsep>,
    );

    /// Tear down the underlying transport connection.
    fn close_connection(&self, handle: HandleId);

    /// Ask the sender behind this handle for a full video frame.
    fn request_keyframe(&self, handle: HandleId);

    /// Send a congestion feedback packet announcing `bitrate` towards the
    /// sender behind this handle.
    fn send_bitrate_feedback(&self, handle: HandleId, bitrate: u32);

    fn relay_rtp(&self, handle: HandleId, packet: &RtpPacket);

    fn relay_rtcp(&self, handle: HandleId, packet: &RtcpPacket);

    fn relay_data(&self, handle: HandleId, packet: &DataPacket);

    /// Best-effort telemetry towards external event collectors. Only called
    /// when both the config toggle and [`Self::events_enabled`] agree.
    fn notify_event(&self, handle: HandleId, info: serde_json::Value) {
        let _ = (handle, info);
    }

    /// Whether the host has an event collector attached.
    fn events_enabled(&self) -> bool {
        false
    }
}

/// Authorization collaborator, consulted on `login`.
pub trait Authorizer: Send + Sync {
    fn is_username_authorized(&self, username: &str) -> bool;
}
