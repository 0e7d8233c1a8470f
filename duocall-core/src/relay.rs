//! Per-packet relay path
//!
//! Runs once per inbound packet on whatever thread the transport uses and
//! is safe against concurrent packets for other sessions and against the
//! serialized signaling worker. It never surfaces an error: a missing
//! peer, a torn-down session or an undecodable feedback block all degrade
//! to a silent drop, because packet loss is an expected condition here.

use crate::call::now_millis;
use crate::media::{remb_bitrate, DataPacket, RtcpPacket, RtpPacket};
use crate::service::ServiceShared;
use crate::session::UserSession;
use crate::types::{HandleId, MediaKind};
use duocall_proto::EventResult;
use std::sync::Arc;
use tracing::debug;

/// Outcome of running one video packet through the receiver's simulcast
/// state, gathered under the relay lock and acted upon after releasing it.
struct SimulcastDecision {
    header: Option<(u16, u32, u32)>,
    changed_substream: Option<i8>,
    changed_temporal: Option<i8>,
    need_keyframe: bool,
}

impl ServiceShared {
    /// Sender session and its peer, or `None` while either end is absent
    /// or mid-teardown. Transient races here are expected, not failures.
    fn relay_endpoints(
        &self,
        handle: HandleId,
    ) -> Option<(Arc<UserSession>, Arc<UserSession>, HandleId)> {
        let session = self.registry.session_for_handle(handle)?;
        if session.is_destroyed() || session.is_hanging_up() {
            return None;
        }
        let peer_name = session.peer_username()?;
        let peer = self.registry.lookup(&peer_name)?;
        if peer.is_destroyed() {
            return None;
        }
        let peer_handle = peer.active_handle()?;
        Some((session, peer, peer_handle))
    }

    pub(crate) fn relay_rtp(&self, handle: HandleId, packet: &RtpPacket) {
        let Some((session, peer, peer_handle)) = self.relay_endpoints(handle) else {
            return;
        };

        // Opportunistic duration cap: the packet that observes the expiry
        // is dropped and the timed-out side is asked to hang up.
        if let Some(call) = session.current_call() {
            if call.duration_exceeded(now_millis()) {
                debug!(%handle, "call duration limit reached");
                self.gateway.close_connection(handle);
                return;
            }
        }

        match packet.kind {
            MediaKind::Audio => {
                if !session.audio_active() {
                    return;
                }
                session.recorders().write_audio(&packet.data);
                self.gateway.relay_rtp(peer_handle, packet);
            }
            MediaKind::Video => {
                if !session.video_active() {
                    return;
                }
                let layer = {
                    let relay = session.relay();
                    if relay.layers.is_enabled() {
                        match relay.layers.index_of(packet.ssrc, packet.rid.as_deref()) {
                            Some(layer) => Some(layer),
                            // A simulcasting sender on an unknown layer:
                            // nothing we could cleanly forward.
                            None => return,
                        }
                    } else {
                        None
                    }
                };
                match layer {
                    Some(layer) => self.relay_simulcast_video(
                        handle,
                        &session,
                        &peer,
                        peer_handle,
                        packet,
                        layer,
                    ),
                    None => {
                        session.recorders().write_video(&packet.data);
                        self.gateway.relay_rtp(peer_handle, packet);
                    }
                }
            }
        }
    }

    fn relay_simulcast_video(
        &self,
        handle: HandleId,
        session: &Arc<UserSession>,
        peer: &Arc<UserSession>,
        peer_handle: HandleId,
        packet: &RtpPacket,
        layer: usize,
    ) {
        // The selection state lives on the receiving side: the peer's
        // context decides what reaches the peer.
        let decision = {
            let mut relay = peer.relay();
            let forward = relay
                .sim
                .process(layer, packet.temporal_layer, packet.keyframe);
            let changed_substream = relay
                .sim
                .take_changed_substream()
                .then(|| relay.sim.substream());
            let changed_temporal = relay
                .sim
                .take_changed_temporal()
                .then(|| relay.sim.templayer());
            let need_keyframe = relay.sim.take_need_keyframe();
            let header = forward.then(|| {
                relay.fwd.rewrite(
                    packet.sequence_number,
                    packet.timestamp,
                    packet.ssrc,
                    changed_substream.is_some(),
                )
            });
            SimulcastDecision {
                header,
                changed_substream,
                changed_temporal,
                need_keyframe,
            }
        };

        if decision.need_keyframe {
            // Only the sender can produce the keyframe the switch needs.
            self.gateway.request_keyframe(handle);
        }
        let videocodec = session
            .state()
            .video_codec
            .map_or("none", |codec| codec.name())
            .to_string();
        if let Some(substream) = decision.changed_substream {
            self.push_result(
                peer_handle,
                None,
                EventResult::Simulcast {
                    videocodec: videocodec.clone(),
                    substream: u8::try_from(substream).ok(),
                    temporal: None,
                },
                None,
            );
        }
        if let Some(temporal) = decision.changed_temporal {
            self.push_result(
                peer_handle,
                None,
                EventResult::Simulcast {
                    videocodec,
                    substream: None,
                    temporal: u8::try_from(temporal).ok(),
                },
                None,
            );
        }
        let Some((sequence_number, timestamp, ssrc)) = decision.header else {
            return;
        };
        session.recorders().write_video(&packet.data);
        // Forward a rewritten copy; the sender's own packet stays intact
        // so its transport statistics are not corrupted.
        let outbound = packet.with_header(sequence_number, timestamp, ssrc);
        self.gateway.relay_rtp(peer_handle, &outbound);
    }

    pub(crate) fn relay_rtcp(&self, handle: HandleId, packet: &RtcpPacket) {
        let Some((session, _peer, peer_handle)) = self.relay_endpoints(handle) else {
            return;
        };
        if let Some(bitrate) = remb_bitrate(&packet.data) {
            // Congestion feedback is not forwarded verbatim: remember what
            // the peer reported and answer with our own cap instead.
            let announced = {
                let mut state = session.state();
                state.peer_reported_bitrate = bitrate;
                if state.bitrate_cap > 0 {
                    state.bitrate_cap
                } else {
                    self.config.default_feedback_bitrate
                }
            };
            self.gateway.send_bitrate_feedback(handle, announced);
            return;
        }
        self.gateway.relay_rtcp(peer_handle, packet);
    }

    pub(crate) fn relay_data(&self, handle: HandleId, packet: &DataPacket) {
        let Some((session, _peer, peer_handle)) = self.relay_endpoints(handle) else {
            return;
        };
        if packet.data.is_empty() {
            return;
        }
        debug!(
            %handle,
            binary = packet.binary,
            bytes = packet.data.len(),
            "forwarding data channel message"
        );
        session.recorders().write_data(&packet.data);
        self.gateway.relay_data(peer_handle, packet);
    }
}
