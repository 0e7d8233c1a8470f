//! Simulcast layer selection and RTP header rewriting
//!
//! A simulcasting sender pushes up to three independent encodings of the
//! same video (substreams 0..=2, low to high), each optionally carrying
//! temporal layers 0..=2. The relay lets exactly one substream/temporal
//! combination through per receiver; the [`SimulcastContext`] tracks which
//! one, and the [`RtpForwardContext`] stitches the surviving packets into a
//! single continuous output stream.

use duocall_proto::SimulcastParams;

/// Highest valid substream / temporal layer index.
pub const MAX_LAYER: i64 = 2;

/// Assumed timestamp advance between frames when stitching substreams
/// (one frame at 30 fps on the 90 kHz video clock).
const SWITCH_TS_STEP: u32 = 3_000;

/// The sender's advertised simulcast layers: up to three SSRCs, or up to
/// three RIDs. The two schemes are mutually exclusive.
#[derive(Debug, Clone, Default)]
pub struct SimulcastLayers {
    ssrcs: [Option<u32>; 3],
    rids: [Option<String>; 3],
}

impl SimulcastLayers {
    #[must_use]
    pub fn from_params(params: &SimulcastParams) -> Self {
        let mut layers = Self::default();
        if let Some(rids) = &params.rids {
            for (slot, rid) in layers.rids.iter_mut().zip(rids.iter()) {
                *slot = Some(rid.clone());
            }
        } else {
            layers.ssrcs = params.ssrcs();
        }
        layers
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.ssrcs[0].is_some() || self.rids[0].is_some()
    }

    /// Which substream a packet belongs to, by SSRC or RID.
    #[must_use]
    pub fn index_of(&self, ssrc: u32, rid: Option<&str>) -> Option<usize> {
        if let Some(rid) = rid {
            if let Some(index) = self
                .rids
                .iter()
                .position(|slot| slot.as_deref() == Some(rid))
            {
                return Some(index);
            }
        }
        self.ssrcs.iter().position(|slot| *slot == Some(ssrc))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Per-receiver simulcast selection state.
///
/// `substream`/`templayer` are what currently flows; the targets are what
/// the receiver asked for. The changed/need-keyframe flags are
/// edge-triggered and cleared by the `take_*` accessors.
#[derive(Debug, Clone)]
pub struct SimulcastContext {
    substream: i8,
    substream_target: i8,
    templayer: i8,
    templayer_target: i8,
    changed_substream: bool,
    changed_temporal: bool,
    need_keyframe: bool,
}

impl Default for SimulcastContext {
    fn default() -> Self {
        Self {
            substream: -1,
            substream_target: MAX_LAYER as i8,
            templayer: -1,
            templayer_target: MAX_LAYER as i8,
            changed_substream: false,
            changed_temporal: false,
            need_keyframe: false,
        }
    }
}

impl SimulcastContext {
    /// Decide whether a packet of the given substream belongs to the
    /// selected layer combination. Switching substreams waits for a
    /// keyframe of the target layer; until one arrives the current
    /// substream keeps flowing and a keyframe request is flagged.
    pub fn process(&mut self, substream: usize, temporal: Option<u8>, keyframe: bool) -> bool {
        let layer = substream as i8;
        if self.substream_target != self.substream {
            if layer == self.substream_target && (keyframe || self.substream == -1) {
                self.substream = self.substream_target;
                self.changed_substream = true;
            } else if self.substream == -1 {
                // Nothing locked yet: take what flows, keep aiming for the target.
                self.substream = layer;
                self.changed_substream = true;
                if self.substream != self.substream_target {
                    self.need_keyframe = true;
                }
            } else if layer == self.substream_target {
                self.need_keyframe = true;
            }
        }
        if layer != self.substream {
            return false;
        }
        if let Some(tid) = temporal {
            let tid = tid as i8;
            if self.templayer_target != self.templayer {
                if self.templayer != -1 && self.templayer_target < self.templayer {
                    self.templayer = self.templayer_target;
                    self.changed_temporal = true;
                } else if tid == self.templayer_target {
                    self.templayer = self.templayer_target;
                    self.changed_temporal = true;
                }
            }
            if self.templayer != -1 && tid > self.templayer {
                return false;
            }
        }
        true
    }

    #[must_use]
    pub fn substream(&self) -> i8 {
        self.substream
    }

    #[must_use]
    pub fn substream_target(&self) -> i8 {
        self.substream_target
    }

    #[must_use]
    pub fn templayer(&self) -> i8 {
        self.templayer
    }

    #[must_use]
    pub fn templayer_target(&self) -> i8 {
        self.templayer_target
    }

    pub fn set_substream_target(&mut self, target: u8) {
        self.substream_target = target as i8;
    }

    pub fn set_templayer_target(&mut self, target: u8) {
        self.templayer_target = target as i8;
    }

    /// Consume the substream-changed edge.
    pub fn take_changed_substream(&mut self) -> bool {
        std::mem::take(&mut self.changed_substream)
    }

    /// Consume the temporal-changed edge.
    pub fn take_changed_temporal(&mut self) -> bool {
        std::mem::take(&mut self.changed_temporal)
    }

    /// Consume the keyframe-needed edge.
    pub fn take_need_keyframe(&mut self) -> bool {
        std::mem::take(&mut self.need_keyframe)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Sequence/timestamp/SSRC rewriting so the receiver sees one continuous
/// RTP stream across substream switches. The output SSRC is pinned to the
/// first substream forwarded.
#[derive(Debug, Clone, Default)]
pub struct RtpForwardContext {
    started: bool,
    out_ssrc: Option<u32>,
    seq_offset: u16,
    ts_offset: u32,
    last_seq_out: u16,
    last_ts_out: u32,
}

impl RtpForwardContext {
    /// Map an inbound header onto the output stream. `switched` marks the
    /// first packet after a substream change, where new offsets are chosen
    /// so the output continues from the last forwarded packet.
    pub fn rewrite(&mut self, seq: u16, ts: u32, ssrc: u32, switched: bool) -> (u16, u32, u32) {
        if !self.started {
            self.started = true;
            self.out_ssrc = Some(ssrc);
        } else if switched {
            self.seq_offset = seq.wrapping_sub(self.last_seq_out.wrapping_add(1));
            self.ts_offset = ts.wrapping_sub(self.last_ts_out.wrapping_add(SWITCH_TS_STEP));
        }
        let out_seq = seq.wrapping_sub(self.seq_offset);
        let out_ts = ts.wrapping_sub(self.ts_offset);
        self.last_seq_out = out_seq;
        self.last_ts_out = out_ts;
        (out_seq, out_ts, self.out_ssrc.unwrap_or(ssrc))
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssrc_layers(a: u32, b: u32, c: u32) -> SimulcastLayers {
        SimulcastLayers::from_params(&SimulcastParams {
            ssrc_0: Some(a),
            ssrc_1: Some(b),
            ssrc_2: Some(c),
            rids: None,
        })
    }

    #[test]
    fn test_layer_lookup_by_ssrc_and_rid() {
        let layers = ssrc_layers(10, 20, 30);
        assert_eq!(layers.index_of(20, None), Some(1));
        assert_eq!(layers.index_of(40, None), None);

        let layers = SimulcastLayers::from_params(&SimulcastParams {
            rids: Some(vec!["l".into(), "m".into(), "h".into()]),
            ..Default::default()
        });
        assert_eq!(layers.index_of(0, Some("h")), Some(2));
        assert_eq!(layers.index_of(0, Some("x")), None);
    }

    #[test]
    fn test_locks_onto_target_layer() {
        let mut ctx = SimulcastContext::default();
        assert!(ctx.process(2, None, true));
        assert_eq!(ctx.substream(), 2);
        assert!(ctx.take_changed_substream());
        // Other layers are dropped once locked.
        assert!(!ctx.process(0, None, false));
        assert!(!ctx.process(1, None, true));
        assert!(ctx.process(2, None, false));
        // Selection is stable: no further change edges at the same layer.
        assert!(!ctx.take_changed_substream());
    }

    #[test]
    fn test_switch_waits_for_keyframe() {
        let mut ctx = SimulcastContext::default();
        assert!(ctx.process(2, None, true));
        ctx.take_changed_substream();

        ctx.set_substream_target(0);
        // Mid-GOP packet of the target layer: keep the old substream flowing,
        // ask for a keyframe.
        assert!(!ctx.process(0, None, false));
        assert!(ctx.take_need_keyframe());
        assert!(ctx.process(2, None, false));
        // The keyframe completes the switch.
        assert!(ctx.process(0, None, true));
        assert!(ctx.take_changed_substream());
        assert!(!ctx.process(2, None, false));
    }

    #[test]
    fn test_provisional_lock_when_target_missing() {
        let mut ctx = SimulcastContext::default();
        // Only the low layer flows; it is relayed while a keyframe for the
        // target is requested.
        assert!(ctx.process(0, None, false));
        assert_eq!(ctx.substream(), 0);
        assert!(ctx.take_changed_substream());
        assert!(ctx.take_need_keyframe());
    }

    #[test]
    fn test_temporal_downgrade_is_immediate_upgrade_waits() {
        let mut ctx = SimulcastContext::default();
        assert!(ctx.process(2, Some(0), true));
        // Lock temporal at the target.
        assert!(ctx.process(2, Some(2), false));
        assert!(ctx.take_changed_temporal());

        ctx.set_templayer_target(0);
        assert!(!ctx.process(2, Some(1), false));
        assert!(ctx.take_changed_temporal());
        assert!(ctx.process(2, Some(0), false));

        ctx.set_templayer_target(2);
        // Upgrade only once a packet of the target layer shows up.
        assert!(ctx.process(2, Some(0), false));
        assert!(ctx.process(2, Some(2), false));
        assert!(ctx.take_changed_temporal());
    }

    #[test]
    fn test_forward_context_continuity_across_switch() {
        let mut fwd = RtpForwardContext::default();
        let (s1, t1, ssrc1) = fwd.rewrite(1000, 90_000, 0xAAAA, false);
        assert_eq!((s1, t1, ssrc1), (1000, 90_000, 0xAAAA));
        let (s2, _, _) = fwd.rewrite(1001, 93_000, 0xAAAA, false);
        assert_eq!(s2, 1001);

        // Switch to another substream with wildly different numbering.
        let (s3, t3, ssrc3) = fwd.rewrite(50_000, 700_000, 0xBBBB, true);
        assert_eq!(s3, 1002);
        assert_eq!(t3, 96_000);
        assert_eq!(ssrc3, 0xAAAA);

        // Gaps within the new substream survive (loss is preserved).
        let (s4, _, _) = fwd.rewrite(50_003, 703_000, 0xBBBB, false);
        assert_eq!(s4, 1005);
    }

    #[test]
    fn test_forward_context_seq_wraparound() {
        let mut fwd = RtpForwardContext::default();
        fwd.rewrite(u16::MAX, 1000, 1, false);
        let (seq, _, _) = fwd.rewrite(0, 4000, 1, false);
        assert_eq!(seq, 0);
    }
}
