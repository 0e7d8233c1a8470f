//! Per-identity session state
//!
//! A [`UserSession`] is one registered identity's mutable state, possibly
//! spanning several transport handles at once. Signaling-owned fields sit
//! under one lock, per-packet relay state under another, recorders under a
//! third; the one-shot lifecycle flags are atomics so the relay path can
//! check them without taking any lock. Linkage fields (`peer`, `call`) are
//! only ever written by the serialized signaling worker.

use crate::call::Call;
use crate::recording::RecorderSet;
use crate::simulcast::{RtpForwardContext, SimulcastContext, SimulcastLayers};
use crate::types::{AudioCodec, HandleId, VideoCodec};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

/// Signaling-owned session fields.
#[derive(Default)]
pub(crate) struct SessionState {
    /// Unique once set; unset sessions are anonymous and cannot be called.
    pub(crate) username: Option<String>,
    /// Every transport handle currently mapped to this identity.
    pub(crate) handles: Vec<HandleId>,
    /// The handle carrying media for the active call.
    pub(crate) active_handle: Option<HandleId>,
    pub(crate) has_audio: bool,
    pub(crate) has_video: bool,
    pub(crate) has_data: bool,
    pub(crate) audio_active: bool,
    pub(crate) video_active: bool,
    /// Outgoing video bitrate cap in bps, 0 = unlimited.
    pub(crate) bitrate_cap: u32,
    /// Last bitrate the peer reported via congestion feedback.
    pub(crate) peer_reported_bitrate: u32,
    pub(crate) audio_codec: Option<AudioCodec>,
    pub(crate) video_codec: Option<VideoCodec>,
    /// The other party of the active call, resolved through the registry at
    /// use time so a torn-down peer is never kept alive through this link.
    pub(crate) peer: Option<String>,
    pub(crate) call: Option<Arc<Call>>,
}

/// Relay-owned state, touched once per forwarded packet.
#[derive(Default)]
pub(crate) struct RelayState {
    /// Simulcast layers this session *sends* (from its offer/answer).
    pub(crate) layers: SimulcastLayers,
    /// Selection state for packets this session *receives*.
    pub(crate) sim: SimulcastContext,
    /// Header rewriting for the stream this session receives.
    pub(crate) fwd: RtpForwardContext,
}

pub struct UserSession {
    state: Mutex<SessionState>,
    relay: Mutex<RelayState>,
    recorders: Mutex<RecorderSet>,
    in_call: AtomicBool,
    media_started: AtomicBool,
    hanging_up: AtomicBool,
    destroyed: AtomicBool,
    slow_link_count: AtomicU16,
}

impl UserSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState {
                audio_active: true,
                video_active: true,
                ..Default::default()
            }),
            relay: Mutex::new(RelayState::default()),
            recorders: Mutex::new(RecorderSet::default()),
            in_call: AtomicBool::new(false),
            media_started: AtomicBool::new(false),
            hanging_up: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            slow_link_count: AtomicU16::new(0),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    pub(crate) fn relay(&self) -> MutexGuard<'_, RelayState> {
        self.relay.lock()
    }

    pub(crate) fn recorders(&self) -> MutexGuard<'_, RecorderSet> {
        self.recorders.lock()
    }

    #[must_use]
    pub fn username(&self) -> Option<String> {
        self.state.lock().username.clone()
    }

    #[must_use]
    pub(crate) fn peer_username(&self) -> Option<String> {
        self.state.lock().peer.clone()
    }

    #[must_use]
    pub(crate) fn current_call(&self) -> Option<Arc<Call>> {
        self.state.lock().call.clone()
    }

    #[must_use]
    pub(crate) fn active_handle(&self) -> Option<HandleId> {
        self.state.lock().active_handle
    }

    #[must_use]
    pub(crate) fn handles(&self) -> Vec<HandleId> {
        self.state.lock().handles.clone()
    }

    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub(crate) fn attach_handle(&self, handle: HandleId) {
        let mut state = self.state.lock();
        if !state.handles.contains(&handle) {
            state.handles.push(handle);
        }
    }

    /// True when the handle was attached.
    pub(crate) fn detach_handle(&self, handle: HandleId) -> bool {
        let mut state = self.state.lock();
        let before = state.handles.len();
        state.handles.retain(|h| *h != handle);
        state.handles.len() != before
    }

    #[must_use]
    pub(crate) fn audio_active(&self) -> bool {
        self.state.lock().audio_active
    }

    #[must_use]
    pub(crate) fn video_active(&self) -> bool {
        self.state.lock().video_active
    }

    /// Claim the at-most-one-call slot.
    pub(crate) fn try_enter_call(&self) -> bool {
        self.in_call
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the call slot; true only for the releasing invocation.
    pub(crate) fn leave_call(&self) -> bool {
        self.in_call
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub(crate) fn in_call(&self) -> bool {
        self.in_call.load(Ordering::Acquire)
    }

    pub(crate) fn set_media_started(&self, started: bool) {
        self.media_started.store(started, Ordering::Release);
    }

    #[must_use]
    pub(crate) fn has_media_started(&self) -> bool {
        self.media_started.load(Ordering::Acquire)
    }

    /// Latch teardown; false when another teardown is already running.
    pub(crate) fn begin_hangup(&self) -> bool {
        self.hanging_up
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_hangup(&self) {
        self.hanging_up.store(false, Ordering::Release);
    }

    #[must_use]
    pub(crate) fn is_hanging_up(&self) -> bool {
        self.hanging_up.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn bump_slow_link(&self) -> u16 {
        self.slow_link_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[must_use]
    pub(crate) fn slow_link_count(&self) -> u16 {
        self.slow_link_count.load(Ordering::Acquire)
    }

    /// Back to the post-teardown defaults; linkage (`peer`, `call`) and the
    /// handle list are managed separately by the teardown routine.
    pub(crate) fn reset_media_state(&self) {
        {
            let mut state = self.state.lock();
            state.has_audio = false;
            state.has_video = false;
            state.has_data = false;
            state.audio_active = true;
            state.video_active = true;
            state.audio_codec = None;
            state.video_codec = None;
            state.bitrate_cap = 0;
            state.peer_reported_bitrate = 0;
        }
        let mut relay = self.relay.lock();
        relay.layers.clear();
        relay.sim.reset();
        relay.fwd.reset();
    }
}

impl Default for UserSession {
    fn default() -> Self {
        Self::new()
    }
}
