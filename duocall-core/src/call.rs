//! Per-call state machine
//!
//! A [`Call`] is the shared state for one pairing attempt between two
//! users. It is created by the caller's `call` request, held by exactly the
//! two participants while the pairing lives, and dropped by each side
//! during its own teardown. All transitions happen under the call's own
//! lock and each forward transition fires at most once.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Milliseconds since the Unix epoch.
#[must_use]
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Call lifecycle states. The wire carries the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Init,
    Busy,
    Ringing,
    Accepted,
    Reject,
    Missed,
    Started,
    Timeout,
    Ended,
}

impl CallState {
    /// Wire discriminant carried in `stop` events.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Busy => 1,
            Self::Ringing => 2,
            Self::Accepted => 3,
            Self::Reject => 4,
            Self::Missed => 5,
            Self::Started => 6,
            Self::Timeout => 7,
            Self::Ended => 8,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Busy | Self::Reject | Self::Missed | Self::Timeout | Self::Ended
        )
    }
}

#[derive(Debug)]
struct CallInner {
    state: CallState,
    start_ring_time: i64,
    start_time: i64,
    stop_time: i64,
    /// Seconds, 0 = unlimited.
    duration_limit: u32,
}

/// What `finalize` observed: the state the call stopped in (kept on the
/// wire even when the stored state moves on to `Ended`) and the call
/// timestamps.
#[derive(Debug, Clone, Copy)]
pub struct CallStop {
    pub state: CallState,
    pub start_time: i64,
    pub stop_time: i64,
}

/// Shared state of one call attempt between two users.
#[derive(Debug)]
pub struct Call {
    is_video: bool,
    record_requested: AtomicBool,
    inner: Mutex<CallInner>,
}

impl Call {
    #[must_use]
    pub fn new(is_video: bool, record: bool, duration_limit: u32, now: i64) -> Self {
        Self {
            is_video,
            record_requested: AtomicBool::new(record),
            inner: Mutex::new(CallInner {
                state: CallState::Init,
                start_ring_time: now,
                start_time: 0,
                stop_time: 0,
                duration_limit,
            }),
        }
    }

    #[must_use]
    pub fn is_video(&self) -> bool {
        self.is_video
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn duration_limit(&self) -> u32 {
        self.inner.lock().duration_limit
    }

    #[must_use]
    pub fn timestamps(&self) -> (i64, i64) {
        let inner = self.inner.lock();
        (inner.start_time, inner.stop_time)
    }

    /// Consume the recording request; true exactly once when recording was
    /// asked for.
    pub fn take_record_request(&self) -> bool {
        self.record_requested
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// INIT -> RINGING. Idempotent; no-op in any other state.
    pub fn mark_ringing(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CallState::Init {
            inner.state = CallState::Ringing;
        }
    }

    /// INIT/RINGING -> ACCEPTED, exactly once. On failure returns the state
    /// that blocked the transition.
    pub fn accept(&self) -> Result<(), CallState> {
        let mut inner = self.inner.lock();
        match inner.state {
            CallState::Init | CallState::Ringing => {
                inner.state = CallState::Accepted;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// INIT/RINGING -> REJECT. On failure returns the blocking state.
    pub fn reject(&self) -> Result<(), CallState> {
        let mut inner = self.inner.lock();
        match inner.state {
            CallState::Init | CallState::Ringing => {
                inner.state = CallState::Reject;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// INIT/RINGING -> MISSED once ringing has lasted `timeout_ms`. True
    /// only for the invocation that performed the transition.
    pub fn ring_expired(&self, now: i64, timeout_ms: i64) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CallState::Init | CallState::Ringing
                if now - inner.start_ring_time >= timeout_ms =>
            {
                inner.state = CallState::Missed;
                true
            }
            _ => false,
        }
    }

    /// ACCEPTED -> STARTED, recording the start time. True exactly once.
    pub fn begin_media(&self, now: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == CallState::Accepted {
            inner.state = CallState::Started;
            inner.start_time = now;
            true
        } else {
            false
        }
    }

    /// STARTED -> TIMEOUT once the duration limit has elapsed; checked
    /// opportunistically on each relayed packet. True only for the
    /// invocation that performed the transition.
    pub fn duration_exceeded(&self, now: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == CallState::Started
            && inner.duration_limit > 0
            && now - inner.start_time >= i64::from(inner.duration_limit) * 1000
        {
            inner.state = CallState::Timeout;
            true
        } else {
            false
        }
    }

    /// Set the duration limit if none was given at call time.
    pub fn set_duration_once(&self, seconds: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.duration_limit == 0 {
            inner.duration_limit = seconds;
            true
        } else {
            false
        }
    }

    /// STARTED/TIMEOUT -> ENDED, stamping the stop time. Returns what the
    /// stop event should carry, or `None` when there is nothing to stop
    /// (never started, or already finalized by the other side).
    pub fn finalize(&self, now: i64) -> Option<CallStop> {
        let mut inner = self.inner.lock();
        match inner.state {
            CallState::Started | CallState::Timeout => {
                let stopped_in = if inner.state == CallState::Started {
                    CallState::Ended
                } else {
                    inner.state
                };
                inner.stop_time = now;
                inner.state = CallState::Ended;
                Some(CallStop {
                    state: stopped_in,
                    start_time: inner.start_time,
                    stop_time: now,
                })
            }
            _ => None,
        }
    }

}
