//! Tilt guard.
//!
//! The tick runs every ~100 ms; observing a negative or much larger
//! delta between two ticks means the clock jumped or the process was
//! frozen. Every timer looks expired in that situation, so the acting
//! half is suspended while monitoring continues to collect state.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::events::{self, EventLevel};
use super::state::{mstime, SupervisorState};
use super::{TILT_PERIOD_MS, TILT_TRIGGER_MS};

/// Compare this tick against the previous one and enter tilt on anomaly.
pub fn check_tilt(state: &Arc<SupervisorState>) {
    let now = mstime();
    let previous = state.previous_tick_time.swap(now, Ordering::SeqCst);

    if now < previous || now - previous > TILT_TRIGGER_MS {
        state.tilt.store(true, Ordering::Relaxed);
        state.tilt_start_time.store(now, Ordering::Relaxed);
        events::emit(
            state,
            EventLevel::Warning,
            "+tilt",
            "#tilt mode entered",
            None,
        );
    }
}

/// While tilted, report whether acting is still suspended; leave tilt
/// once a full quiet period has passed.
pub fn still_tilted(state: &Arc<SupervisorState>) -> bool {
    if !state.is_tilt() {
        return false;
    }
    let start = state.tilt_start_time.load(Ordering::Relaxed);
    if mstime().saturating_sub(start) < TILT_PERIOD_MS {
        return true;
    }
    state.tilt.store(false, Ordering::Relaxed);
    events::emit(
        state,
        EventLevel::Warning,
        "-tilt",
        "#tilt mode exited",
        None,
    );
    false
}
