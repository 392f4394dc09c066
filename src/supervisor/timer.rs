//! Timer / dispatcher.
//!
//! The engine heart: every ~100 ms walk the instance forest (primaries,
//! then their replicas, then their peers), run the per-instance handler,
//! apply deferred address switches, and service the script queue.
//!
//! Per instance and tick the order is fixed: reconnect, probe, down
//! detection, election ask, state machine step.

use std::sync::Arc;
use std::time::Duration;

use super::detector;
use super::failover;
use super::link;
use super::probe;
use super::state::{mstime, FailoverState, InstanceRef, SupervisorState};
use super::tilt;
use super::TICK_PERIOD_MS;

pub async fn run(state: Arc<SupervisorState>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_PERIOD_MS));
    loop {
        ticker.tick().await;
        tick(&state);
    }
}

/// One engine tick.
pub fn tick(state: &Arc<SupervisorState>) {
    tilt::check_tilt(state);
    handle_all_primaries(state);

    state.scripts.run_pending(&state.events, mstime());
    state.scripts.collect_terminated(&state.events);
    state.scripts.kill_timedout(&state.events, mstime());
}

fn handle_all_primaries(state: &Arc<SupervisorState>) {
    // Address switches are applied after the walk so the forest is never
    // restructured under an iterating handler.
    let mut switch_pending = Vec::new();

    let primaries: Vec<_> = state.primaries.iter().map(|e| e.value().clone()).collect();
    for primary in primaries {
        handle_instance(state, &InstanceRef::Primary(primary.clone()));

        let replicas: Vec<_> = primary.replicas.iter().map(|e| e.value().clone()).collect();
        for replica in replicas {
            handle_instance(
                state,
                &InstanceRef::Replica {
                    primary: primary.clone(),
                    replica,
                },
            );
        }

        let peers: Vec<_> = primary.peers.iter().map(|e| e.value().clone()).collect();
        for peer in peers {
            handle_instance(
                state,
                &InstanceRef::Peer {
                    primary: primary.clone(),
                    peer,
                },
            );
        }

        if primary.get_failover_state() == FailoverState::UpdateConfig {
            switch_pending.push(primary);
        }
    }

    for primary in switch_pending {
        failover::switch_to_promoted(state, &primary);
    }
}

fn handle_instance(state: &Arc<SupervisorState>, iref: &InstanceRef) {
    // Monitoring half: runs even in tilt.
    link::reconnect_instance(state, iref);
    probe::probe_instance(state, iref, mstime());

    // Acting half: suspended while the clock is not trusted.
    if tilt::still_tilted(state) {
        return;
    }

    detector::check_subjectively_down(state, iref, mstime());

    if let InstanceRef::Primary(primary) = iref {
        detector::check_objectively_down(state, primary);
        if failover::start_failover_if_needed(state, primary) {
            detector::ask_peers(state, primary, true);
        }
        failover::failover_state_machine(state, primary);
        detector::ask_peers(state, primary, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::state::test_util::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_tick_detects_sdown_and_odown() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.config.write().quorum = 1;

        // Pretend the primary stopped replying half a minute ago.
        primary
            .core
            .last_avail_time
            .store(mstime() - 40_000, Ordering::Relaxed);

        tick(&state);

        assert!(primary.core.flags.is_sdown());
        assert!(primary.core.flags.is_odown());
        // Quorum of one, so a failover election begins at once.
        assert!(primary.core.flags.is_failover_in_progress());
        assert_eq!(state.epoch(), 1);
    }

    #[tokio::test]
    async fn test_tilt_freezes_failover_progress() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.config.write().quorum = 1;
        primary
            .core
            .last_avail_time
            .store(mstime() - 40_000, Ordering::Relaxed);

        // Inject a clock jump: the first tick enters tilt and must not
        // act on the down primary.
        state
            .previous_tick_time
            .store(mstime() - 10_000, Ordering::Relaxed);
        tick(&state);

        assert!(state.is_tilt());
        assert!(!primary.core.flags.is_sdown());
        assert!(!primary.core.flags.is_failover_in_progress());

        // Later ticks keep monitoring but still do not act.
        tick(&state);
        assert!(!primary.core.flags.is_sdown());
    }

    #[tokio::test]
    async fn test_update_config_applied_after_walk() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let replica = test_replica(&primary, "10.0.0.2", 6380);
        replica.core.flags.set_promoted(true);
        *primary.promoted_replica.write() = Some(replica);
        primary.core.flags.set_failover_in_progress(true);
        primary.set_failover_state(FailoverState::UpdateConfig);

        tick(&state);

        assert_eq!(primary.core.addr().to_name(), "10.0.0.2:6380");
        assert_eq!(primary.get_failover_state(), FailoverState::None);
    }
}
