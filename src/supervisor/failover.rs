//! Failover state machine.
//!
//! Once a primary is objectively down, the supervisor that wins the epoch
//! election drives one replica through promotion and points the rest at
//! it: WAIT_START (election) -> SELECT_SLAVE -> SEND_SLAVEOF_NOONE ->
//! WAIT_PROMOTION -> RECONF_SLAVES -> UPDATE_CONFIG. Aborts are possible
//! until the promoted replica acknowledged its new role; after that the
//! failover can only run to its end.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::addr::InstanceAddr;
use super::election;
use super::events::{self, EventLevel};
use super::link::{self, LinkType};
use super::scripts;
use super::state::{
    mstime, FailoverState, PrimaryInstance, ReplicaInstance, SupervisorState, RESET_GENERATE_EVENT,
    RESET_NO_PEERS,
};
use super::{ELECTION_TIMEOUT_MS, INFO_PERIOD_MS, INFO_VALIDITY_TIME_MS, RECONF_RETRY_PERIOD_MS};

/// Start a failover when the primary is objectively down, we are allowed
/// to act, none is running, and the previous attempt is not too recent.
pub fn start_failover_if_needed(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) -> bool {
    let flags = &primary.core.flags;
    if !flags.can_failover() || !flags.is_odown() {
        return false;
    }
    if flags.is_failover_in_progress() {
        return false;
    }
    let last_attempt = primary.failover_start_time.load(Ordering::Relaxed);
    if mstime().saturating_sub(last_attempt) < primary.failover_timeout() * 2 {
        return false;
    }

    start_failover(state, primary);
    true
}

/// Arm the state machine: consume a fresh epoch and enter WAIT_START.
pub fn start_failover(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    primary.set_failover_state(FailoverState::WaitStart);
    primary.core.flags.set_failover_in_progress(true);
    let epoch = state.next_epoch();
    primary.failover_epoch.store(epoch, Ordering::Relaxed);
    events::emit(
        state,
        EventLevel::Warning,
        "+new-epoch",
        &epoch.to_string(),
        Some(primary),
    );
    events::emit(
        state,
        EventLevel::Warning,
        "+try-failover",
        &events::primary_body(primary),
        Some(primary),
    );
    primary
        .failover_start_time
        .store(mstime(), Ordering::Relaxed);
}

/// Operator-forced failover: no down state required, the election is
/// bypassed.
pub fn force_failover(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) -> Result<()> {
    if primary.core.flags.is_failover_in_progress() {
        return Err(Error::FailoverInProgress);
    }
    if select_replica(primary).is_none() {
        return Err(Error::NoSuitableReplica);
    }
    start_failover(state, primary);
    primary.core.flags.set_force_failover(true);
    Ok(())
}

/// One step of the state machine, called every tick for every primary.
pub fn failover_state_machine(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    if !primary.core.flags.is_failover_in_progress() {
        return;
    }

    match primary.get_failover_state() {
        FailoverState::WaitStart => failover_wait_start(state, primary),
        FailoverState::SelectSlave => failover_select_slave(state, primary),
        FailoverState::SendSlaveofNoone => failover_send_slaveof_noone(state, primary),
        FailoverState::WaitPromotion => failover_wait_promotion(state, primary),
        FailoverState::ReconfSlaves => failover_reconf_slaves(state, primary),
        // UPDATE_CONFIG is applied by the dispatcher after the walk.
        FailoverState::UpdateConfig | FailoverState::None => {}
    }
}

fn failover_wait_start(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    let epoch = primary.failover_epoch.load(Ordering::Relaxed);
    let leader = election::get_leader(state, primary, epoch);
    let is_leader = leader.as_deref() == Some(state.myid.as_str());

    if !is_leader && !primary.core.flags.is_force_failover() {
        let election_timeout = ELECTION_TIMEOUT_MS.min(primary.failover_timeout());
        let started = primary.failover_start_time.load(Ordering::Relaxed);
        if mstime().saturating_sub(started) > election_timeout {
            events::emit(
                state,
                EventLevel::Warning,
                "-failover-abort-not-elected",
                &events::primary_body(primary),
                Some(primary),
            );
            abort_failover(state, primary);
        }
        return;
    }

    events::emit(
        state,
        EventLevel::Warning,
        "+elected-leader",
        &events::primary_body(primary),
        Some(primary),
    );
    primary.set_failover_state(FailoverState::SelectSlave);
    events::emit(
        state,
        EventLevel::Warning,
        "+failover-state-select-slave",
        &events::primary_body(primary),
        Some(primary),
    );
}

fn failover_select_slave(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    match select_replica(primary) {
        None => {
            events::emit(
                state,
                EventLevel::Warning,
                "-failover-abort-no-good-slave",
                &events::primary_body(primary),
                Some(primary),
            );
            abort_failover(state, primary);
        }
        Some(replica) => {
            events::emit(
                state,
                EventLevel::Warning,
                "+selected-slave",
                &events::replica_body(&replica, primary),
                Some(primary),
            );
            replica.core.flags.set_promoted(true);
            *primary.promoted_replica.write() = Some(replica.clone());
            primary.set_failover_state(FailoverState::SendSlaveofNoone);
            events::emit(
                state,
                EventLevel::Notice,
                "+failover-state-send-slaveof-noone",
                &events::replica_body(&replica, primary),
                Some(primary),
            );
        }
    }
}

fn failover_send_slaveof_noone(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    let Some(promoted) = primary.promoted_replica.read().clone() else {
        return;
    };

    // Keep retrying while the candidate is unreachable, up to the
    // failover timeout.
    if promoted.core.flags.is_disconnected() {
        let changed = primary.failover_state_change_time.load(Ordering::Relaxed);
        if mstime().saturating_sub(changed) > primary.failover_timeout() {
            events::emit(
                state,
                EventLevel::Warning,
                "-failover-abort-slave-timeout",
                &events::primary_body(primary),
                Some(primary),
            );
            abort_failover(state, primary);
        }
        return;
    }

    // The reply is not interesting; promotion is observed through the
    // info snapshots of the promoted replica.
    if !link::send_replica_of(&promoted.core, None) {
        return;
    }
    events::emit(
        state,
        EventLevel::Notice,
        "+failover-state-wait-promotion",
        &events::replica_body(&promoted, primary),
        Some(primary),
    );
    primary.set_failover_state(FailoverState::WaitPromotion);
}

fn failover_wait_promotion(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    // The transition out of this state is driven by the info ingestor;
    // only the timeout lives here.
    let changed = primary.failover_state_change_time.load(Ordering::Relaxed);
    if mstime().saturating_sub(changed) > primary.failover_timeout() {
        events::emit(
            state,
            EventLevel::Warning,
            "-failover-abort-slave-timeout",
            &events::primary_body(primary),
            Some(primary),
        );
        abort_failover(state, primary);
    }
}

fn failover_reconf_slaves(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    let Some(promoted) = primary.promoted_replica.read().clone() else {
        return;
    };
    let promoted_addr = promoted.core.addr();
    let parallel_syncs = primary.parallel_syncs();
    let now = mstime();

    let mut in_progress = primary
        .replicas
        .iter()
        .filter(|e| {
            let f = &e.value().core.flags;
            f.is_reconf_sent() || f.is_reconf_inprog()
        })
        .count() as u32;

    for entry in primary.replicas.iter() {
        if in_progress >= parallel_syncs {
            break;
        }
        let replica = entry.value();
        let flags = &replica.core.flags;

        if flags.is_promoted() || flags.is_reconf_done() {
            continue;
        }

        // A reconfiguration that shows no progress for too long is
        // retried from scratch.
        if flags.is_reconf_sent()
            && now.saturating_sub(replica.reconf_sent_time.load(Ordering::Relaxed))
                > RECONF_RETRY_PERIOD_MS
        {
            events::emit(
                state,
                EventLevel::Notice,
                "-slave-reconf-sent-timeout",
                &events::replica_body(replica, primary),
                Some(primary),
            );
            flags.set_reconf_sent(false);
        }

        if flags.is_disconnected() || flags.is_reconf_sent() || flags.is_reconf_inprog() {
            continue;
        }

        if link::send_replica_of(&replica.core, Some(promoted_addr)) {
            flags.set_reconf_sent(true);
            replica.reconf_sent_time.store(now, Ordering::Relaxed);
            events::emit(
                state,
                EventLevel::Notice,
                "+slave-reconf-sent",
                &events::replica_body(replica, primary),
                Some(primary),
            );
            in_progress += 1;
        }
    }

    failover_detect_end(state, primary);
}

fn failover_detect_end(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    let Some(promoted) = primary.promoted_replica.read().clone() else {
        return;
    };
    if promoted.core.flags.is_sdown() {
        return;
    }

    let now = mstime();
    let elapsed = now.saturating_sub(primary.failover_state_change_time.load(Ordering::Relaxed));

    let mut not_reconfigured = primary
        .replicas
        .iter()
        .filter(|e| {
            let f = &e.value().core.flags;
            !f.is_promoted() && !f.is_reconf_done() && !f.is_sdown()
        })
        .count();

    let mut timed_out = false;
    if elapsed > primary.failover_timeout() {
        not_reconfigured = 0;
        timed_out = true;
        events::emit(
            state,
            EventLevel::Warning,
            "+failover-end-for-timeout",
            &events::primary_body(primary),
            Some(primary),
        );
    }

    if not_reconfigured == 0 {
        events::emit(
            state,
            EventLevel::Warning,
            "+failover-end",
            &events::primary_body(primary),
            Some(primary),
        );
        primary.set_failover_state(FailoverState::UpdateConfig);
        scripts::call_client_reconfig(
            state,
            primary,
            "leader",
            "end",
            primary.core.addr(),
            promoted.core.addr(),
        );
    }

    // On timeout, still fire a best-effort SLAVEOF at every replica not
    // yet pointed at the new primary.
    if timed_out {
        let promoted_addr = promoted.core.addr();
        for entry in primary.replicas.iter() {
            let replica = entry.value();
            let flags = &replica.core.flags;
            if flags.is_promoted()
                || flags.is_reconf_done()
                || flags.is_reconf_sent()
                || flags.is_disconnected()
            {
                continue;
            }
            if link::send_replica_of(&replica.core, Some(promoted_addr)) {
                events::emit(
                    state,
                    EventLevel::Notice,
                    "+slave-reconf-sent-be",
                    &events::replica_body(replica, primary),
                    Some(primary),
                );
                flags.set_reconf_sent(true);
            }
        }
    }
}

/// Abort a failover that did not get past promotion. Later stages cannot
/// be rolled back and always run to the end.
pub fn abort_failover(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    debug_assert!(primary.core.flags.is_failover_in_progress());
    debug_assert!(primary.get_failover_state() <= FailoverState::WaitPromotion);

    for entry in primary.replicas.iter() {
        entry.value().core.flags.clear_reconf();
    }

    primary.core.flags.set_failover_in_progress(false);
    primary.core.flags.set_force_failover(false);
    primary.set_failover_state(FailoverState::None);

    let promoted = primary.promoted_replica.write().take();
    if let Some(promoted) = promoted {
        scripts::call_client_reconfig(
            state,
            primary,
            "leader",
            "abort",
            promoted.core.addr(),
            primary.core.addr(),
        );
        promoted.core.flags.set_promoted(false);
    }
}

/// UPDATE_CONFIG: swap the primary's address to the promoted replica,
/// re-seeding the old address as a replica.
pub fn switch_to_promoted(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    let target = match primary.promoted_replica.read().as_ref() {
        Some(promoted) => promoted.core.addr(),
        None => primary.core.addr(),
    };
    let old = primary.core.addr();

    events::emit(
        state,
        EventLevel::Warning,
        "+switch-master",
        &format!(
            "{} {} {} {} {}",
            primary.core.name,
            old.ip_string(),
            old.port,
            target.ip_string(),
            target.port
        ),
        Some(primary),
    );

    if let Err(e) =
        reset_and_change_address(state, primary, &target.ip_string(), target.port)
    {
        log::warn!(
            "Can't switch master {} to {}: {}",
            primary.core.name,
            target,
            e
        );
    }
}

/// Drop runtime state: children, links, votes, and the failover machine.
/// Identity flags, configuration, and the config epoch survive.
pub fn reset_primary(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>, flags: u32) {
    primary.replicas.clear();
    if flags & RESET_NO_PEERS == 0 {
        primary.peers.clear();
    }
    link::kill_link(&primary.core, LinkType::Command);
    link::kill_link(&primary.core, LinkType::PubSub);
    primary.core.flags.reset_runtime();

    *primary.leader.write() = None;
    primary.set_failover_state(FailoverState::None);
    primary.failover_state_change_time.store(0, Ordering::Relaxed);
    primary.failover_start_time.store(0, Ordering::Relaxed);
    *primary.promoted_replica.write() = None;
    *primary.core.runid.write() = None;

    let now = mstime();
    primary.core.last_avail_time.store(now, Ordering::Relaxed);
    primary.core.last_pong_time.store(now, Ordering::Relaxed);

    if flags & RESET_GENERATE_EVENT != 0 {
        events::emit(
            state,
            EventLevel::Warning,
            "+reset-master",
            &events::primary_body(primary),
            Some(primary),
        );
    }
}

/// Reset the primary and install a new address, keeping name and peers.
/// Known replicas are re-seeded, including the old primary address so the
/// demoted node is re-discovered and reconfigured.
pub fn reset_and_change_address(
    state: &Arc<SupervisorState>,
    primary: &Arc<PrimaryInstance>,
    ip: &str,
    port: u16,
) -> Result<()> {
    let new_addr = InstanceAddr::resolve(ip, port as i64)?;
    let old_addr = primary.core.addr();

    let mut keep: Vec<InstanceAddr> = primary
        .replicas
        .iter()
        .map(|e| e.value().core.addr())
        .filter(|addr| *addr != new_addr)
        .collect();
    if new_addr != old_addr {
        keep.push(old_addr);
    }

    reset_primary(state, primary, RESET_NO_PEERS);
    *primary.core.addr.write() = new_addr;
    primary.core.o_down_since.store(0, Ordering::Relaxed);
    primary.core.s_down_since.store(0, Ordering::Relaxed);

    for addr in keep {
        if let Ok(replica) = primary.add_replica(addr) {
            events::emit(
                state,
                EventLevel::Notice,
                "+slave",
                &events::replica_body(&replica, primary),
                Some(primary),
            );
        }
    }

    Ok(())
}

/// Pick the replica to promote: reachable, recently seen alive and
/// refreshed, allowed by priority, and not lagging a dead primary for too
/// long. Lowest priority wins, then the smallest run ID.
pub fn select_replica(primary: &Arc<PrimaryInstance>) -> Option<Arc<ReplicaInstance>> {
    let now = mstime();

    let mut max_link_down = primary.core.down_after() * 10;
    if primary.core.flags.is_sdown() {
        max_link_down +=
            now.saturating_sub(primary.core.s_down_since.load(Ordering::Relaxed));
    }

    // Info for replicas of a healthy primary flows at the slow period, so
    // allow for the extra staleness.
    let mut max_info_age = INFO_VALIDITY_TIME_MS;
    if !primary.core.flags.is_sdown() {
        max_info_age += INFO_PERIOD_MS;
    }

    let mut candidates: Vec<Arc<ReplicaInstance>> = Vec::new();
    for entry in primary.replicas.iter() {
        let replica = entry.value();
        let flags = &replica.core.flags;

        if flags.is_sdown() || flags.is_odown() || flags.is_disconnected() {
            continue;
        }
        if now.saturating_sub(replica.core.last_avail_time.load(Ordering::Relaxed))
            > INFO_VALIDITY_TIME_MS
        {
            continue;
        }
        if replica.priority.load(Ordering::Relaxed) == 0 {
            continue;
        }
        let refreshed = replica.core.info_refresh.load(Ordering::Relaxed);
        if refreshed == 0 || now.saturating_sub(refreshed) > max_info_age {
            continue;
        }
        if replica.primary_link_down_time.load(Ordering::Relaxed) > max_link_down {
            continue;
        }
        candidates.push(replica.clone());
    }

    candidates.sort_by(|a, b| {
        let pa = a.priority.load(Ordering::Relaxed);
        let pb = b.priority.load(Ordering::Relaxed);
        if pa != pb {
            return pa.cmp(&pb);
        }
        // A missing run ID sorts after any known one.
        match (a.core.runid(), b.core.runid()) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (Some(ra), Some(rb)) => ra.cmp(&rb),
        }
    });

    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::link::attach_test_cmd_link;
    use crate::supervisor::state::test_util::*;
    use std::sync::atomic::Ordering;

    /// A replica that passes every selection filter.
    fn make_candidate(
        primary: &Arc<PrimaryInstance>,
        ip: &str,
        port: u16,
        priority: u32,
        runid: &str,
    ) -> Arc<ReplicaInstance> {
        let replica = test_replica(primary, ip, port);
        replica.core.flags.set_disconnected(false);
        replica.core.info_refresh.store(mstime(), Ordering::Relaxed);
        replica.priority.store(priority, Ordering::Relaxed);
        *replica.core.runid.write() = Some(runid.to_string());
        replica
    }

    #[test]
    fn test_selection_priority_then_runid() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        make_candidate(&primary, "10.0.0.2", 6379, 100, "bbbb");
        make_candidate(&primary, "10.0.0.3", 6379, 100, "aaaa");
        make_candidate(&primary, "10.0.0.4", 6379, 50, "zzzz");

        // Lower priority wins outright.
        let selected = select_replica(&primary).unwrap();
        assert_eq!(selected.core.name, "10.0.0.4:6379");

        // Equal priorities: the smaller run ID.
        primary.replicas.remove("10.0.0.4:6379");
        let selected = select_replica(&primary).unwrap();
        assert_eq!(selected.core.runid().as_deref(), Some("aaaa"));
    }

    #[test]
    fn test_selection_filters() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");

        // Zero priority is never promoted.
        make_candidate(&primary, "10.0.0.2", 6379, 0, "aaaa");
        assert!(select_replica(&primary).is_none());

        // S_DOWN disqualifies.
        let r = make_candidate(&primary, "10.0.0.3", 6379, 100, "bbbb");
        r.core.flags.set_sdown(true);
        assert!(select_replica(&primary).is_none());

        // Disconnected disqualifies.
        let r = make_candidate(&primary, "10.0.0.4", 6379, 100, "cccc");
        r.core.flags.set_disconnected(true);
        assert!(select_replica(&primary).is_none());

        // Stale info disqualifies.
        let r = make_candidate(&primary, "10.0.0.5", 6379, 100, "dddd");
        r.core
            .info_refresh
            .store(mstime() - 60_000, Ordering::Relaxed);
        assert!(select_replica(&primary).is_none());

        // Replication link down for too long disqualifies.
        let r = make_candidate(&primary, "10.0.0.6", 6379, 100, "eeee");
        r.primary_link_down_time
            .store(primary.core.down_after() * 10 + 60_000, Ordering::Relaxed);
        assert!(select_replica(&primary).is_none());

        let _ok = make_candidate(&primary, "10.0.0.7", 6379, 100, "ffff");
        assert!(select_replica(&primary).is_some());
    }

    #[test]
    fn test_start_failover_if_needed_gates() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");

        // Not O_DOWN: no failover.
        assert!(!start_failover_if_needed(&state, &primary));

        primary.core.flags.set_odown(true);
        assert!(start_failover_if_needed(&state, &primary));
        assert_eq!(primary.get_failover_state(), FailoverState::WaitStart);
        assert_eq!(state.epoch(), 1);
        assert_eq!(primary.failover_epoch.load(Ordering::Relaxed), 1);

        // Already in progress.
        assert!(!start_failover_if_needed(&state, &primary));

        // Too soon after the previous attempt.
        abort_failover(&state, &primary);
        assert!(!start_failover_if_needed(&state, &primary));
    }

    #[test]
    fn test_wait_start_elects_self_with_quorum_one() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.config.write().quorum = 1;
        primary.core.flags.set_odown(true);

        start_failover(&state, &primary);
        failover_state_machine(&state, &primary);

        assert_eq!(primary.get_failover_state(), FailoverState::SelectSlave);
    }

    #[test]
    fn test_wait_start_aborts_when_not_elected() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.core.flags.set_odown(true);
        // A peer exists, so a single self-vote is no majority of 2.
        test_peer(&primary, "10.0.0.5", 26379, "aaaa");

        start_failover(&state, &primary);

        // Still inside the election window: stays put.
        failover_state_machine(&state, &primary);
        assert_eq!(primary.get_failover_state(), FailoverState::WaitStart);

        // Push the start into the past, beyond the election timeout.
        primary
            .failover_start_time
            .store(mstime() - ELECTION_TIMEOUT_MS - 1000, Ordering::Relaxed);
        failover_state_machine(&state, &primary);
        assert_eq!(primary.get_failover_state(), FailoverState::None);
        assert!(!primary.core.flags.is_failover_in_progress());
    }

    #[test]
    fn test_select_slave_aborts_without_candidate() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.config.write().quorum = 1;
        primary.core.flags.set_odown(true);

        start_failover(&state, &primary);
        failover_state_machine(&state, &primary); // WaitStart -> SelectSlave
        failover_state_machine(&state, &primary); // no candidate -> abort

        assert_eq!(primary.get_failover_state(), FailoverState::None);
        assert!(!primary.core.flags.is_failover_in_progress());
    }

    #[test]
    fn test_promotion_path_sends_slaveof_noone() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.config.write().quorum = 1;
        primary.core.flags.set_odown(true);
        let replica = make_candidate(&primary, "10.0.0.2", 6379, 100, "aaaa");
        let mut rx = attach_test_cmd_link(&replica.core);

        start_failover(&state, &primary);
        failover_state_machine(&state, &primary); // -> SelectSlave
        failover_state_machine(&state, &primary); // -> SendSlaveofNoone
        assert!(replica.core.flags.is_promoted());

        failover_state_machine(&state, &primary); // -> WaitPromotion
        assert_eq!(primary.get_failover_state(), FailoverState::WaitPromotion);

        let (op, bytes) = rx.try_recv().unwrap();
        assert_eq!(op, crate::supervisor::link::OpKind::ReplicaOf);
        let text = String::from_utf8_lossy(&bytes).to_string();
        assert!(text.contains("SLAVEOF"));
        assert!(text.contains("NO"));
        // Followed by the best-effort persistence command.
        let (op, _) = rx.try_recv().unwrap();
        assert_eq!(op, crate::supervisor::link::OpKind::ConfigRewrite);
    }

    #[test]
    fn test_disconnected_candidate_retries_then_aborts() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.config.write().quorum = 1;
        primary.config.write().failover_timeout = 5_000;
        primary.core.flags.set_odown(true);
        let replica = make_candidate(&primary, "10.0.0.2", 6379, 100, "aaaa");

        start_failover(&state, &primary);
        failover_state_machine(&state, &primary);
        failover_state_machine(&state, &primary);
        assert_eq!(
            primary.get_failover_state(),
            FailoverState::SendSlaveofNoone
        );

        // Candidate drops off right after selection: state holds.
        replica.core.flags.set_disconnected(true);
        failover_state_machine(&state, &primary);
        assert_eq!(
            primary.get_failover_state(),
            FailoverState::SendSlaveofNoone
        );

        // Beyond the failover timeout the attempt is abandoned.
        primary
            .failover_state_change_time
            .store(mstime() - 6_000, Ordering::Relaxed);
        failover_state_machine(&state, &primary);
        assert_eq!(primary.get_failover_state(), FailoverState::None);
        assert!(!replica.core.flags.is_promoted());
    }

    #[test]
    fn test_reconf_respects_parallel_syncs() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let promoted = make_candidate(&primary, "10.0.0.2", 6379, 100, "aaaa");
        let r1 = make_candidate(&primary, "10.0.0.3", 6379, 100, "bbbb");
        let r2 = make_candidate(&primary, "10.0.0.4", 6379, 100, "cccc");
        let _rx1 = attach_test_cmd_link(&r1.core);
        let _rx2 = attach_test_cmd_link(&r2.core);

        promoted.core.flags.set_promoted(true);
        *primary.promoted_replica.write() = Some(promoted);
        primary.core.flags.set_failover_in_progress(true);
        primary.set_failover_state(FailoverState::ReconfSlaves);

        failover_state_machine(&state, &primary);

        let sent = [&r1, &r2]
            .iter()
            .filter(|r| r.core.flags.is_reconf_sent())
            .count();
        assert_eq!(sent, 1);

        // The slot frees once the first replica reports done.
        if r1.core.flags.is_reconf_sent() {
            r1.core.flags.set_reconf_sent(false);
            r1.core.flags.set_reconf_done(true);
        } else {
            r2.core.flags.set_reconf_sent(false);
            r2.core.flags.set_reconf_done(true);
        }
        failover_state_machine(&state, &primary);
        let sent = [&r1, &r2]
            .iter()
            .filter(|r| r.core.flags.is_reconf_sent())
            .count();
        assert_eq!(sent, 1);
    }

    #[test]
    fn test_reconf_end_moves_to_update_config() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let promoted = make_candidate(&primary, "10.0.0.2", 6379, 100, "aaaa");
        let other = make_candidate(&primary, "10.0.0.3", 6379, 100, "bbbb");

        promoted.core.flags.set_promoted(true);
        other.core.flags.set_reconf_done(true);
        *primary.promoted_replica.write() = Some(promoted);
        primary.core.flags.set_failover_in_progress(true);
        primary.set_failover_state(FailoverState::ReconfSlaves);

        failover_state_machine(&state, &primary);
        assert_eq!(primary.get_failover_state(), FailoverState::UpdateConfig);
    }

    #[test]
    fn test_reconf_timeout_best_effort() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.config.write().failover_timeout = 1_000;
        let promoted = make_candidate(&primary, "10.0.0.2", 6379, 100, "aaaa");
        let straggler = make_candidate(&primary, "10.0.0.3", 6379, 100, "bbbb");
        let mut rx = attach_test_cmd_link(&straggler.core);

        promoted.core.flags.set_promoted(true);
        *primary.promoted_replica.write() = Some(promoted);
        primary.core.flags.set_failover_in_progress(true);
        primary.set_failover_state(FailoverState::ReconfSlaves);
        primary.config.write().parallel_syncs = 0; // starve normal sends
        primary
            .failover_state_change_time
            .store(mstime() - 2_000, Ordering::Relaxed);

        failover_state_machine(&state, &primary);

        assert_eq!(primary.get_failover_state(), FailoverState::UpdateConfig);
        assert!(straggler.core.flags.is_reconf_sent());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_abort_invokes_reconfig_script_and_clears_promotion() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.config.write().client_reconfig_script = Some("/bin/true".into());
        let replica = make_candidate(&primary, "10.0.0.2", 6379, 100, "aaaa");

        primary.core.flags.set_failover_in_progress(true);
        primary.set_failover_state(FailoverState::WaitPromotion);
        replica.core.flags.set_promoted(true);
        replica.core.flags.set_reconf_sent(true);
        *primary.promoted_replica.write() = Some(replica.clone());

        abort_failover(&state, &primary);

        assert!(!replica.core.flags.is_promoted());
        assert!(!replica.core.flags.is_reconf_sent());
        assert!(primary.promoted_replica.read().is_none());

        // abort: from = promoted, to = current primary.
        let jobs = state.scripts.snapshot();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].argv[3], "abort");
        assert_eq!(jobs[0].argv[4], "10.0.0.2");
        assert_eq!(jobs[0].argv[6], "10.0.0.1");
    }

    #[test]
    fn test_switch_to_promoted_swaps_address() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let promoted = make_candidate(&primary, "10.0.0.2", 6379, 100, "aaaa");
        let _other = make_candidate(&primary, "10.0.0.3", 6379, 100, "bbbb");
        let peer = test_peer(&primary, "10.0.0.5", 26379, "cccc");

        promoted.core.flags.set_promoted(true);
        *primary.promoted_replica.write() = Some(promoted);
        primary.core.flags.set_failover_in_progress(true);
        primary.set_failover_state(FailoverState::UpdateConfig);

        switch_to_promoted(&state, &primary);

        assert_eq!(primary.core.addr().to_name(), "10.0.0.2:6379");
        // Old primary address re-seeded as replica, promoted one removed.
        assert!(primary.replicas.contains_key("10.0.0.1:6379"));
        assert!(primary.replicas.contains_key("10.0.0.3:6379"));
        assert!(!primary.replicas.contains_key("10.0.0.2:6379"));
        // Peers survive the switch.
        assert!(primary
            .peers
            .contains_key(&peer.core.addr().to_name()));
        assert_eq!(primary.get_failover_state(), FailoverState::None);
        assert!(!primary.core.flags.is_failover_in_progress());
    }
}
