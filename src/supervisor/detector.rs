//! Down detector.
//!
//! The subjective half is purely local: an instance that stops producing
//! valid ping replies (or a primary stuck reporting the replica role) is
//! S_DOWN. The objective half is a quorum over peer supervisors polled
//! with the down-probe; enough agreeing peers flip the primary to O_DOWN.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::resp::RespValue;

use super::election;
use super::events::{self, EventLevel};
use super::link::{self, LinkType, OpKind};
use super::state::{
    mstime, InstanceRef, PeerInstance, PrimaryInstance, ReportedRole, SupervisorState,
};
use super::{
    ASK_PERIOD_MS, INFO_PERIOD_MS, INFO_VALIDITY_TIME_MS, MIN_LINK_RECONNECT_PERIOD_MS,
    PUBLISH_PERIOD_MS,
};

/// Update the subjective down state of one instance, proactively killing
/// links that look established but carry no traffic.
pub fn check_subjectively_down(state: &Arc<SupervisorState>, iref: &InstanceRef, now: u64) {
    let core = iref.core();
    let down_after = core.down_after();

    // A command link with a long idle time is not trustworthy: kill it and
    // let the next tick reconnect.
    let cmd_idle = {
        let guard = core.links.cmd.lock();
        guard.is_some()
            && now.saturating_sub(core.links.cmd_conn_time.load(Ordering::Relaxed))
                > MIN_LINK_RECONNECT_PERIOD_MS
            && now.saturating_sub(core.last_pong_time.load(Ordering::Relaxed)) > down_after / 2
    };
    if cmd_idle {
        link::kill_link(core, LinkType::Command);
    }

    let pubsub_idle = {
        let guard = core.links.pubsub.lock();
        guard.is_some()
            && now.saturating_sub(core.links.pubsub_conn_time.load(Ordering::Relaxed))
                > MIN_LINK_RECONNECT_PERIOD_MS
            && now.saturating_sub(core.links.pubsub_last_activity.load(Ordering::Relaxed))
                > PUBLISH_PERIOD_MS * 3
    };
    if pubsub_idle {
        link::kill_link(core, LinkType::PubSub);
    }

    let elapsed = now.saturating_sub(core.last_avail_time.load(Ordering::Relaxed));

    // A primary persistently claiming the replica role is as good as down:
    // it cannot serve writes and somebody else holds the real role.
    let stuck_as_replica = core.flags.is_primary()
        && *core.role_reported.read() == ReportedRole::Replica
        && now.saturating_sub(core.role_reported_time.load(Ordering::Relaxed))
            > down_after + INFO_PERIOD_MS * 2;

    if elapsed > down_after || stuck_as_replica {
        if !core.flags.is_sdown() {
            emit_for(state, iref, EventLevel::Warning, "+sdown");
            core.s_down_since.store(now, Ordering::Relaxed);
            core.flags.set_sdown(true);
        }
    } else if core.flags.is_sdown() {
        emit_for(state, iref, EventLevel::Warning, "-sdown");
        core.flags.set_sdown(false);
        core.flags.set_script_kill_sent(false);
    }
}

/// Count PRIMARY_DOWN votes across peers and update O_DOWN.
pub fn check_objectively_down(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>) {
    let mut odown = false;
    let mut quorum_count = 0u32;

    if primary.core.flags.is_sdown() {
        quorum_count = 1; // this supervisor
        for entry in primary.peers.iter() {
            if entry.value().core.flags.is_primary_down() {
                quorum_count += 1;
            }
        }
        if quorum_count >= primary.quorum() {
            odown = true;
        }
    }

    if odown {
        if !primary.core.flags.is_odown() {
            events::emit(
                state,
                EventLevel::Warning,
                "+odown",
                &format!(
                    "{} #quorum {}/{}",
                    events::primary_body(primary),
                    quorum_count,
                    primary.quorum()
                ),
                Some(primary),
            );
            primary.core.flags.set_odown(true);
            primary
                .core
                .o_down_since
                .store(mstime(), Ordering::Relaxed);
        }
    } else if primary.core.flags.is_odown() {
        events::emit(
            state,
            EventLevel::Warning,
            "-odown",
            &events::primary_body(primary),
            Some(primary),
        );
        primary.core.flags.set_odown(false);
    }
}

/// Poll peers about a suspect primary, rate limited per peer unless
/// forced. Stale peer opinions decay on the way.
pub fn ask_peers(state: &Arc<SupervisorState>, primary: &Arc<PrimaryInstance>, forced: bool) {
    let now = mstime();

    // With the quorum already reached, pin our own vote to the current
    // epoch before asking around.
    if primary.core.flags.is_odown() {
        let myid = state.myid.clone();
        election::vote_leader(state, primary, state.epoch(), &myid);
    }

    let addr = primary.core.addr();
    for entry in primary.peers.iter() {
        let peer = entry.value();
        let last_reply = peer.last_primary_down_reply_time.load(Ordering::Relaxed);

        if now.saturating_sub(last_reply) > INFO_VALIDITY_TIME_MS {
            peer.core.flags.set_primary_down(false);
            *peer.leader.write() = None;
        }

        if !primary.core.flags.is_sdown() {
            continue;
        }
        if peer.core.flags.is_disconnected() {
            continue;
        }
        if !forced && now.saturating_sub(last_reply) < ASK_PERIOD_MS {
            continue;
        }

        link::send_command(
            &peer.core,
            OpKind::IsPrimaryDown,
            &RespValue::command(&[
                "IS-PRIMARY-DOWN-BY-ADDR",
                &addr.ip_string(),
                &addr.port.to_string(),
                &state.epoch().to_string(),
                &state.myid,
            ]),
        );
    }
}

/// Apply a peer's 3-tuple reply: down opinion, vote, vote epoch.
pub fn handle_is_primary_down_reply(peer: &Arc<PeerInstance>, frame: &RespValue) {
    let RespValue::Array(items) = frame else {
        return;
    };
    let (Some(RespValue::Integer(isdown)), Some(leader), Some(RespValue::Integer(epoch))) =
        (items.first(), items.get(1), items.get(2))
    else {
        return;
    };
    let Some(leader_bytes) = leader.as_bytes() else {
        return;
    };

    peer.last_primary_down_reply_time
        .store(mstime(), Ordering::Relaxed);
    peer.core.flags.set_primary_down(*isdown == 1);

    let vote = std::str::from_utf8(leader_bytes).unwrap_or("?");
    *peer.leader.write() = if vote == "?" {
        None
    } else {
        Some(vote.to_string())
    };
    peer.leader_epoch.store(*epoch as u64, Ordering::Relaxed);
}

fn emit_for(state: &Arc<SupervisorState>, iref: &InstanceRef, level: EventLevel, kind: &str) {
    let body = match iref {
        InstanceRef::Primary(p) => events::primary_body(p),
        InstanceRef::Replica { primary, replica } => events::replica_body(replica, primary),
        InstanceRef::Peer { primary, peer } => events::peer_body(peer, primary),
    };
    events::emit(state, level, kind, &body, Some(iref.primary()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::state::test_util::*;

    #[test]
    fn test_sdown_after_silence() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let iref = InstanceRef::Primary(primary.clone());
        let now = mstime();

        // Fresh reply: up.
        check_subjectively_down(&state, &iref, now);
        assert!(!primary.core.flags.is_sdown());

        // Silence beyond down-after: subjectively down.
        primary
            .core
            .last_avail_time
            .store(now - 31_000, Ordering::Relaxed);
        check_subjectively_down(&state, &iref, now);
        assert!(primary.core.flags.is_sdown());
        assert!(primary.core.s_down_since.load(Ordering::Relaxed) > 0);

        // A reply clears it, along with the script-kill latch.
        primary.core.flags.set_script_kill_sent(true);
        primary.core.last_avail_time.store(now, Ordering::Relaxed);
        check_subjectively_down(&state, &iref, now);
        assert!(!primary.core.flags.is_sdown());
        assert!(!primary.core.flags.is_script_kill_sent());
    }

    #[test]
    fn test_primary_stuck_as_replica_is_sdown() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let iref = InstanceRef::Primary(primary.clone());
        let now = mstime();

        *primary.core.role_reported.write() = ReportedRole::Replica;
        primary
            .core
            .role_reported_time
            .store(now - 60_000, Ordering::Relaxed);

        check_subjectively_down(&state, &iref, now);
        assert!(primary.core.flags.is_sdown());
    }

    #[test]
    fn test_odown_needs_sdown_and_quorum() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let peer1 = test_peer(&primary, "10.0.0.5", 26379, "aaaa");
        let _peer2 = test_peer(&primary, "10.0.0.6", 26379, "bbbb");

        // No S_DOWN: no O_DOWN even with agreeing peers.
        peer1.core.flags.set_primary_down(true);
        check_objectively_down(&state, &primary);
        assert!(!primary.core.flags.is_odown());

        // S_DOWN plus one agreeing peer meets quorum 2.
        primary.core.flags.set_sdown(true);
        check_objectively_down(&state, &primary);
        assert!(primary.core.flags.is_odown());

        // O_DOWN implies S_DOWN while set.
        assert!(primary.core.flags.is_sdown());

        // Vote lost: O_DOWN clears.
        peer1.core.flags.set_primary_down(false);
        check_objectively_down(&state, &primary);
        assert!(!primary.core.flags.is_odown());
    }

    #[test]
    fn test_is_primary_down_reply_parsing() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let peer = test_peer(&primary, "10.0.0.5", 26379, "aaaa");

        let frame = RespValue::Array(vec![
            RespValue::Integer(1),
            RespValue::bulk("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef"),
            RespValue::Integer(4),
        ]);
        handle_is_primary_down_reply(&peer, &frame);

        assert!(peer.core.flags.is_primary_down());
        assert_eq!(
            peer.leader.read().as_deref(),
            Some("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef")
        );
        assert_eq!(peer.leader_epoch.load(Ordering::Relaxed), 4);

        // "?" means no vote cast.
        let frame = RespValue::Array(vec![
            RespValue::Integer(0),
            RespValue::bulk("?"),
            RespValue::Integer(0),
        ]);
        handle_is_primary_down_reply(&peer, &frame);
        assert!(!peer.core.flags.is_primary_down());
        assert!(peer.leader.read().is_none());
    }

    #[test]
    fn test_stale_peer_opinion_decays() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let peer = test_peer(&primary, "10.0.0.5", 26379, "aaaa");

        peer.core.flags.set_primary_down(true);
        *peer.leader.write() = Some("deadbeef".to_string());
        peer.last_primary_down_reply_time
            .store(mstime() - INFO_VALIDITY_TIME_MS - 1000, Ordering::Relaxed);

        ask_peers(&state, &primary, false);
        assert!(!peer.core.flags.is_primary_down());
        assert!(peer.leader.read().is_none());
    }
}
