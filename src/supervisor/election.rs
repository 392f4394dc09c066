//! Epoch-numbered leader election.
//!
//! One vote per epoch per primary: the first requester in a fresh epoch
//! gets it, later requesters are told who already has it. The winner must
//! hold both an absolute majority of the counted voters and at least the
//! configured quorum.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::events::{self, EventLevel};
use super::state::{mstime, PrimaryInstance, SupervisorState};

/// Cast or recall our vote for `req_runid` in `req_epoch`.
///
/// Returns the vote currently standing for this primary and its epoch,
/// which may be an older vote when the request was not fresh enough.
pub fn vote_leader(
    state: &Arc<SupervisorState>,
    primary: &Arc<PrimaryInstance>,
    req_epoch: u64,
    req_runid: &str,
) -> (Option<String>, u64) {
    if req_epoch > state.epoch() {
        state.set_epoch(req_epoch);
        events::emit(
            state,
            EventLevel::Warning,
            "+new-epoch",
            &req_epoch.to_string(),
            Some(primary),
        );
    }

    if primary.leader_epoch.load(Ordering::Relaxed) < req_epoch && state.epoch() <= req_epoch {
        *primary.leader.write() = Some(req_runid.to_string());
        primary.leader_epoch.store(state.epoch(), Ordering::Relaxed);
        events::emit(
            state,
            EventLevel::Warning,
            "+vote-for-leader",
            &format!("{} {}", req_runid, primary.leader_epoch.load(Ordering::Relaxed)),
            Some(primary),
        );
        // Push our own next failover attempt away by a random amount so
        // competing supervisors do not split the vote forever.
        primary
            .failover_start_time
            .store(mstime() + state.jitter(2000), Ordering::Relaxed);
    }

    (
        primary.leader.read().clone(),
        primary.leader_epoch.load(Ordering::Relaxed),
    )
}

/// Compute the election winner for `epoch` from our vote plus every peer
/// vote cast in the current epoch. None without majority and quorum.
pub fn get_leader(
    state: &Arc<SupervisorState>,
    primary: &Arc<PrimaryInstance>,
    epoch: u64,
) -> Option<String> {
    debug_assert!(
        primary.core.flags.is_odown() || primary.core.flags.is_failover_in_progress()
    );

    let mut counters: HashMap<String, u32> = HashMap::new();
    let mut voters = 0u32;

    let myid = state.myid.clone();
    let (myvote, my_epoch) = vote_leader(state, primary, epoch, &myid);
    if let Some(vote) = myvote {
        if my_epoch == epoch {
            *counters.entry(vote).or_insert(0) += 1;
            voters += 1;
        }
    }

    for entry in primary.peers.iter() {
        let peer = entry.value();
        let vote = peer.leader.read().clone();
        let Some(vote) = vote else { continue };
        if peer.leader_epoch.load(Ordering::Relaxed) != state.epoch() {
            continue;
        }
        *counters.entry(vote).or_insert(0) += 1;
        voters += 1;
    }

    // Ties resolve to the smaller run ID so the outcome is stable.
    let mut winner: Option<(&String, u32)> = None;
    for (runid, votes) in counters.iter() {
        match winner {
            Some((best, best_votes))
                if *votes < best_votes || (*votes == best_votes && runid >= best) => {}
            _ => winner = Some((runid, *votes)),
        }
    }

    let voters_quorum = voters / 2 + 1;
    match winner {
        Some((runid, votes)) if votes >= voters_quorum && votes >= primary.quorum() => {
            Some(runid.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::state::test_util::*;

    #[test]
    fn test_single_vote_per_epoch() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");

        let (vote, epoch) = vote_leader(&state, &primary, 1, "candidate-a");
        assert_eq!(vote.as_deref(), Some("candidate-a"));
        assert_eq!(epoch, 1);

        // Same epoch, different candidate: previous vote stands.
        let (vote, epoch) = vote_leader(&state, &primary, 1, "candidate-b");
        assert_eq!(vote.as_deref(), Some("candidate-a"));
        assert_eq!(epoch, 1);

        // Fresh epoch: vote moves.
        let (vote, epoch) = vote_leader(&state, &primary, 2, "candidate-b");
        assert_eq!(vote.as_deref(), Some("candidate-b"));
        assert_eq!(epoch, 2);
    }

    #[test]
    fn test_vote_adopts_epoch() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");

        vote_leader(&state, &primary, 7, "candidate-a");
        assert_eq!(state.epoch(), 7);
    }

    #[test]
    fn test_vote_schedules_desync_delay() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let before = mstime();

        vote_leader(&state, &primary, 1, "candidate-a");
        let start = primary.failover_start_time.load(Ordering::Relaxed);
        assert!(start >= before);
        assert!(start < before + 2100);
    }

    #[test]
    fn test_get_leader_majority_and_quorum() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.core.flags.set_odown(true);
        state.set_epoch(1);

        let peer1 = test_peer(&primary, "10.0.0.5", 26379, "aaaa");
        let peer2 = test_peer(&primary, "10.0.0.6", 26379, "bbbb");

        // Both peers voted for us in epoch 1: 3/3 votes, quorum 2 met.
        *peer1.leader.write() = Some(state.myid.clone());
        peer1.leader_epoch.store(1, Ordering::Relaxed);
        *peer2.leader.write() = Some(state.myid.clone());
        peer2.leader_epoch.store(1, Ordering::Relaxed);

        let winner = get_leader(&state, &primary, 1).unwrap();
        assert_eq!(winner, state.myid);
    }

    #[test]
    fn test_get_leader_split_vote_fails() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.core.flags.set_odown(true);
        state.set_epoch(1);

        // Our self-vote goes to us; both peers voted elsewhere. Two votes
        // for "other" out of three voters: majority but below... quorum is
        // 2, and 2 >= 2, so "other" wins only with a real majority.
        let peer1 = test_peer(&primary, "10.0.0.5", 26379, "aaaa");
        let peer2 = test_peer(&primary, "10.0.0.6", 26379, "bbbb");
        *peer1.leader.write() = Some("other-runid".to_string());
        peer1.leader_epoch.store(1, Ordering::Relaxed);
        *peer2.leader.write() = Some("other-runid".to_string());
        peer2.leader_epoch.store(1, Ordering::Relaxed);

        let winner = get_leader(&state, &primary, 1);
        assert_eq!(winner.as_deref(), Some("other-runid"));
    }

    #[test]
    fn test_get_leader_no_winner_below_quorum() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.core.flags.set_odown(true);
        state.set_epoch(1);

        // Only our own vote: majority of one voter, but quorum is 2.
        let winner = get_leader(&state, &primary, 1);
        assert!(winner.is_none());
    }

    #[test]
    fn test_get_leader_ignores_stale_epoch_votes() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.core.flags.set_odown(true);
        state.set_epoch(2);

        let peer1 = test_peer(&primary, "10.0.0.5", 26379, "aaaa");
        *peer1.leader.write() = Some(state.myid.clone());
        peer1.leader_epoch.store(1, Ordering::Relaxed); // stale

        let winner = get_leader(&state, &primary, 2);
        assert!(winner.is_none());
    }
}
