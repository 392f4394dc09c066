//! Hello ingestor.
//!
//! Peer supervisors announce themselves and the freshest primary
//! configuration they know on the shared hello channel. Receiving a hello
//! registers the peer (deduplicating aggressively on restarts and
//! topology changes) and may pull us forward to a newer epoch or a newer
//! primary address.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::addr::InstanceAddr;
use super::events::{self, EventLevel};
use super::failover;
use super::state::{mstime, PrimaryInstance, SupervisorState};

/// Parsed hello payload, nine comma-separated tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMsg {
    pub ip: String,
    pub port: u16,
    pub runid: String,
    pub can_failover: bool,
    pub current_epoch: u64,
    pub primary_name: String,
    pub primary_ip: String,
    pub primary_port: u16,
    pub primary_config_epoch: u64,
}

pub fn parse_hello(payload: &str) -> Option<HelloMsg> {
    let tokens: Vec<&str> = payload.split(',').collect();
    if tokens.len() != 9 {
        return None;
    }
    Some(HelloMsg {
        ip: tokens[0].to_string(),
        port: tokens[1].parse().ok()?,
        runid: tokens[2].to_string(),
        can_failover: tokens[3] == "1",
        current_epoch: tokens[4].parse().ok()?,
        primary_name: tokens[5].to_string(),
        primary_ip: tokens[6].to_string(),
        primary_port: tokens[7].parse().ok()?,
        primary_config_epoch: tokens[8].parse().ok()?,
    })
}

/// Process one hello received over the pub/sub link of `link_primary` or
/// one of its replicas.
pub fn ingest_hello(state: &Arc<SupervisorState>, link_primary: &Arc<PrimaryInstance>, payload: &[u8]) {
    let Ok(text) = std::str::from_utf8(payload) else {
        return;
    };

    // Our own announcements come back on the channel as well.
    if text.contains(&state.myid) {
        return;
    }

    let Some(msg) = parse_hello(text) else {
        return;
    };

    let Ok(peer_addr) = InstanceAddr::resolve(&msg.ip, msg.port as i64) else {
        return;
    };

    let peer = match link_primary.find_peer(&peer_addr, &msg.runid) {
        Some(peer) => peer,
        None => {
            // A restarted supervisor keeps its address but changes run ID;
            // an address change keeps the run ID. Both leave a stale entry
            // that must not keep voting.
            let removed = link_primary.remove_matching_peers(&peer_addr, &msg.runid);
            if removed > 0 {
                events::emit(
                    state,
                    EventLevel::Notice,
                    "-dup-sentinel",
                    &format!(
                        "{} #duplicate of {} or {}",
                        events::primary_body(link_primary),
                        peer_addr,
                        msg.runid
                    ),
                    Some(link_primary),
                );
            }

            match link_primary.add_peer(peer_addr, msg.runid.clone()) {
                Ok(peer) => {
                    events::emit(
                        state,
                        EventLevel::Notice,
                        "+sentinel",
                        &events::peer_body(&peer, link_primary),
                        Some(link_primary),
                    );
                    peer
                }
                Err(_) => return,
            }
        }
    };

    // Adopt a newer cluster epoch.
    if msg.current_epoch > state.epoch() {
        state.set_epoch(msg.current_epoch);
        events::emit(
            state,
            EventLevel::Warning,
            "+new-epoch",
            &msg.current_epoch.to_string(),
            Some(link_primary),
        );
    }

    // Adopt a newer primary configuration for the named primary, wherever
    // it is monitored from.
    if let Some(msg_primary) = state.get_primary(&msg.primary_name) {
        if msg_primary.config_epoch.load(Ordering::Relaxed) < msg.primary_config_epoch {
            msg_primary
                .config_epoch
                .store(msg.primary_config_epoch, Ordering::SeqCst);

            let known = msg_primary.core.addr();
            let differs =
                known.ip_string() != msg.primary_ip || known.port != msg.primary_port;
            if differs {
                events::emit(
                    state,
                    EventLevel::Warning,
                    "+switch-master",
                    &format!(
                        "{} {} {} {} {}",
                        msg_primary.core.name,
                        known.ip_string(),
                        known.port,
                        msg.primary_ip,
                        msg.primary_port
                    ),
                    Some(&msg_primary),
                );
                if let Err(e) = failover::reset_and_change_address(
                    state,
                    &msg_primary,
                    &msg.primary_ip,
                    msg.primary_port,
                ) {
                    log::warn!(
                        "Can't switch master {} to {}:{}: {}",
                        msg_primary.core.name,
                        msg.primary_ip,
                        msg.primary_port,
                        e
                    );
                }
            }
        }
    }

    peer.last_hello_time.store(mstime(), Ordering::Relaxed);
    peer.core.flags.set_can_failover(msg.can_failover);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::state::test_util::*;
    use std::sync::atomic::Ordering;

    fn hello_of(runid: &str, epoch: u64, cfg_epoch: u64) -> String {
        format!(
            "10.0.0.5,26379,{},1,{},mymaster,10.0.0.1,6379,{}",
            runid, epoch, cfg_epoch
        )
    }

    #[test]
    fn test_parse_hello_tokens() {
        let msg = parse_hello("10.0.0.5,26379,abcd,1,3,mymaster,10.0.0.1,6379,2").unwrap();
        assert_eq!(msg.ip, "10.0.0.5");
        assert_eq!(msg.port, 26379);
        assert_eq!(msg.runid, "abcd");
        assert!(msg.can_failover);
        assert_eq!(msg.current_epoch, 3);
        assert_eq!(msg.primary_name, "mymaster");
        assert_eq!(msg.primary_config_epoch, 2);

        assert!(parse_hello("not,enough,tokens").is_none());
        assert!(parse_hello("a,b,c,d,e,f,g,h,i").is_none());
    }

    #[test]
    fn test_discovers_new_peer() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");

        let hello = hello_of("cafebabe", 0, 0);
        ingest_hello(&state, &primary, hello.as_bytes());

        assert_eq!(primary.peers.len(), 1);
        let peer = primary.peers.get("10.0.0.5:26379").unwrap().clone();
        assert_eq!(peer.core.runid().as_deref(), Some("cafebabe"));
        assert!(peer.core.flags.can_failover());
    }

    #[test]
    fn test_own_hello_ignored() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");

        let hello = format!(
            "10.0.0.5,26379,{},1,0,mymaster,10.0.0.1,6379,0",
            state.myid
        );
        ingest_hello(&state, &primary, hello.as_bytes());
        assert!(primary.peers.is_empty());
    }

    #[test]
    fn test_restart_dedups_by_address() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let mut rx = state.events.subscribe();

        ingest_hello(&state, &primary, hello_of("oldoldold", 0, 0).as_bytes());
        ingest_hello(&state, &primary, hello_of("newnewnew", 0, 0).as_bytes());

        // Same address, new run ID: count unchanged, old entry replaced.
        assert_eq!(primary.peers.len(), 1);
        let peer = primary.peers.get("10.0.0.5:26379").unwrap().clone();
        assert_eq!(peer.core.runid().as_deref(), Some("newnewnew"));

        let mut saw_dup = false;
        while let Ok(event) = rx.try_recv() {
            if event.channel == "-dup-sentinel" {
                saw_dup = true;
            }
        }
        assert!(saw_dup);
    }

    #[test]
    fn test_adopts_newer_epoch() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");

        ingest_hello(&state, &primary, hello_of("cafebabe", 9, 0).as_bytes());
        assert_eq!(state.epoch(), 9);

        // Lower epochs never roll the counter back.
        ingest_hello(&state, &primary, hello_of("cafebabe", 3, 0).as_bytes());
        assert_eq!(state.epoch(), 9);
    }

    #[test]
    fn test_adopts_newer_primary_address() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let _replica = test_replica(&primary, "10.0.0.2", 6380);

        let hello = "10.0.0.5,26379,cafebabe,1,5,mymaster,10.0.0.2,6380,5";
        ingest_hello(&state, &primary, hello.as_bytes());

        assert_eq!(primary.config_epoch.load(Ordering::Relaxed), 5);
        assert_eq!(primary.core.addr().to_name(), "10.0.0.2:6380");
        // The old primary address is retained as a replica to re-discover.
        assert!(primary.replicas.contains_key("10.0.0.1:6379"));
    }

    #[test]
    fn test_same_config_epoch_is_noop() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        primary.config_epoch.store(5, Ordering::SeqCst);

        let hello = "10.0.0.5,26379,cafebabe,1,5,mymaster,10.0.0.9,9999,5";
        ingest_hello(&state, &primary, hello.as_bytes());

        assert_eq!(primary.core.addr().to_name(), "10.0.0.1:6379");
    }

    #[test]
    fn test_adopts_on_ip_change_with_same_port() {
        // The advertised address differs in ip only; it must still be
        // adopted.
        let state = test_state();
        let primary = test_primary(&state, "mymaster");

        let hello = "10.0.0.5,26379,cafebabe,1,5,mymaster,10.0.0.7,6379,5";
        ingest_hello(&state, &primary, hello.as_bytes());

        assert_eq!(primary.core.addr().to_name(), "10.0.0.7:6379");
    }
}
