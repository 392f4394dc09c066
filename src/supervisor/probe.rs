//! Probe loop.
//!
//! Per tick and per connected instance, at most one of: an info request
//! when the snapshot is stale, a ping when replies are stale, or a hello
//! publish on the shared channel. One in-flight command per operation
//! kind, bounded total pending commands per link.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::resp::RespValue;

use super::link::{self, OpKind};
use super::state::{mstime, InstanceRef, PrimaryInstance, SupervisorState};
use super::{
    HELLO_CHANNEL, INFO_PERIOD_DOWN_MS, INFO_PERIOD_MS, MAX_PENDING_COMMANDS, PING_PERIOD_MS,
    PUBLISH_PERIOD_MS,
};

/// What the probe decided to send this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    None,
    Info,
    Ping,
    Hello,
}

/// Pure decision: info beats ping beats hello, each gated by its period.
pub fn decide_probe(
    is_peer: bool,
    parent_down: bool,
    info_refresh: u64,
    last_pong_time: u64,
    last_pub_time: u64,
    now: u64,
) -> ProbeAction {
    let info_period = if parent_down {
        INFO_PERIOD_DOWN_MS
    } else {
        INFO_PERIOD_MS
    };

    if !is_peer && (info_refresh == 0 || now.saturating_sub(info_refresh) > info_period) {
        ProbeAction::Info
    } else if now.saturating_sub(last_pong_time) > PING_PERIOD_MS {
        ProbeAction::Ping
    } else if !is_peer && now.saturating_sub(last_pub_time) > PUBLISH_PERIOD_MS {
        ProbeAction::Hello
    } else {
        ProbeAction::None
    }
}

pub fn probe_instance(state: &Arc<SupervisorState>, iref: &InstanceRef, now: u64) {
    let core = iref.core();

    if core.flags.is_disconnected() {
        return;
    }
    if core.links.pending() >= MAX_PENDING_COMMANDS {
        return;
    }

    // Replicas of a failing primary are probed for info every second so a
    // promotion performed elsewhere is noticed quickly.
    let parent_down = match iref {
        InstanceRef::Replica { primary, .. } => {
            primary.core.flags.is_odown() || primary.core.flags.is_failover_in_progress()
        }
        _ => false,
    };

    let action = decide_probe(
        core.flags.is_peer(),
        parent_down,
        core.info_refresh.load(Ordering::Relaxed),
        core.last_pong_time.load(Ordering::Relaxed),
        core.last_pub_time.load(Ordering::Relaxed),
        now,
    );

    match action {
        ProbeAction::Info => {
            if !link::has_pending(core, OpKind::Info) {
                link::send_command(core, OpKind::Info, &RespValue::command(&["INFO"]));
            }
        }
        ProbeAction::Ping => {
            if !link::has_pending(core, OpKind::Ping) {
                link::send_command(core, OpKind::Ping, &RespValue::command(&["PING"]));
            }
        }
        ProbeAction::Hello => {
            if !link::has_pending(core, OpKind::HelloPublish) {
                let payload = build_hello_payload(state, iref.primary());
                link::send_command(
                    core,
                    OpKind::HelloPublish,
                    &RespValue::command(&["PUBLISH", HELLO_CHANNEL, &payload]),
                );
            }
        }
        ProbeAction::None => {}
    }
}

/// Nine comma-separated tokens: who we are, and the freshest primary
/// configuration we can vouch for.
pub fn build_hello_payload(state: &SupervisorState, primary: &Arc<PrimaryInstance>) -> String {
    let addr = primary.current_addr();
    format!(
        "{},{},{},{},{},{},{},{},{}",
        state.announce_ip,
        state.announce_port,
        state.myid,
        primary.core.flags.can_failover() as u8,
        state.epoch(),
        primary.core.name,
        addr.ip_string(),
        addr.port,
        primary.config_epoch.load(Ordering::Relaxed),
    )
}

/// Valid replies refresh availability; a -BUSY instance that already looks
/// down gets one SCRIPT KILL so a stuck script cannot hold the node
/// hostage forever.
pub fn handle_ping_reply(iref: &InstanceRef, frame: &RespValue) {
    let core = iref.core();
    let now = mstime();

    if let RespValue::SimpleString(s) | RespValue::Error(s) = frame {
        if s.starts_with(b"PONG") || s.starts_with(b"LOADING") || s.starts_with(b"MASTERDOWN") {
            core.last_avail_time.store(now, Ordering::Relaxed);
        } else if s.starts_with(b"BUSY")
            && core.flags.is_sdown()
            && !core.flags.is_script_kill_sent()
        {
            link::send_command(
                core,
                OpKind::ScriptKill,
                &RespValue::command(&["SCRIPT", "KILL"]),
            );
            core.flags.set_script_kill_sent(true);
        }
    }

    core.last_pong_time.store(now, Ordering::Relaxed);
}

/// A rejected hello publish is retried next tick; only an accepted one
/// refreshes the publish timestamp.
pub fn handle_publish_reply(iref: &InstanceRef, frame: &RespValue) {
    if !matches!(frame, RespValue::Error(_)) {
        iref.core()
            .last_pub_time
            .store(mstime(), Ordering::Relaxed);
    }
}
