//! Operator and peer command surface.
//!
//! Flat RESP commands served on the supervisor's own port: the peer
//! down-probe, introspection of the monitored topology, operator reset
//! and forced failover, and the script queue listing.

use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::resp::RespValue;

use super::addr::InstanceAddr;
use super::election;
use super::failover;
use super::state::{
    mstime, PeerInstance, PrimaryInstance, ReplicaInstance, ReportedRole, SupervisorState,
    RESET_GENERATE_EVENT,
};

/// Execute one client command. SUBSCRIBE and QUIT are handled by the
/// connection loop; everything else lands here.
pub fn execute(args: &[Bytes], state: &Arc<SupervisorState>) -> RespValue {
    if args.is_empty() {
        return RespValue::error("ERR empty command");
    }

    let command = String::from_utf8_lossy(&args[0]).to_uppercase();
    let cmd_args = &args[1..];

    match command.as_str() {
        "PING" => RespValue::SimpleString(Bytes::from_static(b"PONG")),
        "IS-PRIMARY-DOWN-BY-ADDR" => is_primary_down_by_addr(cmd_args, state),
        "MASTERS" => masters(state),
        "SLAVES" => slaves(cmd_args, state),
        "SENTINELS" => sentinels(cmd_args, state),
        "GET-MASTER-ADDR-BY-NAME" => get_master_addr(cmd_args, state),
        "RESET" => reset(cmd_args, state),
        "FAILOVER" => failover_cmd(cmd_args, state),
        "PENDING-SCRIPTS" => pending_scripts(state),
        "INFO" => info(cmd_args, state),
        _ => RespValue::error(&format!("ERR unknown command '{}'", command)),
    }
}

/// `IS-PRIMARY-DOWN-BY-ADDR <ip> <port> <current-epoch> <runid>`
///
/// Reply: down-from-my-point-of-view, our vote (or `?`), vote epoch.
/// In tilt the down opinion is always 0; the vote is still recorded.
fn is_primary_down_by_addr(args: &[Bytes], state: &Arc<SupervisorState>) -> RespValue {
    if args.len() != 4 {
        return wrong_args("is-primary-down-by-addr");
    }
    let ip = String::from_utf8_lossy(&args[0]).to_string();
    let Ok(port) = String::from_utf8_lossy(&args[1]).parse::<i64>() else {
        return RespValue::error("ERR invalid port");
    };
    let Ok(req_epoch) = String::from_utf8_lossy(&args[2]).parse::<u64>() else {
        return RespValue::error("ERR invalid epoch");
    };
    let req_runid = String::from_utf8_lossy(&args[3]).to_string();

    let primary = InstanceAddr::resolve(&ip, port)
        .ok()
        .and_then(|addr| state.get_primary_by_addr(&addr));

    let isdown = !state.is_tilt()
        && primary
            .as_ref()
            .map(|p| p.core.flags.is_sdown())
            .unwrap_or(false);

    let (leader, leader_epoch) = match &primary {
        Some(primary) => election::vote_leader(state, primary, req_epoch, &req_runid),
        None => (None, 0),
    };

    RespValue::Array(vec![
        RespValue::Integer(isdown as i64),
        RespValue::bulk(leader.as_deref().unwrap_or("?")),
        RespValue::Integer(leader_epoch as i64),
    ])
}

fn masters(state: &Arc<SupervisorState>) -> RespValue {
    let entries = state
        .primaries
        .iter()
        .map(|e| primary_details(e.value()))
        .collect();
    RespValue::Array(entries)
}

fn slaves(args: &[Bytes], state: &Arc<SupervisorState>) -> RespValue {
    let Some(primary) = lookup(args, state) else {
        return no_such_master();
    };
    let entries = primary
        .replicas
        .iter()
        .map(|e| replica_details(e.value()))
        .collect();
    RespValue::Array(entries)
}

fn sentinels(args: &[Bytes], state: &Arc<SupervisorState>) -> RespValue {
    let Some(primary) = lookup(args, state) else {
        return no_such_master();
    };
    let entries = primary
        .peers
        .iter()
        .map(|e| peer_details(e.value()))
        .collect();
    RespValue::Array(entries)
}

fn get_master_addr(args: &[Bytes], state: &Arc<SupervisorState>) -> RespValue {
    let Some(primary) = lookup(args, state) else {
        return RespValue::NullArray;
    };
    if primary.core.info_refresh.load(Ordering::Relaxed) == 0 {
        return RespValue::error(&crate::error::Error::InsufficientInfo.to_string());
    }
    let addr = primary.current_addr();
    RespValue::Array(vec![
        RespValue::bulk(&addr.ip_string()),
        RespValue::Integer(addr.port as i64),
    ])
}

fn reset(args: &[Bytes], state: &Arc<SupervisorState>) -> RespValue {
    if args.len() != 1 {
        return wrong_args("reset");
    }
    let pattern = String::from_utf8_lossy(&args[0]).to_string();

    let matching: Vec<Arc<PrimaryInstance>> = state
        .primaries
        .iter()
        .filter(|e| glob_match(pattern.as_bytes(), e.key().as_bytes()))
        .map(|e| e.value().clone())
        .collect();

    for primary in &matching {
        failover::reset_primary(state, primary, RESET_GENERATE_EVENT);
    }
    RespValue::Integer(matching.len() as i64)
}

fn failover_cmd(args: &[Bytes], state: &Arc<SupervisorState>) -> RespValue {
    let Some(primary) = lookup(args, state) else {
        return no_such_master();
    };
    match failover::force_failover(state, &primary) {
        Ok(()) => RespValue::ok(),
        Err(e) => RespValue::error(&e.to_string()),
    }
}

fn pending_scripts(state: &Arc<SupervisorState>) -> RespValue {
    let now = mstime();
    let jobs = state
        .scripts
        .snapshot()
        .into_iter()
        .map(|job| {
            let mut fields = vec![
                RespValue::bulk("argv"),
                RespValue::Array(job.argv.iter().map(|a| RespValue::bulk(a)).collect()),
                RespValue::bulk("flags"),
                RespValue::bulk(if job.running { "running" } else { "scheduled" }),
                RespValue::bulk("pid"),
                RespValue::Integer(job.pid as i64),
            ];
            if job.running {
                fields.push(RespValue::bulk("run-time"));
                fields.push(RespValue::Integer(
                    now.saturating_sub(job.start_time) as i64
                ));
            } else {
                fields.push(RespValue::bulk("run-delay"));
                fields.push(RespValue::Integer(
                    job.start_time.saturating_sub(now) as i64
                ));
            }
            fields.push(RespValue::bulk("retry-num"));
            fields.push(RespValue::Integer(job.retry_num as i64));
            RespValue::Array(fields)
        })
        .collect();
    RespValue::Array(jobs)
}

fn info(args: &[Bytes], state: &Arc<SupervisorState>) -> RespValue {
    let section = if args.is_empty() {
        "default".to_string()
    } else {
        String::from_utf8_lossy(&args[0]).to_lowercase()
    };
    let all = section == "default" || section == "all" || section == "everything";

    let mut out = String::new();

    if all || section == "server" {
        out.push_str("# Server\r\n");
        out.push_str("mode:sentinel\r\n");
        out.push_str(&format!("run_id:{}\r\n", state.myid));
        out.push_str(&format!("tcp_port:{}\r\n", state.announce_port));
        out.push_str("\r\n");
    }

    if all || section == "sentinel" {
        out.push_str("# Sentinel\r\n");
        out.push_str(&format!("sentinel_masters:{}\r\n", state.primaries.len()));
        out.push_str(&format!(
            "sentinel_tilt:{}\r\n",
            state.is_tilt() as u8
        ));
        out.push_str(&format!(
            "sentinel_running_scripts:{}\r\n",
            state.scripts.running_count()
        ));
        out.push_str(&format!(
            "sentinel_scripts_queue_length:{}\r\n",
            state.scripts.queue_len()
        ));

        for (i, entry) in state.primaries.iter().enumerate() {
            let primary = entry.value();
            let addr = primary.core.addr();
            let status = if primary.core.flags.is_odown() {
                "odown"
            } else if primary.core.flags.is_sdown() {
                "sdown"
            } else {
                "ok"
            };
            out.push_str(&format!(
                "master{}:name={},status={},address={}:{},slaves={},sentinels={}\r\n",
                i,
                primary.core.name,
                status,
                addr.ip_string(),
                addr.port,
                primary.replicas.len(),
                primary.peers.len() + 1
            ));
        }
        out.push_str("\r\n");
    }

    RespValue::bulk(&out)
}

fn lookup(args: &[Bytes], state: &Arc<SupervisorState>) -> Option<Arc<PrimaryInstance>> {
    if args.len() != 1 {
        return None;
    }
    let name = String::from_utf8_lossy(&args[0]);
    state.get_primary(&name)
}

fn no_such_master() -> RespValue {
    RespValue::error(&crate::error::Error::NoSuchPrimary.to_string())
}

fn wrong_args(cmd: &str) -> RespValue {
    RespValue::error(&format!("ERR wrong number of arguments for '{}'", cmd))
}

fn kv(fields: &mut Vec<RespValue>, key: &str, value: String) {
    fields.push(RespValue::bulk(key));
    fields.push(RespValue::bulk(&value));
}

fn primary_details(primary: &Arc<PrimaryInstance>) -> RespValue {
    let now = mstime();
    let addr = primary.core.addr();
    let mut fields = Vec::new();
    kv(&mut fields, "name", primary.core.name.clone());
    kv(&mut fields, "ip", addr.ip_string());
    kv(&mut fields, "port", addr.port.to_string());
    kv(
        &mut fields,
        "runid",
        primary.core.runid().unwrap_or_default(),
    );
    kv(&mut fields, "flags", primary.core.flags.format());
    kv(
        &mut fields,
        "pending-commands",
        primary.core.links.pending().to_string(),
    );
    kv(
        &mut fields,
        "last-ok-ping-reply",
        now.saturating_sub(primary.core.last_avail_time.load(Ordering::Relaxed))
            .to_string(),
    );
    kv(
        &mut fields,
        "last-ping-reply",
        now.saturating_sub(primary.core.last_pong_time.load(Ordering::Relaxed))
            .to_string(),
    );
    kv(
        &mut fields,
        "info-refresh",
        now.saturating_sub(primary.core.info_refresh.load(Ordering::Relaxed))
            .to_string(),
    );
    kv(
        &mut fields,
        "role-reported",
        match *primary.core.role_reported.read() {
            ReportedRole::Primary => "master".to_string(),
            ReportedRole::Replica => "slave".to_string(),
        },
    );
    kv(
        &mut fields,
        "config-epoch",
        primary.config_epoch.load(Ordering::Relaxed).to_string(),
    );
    kv(&mut fields, "num-slaves", primary.replicas.len().to_string());
    kv(
        &mut fields,
        "num-other-sentinels",
        primary.peers.len().to_string(),
    );
    kv(&mut fields, "quorum", primary.quorum().to_string());
    kv(
        &mut fields,
        "failover-timeout",
        primary.failover_timeout().to_string(),
    );
    kv(
        &mut fields,
        "parallel-syncs",
        primary.parallel_syncs().to_string(),
    );
    kv(
        &mut fields,
        "failover-state",
        primary.get_failover_state().as_str().to_string(),
    );
    RespValue::Array(fields)
}

fn replica_details(replica: &Arc<ReplicaInstance>) -> RespValue {
    let now = mstime();
    let addr = replica.core.addr();
    let mut fields = Vec::new();
    kv(&mut fields, "name", replica.core.name.clone());
    kv(&mut fields, "ip", addr.ip_string());
    kv(&mut fields, "port", addr.port.to_string());
    kv(
        &mut fields,
        "runid",
        replica.core.runid().unwrap_or_default(),
    );
    kv(&mut fields, "flags", replica.core.flags.format());
    kv(
        &mut fields,
        "pending-commands",
        replica.core.links.pending().to_string(),
    );
    kv(
        &mut fields,
        "last-ok-ping-reply",
        now.saturating_sub(replica.core.last_avail_time.load(Ordering::Relaxed))
            .to_string(),
    );
    kv(
        &mut fields,
        "info-refresh",
        now.saturating_sub(replica.core.info_refresh.load(Ordering::Relaxed))
            .to_string(),
    );
    kv(
        &mut fields,
        "master-link-status",
        if replica.primary_link_up.load(Ordering::Relaxed) {
            "ok".to_string()
        } else {
            "err".to_string()
        },
    );
    kv(
        &mut fields,
        "master-link-down-time",
        replica
            .primary_link_down_time
            .load(Ordering::Relaxed)
            .to_string(),
    );
    kv(
        &mut fields,
        "master-host",
        replica
            .reported_primary_host
            .read()
            .clone()
            .unwrap_or_default(),
    );
    kv(
        &mut fields,
        "master-port",
        replica
            .reported_primary_port
            .load(Ordering::Relaxed)
            .to_string(),
    );
    kv(
        &mut fields,
        "slave-priority",
        replica.priority.load(Ordering::Relaxed).to_string(),
    );
    RespValue::Array(fields)
}

fn peer_details(peer: &Arc<PeerInstance>) -> RespValue {
    let now = mstime();
    let addr = peer.core.addr();
    let mut fields = Vec::new();
    kv(&mut fields, "name", peer.core.name.clone());
    kv(&mut fields, "ip", addr.ip_string());
    kv(&mut fields, "port", addr.port.to_string());
    kv(&mut fields, "runid", peer.core.runid().unwrap_or_default());
    kv(&mut fields, "flags", peer.core.flags.format());
    kv(
        &mut fields,
        "last-hello-message",
        now.saturating_sub(peer.last_hello_time.load(Ordering::Relaxed))
            .to_string(),
    );
    kv(
        &mut fields,
        "voted-leader",
        peer.leader.read().clone().unwrap_or_else(|| "?".to_string()),
    );
    kv(
        &mut fields,
        "voted-leader-epoch",
        peer.leader_epoch.load(Ordering::Relaxed).to_string(),
    );
    RespValue::Array(fields)
}

/// Glob matcher for RESET patterns and channel subscriptions:
/// `*`, `?`, `[abc]`, `[a-z]`, `[^...]`, and `\x` escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let mut p = 0;
    let mut t = 0;

    while p < pattern.len() {
        match pattern[p] {
            b'*' => {
                while p + 1 < pattern.len() && pattern[p + 1] == b'*' {
                    p += 1;
                }
                if p + 1 == pattern.len() {
                    return true;
                }
                for skip in t..=text.len() {
                    if glob_match(&pattern[p + 1..], &text[skip..]) {
                        return true;
                    }
                }
                return false;
            }
            b'?' => {
                if t == text.len() {
                    return false;
                }
                t += 1;
                p += 1;
            }
            b'[' => {
                if t == text.len() {
                    return false;
                }
                p += 1;
                let negate = p < pattern.len() && pattern[p] == b'^';
                if negate {
                    p += 1;
                }
                let mut matched = false;
                while p < pattern.len() && pattern[p] != b']' {
                    if p + 2 < pattern.len() && pattern[p + 1] == b'-' && pattern[p + 2] != b']' {
                        if pattern[p] <= text[t] && text[t] <= pattern[p + 2] {
                            matched = true;
                        }
                        p += 3;
                    } else {
                        if pattern[p] == text[t] {
                            matched = true;
                        }
                        p += 1;
                    }
                }
                if p < pattern.len() {
                    p += 1; // closing bracket
                }
                if matched == negate {
                    return false;
                }
                t += 1;
            }
            b'\\' if p + 1 < pattern.len() => {
                if t == text.len() || pattern[p + 1] != text[t] {
                    return false;
                }
                p += 2;
                t += 1;
            }
            c => {
                if t == text.len() || c != text[t] {
                    return false;
                }
                p += 1;
                t += 1;
            }
        }
    }

    t == text.len()
}
