//! Info ingestor.
//!
//! Parses the monitored store's INFO text: run ID, advertised replicas,
//! replication link health, and the self-reported role. Role flips drive
//! the reactive half: promotion detection during a failover, and
//! re-pointing of replicas that drifted away from the known primary.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::addr::InstanceAddr;
use super::events::{self, EventLevel};
use super::link;
use super::scripts;
use super::state::{
    mstime, FailoverState, InstanceRef, PrimaryInstance, ReplicaInstance, ReportedRole,
    SupervisorState,
};
use super::{INFO_PERIOD_MS, PUBLISH_PERIOD_MS};

/// A primary is a trustworthy reconfiguration target when it still holds
/// the role in our view and recently proved it over info.
pub fn primary_looks_sane(primary: &PrimaryInstance, now: u64) -> bool {
    primary.core.flags.is_primary()
        && *primary.core.role_reported.read() == ReportedRole::Primary
        && !primary.core.flags.is_sdown()
        && !primary.core.flags.is_odown()
        && now.saturating_sub(primary.core.info_refresh.load(Ordering::Relaxed))
            < INFO_PERIOD_MS * 2
}

/// Apply one INFO snapshot to the instance that produced it.
pub fn ingest_info(state: &Arc<SupervisorState>, iref: &InstanceRef, info: &str) {
    let core = iref.core();
    let primary = iref.primary();
    let now = mstime();
    let mut role: Option<ReportedRole> = None;

    // Reset fields that are only valid while present in the snapshot.
    if let InstanceRef::Replica { replica, .. } = iref {
        replica.primary_link_down_time.store(0, Ordering::Relaxed);
    }

    for line in info.lines() {
        let line = line.trim_end();

        // run_id:<40 hex chars>
        if let Some(value) = line.strip_prefix("run_id:") {
            if value.len() >= 40 {
                let value = &value[..40];
                let known = core.runid.read().clone();
                match known.as_deref() {
                    None => *core.runid.write() = Some(value.to_string()),
                    Some(known) if known != value => {
                        *core.runid.write() = Some(value.to_string());
                        emit_instance_event(state, iref, EventLevel::Notice, "+reboot");
                    }
                    _ => {}
                }
            }
        }

        // slaveN: either `ip,port,state` or `ip=...,port=...,...`
        if let InstanceRef::Primary(primary) = iref {
            if let Some((ip, port)) = parse_replica_line(line) {
                if let Ok(addr) = InstanceAddr::resolve(&ip, port as i64) {
                    if primary.lookup_replica(&addr).is_none() {
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
                }
            }
        }

        if let Some(value) = line.strip_prefix("master_link_down_since_seconds:") {
            if let (InstanceRef::Replica { replica, .. }, Ok(secs)) =
                (iref, value.trim().parse::<u64>())
            {
                replica
                    .primary_link_down_time
                    .store(secs * 1000, Ordering::Relaxed);
            }
        }

        if line == "role:master" {
            role = Some(ReportedRole::Primary);
        } else if line == "role:slave" {
            role = Some(ReportedRole::Replica);
        }

        if let InstanceRef::Replica { replica, .. } = iref {
            if let Some(value) = line.strip_prefix("master_host:") {
                let value = value.trim();
                let mut host = replica.reported_primary_host.write();
                if host.as_deref() != Some(value) {
                    *host = Some(value.to_string());
                    replica.conf_change_time.store(now, Ordering::Relaxed);
                }
            }
            if let Some(value) = line.strip_prefix("master_port:") {
                if let Ok(port) = value.trim().parse::<u32>() {
                    if replica.reported_primary_port.load(Ordering::Relaxed) != port {
                        replica.reported_primary_port.store(port, Ordering::Relaxed);
                        replica.conf_change_time.store(now, Ordering::Relaxed);
                    }
                }
            }
            if let Some(value) = line.strip_prefix("master_link_status:") {
                replica
                    .primary_link_up
                    .store(value.trim().eq_ignore_ascii_case("up"), Ordering::Relaxed);
            }
            if let Some(value) = line.strip_prefix("slave_priority:") {
                if let Ok(priority) = value.trim().parse::<u32>() {
                    replica.priority.store(priority, Ordering::Relaxed);
                }
            }
        }
    }

    core.info_refresh.store(now, Ordering::Relaxed);

    // Record role flips. Collection continues during tilt; acting on the
    // new role does not.
    if let Some(role) = role {
        let mut reported = core.role_reported.write();
        if *reported != role {
            *reported = role;
            core.role_reported_time.store(now, Ordering::Relaxed);
            if let InstanceRef::Replica { replica, .. } = iref {
                replica.conf_change_time.store(now, Ordering::Relaxed);
            }
        }
    }

    if state.is_tilt() {
        return;
    }

    if let InstanceRef::Replica { primary, replica } = iref {
        match role {
            Some(ReportedRole::Primary) => {
                handle_replica_reporting_primary(state, primary, replica, now);
            }
            Some(ReportedRole::Replica) => {
                handle_replica_drift(state, primary, replica, now);
                handle_reconf_progress(state, primary, replica);
            }
            None => {}
        }
    }
}

/// A replica claims the primary role: either the promotion we are waiting
/// for, or a stray instance to be demoted back.
fn handle_replica_reporting_primary(
    state: &Arc<SupervisorState>,
    primary: &Arc<PrimaryInstance>,
    replica: &Arc<ReplicaInstance>,
    now: u64,
) {
    if primary.core.flags.is_failover_in_progress()
        && primary.get_failover_state() == FailoverState::WaitPromotion
    {
        // The promoted replica acknowledged the role switch. Stamp the
        // election epoch on the configuration so every peer adopts it.
        primary.config_epoch.store(
            primary.failover_epoch.load(Ordering::Relaxed),
            Ordering::SeqCst,
        );
        primary.set_failover_state(FailoverState::ReconfSlaves);
        events::emit(
            state,
            EventLevel::Warning,
            "+promoted-slave",
            &events::replica_body(replica, primary),
            Some(primary),
        );
        events::emit(
            state,
            EventLevel::Warning,
            "+failover-state-reconf-slaves",
            &events::primary_body(primary),
            Some(primary),
        );
        scripts::call_client_reconfig(
            state,
            primary,
            "leader",
            "start",
            primary.core.addr(),
            replica.core.addr(),
        );
    } else {
        // Force our view back: the parent must look healthy, and the role
        // change must have settled long enough to let a newer
        // configuration reach us first.
        let wait_time = PUBLISH_PERIOD_MS * 4;
        if primary_looks_sane(primary, now)
            && replica.core.no_down_for(wait_time, now)
            && now.saturating_sub(replica.core.role_reported_time.load(Ordering::Relaxed))
                > wait_time
            && link::send_replica_of(&replica.core, Some(primary.core.addr()))
        {
            events::emit(
                state,
                EventLevel::Notice,
                "+convert-to-slave",
                &events::replica_body(replica, primary),
                Some(primary),
            );
        }
    }
}

/// A replica replicating from the wrong address is pointed back at the
/// primary once the view is stable.
fn handle_replica_drift(
    state: &Arc<SupervisorState>,
    primary: &Arc<PrimaryInstance>,
    replica: &Arc<ReplicaInstance>,
    now: u64,
) {
    let parent_addr = primary.core.addr();
    let reported = replica.reported_primary_host.read().clone();
    let differs = match reported {
        Some(_) => !replica.reports_primary(&parent_addr),
        None => false,
    };
    if !differs {
        return;
    }

    let wait_time = primary.failover_timeout();
    if primary_looks_sane(primary, now)
        && replica.core.no_down_for(wait_time, now)
        && now.saturating_sub(replica.conf_change_time.load(Ordering::Relaxed)) > wait_time
        && link::send_replica_of(&replica.core, Some(parent_addr))
    {
        events::emit(
            state,
            EventLevel::Notice,
            "+fix-slave-config",
            &events::replica_body(replica, primary),
            Some(primary),
        );
    }
}

/// Track a replica being reconfigured by the running failover.
fn handle_reconf_progress(
    state: &Arc<SupervisorState>,
    primary: &Arc<PrimaryInstance>,
    replica: &Arc<ReplicaInstance>,
) {
    let flags = &replica.core.flags;
    if !flags.is_reconf_sent() && !flags.is_reconf_inprog() {
        return;
    }
    let promoted_addr = match primary.promoted_replica.read().as_ref() {
        Some(promoted) => promoted.core.addr(),
        None => return,
    };

    if flags.is_reconf_sent() && replica.reports_primary(&promoted_addr) {
        flags.set_reconf_sent(false);
        flags.set_reconf_inprog(true);
        events::emit(
            state,
            EventLevel::Notice,
            "+slave-reconf-inprog",
            &events::replica_body(replica, primary),
            Some(primary),
        );
    }

    if flags.is_reconf_inprog() && replica.primary_link_up.load(Ordering::Relaxed) {
        flags.set_reconf_inprog(false);
        flags.set_reconf_done(true);
        events::emit(
            state,
            EventLevel::Notice,
            "+slave-reconf-done",
            &events::replica_body(replica, primary),
            Some(primary),
        );
    }
}

fn emit_instance_event(
    state: &Arc<SupervisorState>,
    iref: &InstanceRef,
    level: EventLevel,
    kind: &str,
) {
    let body = match iref {
        InstanceRef::Primary(p) => events::primary_body(p),
        InstanceRef::Replica { primary, replica } => events::replica_body(replica, primary),
        InstanceRef::Peer { primary, peer } => events::peer_body(peer, primary),
    };
    events::emit(state, level, kind, &body, Some(iref.primary()));
}

/// `slaveN:` line in either the legacy `ip,port,state` or the keyed
/// `ip=...,port=...` form.
fn parse_replica_line(line: &str) -> Option<(String, u16)> {
    let rest = line.strip_prefix("slave")?;
    let colon = rest.find(':')?;
    let (index, value) = rest.split_at(colon);
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value = &value[1..];

    if value.contains("ip=") {
        let mut ip = None;
        let mut port = None;
        for part in value.split(',') {
            if let Some(v) = part.strip_prefix("ip=") {
                ip = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("port=") {
                port = v.parse().ok();
            }
        }
        Some((ip?, port?))
    } else {
        let mut fields = value.split(',');
        let ip = fields.next()?.to_string();
        let port = fields.next()?.parse().ok()?;
        Some((ip, port))
    }
}
