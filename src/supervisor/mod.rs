//! Supervision engine.
//!
//! A small cluster of these processes cooperatively watches one or more
//! primaries and their replicas, detects primary failure by quorum,
//! elects a leader among themselves, and promotes a replica to be the new
//! primary, reconfiguring the remaining replicas to follow it.
//!
//! Instances are probed over their native client protocol; peer
//! supervisors gossip over a pub/sub channel hosted by the monitored
//! nodes themselves.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::resp::RespValue;

pub mod addr;
pub mod commands;
pub mod config;
pub mod config_parser;
pub mod detector;
pub mod election;
pub mod events;
pub mod failover;
pub mod flags;
pub mod hello;
pub mod info;
pub mod link;
pub mod network;
pub mod probe;
pub mod scripts;
pub mod state;
pub mod tilt;
pub mod timer;

use self::config::SupervisorConfig;
use self::link::{LinkEvent, OpKind};
use self::state::{InstanceRef, SupervisorState};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 26379;
/// Pub/sub channel used for peer discovery and config propagation.
pub const HELLO_CHANNEL: &str = "__sentinel__:hello";

/// Engine tick period.
pub const TICK_PERIOD_MS: u64 = 100;
/// Info refresh period, and the fast variant under O_DOWN/failover.
pub const INFO_PERIOD_MS: u64 = 10_000;
pub const INFO_PERIOD_DOWN_MS: u64 = 1_000;
/// Ping period.
pub const PING_PERIOD_MS: u64 = 1_000;
/// Down-probe period per peer.
pub const ASK_PERIOD_MS: u64 = 1_000;
/// Hello publish period.
pub const PUBLISH_PERIOD_MS: u64 = 2_000;
/// Default milliseconds without valid reply before subjectively down.
pub const DOWN_AFTER_PERIOD_MS: u64 = 30_000;
/// Tick delta that triggers tilt, and how long tilt lasts.
pub const TILT_TRIGGER_MS: u64 = 2_000;
pub const TILT_PERIOD_MS: u64 = PING_PERIOD_MS * 30;
/// Default replica promotion priority.
pub const DEFAULT_REPLICA_PRIORITY: u32 = 100;
/// Retry period for a replica reconfiguration showing no progress.
pub const RECONF_RETRY_PERIOD_MS: u64 = 10_000;
/// Minimum age of a link before it may be killed for inactivity.
pub const MIN_LINK_RECONNECT_PERIOD_MS: u64 = 15_000;
/// Default failover timeout.
pub const DEFAULT_FAILOVER_TIMEOUT_MS: u64 = 180_000;
/// Cap on in-flight commands per link.
pub const MAX_PENDING_COMMANDS: u32 = 100;
/// Cap on the leader election phase.
pub const ELECTION_TIMEOUT_MS: u64 = 10_000;
/// How fresh replies and info must be to trust an instance.
pub const INFO_VALIDITY_TIME_MS: u64 = 5_000;
/// Default number of replicas reconfigured in parallel.
pub const DEFAULT_PARALLEL_SYNCS: u32 = 1;
/// Dial timeout for instance links.
pub const CONNECT_TIMEOUT_MS: u64 = 500;

/// Script scheduler bounds.
pub const SCRIPT_MAX_QUEUE: usize = 256;
pub const SCRIPT_MAX_RUNNING: u32 = 16;
pub const SCRIPT_MAX_RUNTIME_MS: u64 = 60_000;
pub const SCRIPT_MAX_RETRY: u32 = 10;
pub const SCRIPT_RETRY_DELAY_MS: u64 = 30_000;

/// Start the supervisor: build the shared state from the configuration,
/// spawn the listener and the reply dispatcher, and run the engine timer
/// until a shutdown signal arrives.
pub async fn run_supervisor(config: SupervisorConfig) -> Result<()> {
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let state = SupervisorState::new(config.announce_ip(), config.announce_port(), link_tx);
    log::info!("Supervisor run ID: {}", state.myid);

    for (_, primary_config) in config.primaries {
        let name = primary_config.name.clone();
        let quorum = primary_config.quorum;
        let primary = state.add_primary(primary_config)?;
        log::info!(
            "+monitor master {} {} quorum {}",
            name,
            primary.core.addr(),
            quorum
        );
    }

    let bind_addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("Listening for commands on {}", bind_addr);

    tokio::spawn(run_reply_dispatcher(state.clone(), link_rx));
    tokio::spawn(network::run_listener(listener, state.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutdown signal received.");
        }
        _ = timer::run(state) => {}
    }

    Ok(())
}

/// Drain link task events and route replies to their handlers. Runs as a
/// single task, so ingest logic never executes concurrently with itself.
pub async fn run_reply_dispatcher(
    state: Arc<SupervisorState>,
    mut rx: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            LinkEvent::Reply { iref, op, frame } => match op {
                OpKind::Ping => probe::handle_ping_reply(&iref, &frame),
                OpKind::Info => {
                    if let RespValue::BulkString(body) = &frame {
                        if let Ok(text) = std::str::from_utf8(body) {
                            info::ingest_info(&state, &iref, text);
                        }
                    }
                }
                OpKind::HelloPublish => probe::handle_publish_reply(&iref, &frame),
                OpKind::IsPrimaryDown => {
                    if let InstanceRef::Peer { peer, .. } = &iref {
                        detector::handle_is_primary_down_reply(peer, &frame);
                    }
                }
                // Fire-and-forget commands; effects are observed through
                // the next info snapshots.
                OpKind::Auth
                | OpKind::ScriptKill
                | OpKind::ReplicaOf
                | OpKind::ConfigRewrite
                | OpKind::Subscribe => {}
            },
            LinkEvent::PubSubMessage {
                iref,
                channel,
                payload,
            } => {
                if channel.as_ref() == HELLO_CHANNEL.as_bytes() {
                    hello::ingest_hello(&state, iref.primary(), &payload);
                }
            }
            LinkEvent::Closed { iref, link } => {
                log::debug!(
                    "{:?} link to {} {} closed",
                    link,
                    iref.type_str(),
                    iref.core().addr()
                );
                link::kill_link(iref.core(), link);
            }
        }
    }
}
