//! Supervisor state.
//!
//! Data structures tracking every monitored instance:
//! - atomic flags and timestamps updated from link tasks and the engine tick
//! - `DashMap` keyed children (replicas, peer supervisors) per primary
//! - one global state value shared behind `Arc`, no ambient globals

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

use super::addr::InstanceAddr;
use super::config::PrimaryConfig;
use super::events::EventBus;
use super::flags::InstanceFlags;
use super::link::{LinkEvent, Links};
use super::scripts::ScriptScheduler;

/// Current wall clock in milliseconds since the epoch.
#[inline]
pub fn mstime() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a random 40-character hex run ID.
pub fn generate_run_id() -> String {
    format!(
        "{:016x}{:016x}{:08x}",
        fastrand::u64(..),
        fastrand::u64(..),
        fastrand::u32(..)
    )
}

/// Role an instance last reported over its info snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedRole {
    Primary,
    Replica,
}

/// Failover state machine states, primary-scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum FailoverState {
    None = 0,
    WaitStart = 1,
    SelectSlave = 2,
    SendSlaveofNoone = 3,
    WaitPromotion = 4,
    ReconfSlaves = 5,
    UpdateConfig = 6,
}

impl FailoverState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::WaitStart,
            2 => Self::SelectSlave,
            3 => Self::SendSlaveofNoone,
            4 => Self::WaitPromotion,
            5 => Self::ReconfSlaves,
            6 => Self::UpdateConfig,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::WaitStart => "wait-start",
            Self::SelectSlave => "select-slave",
            Self::SendSlaveofNoone => "send-slaveof-noone",
            Self::WaitPromotion => "wait-promotion",
            Self::ReconfSlaves => "reconf-slaves",
            Self::UpdateConfig => "update-config",
        }
    }
}

/// Identity, links, and liveness timers shared by every instance kind.
#[derive(Debug)]
pub struct InstanceCore {
    /// Instance name: caller-supplied for primaries, `ip:port` for children
    pub name: String,
    /// Network address; swapped on a primary only via the address switch
    pub addr: RwLock<InstanceAddr>,
    /// 40-char run ID learned from info or gossip
    pub runid: RwLock<Option<String>>,
    /// Flag bits
    pub flags: InstanceFlags,
    /// Milliseconds without a valid reply before subjectively down
    pub down_after_ms: AtomicU64,
    /// Command and pub/sub links
    pub links: Links,
    /// Last valid ping reply (PONG/LOADING/MASTERDOWN)
    pub last_avail_time: AtomicU64,
    /// Last reply of any kind
    pub last_pong_time: AtomicU64,
    /// Last accepted hello publish
    pub last_pub_time: AtomicU64,
    /// Last info snapshot, 0 when never received
    pub info_refresh: AtomicU64,
    /// Role last reported by info
    pub role_reported: RwLock<ReportedRole>,
    /// Instant the instance was first observed in the reported role
    pub role_reported_time: AtomicU64,
    /// Instant the subjective down condition was entered, 0 when up
    pub s_down_since: AtomicU64,
    /// Instant the objective down condition was entered, 0 when up
    pub o_down_since: AtomicU64,
}

impl InstanceCore {
    fn new(name: String, addr: InstanceAddr, flags: InstanceFlags, down_after_ms: u64) -> Self {
        let now = mstime();
        let role = if flags.is_primary() {
            ReportedRole::Primary
        } else {
            ReportedRole::Replica
        };
        Self {
            name,
            addr: RwLock::new(addr),
            runid: RwLock::new(None),
            flags,
            down_after_ms: AtomicU64::new(down_after_ms),
            links: Links::new(),
            last_avail_time: AtomicU64::new(now),
            last_pong_time: AtomicU64::new(now),
            last_pub_time: AtomicU64::new(now),
            info_refresh: AtomicU64::new(0),
            role_reported: RwLock::new(role),
            role_reported_time: AtomicU64::new(now),
            s_down_since: AtomicU64::new(0),
            o_down_since: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> InstanceAddr {
        *self.addr.read()
    }

    pub fn down_after(&self) -> u64 {
        self.down_after_ms.load(Ordering::Relaxed)
    }

    pub fn runid(&self) -> Option<String> {
        self.runid.read().clone()
    }

    /// True when no down condition was recorded in the last `ms` milliseconds.
    pub fn no_down_for(&self, ms: u64, now: u64) -> bool {
        let most_recent = self
            .s_down_since
            .load(Ordering::Relaxed)
            .max(self.o_down_since.load(Ordering::Relaxed));
        most_recent == 0 || now.saturating_sub(most_recent) > ms
    }
}

/// A monitored primary and everything scoped to it.
#[derive(Debug)]
pub struct PrimaryInstance {
    pub core: InstanceCore,
    pub config: RwLock<PrimaryConfig>,
    /// Version stamped on a successful promotion, advertised via gossip
    pub config_epoch: AtomicU64,
    /// Discovered replicas, keyed by `ip:port`
    pub replicas: DashMap<String, Arc<ReplicaInstance>>,
    /// Peer supervisors monitoring the same primary, keyed by `ip:port`
    pub peers: DashMap<String, Arc<PeerInstance>>,
    pub failover_state: AtomicU8,
    pub failover_epoch: AtomicU64,
    pub failover_start_time: AtomicU64,
    pub failover_state_change_time: AtomicU64,
    /// Replica elevated by the running failover
    pub promoted_replica: RwLock<Option<Arc<ReplicaInstance>>>,
    /// Run ID this supervisor voted for in `leader_epoch`
    pub leader: RwLock<Option<String>>,
    pub leader_epoch: AtomicU64,
}

impl PrimaryInstance {
    pub fn new(config: PrimaryConfig) -> Result<Arc<Self>> {
        let addr = InstanceAddr::resolve(&config.host, config.port as i64)?;
        let flags = InstanceFlags::new_primary();
        flags.set_can_failover(config.can_failover);
        let down_after = config.down_after_ms;
        let name = config.name.clone();

        Ok(Arc::new(Self {
            core: InstanceCore::new(name, addr, flags, down_after),
            config: RwLock::new(config),
            config_epoch: AtomicU64::new(0),
            replicas: DashMap::new(),
            peers: DashMap::new(),
            failover_state: AtomicU8::new(FailoverState::None as u8),
            failover_epoch: AtomicU64::new(0),
            failover_start_time: AtomicU64::new(0),
            failover_state_change_time: AtomicU64::new(0),
            promoted_replica: RwLock::new(None),
            leader: RwLock::new(None),
            leader_epoch: AtomicU64::new(0),
        }))
    }

    pub fn quorum(&self) -> u32 {
        self.config.read().quorum
    }

    pub fn failover_timeout(&self) -> u64 {
        self.config.read().failover_timeout
    }

    pub fn parallel_syncs(&self) -> u32 {
        self.config.read().parallel_syncs
    }

    pub fn auth_pass(&self) -> Option<String> {
        self.config.read().auth_pass.clone()
    }

    pub fn get_failover_state(&self) -> FailoverState {
        FailoverState::from_u8(self.failover_state.load(Ordering::Relaxed))
    }

    pub fn set_failover_state(&self, state: FailoverState) {
        self.failover_state.store(state as u8, Ordering::Relaxed);
        self.failover_state_change_time
            .store(mstime(), Ordering::Relaxed);
    }

    /// The address clients should use right now: once the promoted replica
    /// acknowledged the role switch the new address is advertised even
    /// though the instance table still holds the old one.
    pub fn current_addr(&self) -> InstanceAddr {
        if self.core.flags.is_failover_in_progress()
            && self.get_failover_state() >= FailoverState::ReconfSlaves
        {
            if let Some(promoted) = self.promoted_replica.read().as_ref() {
                return promoted.core.addr();
            }
        }
        self.core.addr()
    }

    /// Create and register a replica child. Fails with `Duplicate` when a
    /// replica with the same address is already known.
    pub fn add_replica(&self, addr: InstanceAddr) -> Result<Arc<ReplicaInstance>> {
        let key = addr.to_name();
        if self.replicas.contains_key(&key) {
            return Err(Error::Duplicate(key));
        }
        let replica = Arc::new(ReplicaInstance::new(
            addr,
            self.core.name.clone(),
            self.core.down_after(),
        ));
        self.replicas.insert(key, replica.clone());
        Ok(replica)
    }

    pub fn lookup_replica(&self, addr: &InstanceAddr) -> Option<Arc<ReplicaInstance>> {
        self.replicas.get(&addr.to_name()).map(|e| e.value().clone())
    }

    /// Create and register a peer supervisor child, keyed by address.
    pub fn add_peer(&self, addr: InstanceAddr, runid: String) -> Result<Arc<PeerInstance>> {
        let key = addr.to_name();
        if self.peers.contains_key(&key) {
            return Err(Error::Duplicate(key));
        }
        let peer = Arc::new(PeerInstance::new(
            addr,
            runid,
            self.core.name.clone(),
            self.core.down_after(),
        ));
        self.peers.insert(key, peer.clone());
        Ok(peer)
    }

    /// Find a peer matching the address or the run ID.
    pub fn find_peer(&self, addr: &InstanceAddr, runid: &str) -> Option<Arc<PeerInstance>> {
        for entry in self.peers.iter() {
            let peer = entry.value();
            if peer.core.addr() == *addr || peer.core.runid().as_deref() == Some(runid) {
                return Some(peer.clone());
            }
        }
        None
    }

    /// Remove every peer sharing the address OR the run ID. Dedup before
    /// inserting a freshly announced peer, so a restarted supervisor or a
    /// topology change never leaves two entries voting for one process.
    pub fn remove_matching_peers(&self, addr: &InstanceAddr, runid: &str) -> usize {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|e| {
                let peer = e.value();
                peer.core.addr() == *addr || peer.core.runid().as_deref() == Some(runid)
            })
            .map(|e| e.key().clone())
            .collect();

        for key in &stale {
            self.peers.remove(key);
        }
        stale.len()
    }
}

/// A replica of a monitored primary.
#[derive(Debug)]
pub struct ReplicaInstance {
    pub core: InstanceCore,
    /// Parent primary name; children never keep the parent alive
    pub primary_name: String,
    /// Primary host the replica reports replicating from
    pub reported_primary_host: RwLock<Option<String>>,
    /// Primary port the replica reports replicating from
    pub reported_primary_port: AtomicU32,
    /// Whether the replica reports its replication link as established
    pub primary_link_up: AtomicBool,
    /// Reported time the replication link has been down, in milliseconds
    pub primary_link_down_time: AtomicU64,
    /// Promotion priority, 0 means never promote
    pub priority: AtomicU32,
    /// Instant the reported primary address last changed
    pub conf_change_time: AtomicU64,
    /// Instant SLAVEOF was sent during a reconfiguration
    pub reconf_sent_time: AtomicU64,
}

impl ReplicaInstance {
    pub fn new(addr: InstanceAddr, primary_name: String, down_after_ms: u64) -> Self {
        let name = addr.to_name();
        Self {
            core: InstanceCore::new(name, addr, InstanceFlags::new_replica(), down_after_ms),
            primary_name,
            reported_primary_host: RwLock::new(None),
            reported_primary_port: AtomicU32::new(0),
            primary_link_up: AtomicBool::new(false),
            primary_link_down_time: AtomicU64::new(0),
            priority: AtomicU32::new(super::DEFAULT_REPLICA_PRIORITY),
            conf_change_time: AtomicU64::new(mstime()),
            reconf_sent_time: AtomicU64::new(0),
        }
    }

    /// True when the replica reports replicating from the given address.
    pub fn reports_primary(&self, addr: &InstanceAddr) -> bool {
        let host = self.reported_primary_host.read();
        match host.as_deref() {
            Some(h) => {
                h.eq_ignore_ascii_case(&addr.ip_string())
                    && self.reported_primary_port.load(Ordering::Relaxed) == addr.port as u32
            }
            None => false,
        }
    }
}

/// A peer supervisor monitoring the same primary.
#[derive(Debug)]
pub struct PeerInstance {
    pub core: InstanceCore,
    pub primary_name: String,
    /// Last hello received from this peer
    pub last_hello_time: AtomicU64,
    /// Last reply to our down-probe
    pub last_primary_down_reply_time: AtomicU64,
    /// Vote this peer reported, and the epoch it was cast in
    pub leader: RwLock<Option<String>>,
    pub leader_epoch: AtomicU64,
}

impl PeerInstance {
    pub fn new(addr: InstanceAddr, runid: String, primary_name: String, down_after_ms: u64) -> Self {
        let now = mstime();
        let name = addr.to_name();
        let core = InstanceCore::new(name, addr, InstanceFlags::new_peer(), down_after_ms);
        *core.runid.write() = Some(runid);
        Self {
            core,
            primary_name,
            last_hello_time: AtomicU64::new(now),
            last_primary_down_reply_time: AtomicU64::new(now),
            leader: RwLock::new(None),
            leader_epoch: AtomicU64::new(0),
        }
    }
}

/// Handle to any instance plus its owning primary, carried by link tasks
/// so late replies can be applied (or ignored after teardown).
#[derive(Debug, Clone)]
pub enum InstanceRef {
    Primary(Arc<PrimaryInstance>),
    Replica {
        primary: Arc<PrimaryInstance>,
        replica: Arc<ReplicaInstance>,
    },
    Peer {
        primary: Arc<PrimaryInstance>,
        peer: Arc<PeerInstance>,
    },
}

impl InstanceRef {
    pub fn core(&self) -> &InstanceCore {
        match self {
            Self::Primary(p) => &p.core,
            Self::Replica { replica, .. } => &replica.core,
            Self::Peer { peer, .. } => &peer.core,
        }
    }

    /// The primary this instance is scoped to (itself for primaries).
    pub fn primary(&self) -> &Arc<PrimaryInstance> {
        match self {
            Self::Primary(p) => p,
            Self::Replica { primary, .. } => primary,
            Self::Peer { primary, .. } => primary,
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Primary(_) => "master",
            Self::Replica { .. } => "slave",
            Self::Peer { .. } => "sentinel",
        }
    }
}

/// Flags for `reset_primary`.
pub const RESET_NO_PEERS: u32 = 1 << 0;
pub const RESET_GENERATE_EVENT: u32 = 1 << 1;

/// The whole supervisor process state.
#[derive(Debug)]
pub struct SupervisorState {
    /// This supervisor's run ID
    pub myid: String,
    /// Address advertised in hello messages
    pub announce_ip: String,
    pub announce_port: u16,
    /// Monotonically increasing election counter
    pub current_epoch: AtomicU64,
    /// Monitored primaries by name
    pub primaries: DashMap<String, Arc<PrimaryInstance>>,
    /// Clock anomaly guard
    pub tilt: AtomicBool,
    pub tilt_start_time: AtomicU64,
    pub previous_tick_time: AtomicU64,
    /// Notification / client-reconfig script scheduler
    pub scripts: ScriptScheduler,
    /// Event feed: log, pub/sub broadcast, notification hook
    pub events: EventBus,
    /// Sink for link task events, drained by the reply dispatcher
    pub link_events: tokio::sync::mpsc::UnboundedSender<LinkEvent>,
    /// Engine PRNG, seeded so election jitter is reproducible in tests
    pub rng: Mutex<fastrand::Rng>,
}

impl SupervisorState {
    pub fn new(
        announce_ip: String,
        announce_port: u16,
        link_events: tokio::sync::mpsc::UnboundedSender<LinkEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            myid: generate_run_id(),
            announce_ip,
            announce_port,
            current_epoch: AtomicU64::new(0),
            primaries: DashMap::new(),
            tilt: AtomicBool::new(false),
            tilt_start_time: AtomicU64::new(0),
            previous_tick_time: AtomicU64::new(mstime()),
            scripts: ScriptScheduler::new(),
            events: EventBus::new(),
            link_events,
            rng: Mutex::new(fastrand::Rng::new()),
        })
    }

    /// Register a primary to monitor. `Duplicate` when the name is taken.
    pub fn add_primary(&self, config: PrimaryConfig) -> Result<Arc<PrimaryInstance>> {
        let name = config.name.clone();
        if self.primaries.contains_key(&name) {
            return Err(Error::Duplicate(name));
        }
        let primary = PrimaryInstance::new(config)?;
        self.primaries.insert(name, primary.clone());
        Ok(primary)
    }

    pub fn get_primary(&self, name: &str) -> Option<Arc<PrimaryInstance>> {
        self.primaries.get(name).map(|e| e.value().clone())
    }

    /// Find a primary by its current address.
    pub fn get_primary_by_addr(&self, addr: &InstanceAddr) -> Option<Arc<PrimaryInstance>> {
        self.primaries
            .iter()
            .find(|e| e.value().core.addr() == *addr)
            .map(|e| e.value().clone())
    }

    pub fn epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    pub fn set_epoch(&self, epoch: u64) {
        self.current_epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn next_epoch(&self) -> u64 {
        self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_tilt(&self) -> bool {
        self.tilt.load(Ordering::Relaxed)
    }

    /// Per-engine jitter used to desynchronise elections.
    pub fn jitter(&self, bound: u64) -> u64 {
        self.rng.lock().u64(0..bound)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// State with a throwaway link event sink, for unit tests.
    pub fn test_state() -> Arc<SupervisorState> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        std::mem::forget(rx);
        SupervisorState::new("127.0.0.1".to_string(), super::super::DEFAULT_PORT, tx)
    }

    pub fn test_primary(state: &Arc<SupervisorState>, name: &str) -> Arc<PrimaryInstance> {
        let config = crate::supervisor::config::PrimaryConfig::new(
            name.to_string(),
            "10.0.0.1".to_string(),
            6379,
            2,
        );
        state.add_primary(config).unwrap()
    }

    pub fn test_replica(primary: &Arc<PrimaryInstance>, ip: &str, port: u16) -> Arc<ReplicaInstance> {
        let addr = InstanceAddr::resolve(ip, port as i64).unwrap();
        primary.add_replica(addr).unwrap()
    }

    pub fn test_peer(primary: &Arc<PrimaryInstance>, ip: &str, port: u16, runid: &str) -> Arc<PeerInstance> {
        let addr = InstanceAddr::resolve(ip, port as i64).unwrap();
        primary.add_peer(addr, runid.to_string()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_run_id_shape() {
        let id = generate_run_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_run_id());
    }

    #[test]
    fn test_add_primary_duplicate() {
        let state = test_state();
        test_primary(&state, "mymaster");
        let again = crate::supervisor::config::PrimaryConfig::new(
            "mymaster".to_string(),
            "10.0.0.9".to_string(),
            6379,
            2,
        );
        assert!(matches!(state.add_primary(again), Err(Error::Duplicate(_))));
    }

    #[test]
    fn test_replica_keyed_by_addr_name() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let replica = test_replica(&primary, "10.0.0.2", 6379);
        assert_eq!(replica.core.name, "10.0.0.2:6379");
        assert!(primary.replicas.contains_key("10.0.0.2:6379"));

        let addr = InstanceAddr::resolve("10.0.0.2", 6379).unwrap();
        assert!(matches!(
            primary.add_replica(addr),
            Err(Error::Duplicate(_))
        ));
    }

    #[test]
    fn test_peer_dedup_by_addr_or_runid() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        test_peer(&primary, "10.0.0.5", 26379, "aaaa");
        test_peer(&primary, "10.0.0.6", 26379, "bbbb");

        // Same address, different run ID: one entry removed.
        let addr = InstanceAddr::resolve("10.0.0.5", 26379).unwrap();
        assert_eq!(primary.remove_matching_peers(&addr, "cccc"), 1);
        assert_eq!(primary.peers.len(), 1);

        // Different address, same run ID: the remaining entry goes too.
        let other = InstanceAddr::resolve("10.0.0.7", 26379).unwrap();
        assert_eq!(primary.remove_matching_peers(&other, "bbbb"), 1);
        assert!(primary.peers.is_empty());
    }

    #[test]
    fn test_current_addr_prefers_promoted() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let replica = test_replica(&primary, "10.0.0.2", 6379);

        assert_eq!(primary.current_addr().to_name(), "10.0.0.1:6379");

        primary.core.flags.set_failover_in_progress(true);
        *primary.promoted_replica.write() = Some(replica);
        primary.set_failover_state(FailoverState::ReconfSlaves);
        assert_eq!(primary.current_addr().to_name(), "10.0.0.2:6379");
    }

    #[test]
    fn test_no_down_for() {
        let state = test_state();
        let primary = test_primary(&state, "mymaster");
        let now = mstime();
        assert!(primary.core.no_down_for(1000, now));

        primary.core.s_down_since.store(now, Ordering::Relaxed);
        assert!(!primary.core.no_down_for(1000, now));
        assert!(primary.core.no_down_for(1000, now + 2000));
    }
}
