//! Instance flags as an atomic bitfield.
//!
//! Every monitored instance carries one word of non-exclusive flag bits,
//! updated lock-free from the engine tick and the link tasks.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct InstanceFlags(AtomicU32);

impl InstanceFlags {
    const PRIMARY: u32 = 1 << 0;
    const REPLICA: u32 = 1 << 1;
    const PEER: u32 = 1 << 2;
    const DISCONNECTED: u32 = 1 << 3;
    const S_DOWN: u32 = 1 << 4; // Subjectively down (no quorum)
    const O_DOWN: u32 = 1 << 5; // Objectively down (quorum reached)
    const PRIMARY_DOWN: u32 = 1 << 6; // Peer believes its primary is down
    const CAN_FAILOVER: u32 = 1 << 7;
    const FAILOVER_IN_PROGRESS: u32 = 1 << 8;
    const PROMOTED: u32 = 1 << 9; // Replica selected for promotion
    const RECONF_SENT: u32 = 1 << 10; // SLAVEOF <new primary> sent
    const RECONF_INPROG: u32 = 1 << 11; // Replica synchronization in progress
    const RECONF_DONE: u32 = 1 << 12; // Replica synchronized with new primary
    const FORCE_FAILOVER: u32 = 1 << 13; // Operator-forced failover
    const SCRIPT_KILL_SENT: u32 = 1 << 14; // SCRIPT KILL already sent on -BUSY

    pub fn new_primary() -> Self {
        Self(AtomicU32::new(Self::PRIMARY | Self::DISCONNECTED))
    }

    pub fn new_replica() -> Self {
        Self(AtomicU32::new(Self::REPLICA | Self::DISCONNECTED))
    }

    pub fn new_peer() -> Self {
        Self(AtomicU32::new(Self::PEER | Self::DISCONNECTED))
    }

    #[inline]
    fn get(&self, flag: u32) -> bool {
        self.0.load(Ordering::Relaxed) & flag != 0
    }

    #[inline]
    fn set(&self, flag: u32, value: bool) {
        if value {
            self.0.fetch_or(flag, Ordering::Relaxed);
        } else {
            self.0.fetch_and(!flag, Ordering::Relaxed);
        }
    }

    pub fn is_primary(&self) -> bool {
        self.get(Self::PRIMARY)
    }
    pub fn is_replica(&self) -> bool {
        self.get(Self::REPLICA)
    }
    pub fn is_peer(&self) -> bool {
        self.get(Self::PEER)
    }

    pub fn is_disconnected(&self) -> bool {
        self.get(Self::DISCONNECTED)
    }
    pub fn set_disconnected(&self, v: bool) {
        self.set(Self::DISCONNECTED, v);
    }

    pub fn is_sdown(&self) -> bool {
        self.get(Self::S_DOWN)
    }
    pub fn set_sdown(&self, v: bool) {
        self.set(Self::S_DOWN, v);
    }

    pub fn is_odown(&self) -> bool {
        self.get(Self::O_DOWN)
    }
    pub fn set_odown(&self, v: bool) {
        self.set(Self::O_DOWN, v);
    }

    pub fn is_primary_down(&self) -> bool {
        self.get(Self::PRIMARY_DOWN)
    }
    pub fn set_primary_down(&self, v: bool) {
        self.set(Self::PRIMARY_DOWN, v);
    }

    pub fn can_failover(&self) -> bool {
        self.get(Self::CAN_FAILOVER)
    }
    pub fn set_can_failover(&self, v: bool) {
        self.set(Self::CAN_FAILOVER, v);
    }

    pub fn is_failover_in_progress(&self) -> bool {
        self.get(Self::FAILOVER_IN_PROGRESS)
    }
    pub fn set_failover_in_progress(&self, v: bool) {
        self.set(Self::FAILOVER_IN_PROGRESS, v);
    }

    pub fn is_promoted(&self) -> bool {
        self.get(Self::PROMOTED)
    }
    pub fn set_promoted(&self, v: bool) {
        self.set(Self::PROMOTED, v);
    }

    pub fn is_reconf_sent(&self) -> bool {
        self.get(Self::RECONF_SENT)
    }
    pub fn set_reconf_sent(&self, v: bool) {
        self.set(Self::RECONF_SENT, v);
    }

    pub fn is_reconf_inprog(&self) -> bool {
        self.get(Self::RECONF_INPROG)
    }
    pub fn set_reconf_inprog(&self, v: bool) {
        self.set(Self::RECONF_INPROG, v);
    }

    pub fn is_reconf_done(&self) -> bool {
        self.get(Self::RECONF_DONE)
    }
    pub fn set_reconf_done(&self, v: bool) {
        self.set(Self::RECONF_DONE, v);
    }

    pub fn is_force_failover(&self) -> bool {
        self.get(Self::FORCE_FAILOVER)
    }
    pub fn set_force_failover(&self, v: bool) {
        self.set(Self::FORCE_FAILOVER, v);
    }

    pub fn is_script_kill_sent(&self) -> bool {
        self.get(Self::SCRIPT_KILL_SENT)
    }
    pub fn set_script_kill_sent(&self, v: bool) {
        self.set(Self::SCRIPT_KILL_SENT, v);
    }

    /// Clear the reconfiguration progress bits.
    pub fn clear_reconf(&self) {
        self.0.fetch_and(
            !(Self::RECONF_SENT | Self::RECONF_INPROG | Self::RECONF_DONE),
            Ordering::Relaxed,
        );
    }

    /// Reset to the bits that survive a primary reset: role, failover
    /// permission, and connection status.
    pub fn reset_runtime(&self) {
        self.0.fetch_and(
            Self::PRIMARY | Self::CAN_FAILOVER | Self::DISCONNECTED,
            Ordering::Relaxed,
        );
    }

    /// Format flags for introspection replies.
    pub fn format(&self) -> String {
        let mut flags = Vec::with_capacity(8);

        if self.is_primary() {
            flags.push("master");
        }
        if self.is_replica() {
            flags.push("slave");
        }
        if self.is_peer() {
            flags.push("sentinel");
        }
        if self.is_disconnected() {
            flags.push("disconnected");
        }
        if self.is_sdown() {
            flags.push("s_down");
        }
        if self.is_odown() {
            flags.push("o_down");
        }
        if self.is_primary_down() {
            flags.push("master_down");
        }
        if self.can_failover() {
            flags.push("can_failover");
        }
        if self.is_failover_in_progress() {
            flags.push("failover_in_progress");
        }
        if self.is_promoted() {
            flags.push("promoted");
        }
        if self.is_reconf_sent() {
            flags.push("reconf_sent");
        }
        if self.is_reconf_inprog() {
            flags.push("reconf_inprog");
        }
        if self.is_reconf_done() {
            flags.push("reconf_done");
        }
        if self.is_force_failover() {
            flags.push("force_failover");
        }
        if self.is_script_kill_sent() {
            flags.push("script_kill_sent");
        }

        if flags.is_empty() {
            "none".to_string()
        } else {
            flags.join(",")
        }
    }
}

impl Clone for InstanceFlags {
    fn clone(&self) -> Self {
        Self(AtomicU32::new(self.0.load(Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_flags() {
        let flags = InstanceFlags::new_primary();
        assert!(flags.is_primary());
        assert!(!flags.is_replica());
        assert!(flags.is_disconnected());

        flags.set_sdown(true);
        assert!(flags.is_sdown());
        assert!(flags.format().contains("s_down"));

        flags.set_sdown(false);
        assert!(!flags.is_sdown());
    }

    #[test]
    fn test_reset_runtime_keeps_identity() {
        let flags = InstanceFlags::new_primary();
        flags.set_can_failover(true);
        flags.set_sdown(true);
        flags.set_odown(true);
        flags.set_failover_in_progress(true);
        flags.set_script_kill_sent(true);

        flags.reset_runtime();
        assert!(flags.is_primary());
        assert!(flags.can_failover());
        assert!(flags.is_disconnected());
        assert!(!flags.is_sdown());
        assert!(!flags.is_odown());
        assert!(!flags.is_failover_in_progress());
        assert!(!flags.is_script_kill_sent());
    }

    #[test]
    fn test_clear_reconf() {
        let flags = InstanceFlags::new_replica();
        flags.set_reconf_sent(true);
        flags.set_reconf_inprog(true);
        flags.set_promoted(true);

        flags.clear_reconf();
        assert!(!flags.is_reconf_sent());
        assert!(!flags.is_reconf_inprog());
        assert!(!flags.is_reconf_done());
        // Promotion is cleared separately by the abort path.
        assert!(flags.is_promoted());
    }
}
