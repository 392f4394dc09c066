//! Supervisor configuration structures.

use std::collections::HashMap;
use std::path::PathBuf;

/// Per-primary monitoring configuration.
#[derive(Debug, Clone)]
pub struct PrimaryConfig {
    /// Primary name identifier
    pub name: String,
    /// Host as written in the configuration
    pub host: String,
    /// Primary port
    pub port: u16,
    /// Supervisors that must agree before the primary is objectively down
    pub quorum: u32,
    /// Milliseconds without a valid reply before subjectively down
    pub down_after_ms: u64,
    /// Failover timeout in milliseconds
    pub failover_timeout: u64,
    /// Whether this supervisor may act on a failover for this primary
    pub can_failover: bool,
    /// Replicas reconfigured in parallel after a promotion
    pub parallel_syncs: u32,
    /// Authentication secret for the primary and its replicas
    pub auth_pass: Option<String>,
    /// Notification script path
    pub notification_script: Option<PathBuf>,
    /// Client reconfiguration script path
    pub client_reconfig_script: Option<PathBuf>,
}

impl PrimaryConfig {
    pub fn new(name: String, host: String, port: u16, quorum: u32) -> Self {
        Self {
            name,
            host,
            port,
            quorum,
            down_after_ms: super::DOWN_AFTER_PERIOD_MS,
            failover_timeout: super::DEFAULT_FAILOVER_TIMEOUT_MS,
            can_failover: true,
            parallel_syncs: super::DEFAULT_PARALLEL_SYNCS,
            auth_pass: None,
            notification_script: None,
            client_reconfig_script: None,
        }
    }
}

/// Global supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Listening port (default 26379)
    pub port: u16,
    /// Bind address
    pub bind: String,
    /// Announced IP for NAT/containers
    pub announce_ip: Option<String>,
    /// Announced port for NAT/containers
    pub announce_port: Option<u16>,
    /// Log level
    pub loglevel: String,
    /// Log file path, empty for stderr
    pub logfile: String,
    /// Monitored primaries, keyed by name
    pub primaries: HashMap<String, PrimaryConfig>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            port: super::DEFAULT_PORT,
            bind: "0.0.0.0".to_string(),
            announce_ip: None,
            announce_port: None,
            loglevel: "notice".to_string(),
            logfile: String::new(),
            primaries: HashMap::new(),
        }
    }
}

impl SupervisorConfig {
    /// The address advertised in hello messages.
    pub fn announce_ip(&self) -> String {
        self.announce_ip.clone().unwrap_or_else(|| {
            if self.bind == "0.0.0.0" {
                "127.0.0.1".to_string()
            } else {
                self.bind.clone()
            }
        })
    }

    pub fn announce_port(&self) -> u16 {
        self.announce_port.unwrap_or(self.port)
    }
}
