//! Instance addresses and naming.

use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};

use crate::error::{Error, Result};

/// Resolved network address of a monitored instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl InstanceAddr {
    /// Resolve a hostname (or literal address) and validate the port.
    pub fn resolve(host: &str, port: i64) -> Result<Self> {
        if !(1..=65535).contains(&port) {
            return Err(Error::InvalidPort);
        }
        let port = port as u16;

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self { ip, port });
        }

        // Name lookup. Blocking, as instances are created rarely: at
        // configuration load and on discovery of a new child.
        let mut addrs = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::Unresolvable(host.to_string()))?;
        match addrs.next() {
            Some(sa) => Ok(Self { ip: sa.ip(), port }),
            None => Err(Error::Unresolvable(host.to_string())),
        }
    }

    /// Synthesised instance name, `host:port` with IPv6 hosts bracketed.
    pub fn to_name(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("{}:{}", ip, self.port),
            IpAddr::V6(ip) => format!("[{}]:{}", ip, self.port),
        }
    }

    pub fn ip_string(&self) -> String {
        self.ip.to_string()
    }
}

impl fmt::Display for InstanceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
