//! Configuration file parser.
//!
//! Plain directive lines, one per line, `#` comments. Per-primary
//! directives must follow the `monitor` line that names the primary.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::config::{PrimaryConfig, SupervisorConfig};

/// Parse a configuration file.
pub fn parse_config_file(path: &Path) -> Result<SupervisorConfig> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

fn config_err(line: usize, msg: impl Into<String>) -> Error {
    Error::Config {
        line,
        msg: msg.into(),
    }
}

/// Parse configuration text. Unknown directives are rejected.
pub fn parse_config(content: &str) -> Result<SupervisorConfig> {
    let mut config = SupervisorConfig::default();

    for (idx, raw) in content.lines().enumerate() {
        let line_num = idx + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        parse_line(&parts, &mut config, line_num)?;
    }

    Ok(config)
}

fn parse_line(parts: &[&str], config: &mut SupervisorConfig, line: usize) -> Result<()> {
    match parts[0].to_lowercase().as_str() {
        "port" => {
            let port = expect_arg(parts, 1, line, "port requires a value")?;
            config.port = port
                .parse()
                .map_err(|_| config_err(line, "invalid port number"))?;
        }
        "bind" => {
            config.bind = expect_arg(parts, 1, line, "bind requires an address")?.to_string();
        }
        "announce-ip" => {
            config.announce_ip =
                Some(expect_arg(parts, 1, line, "announce-ip requires an address")?.to_string());
        }
        "announce-port" => {
            let port = expect_arg(parts, 1, line, "announce-port requires a value")?;
            config.announce_port = Some(
                port.parse()
                    .map_err(|_| config_err(line, "invalid announce-port"))?,
            );
        }
        "loglevel" => {
            config.loglevel = expect_arg(parts, 1, line, "loglevel requires a value")?.to_string();
        }
        "logfile" => {
            config.logfile = expect_arg(parts, 1, line, "logfile requires a path")?.to_string();
        }
        "monitor" => {
            // monitor <name> <host> <port> <quorum>
            if parts.len() != 5 {
                return Err(config_err(line, "monitor requires: name host port quorum"));
            }
            let name = parts[1].to_string();
            let host = parts[2].to_string();
            let port: u16 = parts[3]
                .parse()
                .map_err(|_| config_err(line, "invalid port in monitor"))?;
            let quorum: i64 = parts[4]
                .parse()
                .map_err(|_| config_err(line, "invalid quorum in monitor"))?;
            if quorum <= 0 {
                return Err(Error::QuorumMustBePositive);
            }
            if config.primaries.contains_key(&name) {
                return Err(Error::Duplicate(name));
            }
            config
                .primaries
                .insert(name.clone(), PrimaryConfig::new(name, host, port, quorum as u32));
        }
        "down-after-milliseconds" => {
            let (primary, value) = primary_directive(parts, config, line)?;
            primary.down_after_ms = parse_positive_ms(&value, line)?;
        }
        "failover-timeout" => {
            let (primary, value) = primary_directive(parts, config, line)?;
            primary.failover_timeout = parse_positive_ms(&value, line)?;
        }
        "can-failover" => {
            let (primary, value) = primary_directive(parts, config, line)?;
            primary.can_failover = parse_yes_no(&value, line)?;
        }
        "parallel-syncs" => {
            let (primary, value) = primary_directive(parts, config, line)?;
            primary.parallel_syncs = value
                .parse()
                .map_err(|_| config_err(line, "invalid parallel-syncs count"))?;
        }
        "notification-script" => {
            let (primary, value) = primary_directive(parts, config, line)?;
            primary.notification_script = Some(executable_path(&value)?);
        }
        "client-reconfig-script" => {
            let (primary, value) = primary_directive(parts, config, line)?;
            primary.client_reconfig_script = Some(executable_path(&value)?);
        }
        "auth-pass" => {
            let (primary, value) = primary_directive(parts, config, line)?;
            primary.auth_pass = Some(value);
        }
        other => {
            return Err(config_err(
                line,
                format!("unrecognized directive '{}'", other),
            ));
        }
    }

    Ok(())
}

fn expect_arg<'a>(parts: &[&'a str], idx: usize, line: usize, msg: &str) -> Result<&'a str> {
    parts.get(idx).copied().ok_or_else(|| config_err(line, msg))
}

/// `<directive> <primary-name> <value>` lookup for per-primary settings.
fn primary_directive<'a>(
    parts: &[&str],
    config: &'a mut SupervisorConfig,
    line: usize,
) -> Result<(&'a mut PrimaryConfig, String)> {
    if parts.len() != 3 {
        return Err(config_err(
            line,
            format!("{} requires a primary name and a value", parts[0]),
        ));
    }
    let value = parts[2].to_string();
    match config.primaries.get_mut(parts[1]) {
        Some(primary) => Ok((primary, value)),
        None => Err(Error::NoSuchPrimary),
    }
}

fn parse_positive_ms(value: &str, line: usize) -> Result<u64> {
    let ms: i64 = value
        .parse()
        .map_err(|_| config_err(line, "invalid millisecond value"))?;
    if ms <= 0 {
        return Err(config_err(line, "negative or zero time parameter"));
    }
    Ok(ms as u64)
}

fn parse_yes_no(value: &str, line: usize) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(config_err(line, "argument must be either yes or no")),
    }
}

/// Script paths must exist and be executable at configuration time.
fn executable_path(value: &str) -> Result<PathBuf> {
    let path = PathBuf::from(value);
    if !is_executable(&path) {
        return Err(Error::NonExecutableScript(value.to_string()));
    }
    Ok(path)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
