use clap::Parser;
use std::path::PathBuf;

use crate::error::Result;
use crate::supervisor::config::SupervisorConfig;
use crate::supervisor::config_parser::parse_config_file;

#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(version = "0.3.0")]
#[command(about = "Quorum-based high-availability supervisor for RESP-compatible stores", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(value_name = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Listening port (default: 26379)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[arg(long)]
    pub bind: Option<String>,

    /// Announced IP for NAT/containers
    #[arg(long)]
    pub announce_ip: Option<String>,

    /// Announced port for NAT/containers
    #[arg(long)]
    pub announce_port: Option<u16>,

    /// Log level (debug, verbose, notice, warning, nothing)
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log file path
    #[arg(long)]
    pub logfile: Option<String>,
}

impl Cli {
    /// Parse arguments, load the configuration file if given, and apply
    /// command line overrides on top.
    pub fn load_config() -> Result<SupervisorConfig> {
        let cli = Cli::parse();

        let mut config = match &cli.config_file {
            Some(path) => parse_config_file(path)?,
            None => SupervisorConfig::default(),
        };

        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(bind) = cli.bind {
            config.bind = bind;
        }
        if let Some(ip) = cli.announce_ip {
            config.announce_ip = Some(ip);
        }
        if let Some(port) = cli.announce_port {
            config.announce_port = Some(port);
        }
        if let Some(level) = cli.loglevel {
            config.loglevel = level;
        }
        if let Some(file) = cli.logfile {
            config.logfile = file;
        }

        Ok(config)
    }
}
