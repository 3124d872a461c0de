//! Command-line argument parsing for the Tether relay.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tether relay command-line arguments.
///
/// CLI values override settings loaded from `tether.ron`.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Tether relay server")]
pub struct CliArgs {
    /// Bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// TCP listener port.
    #[arg(long)]
    pub tcp_port: Option<u16>,

    /// UDP socket port.
    #[arg(long)]
    pub udp_port: Option<u16>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Server tick rate in updates per second.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(port) = args.tcp_port {
            self.server.tcp_port = port;
        }
        if let Some(port) = args.udp_port {
            self.server.udp_port = port;
        }
        if let Some(max) = args.max_connections {
            self.server.max_connections = max;
        }
        if let Some(rate) = args.tick_rate {
            self.server.tick_rate = rate;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }

    /// Default config directory: `<user config dir>/tether`, falling back to
    /// the working directory when the platform dir cannot be resolved.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("tether"))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
