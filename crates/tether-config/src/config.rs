//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener and tick settings.
    pub server: ServerConfig,
    /// Socket, buffer, and framing settings.
    pub transport: TransportConfig,
    /// Per-peer fairness limits.
    pub limits: LimitsConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Listener and tick settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the relay binds to.
    pub bind_address: String,
    /// TCP listener port.
    pub tcp_port: u16,
    /// UDP socket port (usually the same as the TCP port).
    pub udp_port: u16,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Server update rate in ticks per second. Uplink caps are declared
    /// per tick and scaled by this value.
    pub tick_rate: u32,
}

/// Socket, buffer, and framing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Staging buffer size for batched TCP writes, in bytes.
    pub tcp_buffer_size: usize,
    /// Maximum serialized size of a single record, in bytes.
    pub max_record_size: usize,
    /// Maximum UDP datagram (container) size, in bytes.
    pub udp_max_datagram_size: usize,
    /// Socket receive timeout in milliseconds. Receive loops use this as
    /// their cancellation poll interval.
    pub receive_timeout_ms: u64,
    /// Canned response written to peers that probe the TCP port with a
    /// plaintext HTTP request.
    pub decoy_response: String,
}

/// Per-peer fairness limits.
///
/// Uplink caps are declared in bytes/packets per server tick; the effective
/// rate cap is the per-tick value multiplied by the current tick rate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum display name length after sanitization.
    pub max_name_length: usize,
    /// Reliable-channel uplink cap in bytes per tick.
    pub tcp_uplink_bytes_per_tick: u32,
    /// Reliable-channel uplink cap in packets per tick.
    pub tcp_uplink_packets_per_tick: u32,
    /// Unreliable-channel uplink cap in bytes per tick.
    pub udp_uplink_bytes_per_tick: u32,
    /// Unreliable-channel uplink cap in packets per tick.
    pub udp_uplink_packets_per_tick: u32,
    /// Delay before a capped reliable queue is flushed again, in
    /// milliseconds.
    pub cap_cooldown_ms: u64,
}

/// Debug/development settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            tcp_port: 3802,
            udp_port: 3802,
            max_connections: 256,
            tick_rate: 60,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_buffer_size: 65536,
            max_record_size: 2048,
            udp_max_datagram_size: 1100,
            receive_timeout_ms: 6000,
            decoy_response: "HTTP/1.1 418 I'm a teapot\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\nThis is not an HTTP server.\r\n".to_string(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_name_length: 30,
            tcp_uplink_bytes_per_tick: 4096,
            tcp_uplink_packets_per_tick: 64,
            udp_uplink_bytes_per_tick: 2048,
            udp_uplink_packets_per_tick: 64,
            cap_cooldown_ms: 100,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("tether.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `tether.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("tether.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("tether.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
