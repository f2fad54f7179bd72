//! Configuration types for cyphal-node.
//! Parsed from ~/.cyphal/node.toml.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use cyphal_identity::AllocatorConfig;
use cyphal_protocol::{Health, Mode, MAX_NODE_NAME_LEN};
use serde::{Deserialize, Serialize};

use crate::heartbeat::{validate_interval, MAX_INTERVAL_MS, MIN_INTERVAL_MS};
use crate::transport::CYPHAL_UDP_PORT;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub allocator: AllocatorSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub transport: TransportSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_name")]
    pub name: String,
    /// 0 = no preference.
    #[serde(default)]
    pub preferred_id: u8,
    #[serde(default = "default_version")]
    pub sw_version: u32,
    #[serde(default = "default_version")]
    pub hw_version: u32,
    #[serde(default = "default_initial_mode")]
    pub initial_mode: Mode,
    #[serde(default)]
    pub initial_health: Health,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            preferred_id: 0,
            sw_version: default_version(),
            hw_version: default_version(),
            initial_mode: default_initial_mode(),
            initial_health: Health::Nominal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_1000_u32")]
    pub interval_ms: u32,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorSection {
    #[serde(default = "default_1000")]
    pub request_interval_ms: u64,
    #[serde(default = "default_10000")]
    pub deadline_ms: u64,
    #[serde(default = "default_3")]
    pub max_retries: u8,
    #[serde(default = "default_100")]
    pub tick_ms: u64,
}

impl Default for AllocatorSection {
    fn default() -> Self {
        Self {
            request_interval_ms: 1000,
            deadline_ms: 10_000,
            max_retries: 3,
            tick_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_100")]
    pub lock_timeout_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_multicast_base")]
    pub multicast_base: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default)]
    pub loopback: bool,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            multicast_base: default_multicast_base(),
            port: default_port(),
            interface: default_interface(),
            ttl: default_ttl(),
            loopback: false,
        }
    }
}

// Default value functions
fn default_name() -> String {
    "cyphal-node".into()
}
fn default_version() -> u32 {
    1
}
fn default_initial_mode() -> Mode {
    Mode::Initialization
}
fn default_true() -> bool {
    true
}
fn default_3() -> u8 {
    3
}
fn default_100() -> u64 {
    100
}
fn default_1000() -> u64 {
    1000
}
fn default_1000_u32() -> u32 {
    1000
}
fn default_10000() -> u64 {
    10_000
}
fn default_multicast_base() -> Ipv4Addr {
    Ipv4Addr::new(239, 0, 0, 0)
}
fn default_port() -> u16 {
    CYPHAL_UDP_PORT
}
fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_ttl() -> u32 {
    16
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("node.name is {len} bytes (max {MAX_NODE_NAME_LEN})")]
    NameTooLong { len: usize },
    #[error("node.preferred_id {0} out of range (0 or 1..=127)")]
    PreferredId(u8),
    #[error("heartbeat.interval_ms {0} out of range ({MIN_INTERVAL_MS}..={MAX_INTERVAL_MS})")]
    HeartbeatInterval(u32),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("transport.multicast_base {0} is not a multicast address")]
    NotMulticast(Ipv4Addr),
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values the runtime would refuse later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.len() > MAX_NODE_NAME_LEN {
            return Err(ConfigError::NameTooLong {
                len: self.node.name.len(),
            });
        }
        if self.node.preferred_id > 127 {
            return Err(ConfigError::PreferredId(self.node.preferred_id));
        }
        if !validate_interval(self.heartbeat.interval_ms) {
            return Err(ConfigError::HeartbeatInterval(self.heartbeat.interval_ms));
        }
        for (field, value) in [
            ("allocator.request_interval_ms", self.allocator.request_interval_ms),
            ("allocator.deadline_ms", self.allocator.deadline_ms),
            ("allocator.max_retries", u64::from(self.allocator.max_retries)),
            ("allocator.tick_ms", self.allocator.tick_ms),
            ("queue.lock_timeout_ms", self.queue.lock_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if !self.transport.multicast_base.is_multicast() {
            return Err(ConfigError::NotMulticast(self.transport.multicast_base));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.lock_timeout_ms)
    }

    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            request_interval_ms: self.allocator.request_interval_ms,
            deadline_ms: self.allocator.deadline_ms,
            max_retries: self.allocator.max_retries,
            lock_timeout: self.lock_timeout(),
        }
    }
}
