use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub blocka: BlockaConfig,

    #[serde(default)]
    pub filters: FiltersConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub stats: StatsConfig,
}

/// Behaviour of the local tunnel, persisted between runs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Only refetch link sources while on wifi.
    #[serde(default = "default_wifi_only")]
    pub wifi_only: bool,
    /// True until the first successful sync.
    #[serde(default = "default_first_load")]
    pub first_load: bool,
    /// Surface a power-saving signal on repeated EPERM instead of retrying.
    #[serde(default)]
    pub powersave: bool,
    #[serde(default = "default_dns_fallback")]
    pub dns_fallback: bool,
    #[serde(default)]
    pub report: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

/// Encrypted tunnel session. Replaced as a whole whenever the lease or
/// gateway changes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BlockaConfig {
    #[serde(default = "default_adblocking")]
    pub adblocking: bool,
    #[serde(default)]
    pub vpn: bool,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Base64 x25519 private key.
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub public_key: String,
    /// Base64 public key of the gateway.
    #[serde(default)]
    pub gateway_id: String,
    #[serde(default)]
    pub gateway_ip: String,
    #[serde(default)]
    pub gateway_port: u16,
    #[serde(default)]
    pub vip4: String,
    #[serde(default)]
    pub vip6: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FiltersConfig {
    #[serde(default)]
    pub repo_url: String,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_hours: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DnsConfig {
    #[serde(default = "default_dns_servers")]
    pub servers: Vec<SocketAddr>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_request_sinks")]
    pub request_sinks: Vec<String>,
    #[serde(default = "default_request_log_capacity")]
    pub request_log_capacity: usize,
    #[serde(default = "default_log_blocked")]
    pub log_blocked: bool,
    #[serde(default = "default_log_allowed")]
    pub log_allowed: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    #[serde(default = "default_stats_enable")]
    pub enable: bool,
    #[serde(default = "default_log_interval")]
    pub log_interval_seconds: u64,
}

// Defaults
fn default_wifi_only() -> bool {
    true
}
fn default_first_load() -> bool {
    true
}
fn default_dns_fallback() -> bool {
    true
}
fn default_cache_ttl_secs() -> u64 {
    86400
}
fn default_adblocking() -> bool {
    true
}
fn default_sync_interval() -> u64 {
    24
}
fn default_dns_servers() -> Vec<SocketAddr> {
    vec![
        SocketAddr::from(([1, 1, 1, 1], 53)),
        SocketAddr::from(([1, 0, 0, 1], 53)),
    ]
}
fn default_device_name() -> String {
    "adtun0".to_string()
}
fn default_mtu() -> usize {
    1600
}
fn default_storage_backend() -> String {
    "sqlite".to_string()
}
fn default_sqlite_path() -> String {
    "ad-tunnel.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_request_sinks() -> Vec<String> {
    vec!["console".to_string(), "memory".to_string()]
}
fn default_request_log_capacity() -> usize {
    500
}
fn default_log_blocked() -> bool {
    true
}
fn default_log_allowed() -> bool {
    true
}
fn default_stats_enable() -> bool {
    true
}
fn default_log_interval() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            blocka: BlockaConfig::default(),
            filters: FiltersConfig::default(),
            dns: DnsConfig::default(),
            device: DeviceConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            wifi_only: default_wifi_only(),
            first_load: default_first_load(),
            powersave: false,
            dns_fallback: default_dns_fallback(),
            report: false,
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for BlockaConfig {
    fn default() -> Self {
        Self {
            adblocking: default_adblocking(),
            vpn: false,
            account_id: String::new(),
            lease_expiry: None,
            private_key: String::new(),
            public_key: String::new(),
            gateway_id: String::new(),
            gateway_ip: String::new(),
            gateway_port: 0,
            vip4: String::new(),
            vip6: String::new(),
        }
    }
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            repo_url: String::new(),
            sync_interval_hours: default_sync_interval(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: default_dns_servers(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            mtu: default_mtu(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            request_sinks: default_request_sinks(),
            request_log_capacity: default_request_log_capacity(),
            log_blocked: default_log_blocked(),
            log_allowed: default_log_allowed(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enable: default_stats_enable(),
            log_interval_seconds: default_log_interval(),
        }
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config TOML")?;
        if config.dns.servers.is_empty() {
            warn!("No DNS servers configured, the tunnel will not start");
        }
        Ok(config)
    }
}

impl BlockaConfig {
    pub fn has_gateway(&self) -> bool {
        !self.gateway_id.is_empty() && !self.gateway_ip.is_empty() && self.gateway_port != 0
    }

    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry.map(|expiry| expiry > now).unwrap_or(false)
    }
}
