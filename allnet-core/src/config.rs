//! Configuration: one `Config` root loaded from an optional TOML file, with
//! compiled-in defaults so every binary runs with zero configuration.
//!
//! Grounded on the teacher's `config::root::Config`/`config::loader` split:
//! a `Deserialize` struct tree with `#[serde(default = "...")]` on every
//! field, plus a `load_from_path` function that reads, parses, and
//! validates in one place.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CoreError, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub bloom: BloomConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub local_gateway: LocalGatewayConfig,
    #[serde(default)]
    pub ip_gateway: IpGatewayConfig,
    #[serde(default)]
    pub wifi: WifiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bloom: BloomConfig::default(),
            rate: RateConfig::default(),
            peer: PeerConfig::default(),
            local_gateway: LocalGatewayConfig::default(),
            ip_gateway: IpGatewayConfig::default(),
            wifi: WifiConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// §4.C duplicate-suppression cache shape.
#[derive(Debug, Deserialize, Clone)]
pub struct BloomConfig {
    #[serde(default = "default_family_size")]
    pub family_size: usize,
    #[serde(default = "default_filter_bits")]
    pub filter_bits: usize,
    #[serde(default = "default_filter_slices")]
    pub filter_slices: usize,
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            family_size: default_family_size(),
            filter_bits: default_filter_bits(),
            filter_slices: default_filter_slices(),
            persist_dir: None,
        }
    }
}

fn default_family_size() -> usize {
    crate::bloom::DEFAULT_FAMILY_SIZE
}

fn default_filter_bits() -> usize {
    crate::bloom::DEFAULT_FILTER_BITS
}

fn default_filter_slices() -> usize {
    crate::bloom::DEFAULT_FILTER_SLICES
}

/// §4.D per-source rate tracker shape.
#[derive(Debug, Deserialize, Clone)]
pub struct RateConfig {
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_rate_capacity")]
    pub capacity: usize,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self { window_ms: default_rate_window_ms(), capacity: default_rate_capacity() }
    }
}

fn default_rate_window_ms() -> u64 {
    10_000
}

fn default_rate_capacity() -> usize {
    1024
}

/// §4.E peer table/listener shape.
#[derive(Debug, Deserialize, Clone)]
pub struct PeerConfig {
    #[serde(default = "default_peer_port")]
    pub port: u16,
    #[serde(default = "default_peer_capacity")]
    pub capacity: usize,
    #[serde(default = "default_reservation_capacity")]
    pub reservation_capacity: usize,
    #[serde(default = "default_true")]
    pub unique_ip_required: bool,
    #[serde(default = "default_true")]
    pub nodelay: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            port: default_peer_port(),
            capacity: default_peer_capacity(),
            reservation_capacity: default_reservation_capacity(),
            unique_ip_required: default_true(),
            nodelay: default_true(),
        }
    }
}

fn default_peer_port() -> u16 {
    6968
}

fn default_peer_capacity() -> usize {
    64
}

fn default_reservation_capacity() -> usize {
    16
}

/// §4.G local gateway shape.
#[derive(Debug, Deserialize, Clone)]
pub struct LocalGatewayConfig {
    #[serde(default = "default_local_gateway_port")]
    pub port: u16,
}

impl Default for LocalGatewayConfig {
    fn default() -> Self {
        Self { port: default_local_gateway_port() }
    }
}

fn default_local_gateway_port() -> u16 {
    6969
}

/// §4.H IP gateway shape.
#[derive(Debug, Deserialize, Clone)]
pub struct IpGatewayConfig {
    #[serde(default = "default_target_peer_count")]
    pub target_peer_count: usize,
    #[serde(default = "default_dial_interval_ms")]
    pub dial_interval_ms: u64,
    #[serde(default = "default_mgmt_interval_ms")]
    pub mgmt_interval_ms: u64,
    #[serde(default = "default_known_peers_path")]
    pub known_peers_path: PathBuf,
}

impl Default for IpGatewayConfig {
    fn default() -> Self {
        Self {
            target_peer_count: default_target_peer_count(),
            dial_interval_ms: default_dial_interval_ms(),
            mgmt_interval_ms: default_mgmt_interval_ms(),
            known_peers_path: default_known_peers_path(),
        }
    }
}

fn default_target_peer_count() -> usize {
    8
}

fn default_dial_interval_ms() -> u64 {
    30_000
}

fn default_mgmt_interval_ms() -> u64 {
    60_000
}

fn default_known_peers_path() -> PathBuf {
    PathBuf::from("known_peers.toml")
}

/// §4.I interface broadcaster shape.
#[derive(Debug, Deserialize, Clone)]
pub struct WifiConfig {
    #[serde(default = "default_wifi_interface")]
    pub interface: String,
    #[serde(default = "default_wifi_port")]
    pub port: u16,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self { interface: default_wifi_interface(), port: default_wifi_port() }
    }
}

fn default_wifi_interface() -> String {
    "wlan0".to_string()
}

fn default_wifi_port() -> u16 {
    6971
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), show_target: false }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false, listen: default_metrics_addr() }
    }
}

fn default_metrics_addr() -> SocketAddr {
    "127.0.0.1:9968".parse().unwrap()
}

fn default_true() -> bool {
    true
}

/// Load and validate a config file, falling back to built-in defaults when
/// `path` is `None` (§6 "absent a file, compiled-in defaults apply").
pub fn load(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Config(format!("failed to read config file {}: {e}", path.display())))?;
    let config: Config =
        toml::from_str(&text).map_err(|e| CoreError::Config(format!("failed to parse config: {e}")))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.bloom.family_size == 0 {
        return Err(CoreError::Config("bloom.family_size must be at least 1".into()));
    }
    if config.rate.capacity == 0 {
        return Err(CoreError::Config("rate.capacity must be at least 1".into()));
    }
    if config.peer.capacity == 0 {
        return Err(CoreError::Config("peer.capacity must be at least 1".into()));
    }
    Ok(())
}
