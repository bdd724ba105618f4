//! Load config from file and environment.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use okmesh_core::protocol::{
    BLE_CHUNK_SIZE, DEFAULT_EXPORT_LIMIT, DISCOVERY_PORT, RELAY_HOST, RELAY_PORT, UDP_PORT,
};
use okmesh_core::relay::DEFAULT_MAX_PACKETS_PER_WINDOW;
use okmesh_core::{parse_relay_key, RelayKeyError, RelaySecurityManager};

use crate::ble::BleConfig;
use crate::coordinator::SyncConfig;
use crate::udp::{RelayEndpoint, UdpConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("relay_public_key: {0}")]
    RelayKey(#[from] RelayKeyError),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("ble_chunk_size {0} leaves no room after the 4-byte length prefix")]
    ChunkTooSmall(usize),
}

/// Daemon configuration. File: ~/.config/okmesh/config.toml or /etc/okmesh/config.toml.
/// Env overrides: OKMESH_UDP_PORT, OKMESH_RELAY_HOST, OKMESH_RELAY_PORT,
/// OKMESH_SYNC_INTERVAL_SECS, OKMESH_SPOOL_DIR, OKMESH_DISCOVERY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local UDP port, also assumed for discovered peers (default 45678).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_true")]
    pub relay_enabled: bool,
    #[serde(default = "default_relay_host")]
    pub relay_host: String,
    /// Relay source port; datagrams from it are rate-limited and never learned as peers.
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    #[serde(default = "default_relay_refresh_secs")]
    pub relay_refresh_secs: u64,
    #[serde(default = "default_relay_retry_secs")]
    pub relay_retry_secs: u64,
    /// Empty disables pinning (the production relay is anycast).
    #[serde(default)]
    pub pinned_relay_ips: Vec<IpAddr>,
    /// Hex Ed25519 key. When set, long relay datagrams must carry a valid signature.
    #[serde(default)]
    pub relay_public_key: Option<String>,
    #[serde(default = "default_relay_rate_limit")]
    pub relay_rate_limit: u32,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_export_limit")]
    pub export_limit: usize,
    #[serde(default)]
    pub mark_delivered_after_send: bool,
    #[serde(default = "default_ble_chunk_size")]
    pub ble_chunk_size: usize,
    #[serde(default = "default_ble_chunk_interval_ms")]
    pub ble_chunk_interval_ms: u64,
    #[serde(default = "default_reassembly_timeout_secs")]
    pub reassembly_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub discovery_enabled: bool,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Outbox, inbox, and contacts live here.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
}

fn default_udp_port() -> u16 {
    UDP_PORT
}
fn default_true() -> bool {
    true
}
fn default_relay_host() -> String {
    RELAY_HOST.to_string()
}
fn default_relay_port() -> u16 {
    RELAY_PORT
}
fn default_relay_refresh_secs() -> u64 {
    300
}
fn default_relay_retry_secs() -> u64 {
    30
}
fn default_relay_rate_limit() -> u32 {
    DEFAULT_MAX_PACKETS_PER_WINDOW
}
fn default_sync_interval_secs() -> u64 {
    15
}
fn default_export_limit() -> usize {
    DEFAULT_EXPORT_LIMIT
}
fn default_ble_chunk_size() -> usize {
    BLE_CHUNK_SIZE
}
fn default_ble_chunk_interval_ms() -> u64 {
    20
}
fn default_reassembly_timeout_secs() -> u64 {
    30
}
fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}
fn default_spool_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/okmesh"),
        None => PathBuf::from("/var/lib/okmesh"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            relay_enabled: true,
            relay_host: default_relay_host(),
            relay_port: default_relay_port(),
            relay_refresh_secs: default_relay_refresh_secs(),
            relay_retry_secs: default_relay_retry_secs(),
            pinned_relay_ips: Vec::new(),
            relay_public_key: None,
            relay_rate_limit: default_relay_rate_limit(),
            sync_interval_secs: default_sync_interval_secs(),
            export_limit: default_export_limit(),
            mark_delivered_after_send: false,
            ble_chunk_size: default_ble_chunk_size(),
            ble_chunk_interval_ms: default_ble_chunk_interval_ms(),
            reassembly_timeout_secs: default_reassembly_timeout_secs(),
            discovery_enabled: true,
            discovery_port: default_discovery_port(),
            spool_dir: default_spool_dir(),
        }
    }
}

impl Config {
    /// Reject values the runtime cannot use (zero intervals panic tokio timers).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            (self.sync_interval_secs, "sync_interval_secs"),
            (self.relay_refresh_secs, "relay_refresh_secs"),
            (self.relay_retry_secs, "relay_retry_secs"),
            (self.reassembly_timeout_secs, "reassembly_timeout_secs"),
            (self.ble_chunk_size as u64, "ble_chunk_size"),
            (self.export_limit as u64, "export_limit"),
        ];
        for (value, name) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.ble_chunk_size <= okmesh_core::wire::LEN_SIZE {
            return Err(ConfigError::ChunkTooSmall(self.ble_chunk_size));
        }
        Ok(())
    }

    pub fn relay_security(&self) -> Result<RelaySecurityManager, ConfigError> {
        let mut security = RelaySecurityManager::new(self.relay_port)
            .with_pinned(self.pinned_relay_ips.iter().copied())
            .with_rate_limit(self.relay_rate_limit);
        if let Some(key) = &self.relay_public_key {
            security = security.with_relay_key(parse_relay_key(key)?);
        }
        Ok(security)
    }

    pub fn udp(&self) -> UdpConfig {
        let relay = self.relay_enabled.then(|| RelayEndpoint {
            host: self.relay_host.clone(),
            port: self.relay_port,
            refresh: Duration::from_secs(self.relay_refresh_secs),
            retry: Duration::from_secs(self.relay_retry_secs),
        });
        UdpConfig {
            port: self.udp_port,
            broadcast: (okmesh_core::protocol::BROADCAST_ADDR, self.udp_port).into(),
            relay,
        }
    }

    pub fn ble(&self) -> BleConfig {
        BleConfig {
            chunk_size: self.ble_chunk_size,
            chunk_interval: Duration::from_millis(self.ble_chunk_interval_ms),
            reassembly_timeout: Duration::from_secs(self.reassembly_timeout_secs),
            ..BleConfig::default()
        }
    }

    pub fn sync(&self) -> SyncConfig {
        SyncConfig {
            interval: Duration::from_secs(self.sync_interval_secs),
            export_limit: self.export_limit,
            mark_delivered_after_send: self.mark_delivered_after_send,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => Config::default(),
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/okmesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/okmesh/config.toml"));
    out
}

pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Unparseable values are ignored and leave the file/default value in place.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("OKMESH_UDP_PORT").and_then(|s| s.parse().ok()) {
        c.udp_port = p;
    }
    if let Some(h) = var("OKMESH_RELAY_HOST").filter(|s| !s.trim().is_empty()) {
        c.relay_host = h;
    }
    if let Some(p) = var("OKMESH_RELAY_PORT").and_then(|s| s.parse().ok()) {
        c.relay_port = p;
    }
    if let Some(s) = var("OKMESH_SYNC_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
        c.sync_interval_secs = s;
    }
    if let Some(d) = var("OKMESH_SPOOL_DIR").filter(|s| !s.is_empty()) {
        c.spool_dir = PathBuf::from(d);
    }
    if let Some(v) = var("OKMESH_DISCOVERY") {
        match v.to_ascii_lowercase().as_str() {
            "0" | "false" | "off" | "no" => c.discovery_enabled = false,
            "1" | "true" | "on" | "yes" => c.discovery_enabled = true,
            _ => {}
        }
    }
}
