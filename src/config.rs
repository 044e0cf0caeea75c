//! Controller configuration from file and environment.
//!
//! File: `~/.config/btlink/config.toml` or `/etc/btlink/config.toml`.
//! Env overrides: `BTLINK_PEER`, `BTLINK_MODE`, `BTLINK_LISTEN`.

use crate::connection::LinkConfig;
use anyhow::{Context, Result};
use btlink_shared::link;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Which transport the controller drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Bluetooth RFCOMM (requires the `bluetooth` feature)
    #[default]
    Rfcomm,
    /// TCP loopback standing in for the radio link
    TcpSimulation,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rfcomm" | "bluetooth" => Ok(TransportMode::Rfcomm),
            "tcp_simulation" | "tcp" => Ok(TransportMode::TcpSimulation),
            other => Err(format!("unknown transport mode: {}", other)),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Rfcomm => write!(f, "rfcomm"),
            TransportMode::TcpSimulation => write!(f, "tcp_simulation"),
        }
    }
}

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    #[serde(default)]
    pub mode: TransportMode,
    /// Remembered peer to connect to on startup
    #[serde(default)]
    pub peer: Option<String>,
    /// Request an authenticated, encrypted link when dialing out
    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default = "default_channel")]
    pub channel: u8,
    /// Accept inbound peers while not connected
    #[serde(default = "default_true")]
    pub listen: bool,
    /// Listen address in TCP simulation mode
    #[serde(default = "default_accept")]
    pub accept: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_channel() -> u8 {
    link::DEFAULT_RFCOMM_CHANNEL
}
fn default_accept() -> String {
    "127.0.0.1:9000".into()
}
fn default_reconnect_delay_ms() -> u64 {
    1_000
}
fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    link::CONNECT_TIMEOUT_MS
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            peer: None,
            secure: true,
            channel: default_channel(),
            listen: true,
            accept: default_accept(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ControllerConfig {
    /// Connection manager settings derived from this config
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..Default::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms.max(self.reconnect_delay_ms))
    }

    /// Apply environment overrides through `lookup`
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(peer) = lookup("BTLINK_PEER") {
            let peer = peer.trim().to_string();
            self.peer = if peer.is_empty() { None } else { Some(peer) };
        }
        if let Some(s) = lookup("BTLINK_MODE") {
            match s.parse() {
                Ok(mode) => self.mode = mode,
                Err(e) => warn!("[CONFIG] Ignoring BTLINK_MODE: {}", e),
            }
        }
        if let Some(s) = lookup("BTLINK_LISTEN") {
            match s.trim() {
                "1" | "true" | "yes" => self.listen = true,
                "0" | "false" | "no" => self.listen = false,
                other => warn!("[CONFIG] Ignoring BTLINK_LISTEN={}", other),
            }
        }
    }
}

/// Load config: defaults, then the config file, then env vars.
///
/// An explicit `path` must exist and parse; the default locations are
/// optional.
pub fn load(path: Option<&Path>) -> Result<ControllerConfig> {
    let mut config = match path {
        Some(path) => read_file(path)?,
        None => load_default_file().unwrap_or_default(),
    };
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

fn read_file(path: &Path) -> Result<ControllerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/btlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/btlink/config.toml"));
    out
}

fn load_default_file() -> Option<ControllerConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match read_file(&path) {
        Ok(config) => {
            debug!("[CONFIG] Loaded {}", path.display());
            Some(config)
        }
        Err(e) => {
            warn!("[CONFIG] {:#}; using defaults", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.mode, TransportMode::Rfcomm);
        assert!(config.peer.is_none());
        assert!(config.secure);
        assert!(config.listen);
        assert_eq!(config.channel, 1);
        assert_eq!(config.link_config().connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_file() {
        let config: ControllerConfig = toml::from_str(
            r#"
            mode = "tcp_simulation"
            peer = "127.0.0.1:9000"
            secure = false
            reconnect_delay_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, TransportMode::TcpSimulation);
        assert_eq!(config.peer.as_deref(), Some("127.0.0.1:9000"));
        assert!(!config.secure);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
        assert_eq!(config.max_reconnect_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<ControllerConfig>("baud = 9600").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BTLINK_PEER", "AA:BB:CC:DD:EE:FF"),
            ("BTLINK_MODE", "tcp"),
            ("BTLINK_LISTEN", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = ControllerConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.peer.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(config.mode, TransportMode::TcpSimulation);
        assert!(!config.listen);
    }

    #[test]
    fn test_bad_env_values_ignored() {
        let mut config = ControllerConfig::default();
        config.apply_env(|key| match key {
            "BTLINK_MODE" => Some("serial".into()),
            "BTLINK_LISTEN" => Some("maybe".into()),
            _ => None,
        });
        assert_eq!(config.mode, TransportMode::Rfcomm);
        assert!(config.listen);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(load(Some(Path::new("/nonexistent/btlink.toml"))).is_err());
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [TransportMode::Rfcomm, TransportMode::TcpSimulation] {
            assert_eq!(mode.to_string().parse::<TransportMode>(), Ok(mode));
        }
    }
}
