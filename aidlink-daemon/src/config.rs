//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/aidlink/config.toml or
/// /etc/aidlink/config.toml.
/// Env overrides: AIDLINK_DISCOVERY_PORT, AIDLINK_TRANSPORT_PORT,
/// AIDLINK_DATA_DIR, AIDLINK_DEVICE_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 45710).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Inbound message TCP port (default 45711).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Where the identity file and both stores live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Display name carried in beacons (default none).
    #[serde(default)]
    pub device_name: Option<String>,
}

fn default_discovery_port() -> u16 {
    45710
}
fn default_transport_port() -> u16 {
    45711
}
fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME").map(PathBuf::from) {
        Some(h) => h.join(".local/share/aidlink"),
        None => PathBuf::from("/var/lib/aidlink"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            data_dir: default_data_dir(),
            device_name: None,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("AIDLINK_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("AIDLINK_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    if let Ok(s) = std::env::var("AIDLINK_DATA_DIR") {
        if !s.trim().is_empty() {
            c.data_dir = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("AIDLINK_DEVICE_NAME") {
        if !s.trim().is_empty() {
            c.device_name = Some(s.trim().to_string());
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/aidlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/aidlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
