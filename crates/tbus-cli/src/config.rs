//! Reads `~/.tbus/config.toml`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted settings for the `tbus` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address `tbus host` listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Host address `tbus expose` connects to.
    #[serde(default = "default_connect_addr")]
    pub connect_addr: String,

    /// Device id the exposed bus reports.
    #[serde(default)]
    pub device_id: u32,

    /// Labels the exposed bus reports.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Invocation timeout; `0` waits forever.
    #[serde(default = "default_timeout_ms")]
    pub invocation_timeout_ms: u64,

    /// Period of the demo device's heartbeat event.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7180".to_string()
}
fn default_connect_addr() -> String {
    "127.0.0.1:7180".to_string()
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_heartbeat_ms() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_addr: default_connect_addr(),
            device_id: 0,
            labels: BTreeMap::new(),
            invocation_timeout_ms: default_timeout_ms(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

impl Config {
    pub fn invocation_timeout(&self) -> Option<Duration> {
        (self.invocation_timeout_ms > 0).then(|| Duration::from_millis(self.invocation_timeout_ms))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }
}

/// Return the path to `~/.tbus/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".tbus").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `TBUS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TBUS_LISTEN_ADDR` | `listen_addr` |
/// | `TBUS_CONNECT_ADDR` | `connect_addr` |
/// | `TBUS_DEVICE_ID` | `device_id` |
/// | `TBUS_TIMEOUT_MS` | `invocation_timeout_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TBUS_LISTEN_ADDR") {
        cfg.listen_addr = v;
    }
    if let Ok(v) = std::env::var("TBUS_CONNECT_ADDR") {
        cfg.connect_addr = v;
    }
    if let Ok(v) = std::env::var("TBUS_DEVICE_ID")
        && let Ok(id) = v.parse::<u32>()
    {
        cfg.device_id = id;
    }
    if let Ok(v) = std::env::var("TBUS_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.invocation_timeout_ms = ms;
    }
}
