//! TOML settings for the agent and the controller.
//!
//! Both files are optional: a missing file yields the defaults below, and a
//! partially filled file only overrides the keys it names.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::env;

/// Shortest interval or timeout a settings file can ask for.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);
/// Longest interval or timeout a settings file can ask for.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Seconds from a settings file, clamped to `MIN_INTERVAL..=MAX_INTERVAL`.
/// Zero, negative and NaN values become the minimum.
fn secs(value: f64) -> Duration {
    if value.is_nan() {
        return MIN_INTERVAL;
    }
    let value = value.clamp(MIN_INTERVAL.as_secs_f64(), MAX_INTERVAL.as_secs_f64());
    Duration::from_secs_f64(value)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// HTTP port of the config API, advertised in DISCOVER
    pub http_port: u16,
    /// Address advertised in DISCOVER (detected when unset)
    pub advertise_ip: Option<String>,
    pub broadcast_ip: String,
    /// Port the agents listen on
    pub broadcast_port: u16,
    /// Port the controller listens on for agent replies
    pub reply_port: u16,
    pub discover_interval_secs: f64,
    pub status_ttl_secs: f64,
    pub service_timeout_secs: f64,
    pub command_timeout_secs: f64,
    pub devices_path: Option<PathBuf>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            http_port: 6982,
            advertise_ip: None,
            broadcast_ip: "255.255.255.255".to_string(),
            broadcast_port: 37020,
            reply_port: 37021,
            discover_interval_secs: 3.0,
            status_ttl_secs: 6.0,
            service_timeout_secs: 25.0,
            command_timeout_secs: 10.0,
            devices_path: None,
        }
    }
}

impl ControllerSettings {
    pub fn discover_interval(&self) -> Duration {
        secs(self.discover_interval_secs)
    }

    pub fn status_ttl(&self) -> Duration {
        secs(self.status_ttl_secs)
    }

    pub fn service_timeout(&self) -> Duration {
        secs(self.service_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        secs(self.command_timeout_secs)
    }

    pub fn devices_path(&self) -> PathBuf {
        self.devices_path.clone().unwrap_or_else(env::devices_path)
    }

    /// $OMI_CONFIG_DIR/controller.toml
    pub fn config_path() -> PathBuf {
        env::config_dir().join("controller.toml")
    }

    pub fn load() -> Result<Self> {
        load_toml(&Self::config_path())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Port the agent listens on for DISCOVER and commands
    pub listen_port: u16,
    /// Reply port used when a command omits `reply_port`
    pub reply_port: u16,
    pub monitor_interval_secs: f64,
    pub terminate_timeout_secs: f64,
    pub refresh_interval_secs: f64,
    pub server_timeout_secs: f64,
    /// Config API port assumed when DISCOVER omits `http_port`
    pub default_http_port: u16,
    pub services_dir: Option<PathBuf>,
    pub state_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            listen_port: 37020,
            reply_port: 37021,
            monitor_interval_secs: 2.0,
            terminate_timeout_secs: 5.0,
            refresh_interval_secs: 1.0,
            server_timeout_secs: 5.0,
            default_http_port: 8000,
            services_dir: None,
            state_path: None,
            log_dir: None,
        }
    }
}

impl AgentSettings {
    pub fn monitor_interval(&self) -> Duration {
        secs(self.monitor_interval_secs)
    }

    pub fn terminate_timeout(&self) -> Duration {
        secs(self.terminate_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        secs(self.refresh_interval_secs)
    }

    pub fn server_timeout(&self) -> Duration {
        secs(self.server_timeout_secs)
    }

    pub fn services_dir(&self) -> PathBuf {
        self.services_dir.clone().unwrap_or_else(env::services_dir)
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(env::agent_state_path)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(env::log_dir)
    }

    /// $OMI_CONFIG_DIR/agent.toml
    pub fn config_path() -> PathBuf {
        env::config_dir().join("agent.toml")
    }

    pub fn load() -> Result<Self> {
        load_toml(&Self::config_path())
    }
}

fn load_toml<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    tracing::trace!(path = %path.display(), "Loading settings");

    if !path.exists() {
        tracing::trace!("Settings file does not exist, using defaults");
        return Ok(T::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse settings from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_defaults_match_protocol_ports() {
        let settings = ControllerSettings::default();
        assert_eq!(settings.broadcast_port, 37020);
        assert_eq!(settings.reply_port, 37021);
        assert_eq!(settings.status_ttl(), Duration::from_secs(6));
        assert_eq!(settings.service_timeout(), Duration::from_secs(25));
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(&path, "monitor_interval_secs = 0.5\nlisten_port = 40000\n").unwrap();

        let settings: AgentSettings = load_toml(&path).unwrap();
        assert_eq!(settings.monitor_interval(), Duration::from_millis(500));
        assert_eq!(settings.listen_port, 40000);
        assert_eq!(settings.reply_port, 37021);
        assert_eq!(settings.terminate_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn degenerate_durations_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.toml");
        fs::write(
            &path,
            "discover_interval_secs = 0.0\nstatus_ttl_secs = -3.0\nservice_timeout_secs = inf\ncommand_timeout_secs = nan\n",
        )
        .unwrap();

        let settings: ControllerSettings = load_toml(&path).unwrap();
        assert_eq!(settings.discover_interval(), MIN_INTERVAL);
        assert_eq!(settings.status_ttl(), MIN_INTERVAL);
        assert_eq!(settings.service_timeout(), MAX_INTERVAL);
        assert_eq!(settings.command_timeout(), MIN_INTERVAL);

        let agent = AgentSettings {
            monitor_interval_secs: 0.0,
            terminate_timeout_secs: f64::INFINITY,
            ..Default::default()
        };
        assert_eq!(agent.monitor_interval(), MIN_INTERVAL);
        assert_eq!(agent.terminate_timeout(), MAX_INTERVAL);
    }

    #[tokio::test]
    async fn clamped_interval_can_drive_a_ticker() {
        let settings = ControllerSettings {
            discover_interval_secs: 0.0,
            ..Default::default()
        };
        let mut ticker = tokio::time::interval(settings.discover_interval());
        ticker.tick().await;
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings: ControllerSettings = load_toml(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings.http_port, 6982);
    }
}
