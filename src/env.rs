use std::path::PathBuf;

/// Environment variables understood by `omi`.
#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    OmiConfigDir,
    OmiDataDir,
    OmiServicesDir,
    OmiServiceId,
    OmiAgentSerial,
    OmiAgentHost,
    OmiServerApi,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OmiConfigDir => "OMI_CONFIG_DIR",
            Self::OmiDataDir => "OMI_DATA_DIR",
            Self::OmiServicesDir => "OMI_SERVICES_DIR",
            Self::OmiServiceId => "OMI_SERVICE_ID",
            Self::OmiAgentSerial => "OMI_AGENT_SERIAL",
            Self::OmiAgentHost => "OMI_AGENT_HOST",
            Self::OmiServerApi => "OMI_SERVER_API",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const FALLBACK_DATA_DIR: &str = "~/.local/share";
const OMI_SUBDIR: &str = "omi";

/// Non-empty value of an environment variable.
pub fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str())
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// OMI config directory ($OMI_CONFIG_DIR or ~/.config/omi)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(EnvVar::OmiConfigDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(OMI_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// OMI data directory ($OMI_DATA_DIR or ~/.local/share/omi)
pub fn data_dir() -> PathBuf {
    let dir = env_opt(EnvVar::OmiDataDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
                .join(OMI_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Service manifests directory ($OMI_SERVICES_DIR or <data>/services)
pub fn services_dir() -> PathBuf {
    env_opt(EnvVar::OmiServicesDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("services"))
}

/// Log directory (<data>/logs)
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Agent identity/desired-service file (<data>/agent.json)
pub fn agent_state_path() -> PathBuf {
    data_dir().join("agent.json")
}

/// Controller device store (<data>/devices.json)
pub fn devices_path() -> PathBuf {
    data_dir().join("devices.json")
}
