//! Persisted agent identity and desired service (`agent.json`).
//!
//! This file is the single source of truth for what the agent should be
//! running. Every mutation goes through [`AgentStore`], which serializes
//! read-modify-write under one lock and writes via temp file plus rename.

use super::catalog::ServiceCatalog;
use crate::env::{env_opt, EnvVar};
use crate::error::Result;
use crate::protocol::ServiceId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

const CPUINFO_PATH: &str = "/proc/cpuinfo";
const MACHINE_ID_PATH: &str = "/etc/machine-id";
const UNKNOWN_SERIAL: &str = "unknown-serial";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentIdentity {
    pub serial: String,
    pub host: String,
    pub name: Option<String>,
    /// Ordinal index assigned by the controller
    pub index: Option<u32>,
}

impl AgentIdentity {
    pub fn new(serial: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            host: host.into(),
            ..Default::default()
        }
    }

    /// Identity of this machine. `OMI_AGENT_SERIAL` / `OMI_AGENT_HOST`
    /// override detection.
    pub fn detect() -> Self {
        let serial = env_opt(EnvVar::OmiAgentSerial).unwrap_or_else(detect_serial);
        let host = env_opt(EnvVar::OmiAgentHost).unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        Self::new(serial, host)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRecord {
    pub version: String,
    pub identity: AgentIdentity,
    pub desired_service: ServiceId,
    pub desired_config: Option<String>,
}

impl Default for AgentRecord {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            identity: AgentIdentity::default(),
            desired_service: ServiceId::Standby,
            desired_config: None,
        }
    }
}

pub struct AgentStore {
    path: PathBuf,
    record: Mutex<AgentRecord>,
}

impl AgentStore {
    /// Load `path`, reconciling it with the detected identity and catalog.
    ///
    /// A different serial means the file came from another board, so it is
    /// regenerated. Host or version drift is rewritten in place. A desired
    /// service missing from the catalog resets to standby.
    pub async fn load_or_init(path: impl Into<PathBuf>, detected: AgentIdentity, catalog: &ServiceCatalog) -> Result<Self> {
        let path = path.into();
        let loaded = read_record(&path).await;

        let mut record = match loaded {
            Some(existing) if existing.identity.serial == detected.serial => existing,
            Some(existing) => {
                warn!(
                    old = %existing.identity.serial,
                    new = %detected.serial,
                    "Agent state belongs to another serial, regenerating"
                );
                AgentRecord {
                    identity: detected.clone(),
                    ..Default::default()
                }
            }
            None => AgentRecord {
                identity: detected.clone(),
                ..Default::default()
            },
        };

        record.version = env!("CARGO_PKG_VERSION").to_string();
        record.identity.host = detected.host;
        if !catalog.contains(&record.desired_service) {
            warn!(
                service = %record.desired_service,
                "Desired service not in catalog, falling back to standby"
            );
            record.desired_service = ServiceId::Standby;
            record.desired_config = None;
        }

        write_atomic(&path, &record).await?;
        info!(
            serial = %record.identity.serial,
            desired = %record.desired_service,
            "Agent state ready at {}",
            path.display()
        );

        Ok(Self {
            path,
            record: Mutex::new(record),
        })
    }

    /// Read the file without reconciling anything.
    pub async fn peek(path: &Path) -> Option<AgentRecord> {
        read_record(path).await
    }

    pub async fn record(&self) -> AgentRecord {
        self.record.lock().await.clone()
    }

    pub async fn identity(&self) -> AgentIdentity {
        self.record.lock().await.identity.clone()
    }

    pub async fn desired(&self) -> (ServiceId, Option<String>) {
        let record = self.record.lock().await;
        (record.desired_service.clone(), record.desired_config.clone())
    }

    pub async fn set_desired(&self, service: &ServiceId, config: Option<String>) -> Result<()> {
        let config = if service.is_standby() { None } else { config };
        self.update(|record| {
            record.desired_service = service.clone();
            record.desired_config = config;
        })
        .await
    }

    pub async fn set_index(&self, index: u32) -> Result<()> {
        self.update(|record| record.identity.index = Some(index)).await
    }

    /// In-memory state only changes once the file is written.
    async fn update(&self, mutate: impl FnOnce(&mut AgentRecord)) -> Result<()> {
        let mut guard = self.record.lock().await;
        let mut next = guard.clone();
        mutate(&mut next);
        if next != *guard {
            write_atomic(&self.path, &next).await?;
            *guard = next;
        }
        Ok(())
    }
}

async fn read_record(path: &Path) -> Option<AgentRecord> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Ignoring unreadable agent state {}: {}", path.display(), e);
            None
        }
    }
}

async fn write_atomic(path: &Path, record: &AgentRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn detect_serial() -> String {
    if let Ok(cpuinfo) = std::fs::read_to_string(CPUINFO_PATH) {
        if let Some(serial) = parse_cpuinfo_serial(&cpuinfo) {
            return serial;
        }
    }
    std::fs::read_to_string(MACHINE_ID_PATH)
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| UNKNOWN_SERIAL.to_string())
}

fn parse_cpuinfo_serial(cpuinfo: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "Serial" {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}
