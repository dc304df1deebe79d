use crate::error::{FleetError, Result};
use crate::protocol::{ServiceEntry, ServiceId, STANDBY};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File each service directory must contain to be discovered.
pub const MANIFEST_FILE: &str = "service.toml";

/// How to launch one service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCatalogEntry {
    pub id: String,
    /// Command to execute
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    /// Directory for the rotating stdout/stderr log (agent log dir if unset)
    pub log_dir: Option<PathBuf>,
    /// Where a named config fetched from the controller API is written
    pub config_file: Option<PathBuf>,
}

impl ServiceCatalogEntry {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            log_dir: None,
            config_file: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }
}

/// On-disk `service.toml`. Relative paths resolve against the service directory.
#[derive(Debug, Deserialize)]
struct ServiceManifest {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
    log_dir: Option<PathBuf>,
    config_file: Option<PathBuf>,
}

/// Services this agent can run. `standby` is always implicitly present.
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    entries: BTreeMap<String, ServiceCatalogEntry>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: ServiceCatalogEntry) {
        if entry.id.eq_ignore_ascii_case(STANDBY) {
            warn!("Ignoring catalog entry named '{}': reserved", entry.id);
            return;
        }
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn with(mut self, entry: ServiceCatalogEntry) -> Self {
        self.register(entry);
        self
    }

    /// Scan `dir/<service>/service.toml` manifests.
    pub async fn discover(dir: &Path) -> Result<Self> {
        let mut catalog = Self::new();
        if !dir.exists() {
            warn!("Services directory {} does not exist", dir.display());
            return Ok(catalog);
        }

        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let manifest_path = path.join(MANIFEST_FILE);
            if !manifest_path.exists() {
                continue;
            }

            match load_manifest(&path, &manifest_path).await {
                Ok(entry) => {
                    info!("Discovered service: {}", entry.id);
                    catalog.register(entry);
                }
                Err(e) => {
                    warn!("Failed to load manifest {:?}: {}", manifest_path, e);
                }
            }
        }

        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&ServiceCatalogEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        match id {
            ServiceId::Standby => true,
            ServiceId::Named(name) => self.entries.contains_key(name),
        }
    }

    /// Validate a raw service name from a request.
    pub fn resolve(&self, raw: &str) -> Result<ServiceId> {
        if raw.trim().is_empty() {
            return Err(FleetError::validation("empty service name"));
        }
        let id = ServiceId::parse(raw);
        if self.contains(&id) {
            Ok(id)
        } else {
            Err(FleetError::validation(format!("unknown service: {}", raw.trim())))
        }
    }

    /// All ids, `standby` first then case-insensitive order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort_by_key(|n| n.to_lowercase());
        names.insert(0, STANDBY.to_string());
        names
    }

    /// Per-service enabled flags with exactly one enabled entry.
    pub fn service_entries(&self, desired: &ServiceId) -> Vec<ServiceEntry> {
        self.names()
            .into_iter()
            .map(|name| ServiceEntry {
                enabled: name == desired.as_str(),
                name,
            })
            .collect()
    }
}

async fn load_manifest(service_dir: &Path, manifest_path: &Path) -> Result<ServiceCatalogEntry> {
    let content = tokio::fs::read_to_string(manifest_path).await?;
    let manifest: ServiceManifest = toml::from_str(&content)
        .map_err(|e| FleetError::Config(format!("invalid manifest: {e}")))?;

    let id = service_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FleetError::Config("service directory has no usable name".into()))?;

    let resolve = |p: PathBuf| {
        if p.is_absolute() {
            p
        } else {
            service_dir.join(p)
        }
    };

    let mut entry = ServiceCatalogEntry::new(id, manifest.command)
        .args(manifest.args)
        .working_dir(manifest.cwd.map(resolve).unwrap_or_else(|| service_dir.to_path_buf()));

    let mut env: Vec<_> = manifest.env.into_iter().collect();
    env.sort();
    for (key, value) in env {
        entry = entry.env(key, value);
    }
    if let Some(dir) = manifest.log_dir {
        entry = entry.log_dir(resolve(dir));
    }
    if let Some(file) = manifest.config_file {
        entry = entry.config_file(resolve(file));
    }

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_put_standby_first() {
        let catalog = ServiceCatalog::new()
            .with(ServiceCatalogEntry::new("osc", "true"))
            .with(ServiceCatalogEntry::new("MIDI", "true"))
            .with(ServiceCatalogEntry::new("companion", "true"));

        assert_eq!(catalog.names(), vec!["standby", "companion", "MIDI", "osc"]);
    }

    #[test]
    fn resolve_rejects_unknown_services() {
        let catalog = ServiceCatalog::new().with(ServiceCatalogEntry::new("MIDI", "true"));

        assert_eq!(catalog.resolve("MIDI").unwrap(), ServiceId::Named("MIDI".into()));
        assert_eq!(catalog.resolve("standby").unwrap(), ServiceId::Standby);
        assert!(matches!(catalog.resolve("DMX"), Err(FleetError::Validation(_))));
        assert!(matches!(catalog.resolve("  "), Err(FleetError::Validation(_))));
    }

    #[test]
    fn standby_name_is_reserved() {
        let catalog = ServiceCatalog::new().with(ServiceCatalogEntry::new("standby", "sleep"));
        assert!(catalog.get("standby").is_none());
        assert_eq!(catalog.names(), vec!["standby"]);
    }

    #[test]
    fn service_entries_enable_only_desired() {
        let catalog = ServiceCatalog::new().with(ServiceCatalogEntry::new("OSC", "true"));
        let entries = catalog.service_entries(&ServiceId::parse("OSC"));
        assert_eq!(entries.iter().filter(|e| e.enabled).count(), 1);
        assert!(entries.iter().any(|e| e.name == "OSC" && e.enabled));
    }

    #[tokio::test]
    async fn discover_reads_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let midi = dir.path().join("MIDI");
        std::fs::create_dir_all(&midi).unwrap();
        std::fs::write(
            midi.join(MANIFEST_FILE),
            r#"
command = "python3"
args = ["service.py"]
config_file = "map.json"

[env]
PYTHONUNBUFFERED = "1"
"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("no-manifest")).unwrap();
        let broken = dir.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(MANIFEST_FILE), "command = [").unwrap();

        let catalog = ServiceCatalog::discover(dir.path()).await.unwrap();
        assert_eq!(catalog.names(), vec!["standby", "MIDI"]);

        let entry = catalog.get("MIDI").unwrap();
        assert_eq!(entry.command, "python3");
        assert_eq!(entry.args, vec!["service.py"]);
        assert_eq!(entry.working_dir.as_deref(), Some(midi.as_path()));
        assert_eq!(entry.config_file, Some(midi.join("map.json")));
        assert_eq!(entry.env, vec![("PYTHONUNBUFFERED".into(), "1".into())]);
    }
}
