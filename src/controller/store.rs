use crate::error::Result;
use crate::protocol::{unix_timestamp, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Persisted identity of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub serial: String,
    #[serde(default)]
    pub host: Option<String>,
    /// Ordinal index assigned by this controller
    pub index: u32,
    #[serde(default)]
    pub desired_service: Option<ServiceId>,
    #[serde(default)]
    pub desired_config: Option<String>,
    #[serde(default)]
    pub created_at: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DevicesFile {
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

/// `devices.json`: every device ever seen, keyed by serial.
pub struct DeviceStore {
    path: PathBuf,
    devices: BTreeMap<String, DeviceRecord>,
}

impl DeviceStore {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let devices = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<DevicesFile>(&content) {
                Ok(file) => file.devices,
                Err(e) => {
                    warn!("Ignoring unreadable device store {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        info!(count = devices.len(), "Loaded device store from {}", path.display());
        Ok(Self {
            path,
            devices: devices.into_iter().map(|d| (d.serial.clone(), d)).collect(),
        })
    }

    pub fn get(&self, serial: &str) -> Option<&DeviceRecord> {
        self.devices.get(serial)
    }

    pub fn all(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Smallest non-negative integer no known device holds.
    fn next_free_index(&self) -> u32 {
        let used: BTreeSet<u32> = self.devices.values().map(|d| d.index).collect();
        (0..).find(|i| !used.contains(i)).unwrap_or_default()
    }

    /// Index of `serial`, assigning and persisting one for a new device.
    /// Host changes are persisted too.
    pub async fn ensure(&mut self, serial: &str, host: Option<&str>) -> Result<u32> {
        if let Some(existing) = self.devices.get(serial) {
            let index = existing.index;
            if host.is_some() && existing.host.as_deref() != host {
                let mut updated = existing.clone();
                updated.host = host.map(str::to_string);
                self.commit(updated).await?;
            }
            return Ok(index);
        }

        let record = DeviceRecord {
            serial: serial.to_string(),
            host: host.map(str::to_string),
            index: self.next_free_index(),
            desired_service: None,
            desired_config: None,
            created_at: unix_timestamp(),
        };
        let index = record.index;
        info!(serial, index, "New device assigned index");
        self.commit(record).await?;
        Ok(index)
    }

    pub async fn set_desired(&mut self, serial: &str, service: &ServiceId, config: Option<String>) -> Result<()> {
        let Some(existing) = self.devices.get(serial) else {
            return Ok(());
        };
        let mut updated = existing.clone();
        updated.desired_service = Some(service.clone());
        updated.desired_config = config;
        self.commit(updated).await
    }

    /// Remove `serial` and compact the remaining indices to `0..n` keeping
    /// their relative order. Returns the devices whose index changed.
    pub async fn remove(&mut self, serial: &str) -> Result<Option<Vec<(String, u32)>>> {
        let mut next = self.devices.clone();
        if next.remove(serial).is_none() {
            return Ok(None);
        }

        let mut ordered: Vec<&mut DeviceRecord> = next.values_mut().collect();
        ordered.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.serial.cmp(&b.serial)));
        let mut changed = Vec::new();
        for (position, record) in ordered.into_iter().enumerate() {
            let position = position as u32;
            if record.index != position {
                record.index = position;
                changed.push((record.serial.clone(), position));
            }
        }

        write_atomic(&self.path, &next).await?;
        self.devices = next;
        info!(serial, resequenced = changed.len(), "Device forgotten");
        Ok(Some(changed))
    }

    async fn commit(&mut self, record: DeviceRecord) -> Result<()> {
        let mut next = self.devices.clone();
        next.insert(record.serial.clone(), record);
        write_atomic(&self.path, &next).await?;
        self.devices = next;
        Ok(())
    }
}

async fn write_atomic(path: &Path, devices: &BTreeMap<String, DeviceRecord>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = DevicesFile {
        devices: devices.values().cloned().collect(),
    };
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(&file)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn indices_fill_smallest_gap() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DeviceStore::load(dir.path().join("devices.json")).await.unwrap();

        assert_eq!(store.ensure("a", Some("pi-a")).await.unwrap(), 0);
        assert_eq!(store.ensure("b", None).await.unwrap(), 1);
        assert_eq!(store.ensure("c", None).await.unwrap(), 2);
        assert_eq!(store.ensure("a", Some("pi-a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn assignments_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        {
            let mut store = DeviceStore::load(&path).await.unwrap();
            store.ensure("a", None).await.unwrap();
            store.ensure("b", Some("pi-b")).await.unwrap();
            store
                .set_desired("b", &ServiceId::parse("MIDI"), Some("live".into()))
                .await
                .unwrap();
        }

        let store = DeviceStore::load(&path).await.unwrap();
        let b = store.get("b").unwrap();
        assert_eq!(b.index, 1);
        assert_eq!(b.host.as_deref(), Some("pi-b"));
        assert_eq!(b.desired_service, Some(ServiceId::parse("MIDI")));
        assert_eq!(b.desired_config.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn remove_resequences_in_previous_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DeviceStore::load(dir.path().join("devices.json")).await.unwrap();
        for serial in ["z", "y", "x", "w"] {
            store.ensure(serial, None).await.unwrap();
        }

        let changed = store.remove("y").await.unwrap().unwrap();
        assert_eq!(changed, vec![("x".to_string(), 1), ("w".to_string(), 2)]);
        assert_eq!(store.get("z").unwrap().index, 0);
        assert_eq!(store.get("w").unwrap().index, 2);

        assert!(store.remove("missing").await.unwrap().is_none());
        assert_eq!(store.ensure("v", None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "{ nope").unwrap();
        let store = DeviceStore::load(&path).await.unwrap();
        assert_eq!(store.all().count(), 0);
    }
}
