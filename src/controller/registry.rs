//! Live view of the fleet.
//!
//! Entries are refreshed by AGENT_STATUS and SERVICE_ACK datagrams. Liveness
//! is never stored: every read compares `last_seen` against the status TTL.

use super::store::DeviceStore;
use crate::error::{FleetError, Result};
use crate::protocol::{AgentStatus, Heartbeat, ServiceAck, ServiceEntry, ServiceId, ServiceState};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Assigned vs. reported index after a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCheck {
    pub assigned: u32,
    pub reported: Option<u32>,
}

impl IndexCheck {
    pub fn needs_correction(&self) -> bool {
        self.reported != Some(self.assigned)
    }
}

/// Copy of one device as seen by the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    pub serial: String,
    /// Index assigned (and persisted) by the controller
    pub index: Option<u32>,
    /// Index the agent last reported
    pub reported_index: Option<u32>,
    pub host: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub ip: Option<IpAddr>,
    pub online: bool,
    pub last_seen_secs: Option<f64>,
    pub services: Vec<ServiceEntry>,
    pub available_services: Vec<String>,
    pub service_state: Option<ServiceState>,
    pub heartbeat: Heartbeat,
    pub server_api: Option<String>,
    pub desired_service: Option<ServiceId>,
    pub desired_config: Option<String>,
}

struct RegistryEntry {
    status: AgentStatus,
    ip: IpAddr,
    last_seen: Instant,
}

struct RegistryInner {
    entries: HashMap<String, RegistryEntry>,
    store: DeviceStore,
}

pub struct DeviceRegistry {
    ttl: Duration,
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new(store: DeviceStore, ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(RegistryInner {
                entries: HashMap::new(),
                store,
            }),
        }
    }

    /// Insert or replace the entry for `status.serial`, assigning a
    /// persistent index to unseen serials.
    pub async fn upsert_from_status(&self, status: AgentStatus, src: SocketAddr) -> Result<IndexCheck> {
        if status.serial.trim().is_empty() {
            return Err(FleetError::validation("AGENT_STATUS without serial"));
        }

        let mut inner = self.inner.lock().await;
        let assigned = inner.store.ensure(&status.serial, status.host.as_deref()).await?;
        let check = IndexCheck {
            assigned,
            reported: status.index,
        };
        debug!(serial = %status.serial, ip = %src.ip(), ?check, "Status recorded");

        inner.entries.insert(
            status.serial.clone(),
            RegistryEntry {
                status,
                ip: src.ip(),
                last_seen: Instant::now(),
            },
        );
        Ok(check)
    }

    /// Fold a SERVICE_ACK into the entry of its sender. Transition acks may
    /// carry no full state; their stage and progress are applied on top of
    /// the last known state.
    pub async fn update_from_service_ack(&self, ack: &ServiceAck) {
        let Some(ref serial) = ack.serial else {
            return;
        };
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(serial) else {
            return;
        };

        if !ack.services.is_empty() {
            entry.status.services = ack.services.clone();
        }
        let mut state = ack
            .service_state
            .clone()
            .or_else(|| entry.status.service_state.clone())
            .unwrap_or_default();
        state.transition = ack.transition;
        state.stage = Some(ack.stage.clone());
        if let Some(progress) = ack.progress {
            state.progress = progress;
        }
        entry.status.service_state = Some(state);
        entry.last_seen = Instant::now();
    }

    /// Record the index an agent confirmed via INDEX_ACK.
    pub async fn update_index(&self, serial: &str, index: Option<u32>) {
        let Some(index) = index else {
            return;
        };
        if let Some(entry) = self.inner.lock().await.entries.get_mut(serial) {
            entry.status.index = Some(index);
        }
    }

    pub async fn record_desired(&self, serial: &str, service: &ServiceId, config: Option<String>) -> Result<()> {
        self.inner
            .lock()
            .await
            .store
            .set_desired(serial, service, config)
            .await
    }

    /// Forget a device entirely. Returns the resequenced `(serial, index)`
    /// pairs, or `None` if the serial was unknown.
    pub async fn remove_device(&self, serial: &str) -> Result<Option<Vec<(String, u32)>>> {
        let mut inner = self.inner.lock().await;
        let changed = inner.store.remove(serial).await?;
        let live = inner.entries.remove(serial).is_some();
        match changed {
            Some(changed) => Ok(Some(changed)),
            None if live => Ok(Some(Vec::new())),
            None => Ok(None),
        }
    }

    pub async fn get_device(&self, serial: &str) -> Option<DeviceView> {
        let inner = self.inner.lock().await;
        self.view(&inner, serial)
    }

    /// Live devices plus persisted ones not seen since startup, ordered by
    /// index.
    pub async fn list_devices(&self) -> Vec<DeviceView> {
        let inner = self.inner.lock().await;
        let mut views: Vec<DeviceView> = inner
            .store
            .all()
            .map(|record| record.serial.as_str())
            .chain(inner.entries.keys().map(String::as_str))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .filter_map(|serial| self.view(&inner, serial))
            .collect();
        views.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.serial.cmp(&b.serial)));
        views
    }

    pub async fn online_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .entries
            .values()
            .filter(|entry| entry.last_seen.elapsed() < self.ttl)
            .count()
    }

    fn view(&self, inner: &RegistryInner, serial: &str) -> Option<DeviceView> {
        let record = inner.store.get(serial);
        let entry = inner.entries.get(serial);
        if record.is_none() && entry.is_none() {
            return None;
        }

        let mut view = DeviceView {
            serial: serial.to_string(),
            index: record.map(|r| r.index),
            reported_index: None,
            host: record.and_then(|r| r.host.clone()),
            name: None,
            version: None,
            ip: None,
            online: false,
            last_seen_secs: None,
            services: Vec::new(),
            available_services: Vec::new(),
            service_state: None,
            heartbeat: Heartbeat::default(),
            server_api: None,
            desired_service: record.and_then(|r| r.desired_service.clone()),
            desired_config: record.and_then(|r| r.desired_config.clone()),
        };

        if let Some(entry) = entry {
            let age = entry.last_seen.elapsed();
            let status = &entry.status;
            view.reported_index = status.index;
            view.host = status.host.clone().or(view.host);
            view.name = status.name.clone();
            view.version = status.version.clone();
            view.ip = Some(entry.ip);
            view.online = age < self.ttl;
            view.last_seen_secs = Some(age.as_secs_f64());
            view.services = status.services.clone();
            view.available_services = status.available_services.clone();
            view.service_state = status.service_state.clone();
            view.heartbeat = status.heartbeat.clone();
            view.server_api = status.server_api.clone();
        }
        Some(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(serial: &str, index: Option<u32>) -> AgentStatus {
        AgentStatus {
            serial: serial.into(),
            index,
            name: None,
            host: Some(format!("host-{serial}")),
            version: Some("0.1.0".into()),
            services: Vec::new(),
            available_services: vec!["standby".into(), "MIDI".into()],
            service_state: None,
            heartbeat: Heartbeat::default(),
            server_api: None,
        }
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 37020))
    }

    async fn registry(dir: &tempfile::TempDir) -> DeviceRegistry {
        let store = DeviceStore::load(dir.path().join("devices.json")).await.unwrap();
        DeviceRegistry::new(store, Duration::from_secs(6))
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_serial() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir).await;

        let first = registry.upsert_from_status(status("a", None), addr(5)).await.unwrap();
        let again = registry.upsert_from_status(status("a", Some(0)), addr(6)).await.unwrap();

        assert_eq!(first, IndexCheck { assigned: 0, reported: None });
        assert!(first.needs_correction());
        assert!(!again.needs_correction());

        let devices = registry.list_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].ip, Some(addr(6).ip()));
    }

    #[tokio::test]
    async fn statuses_without_serial_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir).await;
        let err = registry.upsert_from_status(status(" ", None), addr(1)).await.unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
        assert!(registry.list_devices().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_goes_offline_but_stays_listed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir).await;
        registry.upsert_from_status(status("a", Some(0)), addr(5)).await.unwrap();
        assert!(registry.get_device("a").await.unwrap().online);

        tokio::time::advance(Duration::from_secs(7)).await;

        let device = registry.get_device("a").await.unwrap();
        assert!(!device.online);
        assert_eq!(registry.online_count().await, 0);
        assert_eq!(registry.list_devices().await.len(), 1);
    }

    #[tokio::test]
    async fn persisted_devices_are_listed_offline() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = registry(&dir).await;
            registry.upsert_from_status(status("a", Some(0)), addr(5)).await.unwrap();
            registry
                .record_desired("a", &ServiceId::parse("MIDI"), None)
                .await
                .unwrap();
        }

        let registry = registry(&dir).await;
        let devices = registry.list_devices().await;
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].online);
        assert_eq!(devices[0].ip, None);
        assert_eq!(devices[0].index, Some(0));
        assert_eq!(devices[0].desired_service, Some(ServiceId::parse("MIDI")));
    }

    #[tokio::test]
    async fn transition_ack_updates_stage() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir).await;
        registry.upsert_from_status(status("a", Some(0)), addr(5)).await.unwrap();

        let ack = ServiceAck {
            request_id: "r".into(),
            serial: Some("a".into()),
            timestamp: 0.0,
            service: "MIDI".into(),
            ok: true,
            error: None,
            transition: true,
            stage: "cerrando".into(),
            progress: Some(5),
            config: None,
            services: Vec::new(),
            service_state: None,
        };
        registry.update_from_service_ack(&ack).await;

        let state = registry.get_device("a").await.unwrap().service_state.unwrap();
        assert!(state.transition);
        assert_eq!(state.stage.as_deref(), Some("cerrando"));
        assert_eq!(state.progress, 5);
    }

    #[tokio::test]
    async fn index_ack_updates_reported_index() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir).await;
        registry.upsert_from_status(status("a", None), addr(5)).await.unwrap();
        registry.update_index("a", Some(0)).await;
        assert_eq!(registry.get_device("a").await.unwrap().reported_index, Some(0));
    }

    #[tokio::test]
    async fn remove_device_resequences() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir).await;
        for (serial, last) in [("a", 1), ("b", 2), ("c", 3)] {
            registry.upsert_from_status(status(serial, None), addr(last)).await.unwrap();
        }

        let changed = registry.remove_device("a").await.unwrap().unwrap();
        assert_eq!(changed, vec![("b".to_string(), 0), ("c".to_string(), 1)]);
        assert!(registry.get_device("a").await.is_none());
        assert!(registry.remove_device("a").await.unwrap().is_none());
    }
}
