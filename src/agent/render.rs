use super::heartbeat::primary_ip;
use crate::protocol::{Heartbeat, ServiceState};
use serde::Serialize;
use std::sync::Mutex;
use tracing::info;

/// Everything a local display needs, refreshed once per second.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub serial: String,
    pub host: String,
    pub index: Option<u32>,
    pub server_online: bool,
    pub heartbeat: Heartbeat,
    pub service_state: ServiceState,
}

/// Sink for status snapshots (the on-device display driver lives outside
/// this crate).
pub trait StatusRenderer: Send + Sync {
    fn render(&self, snapshot: &StatusSnapshot);
}

/// Logs phase and server-link changes.
#[derive(Default)]
pub struct LogRenderer {
    last: Mutex<Option<(String, bool)>>,
}

impl LogRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusRenderer for LogRenderer {
    fn render(&self, snapshot: &StatusSnapshot) {
        let current = (snapshot.service_state.phase.label(), snapshot.server_online);
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if last.as_ref() == Some(&current) {
            return;
        }
        info!(
            index = ?snapshot.index,
            server_online = snapshot.server_online,
            ip = ?primary_ip(&snapshot.heartbeat),
            cpu = ?snapshot.heartbeat.cpu,
            temp = ?snapshot.heartbeat.temp,
            "Status: {}",
            current.0
        );
        *last = Some(current);
    }
}
