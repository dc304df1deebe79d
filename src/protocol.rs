//! UDP wire protocol shared by the agent and the controller.
//!
//! Every datagram carries exactly one JSON object whose `type` field selects
//! the message. Commands carry a `request_id`; the matching acknowledgement
//! echoes it so the controller can correlate replies that arrive late,
//! duplicated or out of order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest datagram either side will read.
pub const MAX_DATAGRAM: usize = 65_507;

/// Name of the implicit "no process running" service.
pub const STANDBY: &str = "standby";

/// Identifier of a catalog entry. `Standby` is a distinct variant so the
/// "nothing running" case cannot be confused with a real service name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServiceId {
    #[default]
    Standby,
    Named(String),
}

impl ServiceId {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case(STANDBY) {
            Self::Standby
        } else {
            Self::Named(raw.to_string())
        }
    }

    pub fn is_standby(&self) -> bool {
        matches!(self, Self::Standby)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Standby => STANDBY,
            Self::Named(name) => name,
        }
    }
}

impl From<String> for ServiceId {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> Self {
        id.as_str().to_string()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent state machine as reported in snapshots.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentPhase {
    #[default]
    Standby,
    Running {
        service: String,
    },
    Transitioning {
        from: ServiceId,
        to: ServiceId,
        stage: String,
    },
    Error {
        service: String,
        reason: String,
    },
}

impl AgentPhase {
    pub fn label(&self) -> String {
        match self {
            Self::Standby => STANDBY.to_string(),
            Self::Running { service } => format!("running({service})"),
            Self::Transitioning { from, to, stage } => format!("{from}->{to} [{stage}]"),
            Self::Error { service, reason } => format!("error({service}: {reason})"),
        }
    }
}

/// Observable service state of one agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceState {
    /// Desired service
    pub expected: ServiceId,
    /// Service the supervisor last launched
    pub actual: Option<String>,
    pub running: bool,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub returncode: Option<i32>,
    pub transition: bool,
    pub stage: Option<String>,
    /// 0-100
    pub progress: u8,
    pub config_name: Option<String>,
    /// Orchestrator-level error (crash or failed transition)
    pub error: Option<String>,
    pub phase: AgentPhase,
    pub timestamp: f64,
}

impl ServiceState {
    /// The only unhealthy condition: a real service is desired but nothing runs.
    pub fn is_unhealthy(&self) -> bool {
        !self.expected.is_standby() && !self.running
    }
}

/// Legacy per-service enabled flag list, derived from the single desired id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceInfo {
    pub iface: Option<String>,
    pub ip: Option<String>,
    pub prefix: Option<u8>,
    pub cidr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    pub cpu: Option<f32>,
    pub temp: Option<f32>,
    pub ifaces: Vec<InterfaceInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Shutdown,
    Reboot,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::Reboot => "reboot",
        }
    }
}

impl FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shutdown" => Ok(Self::Shutdown),
            "reboot" => Ok(Self::Reboot),
            other => Err(format!("unsupported power action: {other}")),
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discover {
    pub server_ip: String,
    pub reply_port: u16,
    #[serde(default)]
    pub http_port: Option<u16>,
    #[serde(default)]
    pub ts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub serial: String,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub available_services: Vec<String>,
    #[serde(default)]
    pub service_state: Option<ServiceState>,
    #[serde(default)]
    pub heartbeat: Heartbeat,
    #[serde(default)]
    pub server_api: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetService {
    pub service: String,
    pub request_id: String,
    #[serde(default)]
    pub reply_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAck {
    pub request_id: String,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub timestamp: f64,
    pub service: String,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub transition: bool,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub service_state: Option<ServiceState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerCommand {
    pub action: String,
    pub request_id: String,
    #[serde(default)]
    pub reply_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerAck {
    pub request_id: String,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub action: String,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetIndex {
    pub index: u32,
    pub request_id: String,
    #[serde(default)]
    pub reply_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAck {
    pub request_id: String,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub timestamp: f64,
    pub ok: bool,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Discover(Discover),
    AgentStatus(AgentStatus),
    SetService(SetService),
    ServiceAck(ServiceAck),
    Power(PowerCommand),
    PowerAck(PowerAck),
    SetIndex(SetIndex),
    IndexAck(IndexAck),
}

impl Message {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discover(_) => "DISCOVER",
            Self::AgentStatus(_) => "AGENT_STATUS",
            Self::SetService(_) => "SET_SERVICE",
            Self::ServiceAck(_) => "SERVICE_ACK",
            Self::Power(_) => "POWER",
            Self::PowerAck(_) => "POWER_ACK",
            Self::SetIndex(_) => "SET_INDEX",
            Self::IndexAck(_) => "INDEX_ACK",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::SetService(m) => Some(&m.request_id),
            Self::ServiceAck(m) => Some(&m.request_id),
            Self::Power(m) => Some(&m.request_id),
            Self::PowerAck(m) => Some(&m.request_id),
            Self::SetIndex(m) => Some(&m.request_id),
            Self::IndexAck(m) => Some(&m.request_id),
            Self::Discover(_) | Self::AgentStatus(_) => None,
        }
    }

    /// `(ok, error)` of an acknowledgement.
    pub fn ack_outcome(&self) -> Option<(bool, Option<&str>)> {
        match self {
            Self::ServiceAck(m) => Some((m.ok, m.error.as_deref())),
            Self::PowerAck(m) => Some((m.ok, m.error.as_deref())),
            Self::IndexAck(m) => Some((m.ok, m.error.as_deref())),
            _ => None,
        }
    }
}

/// Seconds since the Unix epoch, as carried in `ts`/`timestamp` fields.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_id_special_cases_standby() {
        assert_eq!(ServiceId::parse("standby"), ServiceId::Standby);
        assert_eq!(ServiceId::parse(" STANDBY "), ServiceId::Standby);
        assert_eq!(ServiceId::parse(""), ServiceId::Standby);
        assert_eq!(ServiceId::parse("MIDI"), ServiceId::Named("MIDI".into()));

        let json = serde_json::to_string(&ServiceId::Standby).unwrap();
        assert_eq!(json, "\"standby\"");
    }

    #[test]
    fn set_service_wire_shape() {
        let msg = Message::SetService(SetService {
            service: "MIDI".into(),
            request_id: "abc".into(),
            reply_port: Some(37021),
            config: None,
        });
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "SET_SERVICE");
        assert_eq!(value["service"], "MIDI");
        assert_eq!(value["request_id"], "abc");
        assert!(value.get("config").is_none());
    }

    #[test]
    fn decodes_sparse_agent_status() {
        let raw = br#"{"type":"AGENT_STATUS","serial":"0001","host":"pi-1","index":2}"#;
        let Message::AgentStatus(status) = Message::decode(raw).unwrap() else {
            panic!("expected AGENT_STATUS");
        };
        assert_eq!(status.serial, "0001");
        assert_eq!(status.index, Some(2));
        assert!(status.services.is_empty());
        assert!(status.heartbeat.ifaces.is_empty());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Message::decode(br#"{"type":"HELLO"}"#).is_err());
        assert!(Message::decode(b"not json").is_err());
    }

    #[test]
    fn ack_outcome_and_request_id() {
        let msg = Message::IndexAck(IndexAck {
            request_id: "r1".into(),
            serial: Some("s".into()),
            timestamp: 0.0,
            ok: false,
            index: None,
            error: Some("bad".into()),
        });
        assert_eq!(msg.request_id(), Some("r1"));
        assert_eq!(msg.ack_outcome(), Some((false, Some("bad"))));
        assert_eq!(msg.kind(), "INDEX_ACK");
    }

    #[test]
    fn unhealthy_only_when_service_expected_but_stopped() {
        let mut state = ServiceState::default();
        assert!(!state.is_unhealthy());
        state.expected = ServiceId::parse("OSC");
        assert!(state.is_unhealthy());
        state.running = true;
        assert!(!state.is_unhealthy());
    }

    #[test]
    fn power_action_parsing() {
        assert_eq!("Reboot".parse::<PowerAction>(), Ok(PowerAction::Reboot));
        assert!("halt".parse::<PowerAction>().is_err());
    }
}
