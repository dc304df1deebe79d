//! OMI agent - runs on each device and keeps at most one service alive
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                 omi agent                  │
//! ├────────────────────────────────────────────┤
//! │ ProtocolHandler │ Orchestrator │ Refresh   │
//! │   (UDP 37020)   │ (monitor 2s) │ (1s)      │
//! ├────────────────────────────────────────────┤
//! │ Supervisor → one child: MIDI │ OSC │ ...   │
//! └────────────────────────────────────────────┘
//! ```

pub mod catalog;
pub mod config_client;
pub mod handler;
pub mod heartbeat;
pub mod orchestrator;
pub mod power;
pub mod render;
pub mod store;
pub mod supervisor;

pub use catalog::{ServiceCatalog, ServiceCatalogEntry};
pub use config_client::{ConfigSource, HttpConfigClient};
pub use handler::{HandlerSettings, ProtocolHandler};
pub use heartbeat::HeartbeatSampler;
pub use orchestrator::ServiceOrchestrator;
pub use power::{PowerControl, SystemPower};
pub use render::{LogRenderer, StatusRenderer, StatusSnapshot};
pub use store::{AgentIdentity, AgentStore};
pub use supervisor::{ProcessSupervisor, RuntimeEnv, Supervisor, SupervisorStatus};
