//! OMI controller - discovers agents on the LAN and sends them commands
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                omi controller               │
//! ├─────────────────────────────────────────────┤
//! │ CommandBroadcaster  (DISCOVER every 3s)     │
//! │   ├── PendingRequests (request_id → waiter) │
//! │   └── DeviceRegistry  (TTL 6s)              │
//! │         └── DeviceStore (devices.json)      │
//! └─────────────────────────────────────────────┘
//! ```

pub mod broadcaster;
pub mod pending;
pub mod registry;
pub mod store;

pub use broadcaster::{BroadcasterSettings, CommandBroadcaster, IndexOutcome};
pub use pending::{PendingHandle, PendingRequests};
pub use registry::{DeviceRegistry, DeviceView, IndexCheck};
pub use store::{DeviceRecord, DeviceStore};
