pub mod agent;
pub mod config;
pub mod controller;
pub mod env;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use error::{FleetError, Result};
