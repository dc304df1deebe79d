use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    /// Unknown service id, unknown device, or a malformed request.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("failed to start service '{service}': {reason}")]
    ProcessSpawn { service: String, reason: String },

    #[error("failed to stop service '{service}': {reason}")]
    ProcessStop { service: String, reason: String },

    #[error("no acknowledgement for {operation} within {timeout_secs:.1}s")]
    Timeout { operation: String, timeout_secs: f64 },

    #[error("{}", crash_message(.service, .returncode))]
    Crash {
        service: String,
        returncode: Option<i32>,
    },

    #[error("network error: {0}")]
    Network(String),

    /// The agent answered with `ok=false`.
    #[error("{0}")]
    Rejected(String),

    #[error("shutdown")]
    Shutdown,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn crash_message(service: &str, returncode: &Option<i32>) -> String {
    let label = service.to_uppercase();
    match returncode {
        Some(rc) => format!("{label} ERROR (rc={rc})"),
        None => format!("{label} ERROR"),
    }
}

impl FleetError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_secs: timeout.as_secs_f64(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
