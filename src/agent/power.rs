use crate::error::{FleetError, Result};
use crate::protocol::PowerAction;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn execute(&self, action: PowerAction) -> Result<()>;
}

/// Runs the OS shutdown/reboot commands, trying sudo first.
pub struct SystemPower;

impl SystemPower {
    fn variants(action: PowerAction) -> &'static [&'static [&'static str]] {
        match action {
            PowerAction::Shutdown => &[
                &["sudo", "shutdown", "-h", "now"],
                &["sudo", "/sbin/shutdown", "-h", "now"],
                &["shutdown", "-h", "now"],
            ],
            PowerAction::Reboot => &[&["sudo", "reboot"], &["sudo", "/sbin/reboot"], &["reboot"]],
        }
    }
}

#[async_trait]
impl PowerControl for SystemPower {
    /// The first variant that spawns wins; its exit is not awaited since the
    /// machine is going down.
    async fn execute(&self, action: PowerAction) -> Result<()> {
        for variant in Self::variants(action) {
            let (cmd, args) = variant.split_first().ok_or_else(|| {
                FleetError::validation(format!("no command for {action}"))
            })?;
            debug!("Trying power command: {} {:?}", cmd, args);

            match Command::new(cmd)
                .args(args.iter())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(_) => {
                    info!("Power action '{}' issued via {}", action, variant.join(" "));
                    return Ok(());
                }
                Err(e) => warn!("Power command {} failed: {}", variant.join(" "), e),
            }
        }

        Err(FleetError::ProcessSpawn {
            service: action.to_string(),
            reason: "no power command could be executed".into(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingPower {
        executed: Mutex<Vec<PowerAction>>,
    }

    impl RecordingPower {
        pub fn executed(&self) -> Vec<PowerAction> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PowerControl for RecordingPower {
        async fn execute(&self, action: PowerAction) -> Result<()> {
            self.executed.lock().unwrap().push(action);
            Ok(())
        }
    }
}
