//! Desired-vs-observed service state for one agent.
//!
//! The orchestrator is the only writer of [`ServiceState`]: the protocol
//! handler opens a [`ServiceTransition`] with
//! [`ServiceOrchestrator::begin_transition`], applies the service through
//! it, and reads state back through [`ServiceOrchestrator::snapshot`].

use super::catalog::ServiceCatalog;
use super::config_client::ConfigSource;
use super::store::AgentStore;
use super::supervisor::Supervisor;
use crate::error::{FleetError, Result};
use crate::protocol::{unix_timestamp, AgentPhase, ServiceId, ServiceState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

pub const STAGE_CLOSING: &str = "cerrando";
pub const STAGE_OPENING: &str = "abriendo";
pub const STAGE_DONE: &str = "completado";
pub const STAGE_ERROR: &str = "error";

#[derive(Debug, Clone)]
struct Transition {
    from: ServiceId,
    to: ServiceId,
}

#[derive(Debug, Clone, Default)]
struct OrchestratorState {
    expected: ServiceId,
    config_name: Option<String>,
    transition: Option<Transition>,
    stage: Option<String>,
    progress: u8,
    error: Option<String>,
}

pub struct ServiceOrchestrator {
    catalog: Arc<ServiceCatalog>,
    supervisor: Arc<dyn Supervisor>,
    store: Arc<AgentStore>,
    configs: Arc<dyn ConfigSource>,
    state: Mutex<OrchestratorState>,
    /// Serializes transitions; the health monitor skips ticks while held.
    apply_lock: Mutex<()>,
    monitor_interval: Duration,
}

impl ServiceOrchestrator {
    pub fn new(
        catalog: Arc<ServiceCatalog>,
        supervisor: Arc<dyn Supervisor>,
        store: Arc<AgentStore>,
        configs: Arc<dyn ConfigSource>,
    ) -> Self {
        Self {
            catalog,
            supervisor,
            store,
            configs,
            state: Mutex::new(OrchestratorState::default()),
            apply_lock: Mutex::new(()),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<AgentStore> {
        &self.store
    }

    pub fn configs(&self) -> &Arc<dyn ConfigSource> {
        &self.configs
    }

    /// Launch the persisted desired service. The agent always boots in
    /// `Standby`; the stored config is reused without downloading it again.
    pub async fn boot(&self) -> Result<()> {
        let (desired, config) = self.store.desired().await;
        info!(service = %desired, "Restoring desired service");
        let _guard = self.apply_lock.lock().await;
        self.apply_inner(&desired, config, false).await
    }

    async fn apply_inner(&self, service: &ServiceId, config: Option<String>, fetch: bool) -> Result<()> {
        if !self.catalog.contains(service) {
            return Err(FleetError::validation(format!("unknown service: {service}")));
        }

        let (previous, previous_config) = {
            let state = self.state.lock().await;
            (state.expected.clone(), state.config_name.clone())
        };
        let status = self.supervisor.status().await;

        let already_active = *service == previous
            && (service.is_standby() || (status.running && status.name.as_deref() == Some(service.as_str())));
        if already_active {
            debug!(service = %service, "Service already active");
            if config.is_some() {
                self.state.lock().await.config_name = config;
            }
            return Ok(());
        }

        if service.is_standby() {
            if let Err(e) = self.supervisor.stop().await {
                warn!("Stop failed while entering standby: {}", e);
            }
            self.store.set_desired(service, None).await?;
            let mut state = self.state.lock().await;
            state.expected = ServiceId::Standby;
            state.config_name = None;
            state.error = None;
            info!("Agent in standby");
            return Ok(());
        }

        let config = config.or_else(|| (*service == previous).then_some(previous_config).flatten());

        if fetch {
            if let (Some(name), Some(entry)) = (&config, self.catalog.get(service.as_str())) {
                self.configs.fetch(entry, name).await?;
            }
        }

        let started = match self.supervisor.start(service).await {
            Ok(()) => self.store.set_desired(service, config.clone()).await,
            Err(e) => Err(e),
        };

        match started {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.expected = service.clone();
                state.config_name = config;
                state.error = None;
                info!(service = %service, "Service active");
                Ok(())
            }
            Err(e) => {
                error!(service = %service, "Failed to activate service: {}", e);
                if previous != *service {
                    self.rollback(&previous).await;
                }
                self.state.lock().await.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn rollback(&self, previous: &ServiceId) {
        warn!(service = %previous, "Rolling back to previous service");
        if let Err(e) = self.supervisor.start(previous).await {
            error!(service = %previous, "Rollback failed: {}", e);
        }
    }

    /// One health-monitor tick.
    pub async fn check_health(&self) {
        let Ok(_guard) = self.apply_lock.try_lock() else {
            debug!("Transition in progress, skipping health check");
            return;
        };

        let (expected, had_error) = {
            let state = self.state.lock().await;
            (state.expected.clone(), state.error.is_some())
        };
        if expected.is_standby() {
            return;
        }

        let status = self.supervisor.status().await;
        if status.running {
            if had_error {
                info!(service = %expected, "Service healthy again");
                self.state.lock().await.error = None;
            }
            return;
        }

        let crash = FleetError::Crash {
            service: expected.as_str().to_string(),
            returncode: status.returncode,
        };
        warn!(service = %expected, returncode = ?status.returncode, "Service not running, relaunching");
        self.state.lock().await.error = Some(crash.to_string());

        if let Err(e) = self.apply_inner(&expected, None, false).await {
            error!(service = %expected, "Relaunch failed, falling back to standby: {}", e);
            if let Err(e) = self.apply_inner(&ServiceId::Standby, None, false).await {
                error!("Standby fallback failed: {}", e);
            }
            self.state.lock().await.error = Some(crash.to_string());
        }
    }

    /// Health monitor loop.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.monitor_interval, "Health monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Health monitor stopped");
                    break;
                }
                _ = ticker.tick() => self.check_health().await,
            }
        }
    }

    /// Wait for any running transition, then enter `Transitioning(from, to)`
    /// at `stage`. The health monitor stays out until the returned
    /// transition is dropped.
    pub async fn begin_transition(&self, target: &ServiceId, stage: &str, progress: u8) -> ServiceTransition<'_> {
        let lock = self.apply_lock.lock().await;
        let mut state = self.state.lock().await;
        state.transition = Some(Transition {
            from: state.expected.clone(),
            to: target.clone(),
        });
        state.stage = Some(stage.to_string());
        state.progress = progress;
        ServiceTransition {
            orchestrator: self,
            target: target.clone(),
            _lock: lock,
        }
    }

    pub async fn expected(&self) -> ServiceId {
        self.state.lock().await.expected.clone()
    }

    /// Deep copy of the current service state.
    pub async fn snapshot(&self) -> ServiceState {
        let status = self.supervisor.status().await;
        let state = self.state.lock().await.clone();

        let phase = match (&state.transition, &state.error) {
            (Some(t), _) => AgentPhase::Transitioning {
                from: t.from.clone(),
                to: t.to.clone(),
                stage: state.stage.clone().unwrap_or_default(),
            },
            (None, Some(reason)) => AgentPhase::Error {
                service: state.expected.to_string(),
                reason: reason.clone(),
            },
            (None, None) if state.expected.is_standby() => AgentPhase::Standby,
            (None, None) if status.running => AgentPhase::Running {
                service: state.expected.to_string(),
            },
            (None, None) => AgentPhase::Error {
                service: state.expected.to_string(),
                reason: status
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "not running".to_string()),
            },
        };

        ServiceState {
            expected: state.expected,
            actual: status.name,
            running: status.running,
            pid: status.pid,
            last_error: status.last_error,
            returncode: status.returncode,
            transition: state.transition.is_some(),
            stage: state.stage,
            progress: state.progress,
            config_name: state.config_name,
            error: state.error,
            phase,
            timestamp: unix_timestamp(),
        }
    }
}

/// One service change in flight. Holds the apply lock, so only one
/// transition at a time writes the transition fields of the state.
pub struct ServiceTransition<'a> {
    orchestrator: &'a ServiceOrchestrator,
    target: ServiceId,
    _lock: MutexGuard<'a, ()>,
}

impl ServiceTransition<'_> {
    /// Make the target the single active service, fetching `config` first
    /// when given. On a failed start the previous service is relaunched and
    /// the start error returned; the persisted desired service only
    /// changes on success.
    pub async fn apply_active_service(&self, config: Option<String>) -> Result<()> {
        self.orchestrator.apply_inner(&self.target, config, true).await
    }

    pub async fn set_stage(&self, stage: &str, progress: u8) {
        let mut state = self.orchestrator.state.lock().await;
        state.stage = Some(stage.to_string());
        state.progress = progress;
    }

    /// Leave `Transitioning`. The apply lock is held until `self` drops.
    pub async fn finish(&self, ok: bool) {
        let mut state = self.orchestrator.state.lock().await;
        state.transition = None;
        state.stage = Some(if ok { STAGE_DONE } else { STAGE_ERROR }.to_string());
        state.progress = 100;
    }
}
