//! Agent side of the UDP protocol.
//!
//! DISCOVER is answered inline with a full AGENT_STATUS. SET_SERVICE acks
//! the closing stage immediately and runs the transition on its own task,
//! so the receive loop never waits on process start/stop.

use super::heartbeat::HeartbeatSampler;
use super::orchestrator::{ServiceOrchestrator, STAGE_CLOSING, STAGE_DONE, STAGE_ERROR, STAGE_OPENING};
use super::power::PowerControl;
use super::render::{StatusRenderer, StatusSnapshot};
use super::supervisor::RuntimeEnv;
use crate::config::AgentSettings;
use crate::env::EnvVar;
use crate::error::{FleetError, Result};
use crate::protocol::{
    unix_timestamp, AgentStatus, Discover, Heartbeat, IndexAck, Message, PowerAck, PowerAction, PowerCommand,
    ServiceAck, ServiceId, SetIndex, SetService, MAX_DATAGRAM,
};
use crate::transport::Transport;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Used when a command carries no `reply_port`
    pub reply_port: u16,
    pub default_http_port: u16,
    /// `server_online` window after the last controller packet
    pub server_timeout: Duration,
    pub refresh_interval: Duration,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for HandlerSettings {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            reply_port: settings.reply_port,
            default_http_port: settings.default_http_port,
            server_timeout: settings.server_timeout(),
            refresh_interval: settings.refresh_interval(),
        }
    }
}

/// One SERVICE_ACK step of a transition.
struct AckStep {
    ok: bool,
    transition: bool,
    stage: &'static str,
    progress: u8,
    error: Option<String>,
}

impl AckStep {
    fn progress(stage: &'static str, progress: u8) -> Self {
        Self {
            ok: true,
            transition: true,
            stage,
            progress,
            error: None,
        }
    }

    fn done() -> Self {
        Self {
            ok: true,
            transition: false,
            stage: STAGE_DONE,
            progress: 100,
            error: None,
        }
    }

    fn failed(error: &FleetError) -> Self {
        Self {
            ok: false,
            transition: false,
            stage: STAGE_ERROR,
            progress: 100,
            error: Some(error.to_string()),
        }
    }
}

pub struct ProtocolHandler {
    orchestrator: Arc<ServiceOrchestrator>,
    transport: Arc<dyn Transport>,
    power: Arc<dyn PowerControl>,
    runtime_env: Arc<RuntimeEnv>,
    settings: HandlerSettings,
    heartbeat: Mutex<Heartbeat>,
    last_contact: Mutex<Option<Instant>>,
}

impl ProtocolHandler {
    pub fn new(
        orchestrator: Arc<ServiceOrchestrator>,
        transport: Arc<dyn Transport>,
        power: Arc<dyn PowerControl>,
        runtime_env: Arc<RuntimeEnv>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            orchestrator,
            transport,
            power,
            runtime_env,
            settings,
            heartbeat: Mutex::new(Heartbeat::default()),
            last_contact: Mutex::new(None),
        }
    }

    pub async fn handle_datagram(self: &Arc<Self>, bytes: &[u8], src: SocketAddr) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(%src, "Dropping malformed datagram: {}", e);
                return;
            }
        };
        trace!(kind = message.kind(), %src, "Datagram received");

        match message {
            Message::Discover(discover) => self.on_discover(discover, src).await,
            Message::SetService(cmd) => self.on_set_service(cmd, src).await,
            Message::Power(cmd) => self.on_power(cmd, src).await,
            Message::SetIndex(cmd) => self.on_set_index(cmd, src).await,
            other => debug!(kind = other.kind(), "Ignoring message not meant for agents"),
        }
    }

    async fn touch_server(&self) {
        *self.last_contact.lock().await = Some(Instant::now());
    }

    pub async fn server_online(&self) -> bool {
        self.last_contact
            .lock()
            .await
            .is_some_and(|at| at.elapsed() < self.settings.server_timeout)
    }

    pub async fn set_heartbeat(&self, heartbeat: Heartbeat) {
        *self.heartbeat.lock().await = heartbeat;
    }

    fn reply_target(&self, src: SocketAddr, reply_port: Option<u16>) -> SocketAddr {
        SocketAddr::new(src.ip(), reply_port.unwrap_or(self.settings.reply_port))
    }

    async fn send(&self, message: Message, target: SocketAddr) {
        if let Err(e) = self.transport.send_to(&message, target).await {
            error!(kind = message.kind(), %target, "Failed to send reply: {}", e);
        }
    }

    async fn serial(&self) -> String {
        self.orchestrator.store().identity().await.serial
    }

    async fn on_discover(&self, discover: Discover, src: SocketAddr) {
        self.touch_server().await;

        let server_ip: IpAddr = discover.server_ip.parse().unwrap_or_else(|_| src.ip());
        let http_port = discover.http_port.unwrap_or(self.settings.default_http_port);
        let api_base = format!("http://{server_ip}:{http_port}");
        if self.orchestrator.configs().set_api_base(api_base.clone()).await {
            self.runtime_env.set(EnvVar::OmiServerApi, api_base).await;
            self.spawn_config_sync();
        }

        let status = self.status_message().await;
        self.send(status, SocketAddr::new(server_ip, discover.reply_port)).await;
    }

    /// Push the active service's local config once a controller is known.
    fn spawn_config_sync(&self) {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let service = orchestrator.expected().await;
            let Some(entry) = orchestrator.catalog().get(service.as_str()) else {
                return;
            };
            let identity = orchestrator.store().identity().await;
            if let Err(e) = orchestrator.configs().push(entry, &identity).await {
                warn!(service = %service, "Could not sync local config: {}", e);
            }
        });
    }

    /// AGENT_STATUS for the current state.
    pub async fn status_message(&self) -> Message {
        let record = self.orchestrator.store().record().await;
        let state = self.orchestrator.snapshot().await;
        let catalog = self.orchestrator.catalog();

        Message::AgentStatus(AgentStatus {
            serial: record.identity.serial,
            index: record.identity.index,
            name: record.identity.name,
            host: Some(record.identity.host),
            version: Some(record.version),
            services: catalog.service_entries(&state.expected),
            available_services: catalog.names(),
            service_state: Some(state),
            heartbeat: self.heartbeat.lock().await.clone(),
            server_api: self.orchestrator.configs().api_base().await,
        })
    }

    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let identity = self.orchestrator.store().identity().await;
        StatusSnapshot {
            serial: identity.serial,
            host: identity.host,
            index: identity.index,
            server_online: self.server_online().await,
            heartbeat: self.heartbeat.lock().await.clone(),
            service_state: self.orchestrator.snapshot().await,
        }
    }

    async fn on_set_service(self: &Arc<Self>, cmd: SetService, src: SocketAddr) {
        self.touch_server().await;
        let target = self.reply_target(src, cmd.reply_port);

        let service = match self.orchestrator.catalog().resolve(&cmd.service) {
            Ok(service) => service,
            Err(e) => {
                warn!(request_id = %cmd.request_id, "Rejecting SET_SERVICE: {}", e);
                self.send_service_ack(&cmd, target, AckStep::failed(&e)).await;
                return;
            }
        };

        info!(request_id = %cmd.request_id, service = %service, %src, "Service change requested");
        let handler = Arc::clone(self);
        tokio::spawn(async move { handler.run_transition(cmd, service, target).await });
    }

    /// Requests queue on the orchestrator's transition lock; each one's acks
    /// are sent while it holds the lock, so they never mix with another's.
    async fn run_transition(&self, cmd: SetService, service: ServiceId, target: SocketAddr) {
        let transition = self.orchestrator.begin_transition(&service, STAGE_CLOSING, 5).await;
        self.send_service_ack(&cmd, target, AckStep::progress(STAGE_CLOSING, 5)).await;

        match transition.apply_active_service(cmd.config.clone()).await {
            Ok(()) => {
                transition.set_stage(STAGE_OPENING, 80).await;
                self.send_service_ack(&cmd, target, AckStep::progress(STAGE_OPENING, 80)).await;
                transition.finish(true).await;
                self.send_service_ack(&cmd, target, AckStep::done()).await;
                info!(request_id = %cmd.request_id, service = %service, "Service change completed");
            }
            Err(e) => {
                transition.finish(false).await;
                self.send_service_ack(&cmd, target, AckStep::failed(&e)).await;
                error!(request_id = %cmd.request_id, service = %service, "Service change failed: {}", e);
            }
        }
    }

    async fn send_service_ack(&self, cmd: &SetService, target: SocketAddr, step: AckStep) {
        let state = self.orchestrator.snapshot().await;
        let ack = Message::ServiceAck(ServiceAck {
            request_id: cmd.request_id.clone(),
            serial: Some(self.serial().await),
            timestamp: unix_timestamp(),
            service: cmd.service.clone(),
            ok: step.ok,
            error: step.error,
            transition: step.transition,
            stage: step.stage.to_string(),
            progress: Some(step.progress),
            config: cmd.config.clone(),
            services: self.orchestrator.catalog().service_entries(&state.expected),
            service_state: Some(state),
        });
        self.send(ack, target).await;
    }

    async fn on_power(&self, cmd: PowerCommand, src: SocketAddr) {
        self.touch_server().await;
        let target = self.reply_target(src, cmd.reply_port);

        let result = match cmd.action.parse::<PowerAction>() {
            Ok(action) => {
                warn!(request_id = %cmd.request_id, %action, %src, "Power action requested");
                self.power.execute(action).await
            }
            Err(e) => Err(FleetError::validation(e)),
        };
        if let Err(ref e) = result {
            error!(request_id = %cmd.request_id, "Power command failed: {}", e);
        }

        let ack = Message::PowerAck(PowerAck {
            request_id: cmd.request_id,
            serial: Some(self.serial().await),
            timestamp: unix_timestamp(),
            action: cmd.action.to_lowercase(),
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        });
        self.send(ack, target).await;
    }

    async fn on_set_index(&self, cmd: SetIndex, src: SocketAddr) {
        self.touch_server().await;
        let target = self.reply_target(src, cmd.reply_port);

        let result = self.orchestrator.store().set_index(cmd.index).await;
        match result {
            Ok(()) => info!(request_id = %cmd.request_id, index = cmd.index, "Index updated"),
            Err(ref e) => error!(request_id = %cmd.request_id, "Could not persist index: {}", e),
        }

        let ack = Message::IndexAck(IndexAck {
            request_id: cmd.request_id,
            serial: Some(self.serial().await),
            timestamp: unix_timestamp(),
            ok: result.is_ok(),
            index: Some(cmd.index),
            error: result.err().map(|e| e.to_string()),
        });
        self.send(ack, target).await;
    }

    /// Receive loop on the agent listen socket.
    pub async fn run(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        info!(addr = ?socket.local_addr().ok(), "Agent listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Agent listener stopped");
                    break;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                    Err(e) => {
                        warn!("Receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        Ok(())
    }

    /// Sample metrics and hand the latest snapshot to `renderer`.
    pub async fn run_refresh(
        self: Arc<Self>,
        mut sampler: HeartbeatSampler,
        renderer: Arc<dyn StatusRenderer>,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(self.settings.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.set_heartbeat(sampler.sample()).await;
                    renderer.render(&self.status_snapshot().await);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::catalog::{ServiceCatalog, ServiceCatalogEntry};
    use crate::agent::config_client::testing::FakeConfigSource;
    use crate::agent::config_client::ConfigSource;
    use crate::agent::orchestrator::testing::FakeSupervisor;
    use crate::agent::power::testing::RecordingPower;
    use crate::agent::store::{AgentIdentity, AgentStore};
    use crate::protocol::AgentPhase;
    use crate::transport::testing::RecordingTransport;

    const CONTROLLER: &str = "10.0.0.2:40000";

    struct Harness {
        handler: Arc<ProtocolHandler>,
        transport: Arc<RecordingTransport>,
        supervisor: Arc<FakeSupervisor>,
        power: Arc<RecordingPower>,
        configs: Arc<FakeConfigSource>,
        runtime_env: Arc<RuntimeEnv>,
        store: Arc<AgentStore>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(
            ServiceCatalog::new()
                .with(ServiceCatalogEntry::new("MIDI", "true"))
                .with(ServiceCatalogEntry::new("OSC", "true")),
        );
        let store = Arc::new(
            AgentStore::load_or_init(dir.path().join("agent.json"), AgentIdentity::new("pi-001", "pi"), &catalog)
                .await
                .unwrap(),
        );
        let supervisor = Arc::new(FakeSupervisor::default());
        let configs = Arc::new(FakeConfigSource::default());
        let orchestrator = Arc::new(ServiceOrchestrator::new(
            catalog,
            supervisor.clone(),
            store.clone(),
            configs.clone(),
        ));
        let transport = Arc::new(RecordingTransport::default());
        let power = Arc::new(RecordingPower::default());
        let runtime_env = Arc::new(RuntimeEnv::new());
        let handler = Arc::new(ProtocolHandler::new(
            orchestrator,
            transport.clone(),
            power.clone(),
            runtime_env.clone(),
            HandlerSettings::default(),
        ));
        Harness {
            handler,
            transport,
            supervisor,
            power,
            configs,
            runtime_env,
            store,
            _dir: dir,
        }
    }

    fn src() -> SocketAddr {
        CONTROLLER.parse().unwrap()
    }

    async fn deliver(h: &Harness, message: Message) {
        h.handler.handle_datagram(&message.encode().unwrap(), src()).await;
    }

    async fn wait_for_sent(transport: &RecordingTransport, count: usize) -> Vec<(Message, SocketAddr)> {
        for _ in 0..200 {
            let sent = transport.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} datagrams, got {:?}", transport.sent_kinds());
    }

    fn service_acks(sent: &[(Message, SocketAddr)]) -> Vec<ServiceAck> {
        sent.iter()
            .filter_map(|(m, _)| match m {
                Message::ServiceAck(ack) => Some(ack.clone()),
                _ => None,
            })
            .collect()
    }

    fn set_service(service: &str, request_id: &str) -> Message {
        Message::SetService(SetService {
            service: service.into(),
            request_id: request_id.into(),
            reply_port: Some(37021),
            config: None,
        })
    }

    #[tokio::test]
    async fn discover_is_answered_with_status() {
        let h = harness().await;
        deliver(
            &h,
            Message::Discover(Discover {
                server_ip: "10.0.0.2".into(),
                reply_port: 37021,
                http_port: Some(6982),
                ts: 0.0,
            }),
        )
        .await;

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        let (Message::AgentStatus(status), target) = &sent[0] else {
            panic!("expected AGENT_STATUS");
        };
        assert_eq!(*target, "10.0.0.2:37021".parse().unwrap());
        assert_eq!(status.serial, "pi-001");
        assert_eq!(status.available_services, vec!["standby", "MIDI", "OSC"]);
        assert_eq!(status.server_api.as_deref(), Some("http://10.0.0.2:6982"));
        assert_eq!(status.services.iter().filter(|s| s.enabled).count(), 1);

        assert!(h.handler.server_online().await);
        assert_eq!(
            h.runtime_env.snapshot().await.get("OMI_SERVER_API").map(String::as_str),
            Some("http://10.0.0.2:6982")
        );
    }

    #[tokio::test]
    async fn discover_falls_back_to_default_http_port() {
        let h = harness().await;
        deliver(
            &h,
            Message::Discover(Discover {
                server_ip: "10.0.0.9".into(),
                reply_port: 37021,
                http_port: None,
                ts: 0.0,
            }),
        )
        .await;
        assert_eq!(h.configs.api_base().await.as_deref(), Some("http://10.0.0.9:8000"));
    }

    #[tokio::test]
    async fn set_service_emits_transition_acks_then_final() {
        let h = harness().await;
        deliver(&h, set_service("MIDI", "req-1")).await;

        let sent = wait_for_sent(&h.transport, 3).await;
        let acks = service_acks(&sent);
        let steps: Vec<_> = acks
            .iter()
            .map(|a| (a.stage.as_str(), a.progress, a.transition, a.ok))
            .collect();
        assert_eq!(
            steps,
            vec![
                ("cerrando", Some(5), true, true),
                ("abriendo", Some(80), true, true),
                ("completado", Some(100), false, true),
            ]
        );
        assert!(acks.iter().all(|a| a.request_id == "req-1"));
        assert!(acks.iter().all(|a| a.serial.as_deref() == Some("pi-001")));
        assert!(sent.iter().all(|(_, t)| *t == "10.0.0.2:37021".parse().unwrap()));

        let final_state = acks[2].service_state.clone().unwrap();
        assert_eq!(final_state.phase, AgentPhase::Running { service: "MIDI".into() });
        assert_eq!(h.store.desired().await.0, ServiceId::parse("MIDI"));
    }

    #[tokio::test]
    async fn unknown_service_is_rejected_immediately() {
        let h = harness().await;
        deliver(&h, set_service("DMX", "req-2")).await;

        let acks = service_acks(&h.transport.sent());
        assert_eq!(acks.len(), 1);
        assert!(!acks[0].ok);
        assert!(!acks[0].transition);
        assert_eq!(acks[0].stage, "error");
        assert!(h.supervisor.starts().is_empty());
    }

    #[tokio::test]
    async fn failed_transition_acks_error_and_keeps_desired() {
        let h = harness().await;
        h.supervisor.fail("OSC");
        deliver(&h, set_service("OSC", "req-3")).await;

        let acks = service_acks(&wait_for_sent(&h.transport, 2).await);
        assert_eq!(acks[0].stage, "cerrando");
        assert!(!acks[1].ok);
        assert!(!acks[1].transition);
        assert_eq!(acks[1].stage, "error");
        assert!(acks[1].error.is_some());
        assert_eq!(h.store.desired().await.0, ServiceId::Standby);
    }

    #[tokio::test]
    async fn concurrent_service_changes_do_not_interleave() {
        let h = harness().await;
        deliver(&h, set_service("MIDI", "req-midi")).await;
        deliver(&h, set_service("OSC", "req-osc")).await;

        let acks = service_acks(&wait_for_sent(&h.transport, 6).await);
        assert_eq!(acks.len(), 6);
        assert!(acks.iter().all(|a| a.ok));

        let order: Vec<&str> = acks.iter().map(|a| a.request_id.as_str()).collect();
        assert!(order[..3].iter().all(|id| *id == order[0]));
        assert!(order[3..].iter().all(|id| *id == order[3]));
        assert_ne!(order[0], order[3]);

        for ack in acks.iter().filter(|a| a.transition) {
            let state = ack.service_state.clone().unwrap();
            let AgentPhase::Transitioning { to, stage, .. } = state.phase else {
                panic!("expected a transition snapshot, got {:?}", state.phase);
            };
            assert_eq!(to, ServiceId::parse(&ack.service));
            assert_eq!(stage, ack.stage);
        }

        let last = &acks[5];
        assert_eq!(h.store.desired().await.0, ServiceId::parse(&last.service));
    }

    #[tokio::test]
    async fn reply_port_defaults_when_missing() {
        let h = harness().await;
        deliver(
            &h,
            Message::SetIndex(SetIndex {
                index: 4,
                request_id: "idx".into(),
                reply_port: None,
            }),
        )
        .await;

        let sent = h.transport.sent();
        assert_eq!(sent[0].1, "10.0.0.2:37021".parse().unwrap());
    }

    #[tokio::test]
    async fn set_index_persists_and_acks() {
        let h = harness().await;
        deliver(
            &h,
            Message::SetIndex(SetIndex {
                index: 2,
                request_id: "idx-1".into(),
                reply_port: Some(37021),
            }),
        )
        .await;

        let sent = h.transport.sent();
        let Message::IndexAck(ack) = &sent[0].0 else {
            panic!("expected INDEX_ACK");
        };
        assert!(ack.ok);
        assert_eq!(ack.index, Some(2));
        assert_eq!(h.store.identity().await.index, Some(2));

        let Message::AgentStatus(status) = h.handler.status_message().await else {
            panic!("expected AGENT_STATUS");
        };
        assert_eq!(status.index, Some(2));
    }

    #[tokio::test]
    async fn power_commands_are_executed_and_acked() {
        let h = harness().await;
        deliver(
            &h,
            Message::Power(PowerCommand {
                action: "Reboot".into(),
                request_id: "p-1".into(),
                reply_port: Some(37021),
            }),
        )
        .await;
        deliver(
            &h,
            Message::Power(PowerCommand {
                action: "halt".into(),
                request_id: "p-2".into(),
                reply_port: Some(37021),
            }),
        )
        .await;

        assert_eq!(h.power.executed(), vec![PowerAction::Reboot]);
        let acks: Vec<_> = h
            .transport
            .sent()
            .into_iter()
            .filter_map(|(m, _)| match m {
                Message::PowerAck(ack) => Some(ack),
                _ => None,
            })
            .collect();
        assert!(acks[0].ok);
        assert_eq!(acks[0].action, "reboot");
        assert!(!acks[1].ok);
        assert!(acks[1].error.is_some());
    }

    #[tokio::test]
    async fn malformed_and_foreign_datagrams_are_ignored() {
        let h = harness().await;
        h.handler.handle_datagram(b"{not json", src()).await;
        h.handler
            .handle_datagram(br#"{"type":"AGENT_STATUS","serial":"other"}"#, src())
            .await;
        assert!(h.transport.sent().is_empty());
        assert!(!h.handler.server_online().await);
    }

    #[tokio::test(start_paused = true)]
    async fn server_goes_offline_after_silence() {
        let h = harness().await;
        deliver(
            &h,
            Message::Discover(Discover {
                server_ip: "10.0.0.2".into(),
                reply_port: 37021,
                http_port: Some(6982),
                ts: 0.0,
            }),
        )
        .await;
        assert!(h.handler.server_online().await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!h.handler.server_online().await);
    }

    #[tokio::test]
    async fn refresh_loop_renders_snapshots() {
        use crate::agent::render::testing::CapturingRenderer;

        let h = harness().await;
        let renderer = Arc::new(CapturingRenderer::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.handler.clone().run_refresh(
            HeartbeatSampler::new(),
            renderer.clone(),
            cancel.clone(),
        ));

        for _ in 0..200 {
            if !renderer.frames.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let frames = renderer.frames.lock().unwrap();
        assert_eq!(frames[0].serial, "pi-001");
        assert!(!frames[0].server_online);
        assert!(frames[0].heartbeat.cpu.is_some());
    }
}
