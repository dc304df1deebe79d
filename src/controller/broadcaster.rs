//! Controller side of the UDP protocol.
//!
//! ```text
//!   broadcast loop ── DISCOVER ──────────────▶ 255.255.255.255:37020
//!   listen loop    ◀─ AGENT_STATUS / *_ACK ── :37021
//!   request_*      ── SET_SERVICE/POWER/SET_INDEX ─▶ device_ip:37020
//! ```
//!
//! Commands are correlated with their acks through [`PendingRequests`];
//! nothing is resent, the caller's timeout is the only retry policy.

use super::pending::PendingRequests;
use super::registry::DeviceRegistry;
use crate::config::ControllerSettings;
use crate::error::{FleetError, Result};
use crate::protocol::{
    unix_timestamp, AgentStatus, Discover, IndexAck, Message, PowerAck, PowerAction, PowerCommand, ServiceAck,
    ServiceId, SetIndex, SetService, MAX_DATAGRAM,
};
use crate::transport::Transport;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct BroadcasterSettings {
    pub advertise_ip: Option<String>,
    pub broadcast_ip: IpAddr,
    /// Port agents listen on; commands go there too
    pub agent_port: u16,
    pub reply_port: u16,
    pub http_port: u16,
    pub discover_interval: Duration,
    pub service_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self::from(&ControllerSettings::default())
    }
}

impl From<&ControllerSettings> for BroadcasterSettings {
    fn from(settings: &ControllerSettings) -> Self {
        Self {
            advertise_ip: settings.advertise_ip.clone(),
            broadcast_ip: settings
                .broadcast_ip
                .parse()
                .unwrap_or(IpAddr::V4(Ipv4Addr::BROADCAST)),
            agent_port: settings.broadcast_port,
            reply_port: settings.reply_port,
            http_port: settings.http_port,
            discover_interval: settings.discover_interval(),
            service_timeout: settings.service_timeout(),
            command_timeout: settings.command_timeout(),
        }
    }
}

/// Result of [`CommandBroadcaster::request_index_update`].
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutcome {
    /// Another update for this serial is still in flight; nothing was sent.
    Pending,
    Acked(IndexAck),
}

pub struct CommandBroadcaster {
    settings: BroadcasterSettings,
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn Transport>,
    pending: PendingRequests,
}

impl CommandBroadcaster {
    pub fn new(settings: BroadcasterSettings, registry: Arc<DeviceRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            settings,
            registry,
            transport,
            pending: PendingRequests::new(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn discover_message(&self) -> Message {
        Message::Discover(Discover {
            server_ip: self.settings.advertise_ip.clone().unwrap_or_else(local_ip),
            reply_port: self.settings.reply_port,
            http_port: Some(self.settings.http_port),
            ts: unix_timestamp(),
        })
    }

    pub async fn broadcast_once(&self) -> Result<()> {
        let target = SocketAddr::new(self.settings.broadcast_ip, self.settings.agent_port);
        self.transport.send_to(&self.discover_message(), target).await?;
        trace!(%target, "DISCOVER broadcast");
        Ok(())
    }

    /// Broadcast DISCOVER every `discover_interval` until cancelled.
    pub async fn run_broadcast(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.settings.discover_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.broadcast_once().await {
                        error!("Error sending DISCOVER: {}", e);
                    }
                }
            }
        }
        debug!("Broadcast loop stopped");
    }

    /// Receive replies on `socket` until cancelled.
    pub async fn run_listener(self: &Arc<Self>, socket: UdpSocket, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        info!(addr = ?socket.local_addr().ok(), "Controller listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                    Err(e) => {
                        warn!("Listener socket error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("Listen loop stopped");
    }

    /// Run both loops; on exit every in-flight request fails with `Shutdown`.
    pub async fn run(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) {
        info!(
            broadcast = %SocketAddr::new(self.settings.broadcast_ip, self.settings.agent_port),
            interval = ?self.settings.discover_interval,
            "Discovery started"
        );
        tokio::join!(self.run_broadcast(cancel.clone()), self.run_listener(socket, cancel));
        self.shutdown().await;
    }

    pub async fn shutdown(&self) {
        self.pending.fail_all().await;
        info!("Broadcaster stopped");
    }

    pub async fn handle_datagram(self: &Arc<Self>, bytes: &[u8], src: SocketAddr) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(%src, "Invalid datagram: {}", e);
                return;
            }
        };

        match message {
            Message::AgentStatus(status) => self.on_agent_status(status, src).await,
            Message::ServiceAck(ack) => self.on_service_ack(ack).await,
            Message::PowerAck(ack) => {
                info!(
                    serial = ?ack.serial,
                    action = %ack.action,
                    ok = ack.ok,
                    "Power ack received"
                );
                let request_id = ack.request_id.clone();
                self.pending.resolve(&request_id, Ok(Message::PowerAck(ack))).await;
            }
            Message::IndexAck(ack) => self.on_index_ack(ack).await,
            other => debug!(kind = other.kind(), %src, "Ignoring message"),
        }
    }

    async fn on_agent_status(self: &Arc<Self>, status: AgentStatus, src: SocketAddr) {
        let serial = status.serial.clone();
        let check = match self.registry.upsert_from_status(status, src).await {
            Ok(check) => check,
            Err(e) => {
                warn!(%src, "Status not recorded: {}", e);
                return;
            }
        };
        debug!(%serial, "Status received");

        if check.needs_correction() {
            info!(%serial, assigned = check.assigned, reported = ?check.reported, "Correcting device index");
            let broadcaster = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = broadcaster.request_index_update(&serial, check.assigned).await {
                    warn!(%serial, "Index correction failed: {}", e);
                }
            });
        }
    }

    async fn on_service_ack(&self, ack: ServiceAck) {
        info!(
            serial = ?ack.serial,
            ok = ack.ok,
            transition = ack.transition,
            stage = %ack.stage,
            "Service ack received"
        );
        self.registry.update_from_service_ack(&ack).await;

        let request_id = ack.request_id.clone();
        let message = Message::ServiceAck(ack);
        if message_is_transition(&message) {
            self.pending.update(&request_id, message).await;
        } else {
            self.pending.resolve(&request_id, Ok(message)).await;
        }
    }

    /// Only an ack for a request still in flight touches the registry;
    /// late or foreign acks are dropped.
    async fn on_index_ack(&self, ack: IndexAck) {
        info!(serial = ?ack.serial, index = ?ack.index, ok = ack.ok, "Index ack received");
        let request_id = ack.request_id.clone();
        if !self.pending.contains(&request_id).await {
            debug!(%request_id, "Index ack for no outstanding request");
            return;
        }
        if let (true, Some(serial)) = (ack.ok, ack.serial.as_deref()) {
            self.registry.update_index(serial, ack.index).await;
        }
        self.pending.resolve(&request_id, Ok(Message::IndexAck(ack))).await;
    }

    /// Command destination for a known device with a known address.
    async fn device_target(&self, serial: &str) -> Result<(SocketAddr, Vec<String>)> {
        let device = self
            .registry
            .get_device(serial)
            .await
            .ok_or_else(|| FleetError::validation(format!("unknown device: {serial}")))?;
        let ip = device
            .ip
            .ok_or_else(|| FleetError::validation(format!("no known address for device {serial}")))?;
        Ok((SocketAddr::new(ip, self.settings.agent_port), device.available_services))
    }

    /// Send `message`; a send failure aborts its pending request.
    async fn send_command(&self, message: &Message, target: SocketAddr, request_id: &str) -> Result<()> {
        if let Err(e) = self.transport.send_to(message, target).await {
            let reason = e.to_string();
            self.pending
                .abort(request_id, FleetError::Network(reason.clone()))
                .await;
            error!(kind = message.kind(), %target, "Command send failed: {}", reason);
            return Err(FleetError::Network(reason));
        }
        info!(kind = message.kind(), %target, %request_id, "Command sent");
        Ok(())
    }

    /// Ask `serial` to switch to `service` and wait for the final ack.
    /// The desired service is persisted only once the agent confirms it.
    pub async fn request_service_change(&self, serial: &str, service: &str, config: Option<String>) -> Result<ServiceAck> {
        let (target, available) = self.device_target(serial).await?;
        let service_id = ServiceId::parse(service);
        if !available.is_empty() && !available.iter().any(|s| s == service_id.as_str()) {
            return Err(FleetError::validation(format!(
                "device {serial} does not offer service {service_id}"
            )));
        }

        let operation = format!("SET_SERVICE({service_id})");
        let handle = self
            .pending
            .register(operation, None)
            .await
            .ok_or_else(|| FleetError::validation("request already pending"))?;
        let message = Message::SetService(SetService {
            service: service_id.to_string(),
            request_id: handle.request_id().to_string(),
            reply_port: Some(self.settings.reply_port),
            config: config.clone(),
        });
        self.send_command(&message, target, handle.request_id()).await?;
        trace_progress(serial, handle.progress());

        let reply = accepted(self.pending.wait(handle, self.settings.service_timeout).await?)?;
        let Message::ServiceAck(ack) = reply else {
            return Err(FleetError::validation("unexpected reply to SET_SERVICE"));
        };

        self.registry.record_desired(serial, &service_id, config).await?;
        Ok(ack)
    }

    pub async fn request_power_action(&self, serial: &str, action: PowerAction) -> Result<PowerAck> {
        let (target, _) = self.device_target(serial).await?;

        let handle = self
            .pending
            .register(format!("POWER({action})"), None)
            .await
            .ok_or_else(|| FleetError::validation("request already pending"))?;
        let message = Message::Power(PowerCommand {
            action: action.to_string(),
            request_id: handle.request_id().to_string(),
            reply_port: Some(self.settings.reply_port),
        });
        self.send_command(&message, target, handle.request_id()).await?;

        let reply = accepted(self.pending.wait(handle, self.settings.command_timeout).await?)?;
        let Message::PowerAck(ack) = reply else {
            return Err(FleetError::validation("unexpected reply to POWER"));
        };
        Ok(ack)
    }

    /// At most one SET_INDEX per serial is in flight; a concurrent call
    /// returns [`IndexOutcome::Pending`] without sending anything.
    pub async fn request_index_update(&self, serial: &str, index: u32) -> Result<IndexOutcome> {
        let (target, _) = self.device_target(serial).await?;

        let Some(handle) = self
            .pending
            .register(format!("SET_INDEX({index})"), Some(serial))
            .await
        else {
            return Ok(IndexOutcome::Pending);
        };
        let message = Message::SetIndex(SetIndex {
            index,
            request_id: handle.request_id().to_string(),
            reply_port: Some(self.settings.reply_port),
        });
        self.send_command(&message, target, handle.request_id()).await?;

        let reply = accepted(self.pending.wait(handle, self.settings.command_timeout).await?)?;
        let Message::IndexAck(ack) = reply else {
            return Err(FleetError::validation("unexpected reply to SET_INDEX"));
        };
        Ok(IndexOutcome::Acked(ack))
    }

    /// Delete a device and push the compacted indices to online devices
    /// whose index moved. Returns the resequenced `(serial, index)` pairs.
    pub async fn forget_device(self: &Arc<Self>, serial: &str) -> Result<Vec<(String, u32)>> {
        let changed = self
            .registry
            .remove_device(serial)
            .await?
            .ok_or_else(|| FleetError::validation(format!("unknown device: {serial}")))?;

        for (other, index) in &changed {
            let online = self
                .registry
                .get_device(other)
                .await
                .is_some_and(|d| d.online && d.reported_index != Some(*index));
            if !online {
                continue;
            }
            let broadcaster = Arc::clone(self);
            let (other, index) = (other.clone(), *index);
            tokio::spawn(async move {
                if let Err(e) = broadcaster.request_index_update(&other, index).await {
                    warn!(serial = %other, "Index update after forget failed: {}", e);
                }
            });
        }
        Ok(changed)
    }
}

fn message_is_transition(message: &Message) -> bool {
    matches!(message, Message::ServiceAck(ack) if ack.transition)
}

/// Turn a negative acknowledgement into [`FleetError::Rejected`].
fn accepted(reply: Message) -> Result<Message> {
    match reply.ack_outcome() {
        Some((false, reason)) => Err(FleetError::Rejected(reason.unwrap_or("unknown error").to_string())),
        _ => Ok(reply),
    }
}

/// Log transition stages until the request completes.
fn trace_progress(serial: &str, mut progress: watch::Receiver<Option<Message>>) {
    let serial = serial.to_string();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            if let Some(Message::ServiceAck(ack)) = snapshot {
                info!(%serial, stage = %ack.stage, progress = ?ack.progress, "Transition in progress");
            }
        }
    });
}

/// Address of the interface that routes outward, as agents should see it.
fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| Ipv4Addr::LOCALHOST.to_string())
}
