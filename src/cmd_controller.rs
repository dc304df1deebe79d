use crate::args::{ControllerCommands, ControllerOpts};
use crate::shutdown::cancel_on_signal;
use anyhow::{anyhow, Context, Result};
use omi::config::{ControllerSettings, MAX_INTERVAL};
use omi::controller::{BroadcasterSettings, CommandBroadcaster, DeviceRegistry, DeviceStore, DeviceView, IndexOutcome};
use omi::logging;
use omi::protocol::PowerAction;
use omi::transport::{bind_listener, UdpTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

const ONLINE_POLL: Duration = Duration::from_millis(200);

pub async fn cmd_controller(command: ControllerCommands, verbose: bool) -> Result<()> {
    match command {
        ControllerCommands::Run { opts, log_dir } => cmd_controller_run(opts, log_dir, verbose).await,
        ControllerCommands::Devices { opts, json } => cmd_devices(opts, json, verbose).await,
        ControllerCommands::SetService {
            opts,
            serial,
            service,
            config,
        } => cmd_set_service(opts, &serial, &service, config, verbose).await,
        ControllerCommands::Power { opts, serial, action } => cmd_power(opts, &serial, &action, verbose).await,
        ControllerCommands::SetIndex { opts, serial, index } => cmd_set_index(opts, &serial, index, verbose).await,
        ControllerCommands::Forget { opts, serial } => cmd_forget(opts, &serial, verbose).await,
    }
}

/// A broadcaster running in the background of a command.
struct Session {
    broadcaster: Arc<CommandBroadcaster>,
    settings: ControllerSettings,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Session {
    async fn start(opts: &ControllerOpts) -> Result<Self> {
        let mut settings = ControllerSettings::load()?;
        if let Some(port) = opts.broadcast_port {
            settings.broadcast_port = port;
        }
        if let Some(port) = opts.reply_port {
            settings.reply_port = port;
        }
        if opts.advertise_ip.is_some() {
            settings.advertise_ip = opts.advertise_ip.clone();
        }
        if opts.devices.is_some() {
            settings.devices_path = opts.devices.clone();
        }

        let store = DeviceStore::load(settings.devices_path())
            .await
            .context("Failed to load device store")?;
        let registry = Arc::new(DeviceRegistry::new(store, settings.status_ttl()));
        let socket = bind_listener(settings.reply_port)
            .with_context(|| format!("Failed to bind UDP port {}", settings.reply_port))?;
        let transport = Arc::new(UdpTransport::bind_ephemeral().await?);
        let broadcaster = Arc::new(CommandBroadcaster::new(
            BroadcasterSettings::from(&settings),
            registry,
            transport,
        ));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(broadcaster.clone().run(socket, cancel.clone()));
        Ok(Self {
            broadcaster,
            settings,
            cancel,
            task,
        })
    }

    /// Let discovery run for `wait` seconds, returning early once `serial`
    /// (if any) is online.
    async fn discover(&self, wait: f64, serial: Option<&str>) {
        let wait = Duration::try_from_secs_f64(wait.clamp(0.0, MAX_INTERVAL.as_secs_f64())).unwrap_or_default();
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if let Some(serial) = serial {
                let online = self
                    .broadcaster
                    .registry()
                    .get_device(serial)
                    .await
                    .is_some_and(|d| d.online);
                if online {
                    return;
                }
            }
            tokio::time::sleep(ONLINE_POLL).await;
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn cmd_controller_run(opts: ControllerOpts, log_dir: Option<PathBuf>, verbose: bool) -> Result<()> {
    let log_dir = log_dir.unwrap_or_else(omi::env::log_dir);
    let _log_guard = logging::init("controller", &log_dir, verbose)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting omi controller");

    let session = Session::start(&opts).await?;
    cancel_on_signal(session.cancel.clone())?;

    let mut ticker = interval(session.settings.discover_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_online = None;

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let registry = session.broadcaster.registry();
                let online = registry.online_count().await;
                if last_online != Some(online) {
                    last_online = Some(online);
                    let devices = registry.list_devices().await;
                    info!(online, known = devices.len(), "Device table changed");
                    for line in device_table(&devices) {
                        info!("{}", line);
                    }
                }
            }
        }
    }

    info!("Shutting down controller...");
    session.stop().await;
    Ok(())
}

async fn cmd_devices(opts: ControllerOpts, json: bool, verbose: bool) -> Result<()> {
    logging::init_stderr(verbose);
    let session = Session::start(&opts).await?;
    session.discover(opts.wait, None).await;

    let devices = session.broadcaster.registry().list_devices().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No devices found");
    } else {
        for line in device_table(&devices) {
            println!("{}", line);
        }
    }

    session.stop().await;
    Ok(())
}

async fn cmd_set_service(
    opts: ControllerOpts,
    serial: &str,
    service: &str,
    config: Option<String>,
    verbose: bool,
) -> Result<()> {
    logging::init_stderr(verbose);
    let session = Session::start(&opts).await?;
    session.discover(opts.wait, Some(serial)).await;

    println!("Switching {} to {}...", serial, service);
    let result = session
        .broadcaster
        .request_service_change(serial, service, config)
        .await;
    session.stop().await;

    let ack = result.map_err(|e| anyhow!("{serial}: {e}"))?;
    let config = ack.config.as_deref().map(|c| format!(" (config {c})")).unwrap_or_default();
    println!("{} is now running {}{}", serial, ack.service, config);
    Ok(())
}

async fn cmd_power(opts: ControllerOpts, serial: &str, action: &str, verbose: bool) -> Result<()> {
    let action: PowerAction = action.parse().map_err(|e: String| anyhow!(e))?;
    logging::init_stderr(verbose);
    let session = Session::start(&opts).await?;
    session.discover(opts.wait, Some(serial)).await;

    let result = session.broadcaster.request_power_action(serial, action).await;
    session.stop().await;

    result.map_err(|e| anyhow!("{serial}: {e}"))?;
    println!("{} acknowledged {}", serial, action);
    Ok(())
}

async fn cmd_set_index(opts: ControllerOpts, serial: &str, index: u32, verbose: bool) -> Result<()> {
    logging::init_stderr(verbose);
    let session = Session::start(&opts).await?;
    session.discover(opts.wait, Some(serial)).await;

    let result = session.broadcaster.request_index_update(serial, index).await;
    session.stop().await;

    match result.map_err(|e| anyhow!("{serial}: {e}"))? {
        IndexOutcome::Acked(ack) => {
            let index = ack.index.unwrap_or(index);
            println!("{} now shows index {}", serial, index);
        }
        IndexOutcome::Pending => println!("An index update for {} is already in flight", serial),
    }
    Ok(())
}

async fn cmd_forget(opts: ControllerOpts, serial: &str, verbose: bool) -> Result<()> {
    logging::init_stderr(verbose);
    let session = Session::start(&opts).await?;
    session.discover(opts.wait, None).await;

    let result = session.broadcaster.forget_device(serial).await;
    if result.is_ok() {
        // Give the resequencing SET_INDEX commands a chance to be acked.
        session.discover(opts.wait, None).await;
    }
    session.stop().await;

    let changed = result.map_err(|e| anyhow!("{serial}: {e}"))?;
    println!("Forgot {}", serial);
    for (other, index) in changed {
        println!("  {} -> index {}", other, index);
    }
    Ok(())
}

fn device_table(devices: &[DeviceView]) -> Vec<String> {
    let mut lines = vec![format!(
        "{:<20} {:>5} {:<16} {:<15} {:<7} {:<10} {}",
        "SERIAL", "INDEX", "HOST", "IP", "ONLINE", "SERVICE", "PHASE"
    )];
    for device in devices {
        let index = device.index.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
        let ip = device.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".into());
        let (service, phase) = match device.service_state {
            Some(ref state) => (state.expected.to_string(), state.phase.label()),
            None => (
                device
                    .desired_service
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".into()),
                "-".to_string(),
            ),
        };
        lines.push(format!(
            "{:<20} {:>5} {:<16} {:<15} {:<7} {:<10} {}",
            device.serial,
            index,
            device.host.as_deref().unwrap_or("-"),
            ip,
            if device.online { "yes" } else { "no" },
            service,
            phase
        ));
    }
    lines
}
