use crate::args::{AgentCommands, AgentRunArgs};
use crate::shutdown::cancel_on_signal;
use anyhow::{Context, Result};
use omi::agent::{
    AgentIdentity, AgentStore, HandlerSettings, HeartbeatSampler, HttpConfigClient, LogRenderer, ProcessSupervisor,
    ProtocolHandler, RuntimeEnv, ServiceCatalog, ServiceOrchestrator, Supervisor, SystemPower,
};
use omi::config::AgentSettings;
use omi::env::EnvVar;
use omi::logging;
use omi::transport::{bind_listener, UdpTransport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn cmd_agent(command: AgentCommands, verbose: bool) -> Result<()> {
    match command {
        AgentCommands::Run(args) => cmd_agent_run(args, verbose).await,
        AgentCommands::Status { state } => cmd_agent_status(state).await,
    }
}

async fn cmd_agent_run(args: AgentRunArgs, verbose: bool) -> Result<()> {
    let mut settings = AgentSettings::load()?;
    if let Some(port) = args.listen_port {
        settings.listen_port = port;
    }
    if args.services_dir.is_some() {
        settings.services_dir = args.services_dir;
    }
    if args.state.is_some() {
        settings.state_path = args.state;
    }
    if args.log_dir.is_some() {
        settings.log_dir = args.log_dir;
    }

    let _log_guard = logging::init("agent", &settings.log_dir(), verbose)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting omi agent");

    let catalog = Arc::new(
        ServiceCatalog::discover(&settings.services_dir())
            .await
            .context("Failed to load service catalog")?,
    );
    info!(services = ?catalog.names(), "Service catalog loaded");

    let store = Arc::new(
        AgentStore::load_or_init(settings.state_path(), AgentIdentity::detect(), &catalog)
            .await
            .context("Failed to load agent state")?,
    );
    let identity = store.identity().await;
    info!(serial = %identity.serial, host = %identity.host, index = ?identity.index, "Agent identity");

    let runtime_env = Arc::new(RuntimeEnv::new());
    runtime_env.set(EnvVar::OmiAgentSerial, identity.serial.clone()).await;
    runtime_env.set(EnvVar::OmiAgentHost, identity.host.clone()).await;

    let supervisor = Arc::new(
        ProcessSupervisor::new(catalog.clone(), runtime_env.clone(), settings.log_dir().join("services"))
            .with_terminate_timeout(settings.terminate_timeout()),
    );
    let configs = Arc::new(HttpConfigClient::new()?);
    let orchestrator = Arc::new(
        ServiceOrchestrator::new(catalog.clone(), supervisor.clone(), store.clone(), configs)
            .with_monitor_interval(settings.monitor_interval()),
    );

    // A failed boot leaves the agent in standby; it stays reachable.
    if let Err(e) = orchestrator.boot().await {
        warn!("Initial service did not start: {}", e);
    }

    let socket = bind_listener(settings.listen_port)
        .with_context(|| format!("Failed to bind UDP port {}", settings.listen_port))?;
    let transport = Arc::new(UdpTransport::bind_ephemeral().await?);
    let handler = Arc::new(ProtocolHandler::new(
        orchestrator.clone(),
        transport,
        Arc::new(SystemPower),
        runtime_env,
        HandlerSettings::from(&settings),
    ));

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    let listener = tokio::spawn(handler.clone().run(socket, cancel.clone()));
    let refresh = tokio::spawn(handler.run_refresh(
        HeartbeatSampler::new(),
        Arc::new(LogRenderer::new()),
        cancel.clone(),
    ));
    let monitor = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        async move { orchestrator.run(cancel).await }
    });
    info!("omi agent ready");

    cancel.cancelled().await;
    info!("Shutting down agent...");

    match listener.await {
        Ok(Err(e)) => error!("Listener failed: {}", e),
        Err(e) => error!("Listener task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = tokio::join!(refresh, monitor);

    if let Err(e) = supervisor.stop().await {
        warn!("Failed to stop service: {}", e);
    }
    info!("omi agent stopped");
    Ok(())
}

async fn cmd_agent_status(state: Option<PathBuf>) -> Result<()> {
    let path = match state {
        Some(path) => path,
        None => AgentSettings::load()?.state_path(),
    };

    let Some(record) = AgentStore::peek(&path).await else {
        println!("No agent state at {}", path.display());
        println!("Run `omi agent run` once to create it.");
        return Ok(());
    };

    let identity = &record.identity;
    let index = identity.index.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
    let config = record.desired_config.as_deref().unwrap_or("-");

    println!("Agent state: {}", path.display());
    println!();
    println!("  {:<10} {}", "Serial", identity.serial);
    println!("  {:<10} {}", "Host", identity.host);
    println!("  {:<10} {}", "Name", identity.name.as_deref().unwrap_or("-"));
    println!("  {:<10} {}", "Index", index);
    println!("  {:<10} {}", "Version", record.version);
    println!("  {:<10} {}", "Service", record.desired_service);
    println!("  {:<10} {}", "Config", config);
    Ok(())
}
