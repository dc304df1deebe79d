use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "omi")]
#[command(version)]
#[command(about = "Fleet agent and controller for OMI service bridges", long_about = None)]
pub(crate) struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run or inspect the on-device agent
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Discover devices and send them commands
    Controller {
        #[command(subcommand)]
        command: ControllerCommands,
    },
}

#[derive(Subcommand)]
pub(crate) enum AgentCommands {
    /// Run the agent in the foreground (Ctrl+C to stop)
    Run(AgentRunArgs),

    /// Show the persisted identity and desired service
    Status {
        /// Agent state file (default: <data>/agent.json)
        #[arg(long)]
        state: Option<PathBuf>,
    },
}

#[derive(Args)]
pub(crate) struct AgentRunArgs {
    /// Port to listen on for DISCOVER and commands
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Directory containing one sub-directory per service
    #[arg(long)]
    pub services_dir: Option<PathBuf>,

    /// Agent state file
    #[arg(long)]
    pub state: Option<PathBuf>,

    /// Log directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

/// Options shared by every controller subcommand.
#[derive(Args, Clone)]
pub(crate) struct ControllerOpts {
    /// Port agents listen on (DISCOVER and commands are sent here)
    #[arg(long)]
    pub broadcast_port: Option<u16>,

    /// Port to receive agent replies on
    #[arg(long)]
    pub reply_port: Option<u16>,

    /// Address advertised to agents in DISCOVER
    #[arg(long)]
    pub advertise_ip: Option<String>,

    /// Device store file (default: <data>/devices.json)
    #[arg(long)]
    pub devices: Option<PathBuf>,

    /// Seconds of discovery before a one-shot command runs
    #[arg(short, long, default_value = "4")]
    pub wait: f64,
}

#[derive(Subcommand)]
pub(crate) enum ControllerCommands {
    /// Run discovery in the foreground, logging the device table on change
    Run {
        #[command(flatten)]
        opts: ControllerOpts,

        /// Log directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// List known devices
    Devices {
        #[command(flatten)]
        opts: ControllerOpts,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Switch a device to another service
    SetService {
        #[command(flatten)]
        opts: ControllerOpts,

        /// Device serial
        serial: String,

        /// Service id (e.g., MIDI, OSC, standby)
        service: String,

        /// Named config to fetch from the config API before starting
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Shut down or reboot a device
    Power {
        #[command(flatten)]
        opts: ControllerOpts,

        /// Device serial
        serial: String,

        /// shutdown or reboot
        action: String,
    },

    /// Assign a display index to a device
    SetIndex {
        #[command(flatten)]
        opts: ControllerOpts,

        /// Device serial
        serial: String,

        index: u32,
    },

    /// Delete a device and compact the remaining indices
    Forget {
        #[command(flatten)]
        opts: ControllerOpts,

        /// Device serial
        serial: String,
    },
}
