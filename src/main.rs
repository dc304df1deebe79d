mod args;
mod cmd_agent;
mod cmd_controller;
mod shutdown;

use args::{Cli, Commands};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Agent { command } => cmd_agent::cmd_agent(command, cli.verbose).await?,
        Commands::Controller { command } => cmd_controller::cmd_controller(command, cli.verbose).await?,
    }

    Ok(())
}
