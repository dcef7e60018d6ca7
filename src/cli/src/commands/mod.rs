//! CLI command definitions and dispatch.

mod fetch;
mod version;
mod worker;

use clap::{Parser, Subcommand};

pub use fetch::FetchArgs;
pub use worker::WorkerArgs;

/// Pull OCI artifacts as Docker archives and scan them for vulnerabilities.
#[derive(Parser)]
#[command(name = "scantask", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Consume scan jobs from the queue until interrupted
    Worker(WorkerArgs),
    /// Pull one artifact into a Docker archive, optionally scanning it
    Fetch(FetchArgs),
    /// Show version information
    Version,
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Worker(args) => worker::execute(args).await,
        Command::Fetch(args) => fetch::execute(args).await,
        Command::Version => {
            version::execute();
            Ok(())
        }
    }
}
