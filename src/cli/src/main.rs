//! scantask CLI entry point.

use clap::Parser;

use scantask_cli::commands::{dispatch, Cli};

#[tokio::main]
async fn main() {
    scantask_cli::logging::init();

    let cli = Cli::parse();

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
