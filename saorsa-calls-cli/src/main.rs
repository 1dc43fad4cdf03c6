//! Saorsa Calls CLI

use anyhow::Result;
use clap::{Parser, Subcommand};

mod demo;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted two-party call over the in-process relay
    Call {
        /// Negotiate audio only, no video tracks
        #[arg(long)]
        audio_only: bool,

        /// Hand the call to picture-in-picture before hanging up
        #[arg(long)]
        pip: bool,
    },

    /// Run a canceled-call scenario and show the missed-call ledger
    Missed,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "saorsa_calls=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Call { audio_only, pip } => demo::run_call(!audio_only, pip).await?,
        Commands::Missed => demo::run_missed().await?,
    }
    Ok(())
}
