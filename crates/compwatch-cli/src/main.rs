use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use compwatch_sync::{RunOutcome, WatchConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "compwatch")]
#[command(about = "Watch the WCA API for newly announced competitions")]
struct Cli {
    /// YAML file with configuration overrides (environment variables still win).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch competitions, refresh the summary and notify about new ones (default).
    Check {
        /// Read the API payload from a saved JSON file instead of the network.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Print the IDs already reported.
    Seen,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Check { fixture: None }) {
        Commands::Check { fixture } => {
            let summary = compwatch_sync::run_check_once(config, fixture).await?;
            match summary.outcome {
                RunOutcome::NoNewCompetitions => println!(
                    "no new competitions ({} fetched); summary refreshed at {}",
                    summary.fetched,
                    summary.summary_path.display()
                ),
                RunOutcome::NewCompetitions(n) => println!(
                    "{n} new: {}; summary written to {}",
                    summary.new_ids.join(", "),
                    summary.summary_path.display()
                ),
            }
        }
        Commands::Seen => {
            for id in compwatch_sync::load_seen_ids(&config).await? {
                println!("{id}");
            }
        }
    }

    Ok(())
}
