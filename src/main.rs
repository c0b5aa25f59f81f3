//! Command-line bench probe: list registry entries, connect to instruments
//! and issue ad-hoc queries without writing driver code.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labcomms::facade::GenericInstrument;
use labcomms::factory::ConnectionFactory;
use labcomms::registry::InstrumentRegistry;
use std::path::PathBuf;
use tracing::debug;

/// Environment variable overriding the registry file location.
const REGISTRY_ENV: &str = "LABCOMMS_REGISTRY";

#[derive(Parser)]
#[command(name = "labcomms", about = "Laboratory instrument connection probe")]
struct Cli {
    /// Path to the instrument registry file.
    #[arg(long)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all registered instruments and their transports.
    List,
    /// Connect to an instrument and print its identification string.
    Probe {
        /// Instrument identifier from the registry.
        id: String,
    },
    /// Connect to an instrument, send one command and print the reply.
    Query {
        /// Instrument identifier from the registry.
        id: String,
        /// Command string to send verbatim.
        command: String,
    },
}

fn registry_path(cli: &Cli) -> PathBuf {
    cli.registry
        .clone()
        .or_else(|| std::env::var_os(REGISTRY_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/instruments.ini"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let path = registry_path(&cli);
    debug!(path = %path.display(), "loading instrument registry");
    let registry = InstrumentRegistry::load(&path)
        .with_context(|| format!("loading registry from {}", path.display()))?;

    match cli.command {
        Command::List => {
            let factory = ConnectionFactory::new(registry);
            for id in factory.registry().identifiers() {
                let entry = factory
                    .registry()
                    .resolve(id)
                    .with_context(|| format!("resolving '{id}'"))?;
                let device_type = entry
                    .device_type
                    .map(|t| format!("{t:?}").to_lowercase())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<20} {:<8} {}", entry.id, device_type, entry.params.kind());
            }
        }
        Command::Probe { id } => {
            let factory = ConnectionFactory::new(registry);
            let mut instrument = GenericInstrument::connect(&factory, &id)
                .await
                .with_context(|| format!("connecting to '{id}'"))?;
            let ident = instrument.ident().await;
            instrument.close().await;
            println!("{}", ident.with_context(|| format!("identifying '{id}'"))?);
        }
        Command::Query { id, command } => {
            let factory = ConnectionFactory::new(registry);
            let mut instrument = GenericInstrument::connect(&factory, &id)
                .await
                .with_context(|| format!("connecting to '{id}'"))?;
            let reply = instrument.query(&command).await;
            instrument.close().await;
            println!("{}", reply.with_context(|| format!("querying '{id}'"))?);
        }
    }

    Ok(())
}
