#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions, clippy::similar_names)]

use clap::{Parser, Subcommand};
use gitrelay::{tokio, tracing};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

mod client;
mod commands;
mod serve;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "gitrelay", version, about, long_about = None)]
struct Cli {
    /// Management API endpoint used by entity subcommands.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    endpoint: String,
    /// Tenant scope; empty is the global scope.
    #[arg(long, global = true, default_value = "")]
    tenant_id: String,
    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook router server
    Serve {},
    /// Apply pending database migrations
    Migrate {},
    /// Print the version
    Version {},
    /// Manage provider instances
    Providers {
        #[command(subcommand)]
        command: commands::ProviderCommands,
    },
    /// Manage broker drivers
    Drivers {
        #[command(subcommand)]
        command: commands::DriverCommands,
    },
    /// Manage routing rules
    Rules {
        #[command(subcommand)]
        command: commands::RuleCommands,
    },
    /// Inspect and update namespaces
    Namespaces {
        #[command(subcommand)]
        command: commands::NamespaceCommands,
    },
    /// Inspect installations
    Installations {
        #[command(subcommand)]
        command: commands::InstallationCommands,
    },
    /// Query event logs
    EventLogs {
        #[command(subcommand)]
        command: commands::EventLogCommands,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Some(config) = &cli.config {
        gitrelay::set_config_file(config.clone());
    }

    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let client = client::ApiClient::new(cli.endpoint.clone(), cli.tenant_id.clone());

    match cli.command {
        Commands::Serve {} => {
            tracing::info!("gitrelay {VERSION} starting");
            serve::serve().await?;
        }
        Commands::Migrate {} => {
            serve::migrate().await?;
            println!("Database migration complete.");
        }
        Commands::Version {} => {
            println!("{VERSION}");
        }
        Commands::Providers { command } => commands::providers(&client, command).await?,
        Commands::Drivers { command } => commands::drivers(&client, command).await?,
        Commands::Rules { command } => commands::rules(&client, command).await?,
        Commands::Namespaces { command } => commands::namespaces(&client, command).await?,
        Commands::Installations { command } => commands::installations(&client, command).await?,
        Commands::EventLogs { command } => commands::event_logs(&client, command).await?,
    }

    Ok(())
}
