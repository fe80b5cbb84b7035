use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use agency::config::{AgencyConfig, CliOverrides};

mod cmd;

#[derive(Parser)]
#[command(name = "agency")]
#[command(version, about = "Client, project and task board with human-readable slugs")]
pub struct Cli {
    /// Path to agency.toml (defaults to .agency/agency.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path. Overrides agency.toml and AGENCY_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Log filter directive, e.g. "debug" or "agency=trace". RUST_LOG wins when set.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket board server
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Enable permissive CORS for a separately served frontend
        #[arg(long)]
        dev: bool,
    },
    /// Create agency.toml and the database
    Init,
    /// Look up the entity a slug refers to
    Resolve {
        slug: String,

        /// Entity kind hint: task, sprint or project
        #[arg(short, long)]
        kind: Option<String>,
    },
    /// Assign a slug to an existing entity (idempotent)
    Allocate {
        #[arg(short, long)]
        kind: String,

        #[arg(long)]
        id: i64,
    },
    /// Assign slugs to entities created before their client had a key
    Backfill,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default agency.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let creates_config = matches!(
        cli.command,
        Commands::Init
            | Commands::Config {
                command: Some(ConfigCommands::Init)
            }
    );
    let base = match &cli.config {
        Some(path) if creates_config && !path.exists() => AgencyConfig::defaults_at(path.clone()),
        path => AgencyConfig::load(path.as_deref())?,
    };

    let (host, port, dev_mode) = match &cli.command {
        Commands::Serve { host, port, dev } => (host.clone(), *port, *dev),
        _ => (None, None, false),
    };
    let config = base.with_env()?.with_cli(CliOverrides {
        host,
        port,
        db_path: cli.db_path.clone(),
        dev_mode,
        log_level: cli.log_level.clone(),
        log_json: cli.log_json,
    });

    agency::logging::init(&config.toml.logging)?;

    match &cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(&config).await?,
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Resolve { slug, kind } => cmd::cmd_resolve(&config, slug, kind.as_deref())?,
        Commands::Allocate { kind, id } => cmd::cmd_allocate(&config, kind, *id)?,
        Commands::Backfill => cmd::cmd_backfill(&config)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
