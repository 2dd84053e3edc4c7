// ABOUTME: CLI entry point for replication-ledger
// ABOUTME: Parses commands and routes to appropriate handlers

use clap::{Parser, Subcommand};
use replication_ledger::commands::{self, LedgerPaths};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "replication-ledger")]
#[command(about = "Track write-ahead log replication progress and retire finished files", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Replication configuration file (default: ~/.replication-ledger/replication.toml)
    #[arg(long, env = "LEDGER_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Record store database (default: ~/.replication-ledger/ledger.db)
    #[arg(long, env = "LEDGER_STORE", global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record or update the Status record of a write-ahead log file
    Register(commands::records::RegisterArgs),
    /// Merge a shipping worker's progress into a Work record
    Progress(commands::records::ProgressArgs),
    /// Run one garbage collection pass
    Gc(commands::maintenance::RetryArgs),
    /// Run one work assignment tick
    Assign(commands::maintenance::RetryArgs),
    /// Run garbage collection and work assignment until Ctrl-C
    Run,
    /// Show replication progress per file
    Status(commands::status::StatusArgs),
    /// Wait until a table's current files are fully replicated
    Drain(commands::status::DrainArgs),
    /// Manage replication targets
    Targets(commands::targets::TargetsArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let paths = LedgerPaths::resolve(cli.store, cli.config)?;

    match cli.command {
        Commands::Register(args) => commands::records::register(&paths, args).await,
        Commands::Progress(args) => commands::records::progress(&paths, args).await,
        Commands::Gc(retry) => commands::maintenance::gc(&paths, retry).await,
        Commands::Assign(retry) => commands::maintenance::assign(&paths, retry).await,
        Commands::Run => commands::maintenance::run(&paths).await,
        Commands::Status(args) => commands::status::status(&paths, args).await,
        Commands::Drain(args) => commands::status::drain(&paths, args).await,
        Commands::Targets(args) => commands::targets::command(&paths, args).await,
    }
}
