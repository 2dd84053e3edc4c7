use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::fs;

use super::LedgerPaths;
use crate::config::ReplicationConfig;

#[derive(Args)]
pub struct TargetsArgs {
    #[command(subcommand)]
    command: TargetsCommands,
}

#[derive(Subcommand)]
enum TargetsCommands {
    /// Show the configured targets of every table, or of one table
    List {
        #[arg(long)]
        table: Option<String>,
    },
    /// Replicate a source table to a peer
    Add {
        #[arg(long)]
        table: String,
        #[arg(long)]
        peer: String,
        /// Table id on the peer
        #[arg(long = "remote-table")]
        remote_table: String,
    },
    /// Stop replicating a source table to a peer
    Remove {
        #[arg(long)]
        table: String,
        #[arg(long)]
        peer: String,
    },
    /// Turn replication of a table on or off without forgetting its targets
    Enable {
        #[arg(long)]
        table: String,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

pub async fn command(paths: &LedgerPaths, args: TargetsArgs) -> Result<()> {
    match args.command {
        TargetsCommands::List { table } => {
            let config = paths.load_config()?;
            let tables: Vec<&String> = match &table {
                Some(table) => config.tables.keys().filter(|t| *t == table).collect(),
                None => config.tables.keys().collect(),
            };
            if tables.is_empty() {
                println!("No replication targets configured.");
            }
            for table in tables {
                let enabled = config.tables[table].enabled;
                println!(
                    "Table {}{}",
                    table,
                    if enabled { "" } else { " (disabled)" }
                );
                for (peer, remote) in &config.tables[table].targets {
                    println!("  {} -> remote table {}", peer, remote);
                }
            }
        }
        TargetsCommands::Add {
            table,
            peer,
            remote_table,
        } => {
            let mut config = paths.load_config()?;
            config.add_target(&table, &peer, &remote_table);
            save(paths, &config)?;
            println!(
                "Table {} now replicates to {} (remote table {}).",
                table, peer, remote_table
            );
        }
        TargetsCommands::Remove { table, peer } => {
            let mut config = paths.load_config()?;
            let removed = config
                .tables
                .get_mut(&table)
                .and_then(|t| t.targets.remove(&peer))
                .is_some();
            if removed {
                save(paths, &config)?;
                println!("Table {} no longer replicates to {}.", table, peer);
            } else {
                println!("Table {} has no target {}.", table, peer);
            }
        }
        TargetsCommands::Enable { table, enabled } => {
            let mut config = paths.load_config()?;
            config.tables.entry(table.clone()).or_default().enabled = enabled;
            save(paths, &config)?;
            println!(
                "Replication of table {} {}.",
                table,
                if enabled { "enabled" } else { "disabled" }
            );
        }
    }
    Ok(())
}

fn save(paths: &LedgerPaths, config: &ReplicationConfig) -> Result<()> {
    if let Some(parent) = paths.config.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("Failed to serialize configuration")?;
    fs::write(&paths.config, contents)
        .with_context(|| format!("Failed to write {}", paths.config.display()))?;
    Ok(())
}
