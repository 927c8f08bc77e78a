//! CLI tool for administering MFA methods
//!
//! # Usage
//!
//! ```bash
//! # List a user's methods
//! mfa-admin list user-42 --db sqlite://mfa.db
//!
//! # Show MFA status
//! mfa-admin status user-42
//!
//! # Remove a method
//! mfa-admin remove 6f1c0a52-2a9e-4e63-9f0e-1d2b3c4d5e6f
//!
//! # Issue a fresh set of backup codes, replacing the old ones
//! mfa-admin backup-codes user-42 --replace
//!
//! # Drop challenge records older than a day
//! mfa-admin purge --older-than-hours 24
//! ```

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use mfa_core::{ConsoleChannel, MfaConfig, MfaService, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "mfa-admin")]
#[command(about = "Administer multi-factor authentication methods", long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database URL, overrides the config file (e.g., sqlite://mfa.db)
    #[arg(short, long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a user's methods
    List {
        /// User id
        user: String,
    },
    /// Show a user's MFA summary
    Status {
        /// User id
        user: String,
    },
    /// Remove a method by id
    Remove {
        /// Method id
        method_id: Uuid,
    },
    /// Generate backup codes for a user
    BackupCodes {
        /// User id
        user: String,
        /// Number of codes (defaults to the configured count)
        #[arg(short = 'n', long)]
        count: Option<usize>,
        /// Delete the user's existing backup codes first
        #[arg(long)]
        replace: bool,
    },
    /// Delete stale challenge records
    Purge {
        /// Only records created more than this many hours ago
        #[arg(long, default_value_t = 24)]
        older_than_hours: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MfaConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MfaConfig::default(),
    };
    if let Some(db) = cli.db {
        config.storage.database_url = db;
    }

    mfa_core::logging::init(&config.logging)?;
    info!("Using database {}", config.storage.database_url);

    let store = Arc::new(SqliteStore::connect(&config.storage.database_url).await?);
    let service = MfaService::new(config, store, Arc::new(ConsoleChannel))?;

    match cli.command {
        Commands::List { user } => {
            let methods = service.registry().list_methods(&user).await?;

            if methods.is_empty() {
                println!("No methods found.");
            } else {
                println!(
                    "{:<38} {:<8} {:<20} {:<9} {:<8} {:<20}",
                    "Id", "Kind", "Destination", "Verified", "Primary", "Last Used"
                );
                println!("{:-<105}", "");

                for m in &methods {
                    let last_used = m
                        .last_used_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "Never".to_string());
                    println!(
                        "{:<38} {:<8} {:<20} {:<9} {:<8} {:<20}",
                        m.id.to_string(),
                        m.kind,
                        m.destination.as_deref().unwrap_or("-"),
                        m.is_verified,
                        m.is_primary,
                        last_used
                    );
                }

                println!("\nTotal: {} method(s)", methods.len());
            }
        }
        Commands::Status { user } => {
            let status = service.status(&user).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Remove { method_id } => {
            service.registry().remove_method(method_id).await?;
            println!("✓ Method {} removed", method_id);
        }
        Commands::BackupCodes {
            user,
            count,
            replace,
        } => {
            let codes = if replace {
                service
                    .backup_codes()
                    .regenerate_backup_codes(&user, count)
                    .await?
            } else {
                service
                    .backup_codes()
                    .generate_backup_codes(&user, count)
                    .await?
            };

            println!("Backup codes for {} (shown once):\n", user);
            for code in codes.display_codes() {
                println!("  {}", code);
            }
        }
        Commands::Purge { older_than_hours } => {
            let cutoff = Utc::now() - Duration::hours(older_than_hours);
            let removed = service.issuer().purge_stale_challenges(cutoff).await?;
            println!("✓ Removed {} challenge record(s)", removed);
        }
    }

    Ok(())
}
