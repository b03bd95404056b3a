use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::config::{load_profile, ProfileOverrides};
use crate::error::MigrateError;
use crate::orchestrator::Orchestrator;

/// CLI for pgevodb: a PostgreSQL schema migration manager.
#[derive(Parser)]
#[command(
    name = "pgevodb",
    version,
    about = "PostgreSQL schema migration manager"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "migrate.yaml", global = true)]
    pub config: PathBuf,

    /// Profile to use from the configuration
    #[arg(long, global = true)]
    pub env: Option<String>,

    /// Override the profile's DSN
    #[arg(long, global = true)]
    pub dsn: Option<String>,

    /// Override the migrations directory
    #[arg(long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    /// Override the log directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Override the statement timeout in seconds
    #[arg(long, global = true)]
    pub timeout_sec: Option<u32>,

    /// Disable interactive confirmations
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Explicitly confirm production execution
    #[arg(long, global = true)]
    pub confirm_prod: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands in pgevodb.
#[derive(Subcommand)]
pub enum Command {
    /// Show current migration status
    Status,

    /// Preview pending migrations
    Plan {
        /// Target migration id (inclusive)
        #[arg(long)]
        to: Option<String>,
    },

    /// Apply pending migrations
    Up {
        /// Target migration id (inclusive)
        #[arg(long)]
        to: Option<String>,
    },

    /// Rollback applied migrations above the target
    Down {
        /// Boundary id: everything above it is reverted
        #[arg(long)]
        to: String,
    },

    /// Run verification scripts
    Verify {
        /// Verify only the latest applied migration
        #[arg(long, conflicts_with = "id")]
        latest: bool,

        /// Verify a specific migration
        #[arg(long)]
        id: Option<String>,
    },

    /// Repair the stored checksum for a migration
    Repair {
        /// Migration id whose on-disk checksum should be accepted
        #[arg(long = "accept-checksum", value_name = "ID")]
        accept_checksum: String,
    },

    /// Retry a failed migration
    Retry {
        /// Migration id to retry
        #[arg(long)]
        id: String,

        /// Repair the checksum automatically when the filesystem differs
        #[arg(long)]
        accept_checksum: bool,

        /// Override the running-status check (use with caution)
        #[arg(long)]
        force: bool,
    },

    /// Reset or delete failed migration records
    ResetFailed {
        /// Migration id to reset
        #[arg(long)]
        id: String,

        /// Delete the record instead of marking it reverted
        #[arg(long)]
        delete: bool,
    },
}

#[derive(Tabled)]
struct StatusRow {
    id: String,
    status: String,
    applied_at: String,
    applied_by: String,
    #[tabled(rename = "ms")]
    execution_ms: String,
    verify: String,
    note: String,
}

impl Cli {
    pub fn handle_command_line() -> Result<(), MigrateError> {
        let args = Cli::parse();

        let overrides = ProfileOverrides {
            dsn: args.dsn.clone(),
            migrations_dir: args.migrations_dir.clone(),
            log_dir: args.log_dir.clone(),
            timeout_sec: args.timeout_sec,
            non_interactive: args.non_interactive,
        };
        let profile = load_profile(&args.config, args.env.as_deref(), &overrides)?;
        info!(
            "using profile '{}' (schema: {}, migrations: {})",
            profile.name,
            profile.schema,
            profile.migrations_dir.display()
        );
        let orchestrator = Orchestrator::new(profile, args.confirm_prod, args.non_interactive)?;

        match args.command {
            Command::Status => Self::handle_status(&orchestrator),
            Command::Plan { to } => Self::handle_plan(&orchestrator, to.as_deref()),
            Command::Up { to } => {
                info!("running up with target: {to:?}");
                orchestrator.up(to.as_deref())
            }
            Command::Down { to } => {
                info!("running down to: {to}");
                orchestrator.down(&to)
            }
            Command::Verify { latest, id } => {
                Self::handle_verify(&orchestrator, latest, id.as_deref())
            }
            Command::Repair { accept_checksum } => {
                info!("repairing checksum for {accept_checksum}");
                orchestrator.repair(&accept_checksum)?;
                println!("Checksum repaired for {accept_checksum}");
                Ok(())
            }
            Command::Retry {
                id,
                accept_checksum,
                force,
            } => {
                info!("retrying {id} (accept_checksum: {accept_checksum}, force: {force})");
                orchestrator.retry(&id, accept_checksum, force)
            }
            Command::ResetFailed { id, delete } => {
                info!("reset-failed for {id} (delete: {delete})");
                orchestrator.reset_failed(&id, delete)
            }
        }
    }

    fn handle_status(orchestrator: &Orchestrator) -> Result<(), MigrateError> {
        let report = orchestrator.status()?;
        println!("Total migrations: {}", report.total);
        println!("Applied: {}", report.applied);

        if report.entries.is_empty() {
            println!("No migrations found");
            return Ok(());
        }
        let rows: Vec<StatusRow> = report
            .entries
            .iter()
            .map(|e| StatusRow {
                id: e.id.clone(),
                status: e.status.clone(),
                applied_at: e
                    .applied_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
                applied_by: e.applied_by.clone().unwrap_or_else(|| "-".to_string()),
                execution_ms: e
                    .execution_ms
                    .map(|ms| ms.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                verify: match e.verify_ok {
                    Some(true) => "ok".to_string(),
                    Some(false) => "failed".to_string(),
                    None => "-".to_string(),
                },
                note: e.note.clone(),
            })
            .collect();
        println!("{}", Table::new(rows).with(Style::psql()));

        let failed: Vec<_> = report
            .entries
            .iter()
            .filter(|e| e.status == "failed")
            .collect();
        if !failed.is_empty() {
            println!("Failed migrations:");
            for entry in failed {
                match &entry.log_ref {
                    Some(log_ref) => println!("  - {} (log: {log_ref})", entry.id),
                    None => println!("  - {}", entry.id),
                }
            }
        }
        Ok(())
    }

    fn handle_plan(orchestrator: &Orchestrator, to: Option<&str>) -> Result<(), MigrateError> {
        let entries = orchestrator.plan(to)?;
        if entries.is_empty() {
            println!("No pending migrations");
            return Ok(());
        }
        println!("Migrations to apply:");
        for entry in entries {
            let tags = if entry.tags.is_empty() {
                "-".to_string()
            } else {
                entry.tags.join(",")
            };
            let reversible = if entry.reversible { "yes" } else { "no" };
            let online = if entry.online_safe { " online-safe" } else { "" };
            println!("  - {} [tags={tags} reversible={reversible}{online}]", entry.id);
        }
        Ok(())
    }

    fn handle_verify(
        orchestrator: &Orchestrator,
        latest: bool,
        id: Option<&str>,
    ) -> Result<(), MigrateError> {
        let outcomes = orchestrator.verify(latest, id)?;
        let mut first_failed: Option<String> = None;
        for outcome in &outcomes {
            let status = if outcome.ok { "OK" } else { "FAILED" };
            match &outcome.details {
                Some(details) => println!("{}: {status} - {details}", outcome.id),
                None => println!("{}: {status}", outcome.id),
            }
            if !outcome.ok && first_failed.is_none() {
                first_failed = Some(outcome.id.clone());
            }
        }
        match first_failed {
            Some(id) => Err(MigrateError::VerifyFailed(id)),
            None => Ok(()),
        }
    }
}
