//! Schema migration command line.
//!
//! Reads the same configuration as the server and connects with the
//! sync-driver rendition of `DB_URL`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use orca_server::db;
use orca_server::migrate::MigrationRunner;
use orca_server::Settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "migrate", about = "Apply and author schema migrations", version)]
struct Cli {
    /// Directory holding the revision scripts (defaults to MIGRATIONS__DIR)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending revisions up to TARGET, or to the newest one
    Upgrade { target: Option<String> },
    /// Print the revision the database is at
    Current,
    /// List the revision chain, oldest first
    History,
    /// Write a new revision chained onto the newest one
    Revision {
        #[arg(short, long)]
        message: String,
        /// Fill the script with DDL for the differences between models and database
        #[arg(long)]
        autogenerate: bool,
    },
    /// Exit non-zero when the database is missing tables or columns from the models
    Check,
}

fn main() -> anyhow::Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::new().context("failed to load settings")?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let registry = db::metadata().context("entity registry is inconsistent")?;
    let mut runner = MigrationRunner::from_settings(&settings, registry)
        .context("failed to connect migration engine")?;
    if let Some(dir) = cli.dir {
        runner = runner.with_dir(dir);
    }

    let code = match cli.command {
        Command::Upgrade { target } => {
            let report = runner.upgrade(target.as_deref())?;
            if report.is_noop() {
                println!("Already at {}", report.to.as_deref().unwrap_or("<base>"));
            }
            for revision in &report.applied {
                println!("Applied {}", revision);
            }
            ExitCode::SUCCESS
        }
        Command::Current => {
            println!("{}", runner.current()?.as_deref().unwrap_or("<base>"));
            ExitCode::SUCCESS
        }
        Command::History => {
            let history = runner.history()?;
            let current = runner.current()?;
            for script in history.iter() {
                let marker = if current.as_deref() == Some(script.revision.as_str()) {
                    " (current)"
                } else {
                    ""
                };
                println!(
                    "{} -> {}{}, {}",
                    script.down_revision.as_deref().unwrap_or("<base>"),
                    script.revision,
                    marker,
                    script.message
                );
            }
            ExitCode::SUCCESS
        }
        Command::Revision {
            message,
            autogenerate,
        } => {
            let script = runner.generate(&message, autogenerate)?;
            println!("Generated {}", script.path.display());
            ExitCode::SUCCESS
        }
        Command::Check => {
            let diff = runner.check()?;
            if diff.is_empty() {
                println!("No new upgrade operations detected.");
                ExitCode::SUCCESS
            } else {
                for line in diff.summary() {
                    println!("{}", line);
                }
                ExitCode::FAILURE
            }
        }
    };

    runner.close()?;
    info!("Migration command finished");
    Ok(code)
}
