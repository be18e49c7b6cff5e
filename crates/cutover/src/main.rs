//! Cutover: move code-review changes from the legacy database to the log store.
//!
//! Subcommands:
//! - `migrate`: run the full migration from the site's current state
//! - `rebuild`: rebuild some or all changes without changing the state
//! - `status`: print the current migration state

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cutover_legacy::ChangeId;
use cutover_migrate::{MigrationRequest, MigrationRequestBuilder, Migrator, ProgressSink};
use cutover_repo::ProjectName;
use cutover_state::MigrationState;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod site;

use site::{Site, default_site_dir};

#[derive(Parser)]
#[command(name = "cutover")]
#[command(about = "Migrate changes from the legacy database to the log store", long_about = None)]
struct Cli {
    /// Site directory
    #[arg(long, env = "CUTOVER_SITE", default_value_os_t = default_site_dir())]
    site: PathBuf,

    /// Don't print progress
    #[arg(long, short)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate the site to the log store
    Migrate {
        /// Worker tasks to run at once
        #[arg(long, default_value = "1")]
        threads: usize,

        /// Stop once the log store is readable and writable
        #[arg(long)]
        trial: bool,

        /// Rebuild all changes even if already rebuilt
        #[arg(long)]
        force: bool,

        /// Gap between legacy and log-store change ids (default from config)
        #[arg(long)]
        sequence_gap: Option<i64>,

        /// Resume the migration automatically when the server restarts
        #[arg(long)]
        auto_migrate: bool,

        /// Seconds each change stays read-only during cutover
        #[arg(long)]
        lease_timeout: Option<u64>,

        /// Stop when this state is reached
        #[arg(long, value_parser = parse_state)]
        stop_at: Option<MigrationState>,
    },

    /// Rebuild changes into the log store
    Rebuild {
        /// Worker tasks to run at once
        #[arg(long, default_value = "1")]
        threads: usize,

        /// Only rebuild changes of this project (repeatable)
        #[arg(long = "project", conflicts_with = "changes")]
        projects: Vec<String>,

        /// Only rebuild this change (repeatable)
        #[arg(long = "change")]
        changes: Vec<u32>,
    },

    /// Print the current migration state
    Status,
}

fn parse_state(s: &str) -> Result<MigrationState, String> {
    s.parse().map_err(|e| format!("{e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let site = Site::open(&cli.site).await?;
    let progress = if cli.quiet {
        ProgressSink::none()
    } else {
        ProgressSink::stderr()
    };

    match cli.command {
        Commands::Migrate {
            threads,
            trial,
            force,
            sequence_gap,
            auto_migrate,
            lease_timeout,
            stop_at,
        } => {
            let mut builder = MigrationRequest::builder()
                .threads(threads)
                .force_rebuild(force)
                .progress(progress);
            // Flags left off fall back to the site config.
            if trial {
                builder = builder.trial(true);
            }
            if auto_migrate {
                builder = builder.auto_migrate(true);
            }
            if let Some(gap) = sequence_gap {
                builder = builder.sequence_gap(gap);
            }
            if let Some(secs) = lease_timeout {
                builder = builder.lease_timeout(std::time::Duration::from_secs(secs));
            }
            if let Some(state) = stop_at {
                builder = builder.stop_at(state);
            }
            let migrator = migrator(&site, builder).await?;
            migrator.migrate().await.into_diagnostic()?;
        }
        Commands::Rebuild {
            threads,
            projects,
            changes,
        } => {
            let builder = MigrationRequest::builder()
                .threads(threads)
                .projects(projects.into_iter().map(ProjectName::new))
                .changes(changes.into_iter().map(ChangeId))
                .progress(progress);
            let migrator = migrator(&site, builder).await?;
            migrator.rebuild().await.into_diagnostic()?;
        }
        Commands::Status => {
            let state = site.store.load().await.into_diagnostic()?;
            println!("{state}");
            println!("  {}", state.flags());
        }
    }

    Ok(())
}

async fn migrator(site: &Site, builder: MigrationRequestBuilder) -> Result<Migrator> {
    let request = builder.build().into_diagnostic()?;
    Migrator::new(
        request,
        site.store.clone(),
        site.repos.clone(),
        site.legacy.clone(),
    )
    .await
    .into_diagnostic()
}
