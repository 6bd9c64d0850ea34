//! # rentsync CLI
//!
//! Moves bookings from the property-management API into a staging SQLite
//! database, then from staging into the CRM as contacts, products and deals.
//!
//! ## Usage
//!
//! ```bash
//! rentsync --config ./config/rentsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rentsync init` | Create the staging database and its tables |
//! | `rentsync import` | Source API → staging tables |
//! | `rentsync export` | Staging tables → CRM |
//! | `rentsync sync` | `import`, then `export` |
//! | `rentsync stats` | Staging row counts and recent runs |
//! | `rentsync fields <entity>` | CRM custom fields and their labels |
//!
//! ## Examples
//!
//! ```bash
//! rentsync init
//! rentsync import --dry-run
//! rentsync sync --log file --progress off
//! rentsync fields deal
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

use rentsync::config::{self, Config};
use rentsync::crm::CrmEntity;
use rentsync::logging::{self, LogTarget};
use rentsync::pipeline::{self, RunOptions};
use rentsync::progress::ProgressMode;
use rentsync::{migrate, stats};

/// Sync rental bookings from the property-management API into the CRM.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rentsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rentsync",
    about = "Sync rental bookings from the property-management API into the CRM",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rentsync.toml")]
    config: PathBuf,

    /// Where logs go: stderr or a timestamped file in `[logging] dir`.
    #[arg(long, global = true, value_enum, default_value = "stream")]
    log: LogTarget,

    /// Progress on stderr: `human`, `json` or `off`. Defaults to `human` on a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Reconcile and print the change-set sizes without writing anything.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the staging database and its tables. Safe to run repeatedly.
    Init,

    /// Fetch clients, rentals, bookings and fees into the staging tables.
    Import,

    /// Push staging rows to the CRM as contacts, products and deals.
    Export,

    /// Import, then export.
    Sync,

    /// Show staging row counts and recent runs.
    Stats,

    /// List a CRM entity's custom fields (for `[crm.labels]`).
    Fields {
        /// `contact`, `product` or `deal`.
        #[arg(default_value = "deal")]
        entity: CrmEntity,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        debug!("{:?}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg: Config = config::load_config(&cli.config)?;
    if let Some(path) = logging::init(cli.log, &cfg.logging)? {
        eprintln!("Logging to {}", path.display());
    }

    let options = RunOptions {
        dry_run: cli.dry_run,
        progress: cli.progress.unwrap_or_else(ProgressMode::default_for_tty),
        now: None,
    };

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import => {
            pipeline::run_import(&cfg, &options).await?.print();
        }
        Commands::Export => {
            pipeline::run_export(&cfg, &options).await?.print();
        }
        Commands::Sync => {
            pipeline::run_sync(&cfg, &options).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Fields { entity } => {
            pipeline::run_fields(&cfg, entity).await?;
        }
    }

    Ok(())
}
