use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{publish, sync};

#[derive(Parser)]
#[command(name = "chx")]
#[command(about = "Change-hash detection engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Reconcile hashes for every entity type (leaves first), then sync delivery rows
    Sync {
        /// Layered config paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Only this entity type
        #[arg(long)]
        entity_type: Option<String>,

        /// Cap on changed rows written per type
        #[arg(long)]
        limit: Option<i64>,

        /// Count pending changes without writing
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Find hashes whose backing row is gone, soft-deleted or out of scope
    Orphans {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        entity_type: Option<String>,

        /// Also delete tombstoned hashes (and their edges and delivery rows)
        #[arg(long, default_value_t = false)]
        purge: bool,
    },

    /// Delivery rows and the dispatcher
    Publish {
        #[command(subcommand)]
        cmd: PublishCmd,
    },

    /// Subscriber management
    Subscriber {
        #[command(subcommand)]
        cmd: SubscriberCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status {
        /// Layered config paths; default table names from CHX_DATABASE_URL when omitted
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    /// Create the store tables if missing. Safe to re-run.
    Migrate {
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PublishCmd {
    /// Create missing delivery rows and reset stale ones
    Sync {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        entity_type: Option<String>,
    },

    /// Run one delivery batch with the built-in strategies
    Run {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        entity_type: Option<String>,
    },

    /// Put rows stuck in dispatched back to pending
    RequeueStale {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Defaults to publish.stale_dispatch_secs
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Count delivery rows by status
    Status {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },

    /// Operator override: record a delivery as published with the current hash
    MarkPublished {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        delivery_id: i64,
    },

    /// Operator override: fail a delivery permanently
    MarkFailed {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        delivery_id: i64,

        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum SubscriberCmd {
    Add {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        entity_type: String,

        /// Delivery strategy name (log | webhook)
        #[arg(long)]
        strategy: String,

        /// Higher runs first
        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Strategy options as a JSON object
        #[arg(long)]
        options_json: Option<String>,
    },

    List {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },

    SetStatus {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        #[arg(long)]
        id: i64,

        /// active | inactive
        #[arg(long)]
        status: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => match cmd {
            DbCmd::Status { config_paths } => {
                let (pool, tables) = commands::open_store(&config_paths).await?;
                let s = chx_db::status(&pool, &tables).await?;
                println!("db_ok={} has_store_tables={}", s.ok, s.has_store_tables);
            }
            DbCmd::Migrate { config_paths } => {
                let (pool, tables) = commands::open_store(&config_paths).await?;
                chx_db::install_schema(&pool, &tables)
                    .await
                    .context("migrate failed")?;
                println!("migrations_applied=true");
            }
        },

        Commands::ConfigHash { paths } => {
            let (loaded, settings) = commands::load_settings(&paths)?;
            println!("config_hash={}", loaded.config_hash);
            println!("entity_types={}", settings.entities.len());
            println!("{}", loaded.canonical_json);
        }

        Commands::Sync {
            config_paths,
            entity_type,
            limit,
            dry_run,
        } => sync::sync(&config_paths, entity_type, limit, dry_run).await?,

        Commands::Orphans {
            config_paths,
            entity_type,
            purge,
        } => sync::orphans(&config_paths, entity_type, purge).await?,

        Commands::Publish { cmd } => match cmd {
            PublishCmd::Sync {
                config_paths,
                entity_type,
            } => publish::sync(&config_paths, entity_type).await?,
            PublishCmd::Run {
                config_paths,
                entity_type,
            } => publish::run(&config_paths, entity_type).await?,
            PublishCmd::RequeueStale {
                config_paths,
                older_than_secs,
            } => publish::requeue_stale(&config_paths, older_than_secs).await?,
            PublishCmd::Status { config_paths } => publish::status(&config_paths).await?,
            PublishCmd::MarkPublished {
                config_paths,
                delivery_id,
            } => publish::mark_published(&config_paths, delivery_id).await?,
            PublishCmd::MarkFailed {
                config_paths,
                delivery_id,
                reason,
            } => publish::mark_failed(&config_paths, delivery_id, &reason).await?,
        },

        Commands::Subscriber { cmd } => match cmd {
            SubscriberCmd::Add {
                config_paths,
                entity_type,
                strategy,
                priority,
                options_json,
            } => {
                publish::subscriber_add(&config_paths, entity_type, strategy, priority, options_json)
                    .await?
            }
            SubscriberCmd::List { config_paths } => publish::subscriber_list(&config_paths).await?,
            SubscriberCmd::SetStatus {
                config_paths,
                id,
                status,
            } => publish::subscriber_set_status(&config_paths, id, &status).await?,
        },
    }

    Ok(())
}
