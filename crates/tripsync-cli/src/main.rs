use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tripsync_storage::{derive_surrogate_key, ConnectionOverrides, StoreConfig};
use tripsync_sync::{MergeMode, SyncConfig, SyncSummary};

/// Token accepted by `tripsync key` for a NULL key component.
const NULL_TOKEN: &str = "\\N";

#[derive(Debug, Parser)]
#[command(name = "tripsync")]
#[command(about = "Reconcile and merge staged trip relations into their final tables")]
struct Cli {
    #[command(flatten)]
    db: DbArgs,
    /// YAML entity registry replacing the built-in yellow/green trip entities.
    #[arg(long, env = "TRIPSYNC_ENTITIES", global = true)]
    entities: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct DbArgs {
    /// Connection URL; `DATABASE_URL` is read when absent.
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[arg(long, global = true)]
    db_name: Option<String>,
    #[arg(long, global = true)]
    db_user: Option<String>,
    #[arg(long, global = true)]
    db_pass: Option<String>,
    #[arg(long, global = true)]
    db_host: Option<String>,
    #[arg(long, global = true)]
    db_port: Option<u16>,
    #[arg(long, global = true)]
    schema: Option<String>,
    #[arg(long, global = true)]
    statement_timeout_secs: Option<u64>,
}

impl DbArgs {
    /// Layers the flags over `base`. The discrete `--db-*` flags override the
    /// matching parts of the URL as well as the `DB_*` variables.
    fn store_config(self, mut base: StoreConfig) -> StoreConfig {
        if self.database_url.is_some() {
            base.database_url = self.database_url;
        }
        base.overrides = ConnectionOverrides {
            host: self.db_host,
            port: self.db_port,
            user: self.db_user,
            password: self.db_pass,
            name: self.db_name,
        };
        if let Some(schema) = self.schema {
            base.schema = schema;
        }
        if let Some(secs) = self.statement_timeout_secs {
            base.statement_timeout = Some(Duration::from_secs(secs));
        }
        base
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Synchronize every registered entity, or the ones named with --entity.
    Sync {
        #[arg(long = "entity")]
        only: Vec<String>,
        #[arg(long, default_value = "insert-only")]
        mode: MergeMode,
        #[arg(long)]
        json: bool,
    },
    /// Show the schema changes a sync would apply, without applying them.
    Plan {
        #[arg(long = "entity")]
        only: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print the surrogate identity of a business key tuple. Use \N for NULL.
    Key {
        #[arg(required = true, allow_hyphen_values = true)]
        values: Vec<String>,
    },
    /// List registered entity types.
    Entities,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries command output; logs go to stderr in both formats.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn print_summary(summary: &SyncSummary) {
    for result in &summary.results {
        println!(
            "{}: created={} added={} archived={} retyped={} deduplicated={} updated={} \
             inserted={} run_id={}",
            result.entity_type,
            result.final_created,
            result.columns_added.len(),
            result.columns_archived.len(),
            result.columns_retyped.len(),
            result.rows_deduplicated,
            result.rows_updated,
            result.rows_inserted,
            result.run_id
        );
    }
    for failure in &summary.failures {
        println!("{}: FAILED {}", failure.entity_type, failure.error);
    }
    println!(
        "sync complete: reconciled={} failed={}",
        summary.relations_reconciled,
        summary.failures.len()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = SyncConfig {
        store: cli.db.store_config(StoreConfig::from_env()),
        entities_file: cli.entities,
        mode: MergeMode::default(),
    };

    match cli.command {
        Commands::Sync { only, mode, json } => {
            config.mode = mode;
            info!(entities = ?only, ?mode, "starting sync");
            let summary = tripsync_sync::run_sync(&config, &only).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            if !summary.is_success() {
                anyhow::bail!("{} of the entities failed to synchronize", summary.failures.len());
            }
        }
        Commands::Plan { only, json } => {
            let plans = tripsync_sync::plan_sync(&config, &only).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            } else {
                for plan in &plans {
                    if plan.changes.is_empty() {
                        println!("{}: up to date", plan.entity_type);
                    }
                    for change in &plan.changes {
                        println!("{}: {}", plan.entity_type, change.describe());
                    }
                }
            }
        }
        Commands::Key { values } => {
            let parts = values.iter().map(|v| (v != NULL_TOKEN).then_some(v.as_str()));
            let key = derive_surrogate_key(parts);
            println!("{key}");
        }
        Commands::Entities => {
            let registry = config.registry().context("loading entity registry")?;
            for entity in registry.entities() {
                let key = entity.business_key.iter().map(|k| k.as_str()).collect::<Vec<_>>();
                println!(
                    "{}: {} -> {} key=({}) tie_break={} columns={}",
                    entity.entity_type,
                    entity.staging_relation,
                    entity.final_relation,
                    key.join(", "),
                    entity.tie_break,
                    entity.columns.len()
                );
            }
        }
    }

    Ok(())
}
