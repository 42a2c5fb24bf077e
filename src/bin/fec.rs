use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use fec_bulk::bulk::download::BulkSource;
use fec_bulk::bulk::job::JobSnapshot;
use fec_bulk::bulk::{DataType, ImportController, ImportRequest, ImportSource};
use fec_bulk::config::ImportConfig;
use fec_bulk::database_ops::{MemoryStore, PgStore, Store};
use fec_bulk::util::db::Db;
use fec_bulk::util::env::{bootstrap_cli, db_url, preflight_check};
use fec_bulk::util::logging::init_tracing;
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fec", version, about = "FEC bulk data importer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Apply pending SQL migrations from ./migrations
    Migrate,
    /// Import one bulk file for a data type and election cycle
    Import {
        /// e.g. individual_contributions, committee_master
        #[arg(long)]
        data_type: DataType,
        /// Even election year, e.g. 2024
        #[arg(long)]
        cycle: i32,
        /// Local .txt/.csv/.zip file; downloads from the FEC site when omitted
        #[arg(long)]
        file: Option<PathBuf>,
        /// Download again even if an earlier copy exists
        #[arg(long, default_value_t = false)]
        force_download: bool,
        /// Override FEC_CHUNK_SIZE for this run
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Parse and merge into an in-memory store; nothing is persisted
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Show one job
    Status { job_id: String },
    /// List recent jobs, newest first
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Cancel a job at its next chunk boundary
    Cancel { job_id: String },
    /// Pause a running job at its next chunk boundary
    Pause { job_id: String },
    /// Continue a paused job from its last committed offset
    Resume { job_id: String },
    /// Start a new job continuing a failed or cancelled one
    Retry { job_id: String },
    /// Pause jobs left running by a process that died; fail never-started ones
    Recover,
    /// Print a stored row by natural key
    Lookup {
        #[arg(long)]
        data_type: DataType,
        /// e.g. C00000001:2024 for committee master rows
        #[arg(long)]
        key: String,
    },
    /// Print the column layout used for a data type
    Layout { data_type: DataType },
}

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap_cli("fec");
    init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();
    let config = ImportConfig::from_env();

    match cli.command {
        Commands::Layout { data_type } => print_layout(data_type),
        Commands::Migrate => {
            let db = connect(&config).await?;
            let applied = db.migrate().await?;
            info!(applied, "migrations complete");
            Ok(())
        }
        Commands::Import {
            data_type,
            cycle,
            file,
            force_download,
            chunk_size,
            dry_run,
        } => {
            let store: Arc<dyn Store> = if dry_run {
                warn!("dry run: rows are merged in memory and discarded");
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(PgStore::new(connect(&config).await?))
            };
            let source = match file {
                Some(path) => ImportSource::LocalFile(path),
                None => ImportSource::Download {
                    force: force_download,
                },
            };
            let ctl = controller(store, &config)?;
            let handle = ctl
                .start_import(ImportRequest {
                    data_type,
                    cycle,
                    source,
                    chunk_size,
                })
                .await?;
            let job_id = handle.job_id.clone();
            info!(%job_id, "import started; Ctrl-C pauses at the next chunk boundary");

            let wait = handle.wait();
            tokio::pin!(wait);
            let outcome = tokio::select! {
                res = &mut wait => res,
                _ = tokio::signal::ctrl_c() => {
                    warn!(%job_id, "interrupt received; pausing");
                    ctl.pause_job(&job_id).await?;
                    wait.await
                }
            };
            match outcome {
                Ok(snapshot) => print_json(&snapshot),
                Err(err) => {
                    if let Ok(snapshot) = ctl.get_job(&job_id).await {
                        print_json(&snapshot)?;
                    }
                    Err(err.into())
                }
            }
        }
        Commands::Status { job_id } => {
            let ctl = pg_controller(&config).await?;
            print_json(&ctl.get_job(&job_id).await?)
        }
        Commands::Jobs { limit } => {
            let ctl = pg_controller(&config).await?;
            let jobs: Vec<JobSnapshot> = ctl.list_jobs(limit).await?;
            print_json(&jobs)
        }
        Commands::Cancel { job_id } => {
            let ctl = pg_controller(&config).await?;
            let accepted = ctl.cancel_job(&job_id).await?;
            print_json(&json!({ "job_id": job_id, "cancel_requested": accepted }))
        }
        Commands::Pause { job_id } => {
            let ctl = pg_controller(&config).await?;
            let accepted = ctl.pause_job(&job_id).await?;
            print_json(&json!({ "job_id": job_id, "pause_requested": accepted }))
        }
        Commands::Resume { job_id } => {
            let ctl = pg_controller(&config).await?;
            let snapshot = ctl.resume_job(&job_id).await?.wait().await?;
            print_json(&snapshot)
        }
        Commands::Retry { job_id } => {
            let ctl = pg_controller(&config).await?;
            let snapshot = ctl.retry_job(&job_id).await?.wait().await?;
            print_json(&snapshot)
        }
        Commands::Recover => {
            let ctl = pg_controller(&config).await?;
            let recovered = ctl.recover_interrupted().await?;
            print_json(&json!({ "recovered": recovered }))
        }
        Commands::Lookup { data_type, key } => {
            let store = PgStore::new(connect(&config).await?);
            let row = store
                .lookup(data_type, &key)
                .await?
                .ok_or_else(|| anyhow!("no {data_type} row with key {key}"))?;
            print_json(&json!({
                "natural_key": row.natural_key,
                "cycle": row.cycle,
                "fields": row.fields_json(),
            }))
        }
    }
}

async fn connect(config: &ImportConfig) -> Result<Db> {
    preflight_check("fec", &[], ImportConfig::LOGGED_KEYS).ok();
    let url = db_url().context("database url")?;
    Db::connect(&url, config.db_max_connections, config.db_acquire_timeout).await
}

fn controller(store: Arc<dyn Store>, config: &ImportConfig) -> Result<ImportController> {
    let source = BulkSource::from_config(config)?;
    Ok(ImportController::new(store, config.clone(), Some(source))?)
}

async fn pg_controller(config: &ImportConfig) -> Result<ImportController> {
    let store: Arc<dyn Store> = Arc::new(PgStore::new(connect(config).await?));
    controller(store, config)
}

fn print_layout(data_type: DataType) -> Result<()> {
    let schema = data_type.schema();
    let fields: Vec<_> = schema
        .fields
        .iter()
        .enumerate()
        .map(|(i, f)| {
            json!({
                "position": i,
                "name": f.name,
                "kind": format!("{:?}", f.kind),
                "aliases": f.aliases,
                "required": f.required,
            })
        })
        .collect();
    print_json(&json!({
        "data_type": data_type,
        "table": data_type.table(),
        "format": format!("{:?}", schema.format),
        "natural_key": schema.natural_key.fields,
        "smart_merge": schema.smart_merge,
        "fields": fields,
    }))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
