use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lotto_core::{DrawRecord, EventKind, NotificationEvent, RawDrawRow};
use lotto_storage::{AnomalyStateFile, DrawStore, RestoreOutcome};
use lotto_sync::{
    audit, load_recent_runs, report_markdown, validate, NotifyConfig, SyncConfig, SyncPipeline,
};
use serde::de::DeserializeOwned;
use tracing::info;

mod lock;

use lock::RunLock;

#[derive(Debug, Parser)]
#[command(name = "lotto-cli")]
#[command(about = "Lottery draw ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Anomaly,
    Divergence,
}

impl From<KindArg> for EventKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Anomaly => EventKind::Anomaly,
            KindArg::Divergence => EventKind::Divergence,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass (default). Exit 0 ok, 2 anomalous, 1 failed.
    Sync,
    /// Record count, latest draw and anomaly counter.
    Stats,
    /// Check every stored draw and report all problems.
    Audit,
    /// Markdown summary of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Send a manual alert through the configured channels.
    Notify {
        #[arg(long, value_enum, default_value_t = KindArg::Anomaly)]
        kind: KindArg,
        #[arg(long)]
        message: String,
    },
    /// Replace one stored draw with a corrected JSON row.
    Restore {
        #[arg(long)]
        file: PathBuf,
    },
    /// Import a JSON array of historical rows through validation and merge.
    Import {
        #[arg(long)]
        file: PathBuf,
    },
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "info",
        1 => "lotto_cli=debug,lotto_sync=debug,lotto_adapters=debug,lotto_storage=debug,info",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => fmt().with_env_filter(env_filter).with_target(false).init(),
        LogFormat::Json => fmt().json().with_env_filter(env_filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli);
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let _lock = RunLock::acquire(&config.lock_path())?;
            let pipeline = SyncPipeline::from_config(&config).await?;
            let run = pipeline.run_once().await;
            pipeline.store().close().await;
            println!(
                "sync {:?}: run_id={} fetched={} inserted={} no_new_streak={} exit={}",
                run.outcome,
                run.run_id,
                run.rows_fetched,
                run.rows_inserted,
                run.consecutive_no_new_draws
                    .map_or_else(|| "-".to_string(), |c| c.to_string()),
                run.exit_code()
            );
            return Ok(exit_code(run.exit_code()));
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            let count = store.count().await?;
            let latest = match store.max_draw_id().await? {
                Some(id) => store.get(id).await?,
                None => None,
            };
            let state = AnomalyStateFile::new(config.anomaly_state_path(), config.store_timeout())
                .load()
                .await?;
            println!("records: {count}");
            match latest {
                Some(record) => println!("latest: {record}"),
                None => println!("latest: none"),
            }
            println!(
                "runs without new draws: {} (threshold {}, alert sent: {})",
                state.consecutive_no_new_draws, config.anomaly_threshold, state.alert_sent
            );
            store.close().await;
        }
        Commands::Audit => {
            let store = open_store(&config).await?;
            let rows = store.all_raw().await?;
            store.close().await;
            let findings = audit(&rows);
            if findings.is_empty() {
                println!("audit ok: {} draws checked", rows.len());
            } else {
                for finding in &findings {
                    println!("draw {}: {}", finding.draw_id, finding.problem);
                }
                println!("audit found {} problem(s) in {} draws", findings.len(), rows.len());
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Report { runs } => {
            let recent = load_recent_runs(&config.reports_dir, runs)?;
            println!("{}", report_markdown(&recent));
        }
        Commands::Notify { kind, message } => {
            let notifier = NotifyConfig::from_env()?.build(config.notify_timeout())?;
            let event = NotificationEvent {
                kind: kind.into(),
                message,
                context: serde_json::json!({ "source": "manual" }),
            };
            let result = notifier.notify(&event).await;
            println!(
                "delivered: {:?} failed: {:?}",
                result.delivered, result.failed
            );
            if !result.any_delivered() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Restore { file } => {
            let row: RawDrawRow = read_json(&file).await?;
            let record = DrawRecord::try_from(&row)
                .with_context(|| format!("draw {} in {} is invalid", row.draw_id, file.display()))?;
            let store = open_store(&config).await?;
            let outcome = store.restore(&record).await?;
            store.close().await;
            match outcome {
                RestoreOutcome::Inserted => println!("draw {} inserted", record.draw_id()),
                RestoreOutcome::Replaced => println!("draw {} replaced", record.draw_id()),
                RestoreOutcome::Unchanged => println!("draw {} already up to date", record.draw_id()),
            }
        }
        Commands::Import { file } => {
            let rows: Vec<RawDrawRow> = read_json(&file).await?;
            let batch = validate(rows).with_context(|| format!("validating {}", file.display()))?;
            let store = open_store(&config).await?;
            let counts = store.merge(batch.records()).await?;
            store.close().await;
            info!(file = %file.display(), inserted = counts.inserted, "historical import finished");
            println!(
                "imported {}: {} rows, {} inserted",
                file.display(),
                batch.len(),
                counts.inserted
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn open_store(config: &SyncConfig) -> Result<DrawStore> {
    DrawStore::connect(&config.database_url, config.store_timeout())
        .await
        .with_context(|| format!("opening draw store {}", config.database_url))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}
