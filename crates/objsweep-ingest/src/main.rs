//! objsweep - sweep an S3 prefix into a PostgreSQL table

use anyhow::{Context, Result};
use clap::Parser;
use objsweep_common::logging::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};
use objsweep_common::SweepError;
use objsweep_ingest::builder::{ContentChecksum, LastModified, ObjectSize};
use objsweep_ingest::config::{
    AnalysisFailurePolicy, DedupFailurePolicy, ObjectFailurePolicy, PersistFailurePolicy,
    SweepConfigBuilder, DEFAULT_PERSIST_BACKOFF_MS,
};
use objsweep_ingest::postgres::PgDestination;
use objsweep_ingest::s3::S3ObjectStore;
use objsweep_ingest::{IngestionPipeline, SweepReport};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status after Ctrl-C (128 + SIGINT)
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "objsweep")]
#[command(author, version, about = "Ingest S3 objects into a PostgreSQL table")]
struct Cli {
    /// Source bucket
    #[arg(long, env = "SWEEP_BUCKET")]
    bucket: Option<String>,

    /// Key prefix to sweep
    #[arg(long, env = "SWEEP_PREFIX")]
    prefix: Option<String>,

    /// Destination table
    #[arg(long, env = "SWEEP_TABLE")]
    table: Option<String>,

    /// Local directory objects are downloaded into
    #[arg(long, env = "SWEEP_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// Records per insert transaction
    #[arg(long, env = "SWEEP_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Maximum already-recorded keys loaded for skip detection
    #[arg(long, env = "SWEEP_DEDUP_LIMIT")]
    dedup_limit: Option<i64>,

    /// Column compared against for skip detection
    #[arg(long, env = "SWEEP_DEDUP_COLUMN")]
    dedup_column: Option<String>,

    /// Concurrent fetch workers
    #[arg(short, long, env = "SWEEP_WORKERS")]
    workers: Option<usize>,

    /// skip | abort
    #[arg(long, env = "SWEEP_ON_OBJECT_FAILURE")]
    on_object_failure: Option<ObjectFailurePolicy>,

    /// persist-partial | drop
    #[arg(long, env = "SWEEP_ON_ANALYSIS_FAILURE")]
    on_analysis_failure: Option<AnalysisFailurePolicy>,

    /// Retry a failed batch this many times before dropping it, instead of aborting
    #[arg(long)]
    persist_retries: Option<u32>,

    /// Base backoff between batch retries in milliseconds
    #[arg(long, default_value_t = DEFAULT_PERSIST_BACKOFF_MS)]
    persist_backoff_ms: u64,

    /// abort | proceed
    #[arg(long, env = "SWEEP_ON_DEDUP_FAILURE")]
    on_dedup_failure: Option<DedupFailurePolicy>,

    /// Add a size_bytes column from the listing
    #[arg(long)]
    with_size: bool,

    /// Add a last_modified column from the listing
    #[arg(long)]
    with_last_modified: bool,

    /// Add a sha256 column computed from the downloaded file
    #[arg(long)]
    with_checksum: bool,

    /// Write the final report as JSON to this file
    #[arg(long)]
    report_file: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// CLI values win over the environment
    fn apply(&self, mut builder: SweepConfigBuilder) -> SweepConfigBuilder {
        fn set<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }

        set(&mut builder.bucket, &self.bucket);
        set(&mut builder.prefix, &self.prefix);
        set(&mut builder.table, &self.table);
        set(&mut builder.download_dir, &self.download_dir);
        set(&mut builder.batch_size, &self.batch_size);
        set(&mut builder.dedup_limit, &self.dedup_limit);
        set(&mut builder.dedup_column, &self.dedup_column);
        set(&mut builder.workers, &self.workers);
        set(&mut builder.on_object_failure, &self.on_object_failure);
        set(&mut builder.on_analysis_failure, &self.on_analysis_failure);
        set(&mut builder.on_dedup_failure, &self.on_dedup_failure);

        if let Some(retries) = self.persist_retries {
            builder.on_persist_failure = Some(PersistFailurePolicy::retry(
                retries,
                Duration::from_millis(self.persist_backoff_ms),
            ));
        }

        builder
    }
}

#[tokio::main]
async fn main() {
    // Load .env before clap reads its env-backed arguments
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .format(if cli.json_logs { LogFormat::Json } else { LogFormat::Text })
        .log_file_prefix("objsweep")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {:#}", e);
            process::exit(1);
        },
    };

    let code = match run(&cli).await {
        Ok(report) if report.cancelled => EXIT_CANCELLED,
        Ok(_) => 0,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Sweep failed");
            eprintln!("Error: {:#}", e);
            1
        },
    };

    // Flush buffered file logs before exiting
    drop(guard);
    process::exit(code);
}

async fn run(cli: &Cli) -> Result<SweepReport> {
    let config = cli.apply(SweepConfigBuilder::from_env()?).build()?;

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create download directory {}",
                config.download_dir.display()
            )
        })?;

    let objects = Arc::new(
        S3ObjectStore::new(&config.storage)
            .await
            .context("Failed to initialize S3 client")?,
    );
    let destination = Arc::new(PgDestination::connect(&config.database).await.map_err(|e| {
        SweepError::DestinationUnavailable {
            cause: format!("{:#}", e),
        }
    })?);

    info!(
        source = %format!("s3://{}/{}", config.bucket, config.prefix),
        table = %config.table,
        "Configuration resolved"
    );
    let pipeline = with_extensions(IngestionPipeline::new(config, objects, destination), cli);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current batch");
            on_signal.cancel();
        }
    });

    info!(run_id = %pipeline.run_id(), "Sweep starting");
    let report = pipeline.run(cancel).await?;

    if let Some(path) = &cli.report_file {
        let json = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    Ok(report)
}

fn with_extensions(
    mut pipeline: IngestionPipeline<S3ObjectStore, PgDestination>,
    cli: &Cli,
) -> IngestionPipeline<S3ObjectStore, PgDestination> {
    if cli.with_size {
        pipeline = pipeline.with_extension(ObjectSize);
    }
    if cli.with_last_modified {
        pipeline = pipeline.with_extension(LastModified);
    }
    if cli.with_checksum {
        pipeline = pipeline.with_extension(ContentChecksum);
    }
    pipeline
}
