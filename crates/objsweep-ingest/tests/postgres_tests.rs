//! PostgreSQL destination tests using testcontainers
//!
//! These need a Docker daemon and are skipped unless `OBJSWEEP_CONTAINER_TESTS`
//! is set:
//!
//! ```bash
//! OBJSWEEP_CONTAINER_TESTS=1 cargo test -p objsweep-ingest --test postgres_tests
//! ```

use anyhow::Result;
use chrono::TimeZone;
use objsweep_common::{RecordValue, SweepError};
use objsweep_ingest::builder::{LastModified, ObjectSize};
use objsweep_ingest::config::{
    AnalysisFailurePolicy, DatabaseConfig, DedupFailurePolicy, ObjectFailurePolicy,
    PersistFailurePolicy, StorageConfig,
};
use objsweep_ingest::memory::MemoryObjectStore;
use objsweep_ingest::postgres::PgDestination;
use objsweep_ingest::sink::PersistenceSink;
use objsweep_ingest::store::DestinationStore;
use objsweep_ingest::{IngestionPipeline, SweepConfig};
use serial_test::serial;
use std::sync::Arc;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE ingested_files (
    id BIGSERIAL PRIMARY KEY,
    s3_path TEXT NOT NULL,
    s3_bucket TEXT NOT NULL,
    file_name TEXT NOT NULL UNIQUE,
    size_bytes BIGINT,
    last_modified TIMESTAMPTZ
)
"#;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,objsweep_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn containers_enabled() -> bool {
    if std::env::var("OBJSWEEP_CONTAINER_TESTS").is_err() {
        eprintln!("Skipping container test: OBJSWEEP_CONTAINER_TESTS not set");
        return false;
    }
    true
}

/// Start PostgreSQL and create the destination table
async fn start_postgres() -> Result<(ContainerAsync<Postgres>, DatabaseConfig, PgDestination)> {
    let container = Postgres::default().with_tag("16-alpine").start().await?;

    let config = DatabaseConfig {
        host: container.get_host().await?.to_string(),
        port: container.get_host_port_ipv4(5432).await?,
        name: "postgres".to_string(),
        user: "postgres".to_string(),
        password: "postgres".to_string(),
        max_connections: 2,
        connect_timeout_secs: 30,
    };

    let destination = PgDestination::connect(&config).await?;
    sqlx::query(SCHEMA).execute(destination.pool()).await?;
    info!(port = config.port, "PostgreSQL ready");

    Ok((container, config, destination))
}

async fn row_count(destination: &PgDestination) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingested_files")
        .fetch_one(destination.pool())
        .await?;
    Ok(count)
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
#[serial]
async fn test_insert_rows_binds_every_value_kind() -> Result<()> {
    if !containers_enabled() {
        return Ok(());
    }
    init_tracing();
    let (_container, _config, destination) = start_postgres().await?;

    let modified = chrono::Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
    let rows = vec![
        vec![
            RecordValue::from("p/a.txt"),
            RecordValue::from("docs"),
            RecordValue::from("/d/a.txt"),
            RecordValue::Integer(10),
            RecordValue::Timestamp(modified),
        ],
        vec![
            RecordValue::from("p/b.txt"),
            RecordValue::from("docs"),
            RecordValue::from("/d/b.txt"),
            RecordValue::Null,
            RecordValue::Null,
        ],
    ];

    let inserted = destination
        .insert_rows(
            "ingested_files",
            &columns(&["s3_path", "s3_bucket", "file_name", "size_bytes", "last_modified"]),
            &rows,
        )
        .await?;
    assert_eq!(inserted, 2);

    let stored: Vec<(String, Option<i64>, Option<chrono::DateTime<chrono::Utc>>)> = sqlx::query_as(
        "SELECT file_name, size_bytes, last_modified FROM ingested_files ORDER BY file_name",
    )
    .fetch_all(destination.pool())
    .await?;

    assert_eq!(stored[0], ("/d/a.txt".to_string(), Some(10), Some(modified)));
    assert_eq!(stored[1], ("/d/b.txt".to_string(), None, None));
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_constraint_violation_rolls_back_whole_batch() -> Result<()> {
    if !containers_enabled() {
        return Ok(());
    }
    init_tracing();
    let (_container, _config, destination) = start_postgres().await?;
    let destination = Arc::new(destination);

    let record = |name: &str| {
        objsweep_common::Record::new()
            .with("s3_path", format!("p/{}", name))
            .with("s3_bucket", "docs")
            .with("file_name", format!("/d/{}", name))
    };

    let sink = PersistenceSink::new(Arc::clone(&destination), "ingested_files")?;
    let err = sink
        .persist(&[record("a.txt"), record("b.txt"), record("a.txt")])
        .await
        .unwrap_err();

    assert!(matches!(err, SweepError::Persist { records: 3, .. }));
    assert_eq!(row_count(&destination).await?, 0);

    assert_eq!(sink.persist(&[record("a.txt"), record("b.txt")]).await?, 2);
    assert_eq!(row_count(&destination).await?, 2);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_distinct_values_respects_limit() -> Result<()> {
    if !containers_enabled() {
        return Ok(());
    }
    init_tracing();
    let (_container, _config, destination) = start_postgres().await?;

    for name in ["a", "b", "c"] {
        sqlx::query(
            "INSERT INTO ingested_files (s3_path, s3_bucket, file_name) VALUES ($1, 'docs', $2)",
        )
        .bind(format!("p/{}.txt", name))
        .bind(format!("/d/{}.txt", name))
        .execute(destination.pool())
        .await?;
    }

    let all = destination.distinct_values("ingested_files", "file_name", 10).await?;
    assert_eq!(all.len(), 3);

    let bounded = destination.distinct_values("ingested_files", "file_name", 2).await?;
    assert_eq!(bounded.len(), 2);

    let sizes = destination.distinct_values("ingested_files", "size_bytes", 10).await?;
    assert!(sizes.is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_sweep_into_postgres_is_idempotent() -> Result<()> {
    if !containers_enabled() {
        return Ok(());
    }
    init_tracing();
    let (_container, database, destination) = start_postgres().await?;
    let destination = Arc::new(destination);
    let dir = tempfile::tempdir()?;

    let store = Arc::new(MemoryObjectStore::new().with_page_size(2));
    store.put("docs", "p/x.txt", b"0123456789".to_vec());
    store.put("docs", "p/y.txt", Vec::new());
    store.put("docs", "p/z.txt", b"abcde".to_vec());

    let config = SweepConfig {
        bucket: "docs".to_string(),
        prefix: "p/".to_string(),
        table: "ingested_files".to_string(),
        download_dir: dir.path().to_path_buf(),
        batch_size: 1,
        dedup_limit: 10_000,
        dedup_column: "file_name".to_string(),
        workers: 2,
        on_object_failure: ObjectFailurePolicy::Skip,
        on_analysis_failure: AnalysisFailurePolicy::PersistPartial,
        on_persist_failure: PersistFailurePolicy::Abort,
        on_dedup_failure: DedupFailurePolicy::Abort,
        database,
        storage: StorageConfig::default(),
    };

    let first = IngestionPipeline::new(config.clone(), Arc::clone(&store), Arc::clone(&destination))
        .with_extension(ObjectSize)
        .with_extension(LastModified)
        .run(CancellationToken::new())
        .await?;
    assert_eq!(first.records_persisted, 2);
    assert_eq!(first.skipped_empty, 1);

    let second = IngestionPipeline::new(config, Arc::clone(&store), Arc::clone(&destination))
        .with_extension(ObjectSize)
        .with_extension(LastModified)
        .run(CancellationToken::new())
        .await?;
    assert_eq!(second.records_persisted, 0);
    assert_eq!(second.skipped_existing, 2);
    assert_eq!(row_count(&destination).await?, 2);
    Ok(())
}
