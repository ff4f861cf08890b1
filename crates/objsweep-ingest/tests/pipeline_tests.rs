//! End-to-end sweeps over the in-memory object store and destination
//!
//! Covers:
//! 1. Zero-size objects never become records
//! 2. Known objects are skipped before any download
//! 3. A second sweep over an unchanged bucket persists nothing
//! 4. A failed batch leaves no rows behind
//! 5. Cancellation stops enumeration and keeps already-built records

use anyhow::Result;
use async_trait::async_trait;
use objsweep_common::{Record, RecordValue, SweepError};
use objsweep_ingest::builder::{AnalysisContext, FnExtension, ObjectSize, FILE_NAME};
use objsweep_ingest::config::{
    AnalysisFailurePolicy, DatabaseConfig, DedupFailurePolicy, ObjectFailurePolicy,
    PersistFailurePolicy, StorageConfig,
};
use objsweep_ingest::fetcher::derive_local_path;
use objsweep_ingest::memory::{MemoryDestination, MemoryObjectStore};
use objsweep_ingest::store::{ObjectBody, ObjectPage, ObjectStore};
use objsweep_ingest::{IngestionPipeline, SweepConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const TABLE: &str = "ingested_files";
const COLUMNS: &[&str] = &["s3_path", "s3_bucket", "file_name", "size_bytes", "page_count"];

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

fn sweep_config(download_dir: &Path, batch_size: usize) -> SweepConfig {
    SweepConfig {
        bucket: "documents".to_string(),
        prefix: "p/".to_string(),
        table: TABLE.to_string(),
        download_dir: download_dir.to_path_buf(),
        batch_size,
        dedup_limit: 10_000,
        dedup_column: FILE_NAME.to_string(),
        workers: 1,
        on_object_failure: ObjectFailurePolicy::Skip,
        on_analysis_failure: AnalysisFailurePolicy::PersistPartial,
        on_persist_failure: PersistFailurePolicy::Abort,
        on_dedup_failure: DedupFailurePolicy::Abort,
        database: DatabaseConfig::default(),
        storage: StorageConfig::default(),
    }
}

fn destination() -> Arc<MemoryDestination> {
    Arc::new(
        MemoryDestination::new()
            .with_table(TABLE, COLUMNS)
            .with_unique(TABLE, FILE_NAME),
    )
}

fn local(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().to_string()
}

fn persisted_names(dest: &MemoryDestination) -> Vec<String> {
    dest.rows(TABLE)
        .iter()
        .filter_map(|r| r.get(FILE_NAME).and_then(RecordValue::as_text).map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_three_object_scenario() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let store = Arc::new(MemoryObjectStore::new());
    store.put("documents", "p/x.txt", b"0123456789".to_vec());
    store.put("documents", "p/y.txt", Vec::new());
    store.put("documents", "p/z.txt", b"abcde".to_vec());

    let dest = destination();
    let x = local(dir.path(), "x.txt");
    dest.seed(TABLE, Record::new().with(FILE_NAME, x.as_str()));

    let report = IngestionPipeline::new(sweep_config(dir.path(), 10), Arc::clone(&store), Arc::clone(&dest))
        .run(CancellationToken::new())
        .await?;
    info!(?report, "Sweep finished");

    assert_eq!(persisted_names(&dest), vec![x, local(dir.path(), "z.txt")]);
    assert_eq!(store.fetched_keys(), vec!["p/z.txt"]);
    assert!(!dir.path().join("y.txt").exists());
    assert!(!dir.path().join("x.txt").exists());
    assert_eq!(std::fs::read(dir.path().join("z.txt"))?, b"abcde");
    assert_eq!(report.skipped_empty, 1);
    assert_eq!(report.skipped_existing, 1);
    assert_eq!(report.records_persisted, 1);
    assert_eq!(report.bytes_downloaded, 5);

    let row = &dest.rows(TABLE)[1];
    let columns: Vec<&str> = row.columns().collect();
    assert_eq!(columns, vec!["s3_path", "s3_bucket", "file_name"]);
    assert_eq!(row.get("s3_path").and_then(RecordValue::as_text), Some("p/z.txt"));
    assert_eq!(row.get("s3_bucket").and_then(RecordValue::as_text), Some("documents"));
    Ok(())
}

#[tokio::test]
async fn test_zero_size_objects_never_become_records() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let store = Arc::new(MemoryObjectStore::new().with_page_size(2));
    for i in 0..7 {
        store.put("documents", &format!("p/empty-{}.txt", i), Vec::new());
    }
    store.put("documents", "p/full.txt", b"content".to_vec());

    let dest = destination();
    let report = IngestionPipeline::new(sweep_config(dir.path(), 3), Arc::clone(&store), Arc::clone(&dest))
        .run(CancellationToken::new())
        .await?;

    assert_eq!(report.listed, 8);
    assert_eq!(report.skipped_empty, 7);
    assert_eq!(persisted_names(&dest), vec![local(dir.path(), "full.txt")]);
    assert_eq!(store.fetched_keys(), vec!["p/full.txt"]);
    Ok(())
}

#[tokio::test]
async fn test_second_sweep_persists_nothing() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let store = Arc::new(MemoryObjectStore::new().with_page_size(4));
    for i in 0..10 {
        store.put("documents", &format!("p/nested/{}.txt", i), format!("body {}", i).into_bytes());
    }

    let dest = destination();
    let first = IngestionPipeline::new(sweep_config(dir.path(), 3), Arc::clone(&store), Arc::clone(&dest))
        .with_extension(ObjectSize)
        .run(CancellationToken::new())
        .await?;
    assert_eq!(first.records_persisted, 10);
    assert_eq!(first.batches, 4);

    let fetched_after_first = store.fetched_keys().len();
    let second = IngestionPipeline::new(sweep_config(dir.path(), 3), Arc::clone(&store), Arc::clone(&dest))
        .with_extension(ObjectSize)
        .run(CancellationToken::new())
        .await?;

    assert_eq!(second.records_persisted, 0);
    assert_eq!(second.skipped_existing, 10);
    assert_eq!(store.fetched_keys().len(), fetched_after_first);
    assert_eq!(dest.rows(TABLE).len(), 10);
    assert_ne!(first.run_id, second.run_id);
    Ok(())
}

#[tokio::test]
async fn test_failed_batch_leaves_no_rows() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let store = Arc::new(MemoryObjectStore::new());
    for name in ["a", "b", "c", "d"] {
        store.put("documents", &format!("p/{}.txt", name), name.as_bytes().to_vec());
    }

    let dest = destination();
    dest.fail_next_inserts(1);

    let err = IngestionPipeline::new(sweep_config(dir.path(), 4), store, Arc::clone(&dest))
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SweepError::Persist { records: 4, .. }));
    assert!(dest.rows(TABLE).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_derived_path_matches_persisted_file_name() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let download_dir = dir.path().join("out");

    assert_eq!(
        derive_local_path("in/a/b.pdf", "in/", Path::new("/tmp/out/"))?,
        PathBuf::from("/tmp/out/a/b.pdf")
    );

    let store = Arc::new(MemoryObjectStore::new());
    store.put("documents", "p/a/b.pdf", b"%PDF-1.7".to_vec());
    let dest = destination();

    IngestionPipeline::new(sweep_config(&download_dir, 1), store, Arc::clone(&dest))
        .run(CancellationToken::new())
        .await?;

    let expected = derive_local_path("p/a/b.pdf", "p/", &download_dir)?;
    assert_eq!(persisted_names(&dest), vec![expected.to_string_lossy().to_string()]);
    assert!(expected.exists());
    Ok(())
}

type AnalysisFn = fn(&AnalysisContext<'_>, Record) -> anyhow::Result<Record>;

fn count_pdf_pages(ctx: &AnalysisContext<'_>, record: Record) -> anyhow::Result<Record> {
    if !ctx.descriptor.key.ends_with(".pdf") {
        anyhow::bail!("not a PDF");
    }
    Ok(record.with("page_count", 12i64))
}

#[tokio::test]
async fn test_analysis_failure_policies() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let store = Arc::new(MemoryObjectStore::new());
    store.put("documents", "p/report.pdf", b"%PDF".to_vec());
    store.put("documents", "p/notes.txt", b"notes".to_vec());

    let partial = destination();
    let report = IngestionPipeline::new(sweep_config(dir.path(), 10), Arc::clone(&store), Arc::clone(&partial))
        .with_extension(FnExtension::new("page_count", &["page_count"], count_pdf_pages as AnalysisFn))
        .run(CancellationToken::new())
        .await?;

    assert_eq!(report.records_persisted, 2);
    assert_eq!(report.analysis_failures, 1);
    let pages: Vec<Option<RecordValue>> = partial
        .rows(TABLE)
        .iter()
        .map(|r| r.get("page_count").cloned())
        .collect();
    assert_eq!(pages, vec![Some(RecordValue::Null), Some(RecordValue::Integer(12))]);

    let dropped = destination();
    let mut config = sweep_config(dir.path(), 10);
    config.on_analysis_failure = AnalysisFailurePolicy::Drop;
    let report = IngestionPipeline::new(config, store, Arc::clone(&dropped))
        .with_extension(FnExtension::new("page_count", &["page_count"], count_pdf_pages as AnalysisFn))
        .run(CancellationToken::new())
        .await?;

    assert_eq!(report.records_persisted, 1);
    assert_eq!(report.records_dropped, 1);
    assert_eq!(persisted_names(&dropped), vec![local(dir.path(), "report.pdf")]);
    Ok(())
}

fn tag_pdfs_only(ctx: &AnalysisContext<'_>, record: Record) -> anyhow::Result<Record> {
    if ctx.descriptor.key.ends_with(".pdf") {
        Ok(record.with("page_count", 1i64))
    } else {
        Ok(record)
    }
}

#[tokio::test]
async fn test_keys_differing_only_by_separators_keep_their_own_bytes() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let store = Arc::new(MemoryObjectStore::new());
    store.put("documents", "p/a.txt", b"first".to_vec());
    store.put("documents", "p//a.txt", b"SECOND".to_vec());

    let dest = destination();
    let report = IngestionPipeline::new(sweep_config(dir.path(), 10), Arc::clone(&store), Arc::clone(&dest))
        .run(CancellationToken::new())
        .await?;

    assert_eq!(report.fetch_failures, 1);
    assert_eq!(report.records_persisted, 1);
    assert_eq!(store.fetched_keys(), vec!["p/a.txt"]);

    let rows = dest.rows(TABLE);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("s3_path").and_then(RecordValue::as_text), Some("p/a.txt"));
    assert_eq!(std::fs::read(dir.path().join("a.txt"))?, b"first");
    Ok(())
}

#[tokio::test]
async fn test_inconsistent_columns_abort_the_sweep() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let store = Arc::new(MemoryObjectStore::new());
    store.put("documents", "p/a.pdf", b"%PDF".to_vec());
    store.put("documents", "p/b.txt", b"text".to_vec());

    // Declares no columns, so nothing pads the records that lack page_count
    let dest = destination();
    let err = IngestionPipeline::new(sweep_config(dir.path(), 10), store, Arc::clone(&dest))
        .with_extension(FnExtension::new("tagger", &[], tag_pdfs_only as AnalysisFn))
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SweepError::SchemaMismatch { ref key, .. } if key == "p/b.txt"));
    assert!(dest.rows(TABLE).is_empty());
    Ok(())
}

/// Cancels the sweep as soon as a chosen key is requested
struct CancellingStore {
    inner: MemoryObjectStore,
    trigger: String,
    cancel: CancellationToken,
}

#[async_trait]
impl ObjectStore for CancellingStore {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<String>,
    ) -> anyhow::Result<ObjectPage> {
        self.inner.list_page(bucket, prefix, token).await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<ObjectBody> {
        if key == self.trigger {
            self.cancel.cancel();
        }
        self.inner.get_object(bucket, key).await
    }
}

#[tokio::test]
async fn test_cancellation_flushes_built_records() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;

    let inner = MemoryObjectStore::new();
    for name in ["a", "b", "c", "d", "e"] {
        inner.put("documents", &format!("p/{}.txt", name), name.as_bytes().to_vec());
    }

    let cancel = CancellationToken::new();
    let store = Arc::new(CancellingStore {
        inner,
        trigger: "p/c.txt".to_string(),
        cancel: cancel.clone(),
    });

    let dest = destination();
    let report = IngestionPipeline::new(sweep_config(dir.path(), 100), Arc::clone(&store), Arc::clone(&dest))
        .run(cancel)
        .await?;

    assert!(report.cancelled);
    let names = persisted_names(&dest);
    assert!(names.contains(&local(dir.path(), "a.txt")));
    assert!(names.contains(&local(dir.path(), "b.txt")));
    assert!(!names.contains(&local(dir.path(), "d.txt")));
    assert!(!store.inner.fetched_keys().contains(&"p/e.txt".to_string()));
    Ok(())
}
