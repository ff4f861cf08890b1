//! The sweep orchestrator
//!
//! One [`IngestionPipeline::run`] performs a single bounded pass over a
//! bucket prefix:
//!
//! ```text
//! Init -> Enumerating -> (filter -> fetch -> build -> buffer)* -> Flushing -> Done
//!   \________________________ any fatal error ______________________/ -> Aborted
//! ```
//!
//! Fetch and build run on up to `workers` objects at a time; their results
//! come back to a single loop that owns the batch buffer, so only one
//! transaction is ever open against the destination.

use futures::stream::StreamExt;
use objsweep_common::{ObjectDescriptor, Record, RecordValue, Result, SweepError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::builder::{RecordBuilder, RecordExtension};
use crate::config::{
    DedupFailurePolicy, ObjectFailurePolicy, PersistFailurePolicy, SweepConfig,
};
use crate::dedup::DedupIndex;
use crate::fetcher::{derive_local_path, ObjectFetcher};
use crate::sink::{record_key, PersistenceSink};
use crate::source::ObjectSource;
use crate::store::{DestinationStore, ObjectStore};

/// Sweep lifecycle, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepState {
    Init,
    Enumerating,
    Flushing,
    Done,
    Aborted,
}

impl std::fmt::Display for SweepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SweepState::Init => "init",
            SweepState::Enumerating => "enumerating",
            SweepState::Flushing => "flushing",
            SweepState::Done => "done",
            SweepState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Counters for one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub run_id: Uuid,
    pub listed: u64,
    pub skipped_empty: u64,
    pub skipped_existing: u64,
    pub fetched: u64,
    pub fetch_failures: u64,
    pub analysis_failures: u64,
    pub records_dropped: u64,
    pub records_persisted: u64,
    pub batches: u64,
    pub retries: u64,
    pub bytes_downloaded: u64,
    pub cancelled: bool,
}

impl SweepReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            ..Self::default()
        }
    }
}

/// What happened to one listed object before it reached the buffer
enum Outcome {
    Empty,
    Existing { key: String },
    Built {
        key: String,
        record: Record,
        bytes: u64,
        analysis_failures: usize,
    },
    Failed { key: String, error: SweepError },
    Cancelled { key: String },
}

pub struct IngestionPipeline<S: ?Sized, D: ?Sized> {
    config: SweepConfig,
    objects: Arc<S>,
    destination: Arc<D>,
    builder: RecordBuilder,
    run_id: Uuid,
}

impl<S, D> IngestionPipeline<S, D>
where
    S: ObjectStore + ?Sized + 'static,
    D: DestinationStore + ?Sized,
{
    pub fn new(config: SweepConfig, objects: Arc<S>, destination: Arc<D>) -> Self {
        let builder = RecordBuilder::new(config.on_analysis_failure);
        Self {
            config,
            objects,
            destination,
            builder,
            run_id: Uuid::new_v4(),
        }
    }

    /// Register a content-analysis extension for every built record
    pub fn with_extension(mut self, extension: impl RecordExtension + 'static) -> Self {
        self.builder = self.builder.with_extension(extension);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Sweep the configured prefix once.
    ///
    /// Returns the report when the listing is exhausted or `cancel` fires
    /// (with `cancelled` set). Fatal errors end the sweep with `Err`; any
    /// buffered records discarded on the way out are logged by key.
    pub async fn run(&self, cancel: CancellationToken) -> Result<SweepReport> {
        let span = info_span!(
            "sweep",
            run_id = %self.run_id,
            bucket = %self.config.bucket,
            prefix = %self.config.prefix,
        );
        self.sweep(cancel).instrument(span).await
    }

    async fn sweep(&self, cancel: CancellationToken) -> Result<SweepReport> {
        let mut report = SweepReport::new(self.run_id);
        let mut state = SweepState::Init;
        info!(
            table = %self.config.table,
            batch_size = self.config.batch_size,
            workers = self.config.workers,
            extensions = ?self.builder.extension_names(),
            "Starting sweep"
        );

        let result = self.drive(&cancel, &mut report, &mut state).await;

        match result {
            Ok(()) => {
                transition(&mut state, SweepState::Done);
                info!(
                    listed = report.listed,
                    skipped_empty = report.skipped_empty,
                    skipped_existing = report.skipped_existing,
                    fetched = report.fetched,
                    fetch_failures = report.fetch_failures,
                    analysis_failures = report.analysis_failures,
                    records_dropped = report.records_dropped,
                    records_persisted = report.records_persisted,
                    batches = report.batches,
                    bytes = report.bytes_downloaded,
                    cancelled = report.cancelled,
                    "Sweep complete"
                );
                Ok(report)
            },
            Err(e) => {
                transition(&mut state, SweepState::Aborted);
                error!(
                    error = %e,
                    records_persisted = report.records_persisted,
                    "Sweep aborted"
                );
                Err(e)
            },
        }
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        report: &mut SweepReport,
        state: &mut SweepState,
    ) -> Result<()> {
        let sink = PersistenceSink::new(Arc::clone(&self.destination), self.config.table.as_str())?;
        let index = self.load_index().await?;

        transition(state, SweepState::Enumerating);

        let fetcher = ObjectFetcher::new(Arc::clone(&self.objects));
        let descriptors = ObjectSource::new(Arc::clone(&self.objects))
            .enumerate(&self.config.bucket, &self.config.prefix)
            .take_until(cancel.clone().cancelled_owned());

        let fetcher = &fetcher;
        let index = &index;
        let outcomes = descriptors
            .map(move |item| async move {
                match item {
                    Ok(descriptor) => Ok(self.process(fetcher, index, cancel, descriptor).await),
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(self.config.workers.max(1));
        let mut outcomes = std::pin::pin!(outcomes);

        let mut buffer: Vec<Record> = Vec::with_capacity(self.config.batch_size);

        while let Some(item) = outcomes.next().await {
            let outcome = match item {
                Ok(outcome) => outcome,
                Err(e) => {
                    log_discarded(&buffer, &e);
                    return Err(e);
                },
            };

            report.listed += 1;
            match outcome {
                Outcome::Empty => report.skipped_empty += 1,
                Outcome::Existing { key } => {
                    debug!(key = %key, "Already recorded, skipping");
                    report.skipped_existing += 1;
                },
                Outcome::Cancelled { key } => {
                    debug!(key = %key, "Cancelled before fetch");
                },
                Outcome::Built {
                    key,
                    record,
                    bytes,
                    analysis_failures,
                } => {
                    debug!(key = %key, "Record buffered");
                    report.fetched += 1;
                    report.bytes_downloaded += bytes;
                    report.analysis_failures += analysis_failures as u64;
                    buffer.push(record);
                },
                Outcome::Failed { key, error } => {
                    match &error {
                        SweepError::Analysis { .. } => {
                            report.fetched += 1;
                            report.analysis_failures += 1;
                            report.records_dropped += 1;
                        },
                        SweepError::Fetch { .. } => report.fetch_failures += 1,
                        _ => {},
                    }

                    if error.is_fatal() {
                        log_discarded(&buffer, &error);
                        return Err(error);
                    }

                    if self.config.on_object_failure == ObjectFailurePolicy::Abort {
                        error!(key = %key, error = %error, "Object failed, aborting sweep");
                        log_discarded(&buffer, &error);
                        return Err(error);
                    }

                    warn!(key = %key, error = %error, "Object skipped");
                },
            }

            if buffer.len() >= self.config.batch_size {
                self.flush(&sink, &mut buffer, report, cancel).await?;
            }
        }

        if cancel.is_cancelled() {
            info!(buffered = buffer.len(), "Sweep cancelled, flushing built records");
            report.cancelled = true;
        }

        transition(state, SweepState::Flushing);
        self.flush(&sink, &mut buffer, report, cancel).await
    }

    async fn load_index(&self) -> Result<DedupIndex> {
        let loaded = DedupIndex::load(
            self.destination.as_ref(),
            &self.config.table,
            &self.config.dedup_column,
            self.config.dedup_limit,
        )
        .await;

        match loaded {
            Ok(index) => Ok(index),
            Err(e @ SweepError::DestinationUnavailable { .. })
                if self.config.on_dedup_failure == DedupFailurePolicy::Proceed =>
            {
                warn!(error = %e, "Dedup index unavailable, treating every object as new");
                Ok(DedupIndex::empty())
            },
            Err(e) => Err(e),
        }
    }

    /// Filter, fetch and build one object
    async fn process(
        &self,
        fetcher: &ObjectFetcher<S>,
        index: &DedupIndex,
        cancel: &CancellationToken,
        descriptor: ObjectDescriptor,
    ) -> Outcome {
        let key = descriptor.key.clone();

        if descriptor.is_empty() {
            debug!(key = %key, "Zero-size object, skipping");
            return Outcome::Empty;
        }

        let local_path = match derive_local_path(&key, &self.config.prefix, &self.config.download_dir) {
            Ok(path) => path,
            Err(error) => return Outcome::Failed { key, error },
        };

        let identity = match self.identity(&descriptor, &local_path) {
            Ok(identity) => identity,
            Err(error) => return Outcome::Failed { key, error },
        };
        if index.contains(&identity) {
            return Outcome::Existing { key };
        }

        if cancel.is_cancelled() {
            return Outcome::Cancelled { key };
        }

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled { key },
            result = fetcher.fetch(&descriptor, &local_path) => result,
        };

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(error) => return Outcome::Failed { key, error },
        };

        info!(key = %key, path = %local_path.display(), bytes, "Downloaded object");

        match self.build(descriptor, local_path).await {
            Ok(built) => Outcome::Built {
                key,
                record: built.record,
                bytes,
                analysis_failures: built.failures.len(),
            },
            Err(error) => Outcome::Failed { key, error },
        }
    }

    /// Extensions may read the whole file, so they run off the async workers
    async fn build(
        &self,
        descriptor: ObjectDescriptor,
        local_path: PathBuf,
    ) -> Result<crate::builder::BuiltRecord> {
        let builder = self.builder.clone();
        let key = descriptor.key.clone();

        tokio::task::spawn_blocking(move || builder.build(&descriptor, &local_path))
            .await
            .map_err(|e| SweepError::Analysis {
                extension: "record_builder".to_string(),
                key,
                cause: e.to_string(),
            })?
    }

    /// The value of the dedup column this object's record would carry
    fn identity(&self, descriptor: &ObjectDescriptor, local_path: &std::path::Path) -> Result<String> {
        RecordBuilder::base_record(descriptor, local_path)
            .get(&self.config.dedup_column)
            .and_then(RecordValue::as_text)
            .map(str::to_string)
            .ok_or_else(|| {
                SweepError::config(format!(
                    "Dedup column '{}' is not a baseline text column",
                    self.config.dedup_column
                ))
            })
    }

    /// Persist and clear the buffer, applying the persist failure policy
    async fn flush(
        &self,
        sink: &PersistenceSink<D>,
        buffer: &mut Vec<Record>,
        report: &mut SweepReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(buffer);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let error = match sink.persist(&batch).await {
                Ok(inserted) => {
                    report.records_persisted += inserted;
                    report.batches += 1;
                    info!(records = inserted, attempt, "Persisted batch");
                    return Ok(());
                },
                Err(e) => e,
            };

            warn!(records = batch.len(), attempt, error = %error, "Batch persist failed");

            // Only store failures are retried; schema and identifier errors stay fatal
            let (max_retries, backoff_ms) = match self.config.on_persist_failure {
                PersistFailurePolicy::Retry {
                    max_retries,
                    backoff_ms,
                } if matches!(error, SweepError::Persist { .. }) => (max_retries, backoff_ms),
                _ => {
                    log_discarded(&batch, &error);
                    return Err(error);
                },
            };

            if attempt > max_retries {
                error!(
                    records = batch.len(),
                    attempts = attempt,
                    "Giving up on batch, continuing sweep"
                );
                log_discarded(&batch, &error);
                report.records_dropped += batch.len() as u64;
                return Ok(());
            }

            report.retries += 1;
            let backoff = Duration::from_millis(backoff_ms.saturating_mul(attempt as u64));
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(records = batch.len(), "Cancelled while waiting to retry batch");
                    log_discarded(&batch, &error);
                    report.records_dropped += batch.len() as u64;
                    return Ok(());
                },
                _ = tokio::time::sleep(backoff) => {},
            }
        }
    }
}

fn transition(state: &mut SweepState, next: SweepState) {
    debug!(from = %state, to = %next, "Sweep state");
    *state = next;
}

/// Records never reach the destination silently: each one is logged by key
fn log_discarded(records: &[Record], error: &SweepError) {
    for record in records {
        error!(key = %record_key(record), error = %error, "Record dropped");
    }
}
