//! Record construction and pluggable content analysis
//!
//! [`RecordBuilder`] produces the baseline row for a materialized object and
//! then runs each registered [`RecordExtension`] in registration order. An
//! extension receives the record built so far and returns it with its own
//! columns added.

use anyhow::Context;
use objsweep_common::checksum::compute_file_checksum;
use objsweep_common::types::ChecksumAlgorithm;
use objsweep_common::{ObjectDescriptor, Record, RecordValue, Result, SweepError};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::config::AnalysisFailurePolicy;

pub const S3_PATH: &str = "s3_path";
pub const S3_BUCKET: &str = "s3_bucket";
pub const FILE_NAME: &str = "file_name";

/// Baseline columns that identify one object and can back skip detection
pub const IDENTITY_COLUMNS: &[&str] = &[S3_PATH, FILE_NAME];

/// What an extension can see about the object it is analysing
#[derive(Debug, Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub descriptor: &'a ObjectDescriptor,
    pub local_path: &'a Path,
}

/// A content-analysis step that derives extra columns
pub trait RecordExtension: Send + Sync {
    /// Name used in logs and `Analysis` errors
    fn name(&self) -> &str;

    /// Columns this extension adds, in order.
    ///
    /// Under [`AnalysisFailurePolicy::PersistPartial`] a failed extension
    /// contributes NULL for each of these, keeping every record of a batch on
    /// the same column list.
    fn columns(&self) -> &[&'static str];

    fn apply(&self, ctx: &AnalysisContext<'_>, record: Record) -> anyhow::Result<Record>;
}

/// Adapts a closure into a [`RecordExtension`]
pub struct FnExtension<F> {
    name: String,
    columns: Vec<&'static str>,
    func: F,
}

impl<F> FnExtension<F>
where
    F: Fn(&AnalysisContext<'_>, Record) -> anyhow::Result<Record> + Send + Sync,
{
    pub fn new(name: impl Into<String>, columns: &[&'static str], func: F) -> Self {
        Self {
            name: name.into(),
            columns: columns.to_vec(),
            func,
        }
    }
}

impl<F> RecordExtension for FnExtension<F>
where
    F: Fn(&AnalysisContext<'_>, Record) -> anyhow::Result<Record> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    fn apply(&self, ctx: &AnalysisContext<'_>, record: Record) -> anyhow::Result<Record> {
        (self.func)(ctx, record)
    }
}

/// Adds `size_bytes` from the listing
pub struct ObjectSize;

impl RecordExtension for ObjectSize {
    fn name(&self) -> &str {
        "object_size"
    }

    fn columns(&self) -> &[&'static str] {
        &["size_bytes"]
    }

    fn apply(&self, ctx: &AnalysisContext<'_>, record: Record) -> anyhow::Result<Record> {
        Ok(record.with("size_bytes", ctx.descriptor.size))
    }
}

/// Adds `last_modified` from the listing (NULL when the store omits it)
pub struct LastModified;

impl RecordExtension for LastModified {
    fn name(&self) -> &str {
        "last_modified"
    }

    fn columns(&self) -> &[&'static str] {
        &["last_modified"]
    }

    fn apply(&self, ctx: &AnalysisContext<'_>, record: Record) -> anyhow::Result<Record> {
        Ok(record.with("last_modified", ctx.descriptor.last_modified))
    }
}

/// Adds a hex `sha256` digest of the materialized file
pub struct ContentChecksum;

impl RecordExtension for ContentChecksum {
    fn name(&self) -> &str {
        "content_checksum"
    }

    fn columns(&self) -> &[&'static str] {
        &["sha256"]
    }

    fn apply(&self, ctx: &AnalysisContext<'_>, record: Record) -> anyhow::Result<Record> {
        let digest = compute_file_checksum(ctx.local_path, ChecksumAlgorithm::Sha256)
            .with_context(|| format!("cannot hash {}", ctx.local_path.display()))?;
        Ok(record.with("sha256", digest))
    }
}

/// A built record plus the extension failures tolerated while building it
#[derive(Debug)]
pub struct BuiltRecord {
    pub record: Record,
    pub failures: Vec<SweepError>,
}

#[derive(Clone, Default)]
pub struct RecordBuilder {
    extensions: Vec<Arc<dyn RecordExtension>>,
    policy: AnalysisFailurePolicy,
}

impl RecordBuilder {
    pub fn new(policy: AnalysisFailurePolicy) -> Self {
        Self {
            extensions: Vec::new(),
            policy,
        }
    }

    /// Register an extension; extensions run in registration order
    pub fn with_extension(mut self, extension: impl RecordExtension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    pub fn extension_names(&self) -> Vec<&str> {
        self.extensions.iter().map(|e| e.name()).collect()
    }

    /// Columns every record from this builder will carry, in order
    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = vec![S3_PATH, S3_BUCKET, FILE_NAME];
        for extension in &self.extensions {
            for column in extension.columns() {
                if !columns.contains(column) {
                    columns.push(column);
                }
            }
        }
        columns
    }

    /// The baseline row: remote key, bucket, and local materialized path
    pub fn base_record(descriptor: &ObjectDescriptor, local_path: &Path) -> Record {
        Record::new()
            .with(S3_PATH, descriptor.key.as_str())
            .with(S3_BUCKET, descriptor.bucket.as_str())
            .with(FILE_NAME, local_path.to_string_lossy().to_string())
    }

    /// Build the record for one object.
    ///
    /// Fails with `Analysis` only under [`AnalysisFailurePolicy::Drop`];
    /// otherwise failures are returned alongside the partial record.
    pub fn build(&self, descriptor: &ObjectDescriptor, local_path: &Path) -> Result<BuiltRecord> {
        let ctx = AnalysisContext {
            descriptor,
            local_path,
        };
        let mut record = Self::base_record(descriptor, local_path);
        let mut failures = Vec::new();

        for extension in &self.extensions {
            match extension.apply(&ctx, record.clone()) {
                Ok(mut updated) => {
                    fill_missing(&mut updated, extension.columns());
                    record = updated;
                },
                Err(e) => {
                    let failure = SweepError::Analysis {
                        extension: extension.name().to_string(),
                        key: descriptor.key.clone(),
                        cause: format!("{:#}", e),
                    };

                    if self.policy == AnalysisFailurePolicy::Drop {
                        return Err(failure);
                    }

                    warn!(
                        key = %descriptor.key,
                        extension = extension.name(),
                        error = %failure,
                        "Extension failed, persisting NULL for its columns"
                    );
                    fill_missing(&mut record, extension.columns());
                    failures.push(failure);
                },
            }
        }

        Ok(BuiltRecord { record, failures })
    }
}

fn fill_missing(record: &mut Record, columns: &[&'static str]) {
    for column in columns {
        if !record.contains(column) {
            record.insert(*column, RecordValue::Null);
        }
    }
}
