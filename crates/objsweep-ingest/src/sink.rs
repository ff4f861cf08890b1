//! Batched transactional persistence

use objsweep_common::{Record, RecordValue, Result, SweepError};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::builder::S3_PATH;
use crate::config::validate_identifier;
use crate::store::DestinationStore;

/// Writes batches of records to one destination table
pub struct PersistenceSink<D: ?Sized> {
    store: Arc<D>,
    table: String,
}

impl<D: DestinationStore + ?Sized> PersistenceSink<D> {
    pub fn new(store: Arc<D>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { store, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Insert `records` as one multi-row insert in a single transaction.
    ///
    /// Every record must carry the first record's columns in the same order,
    /// otherwise nothing is written and `SchemaMismatch` is returned. Store
    /// failures roll the whole batch back and surface as `Persist`. An empty
    /// batch is a no-op.
    #[instrument(skip(self, records), fields(table = %self.table, records = records.len()))]
    pub async fn persist(&self, records: &[Record]) -> Result<u64> {
        let Some(first) = records.first() else {
            return Ok(0);
        };

        let columns = first.column_names();
        for column in &columns {
            validate_identifier(column)?;
        }

        if let Some(odd) = records.iter().find(|r| !r.same_columns(first)) {
            return Err(SweepError::SchemaMismatch {
                expected: columns,
                found: odd.column_names(),
                key: record_key(odd).to_string(),
            });
        }

        let rows: Vec<Vec<RecordValue>> = records
            .iter()
            .map(|record| record.values().cloned().collect())
            .collect();

        let inserted = self
            .store
            .insert_rows(&self.table, &columns, &rows)
            .await
            .map_err(|e| SweepError::Persist {
                records: records.len(),
                cause: format!("{:#}", e),
            })?;

        debug!(inserted, "Committed batch");
        Ok(inserted)
    }
}

/// The remote key a record was built from, for logging
pub fn record_key(record: &Record) -> &str {
    record
        .get(S3_PATH)
        .and_then(RecordValue::as_text)
        .unwrap_or("<unknown>")
}
