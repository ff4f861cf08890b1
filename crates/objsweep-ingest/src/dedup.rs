//! Skip detection against already-persisted rows

use objsweep_common::{Result, SweepError};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::config::validate_identifier;
use crate::store::DestinationStore;

/// Identifying values already present in the destination table.
///
/// Loaded once per sweep and read-only afterwards; records persisted during
/// the same sweep are not added back.
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    keys: HashSet<String>,
    limit: i64,
}

impl DedupIndex {
    /// Run the bounded distinct-value query and collect the result.
    ///
    /// Once `limit` distinct values come back, coverage is partial and older
    /// objects may be ingested again; this is logged as a warning.
    pub async fn load<D>(store: &D, table: &str, column: &str, limit: i64) -> Result<Self>
    where
        D: DestinationStore + ?Sized,
    {
        validate_identifier(table)?;
        validate_identifier(column)?;

        let values = store
            .distinct_values(table, column, limit)
            .await
            .map_err(|e| SweepError::DestinationUnavailable {
                cause: format!("{:#}", e),
            })?;

        let index = Self {
            keys: values.into_iter().collect(),
            limit,
        };

        if index.at_limit() {
            warn!(
                table,
                column,
                limit,
                "Dedup index reached its limit; objects beyond it may be ingested again"
            );
        }

        info!(table, column, keys = index.len(), "Loaded dedup index");
        Ok(index)
    }

    /// An empty index: every object counts as new
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether the query returned as many values as it was allowed to
    pub fn at_limit(&self) -> bool {
        self.limit > 0 && self.keys.len() as i64 >= self.limit
    }
}

impl FromIterator<String> for DedupIndex {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
            limit: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDestination;
    use objsweep_common::Record;

    fn destination_with(names: &[&str]) -> MemoryDestination {
        let dest = MemoryDestination::new().with_table("files", &["s3_path", "file_name"]);
        for name in names {
            dest.seed("files", Record::new().with("file_name", *name));
        }
        dest
    }

    #[tokio::test]
    async fn test_load_collects_distinct_values() {
        let dest = destination_with(&["/d/a.txt", "/d/b.txt", "/d/a.txt"]);

        let index = DedupIndex::load(&dest, "files", "file_name", 100).await.unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.contains("/d/a.txt"));
        assert!(index.contains("/d/b.txt"));
        assert!(!index.contains("/d/c.txt"));
        assert!(!index.at_limit());
    }

    #[tokio::test]
    async fn test_load_respects_limit() {
        let dest = destination_with(&["/d/a.txt", "/d/b.txt", "/d/c.txt"]);

        let index = DedupIndex::load(&dest, "files", "file_name", 2).await.unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.at_limit());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_destination_unavailable() {
        let dest = MemoryDestination::new().unavailable();

        let err = DedupIndex::load(&dest, "files", "file_name", 10).await.unwrap_err();

        assert!(matches!(err, SweepError::DestinationUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_missing_table_is_destination_unavailable() {
        let dest = MemoryDestination::new();

        let err = DedupIndex::load(&dest, "nope", "file_name", 10).await.unwrap_err();

        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_rejects_unsafe_identifiers() {
        let dest = destination_with(&[]);

        let err = DedupIndex::load(&dest, "files; DROP TABLE files", "file_name", 10)
            .await
            .unwrap_err();

        assert!(matches!(err, SweepError::InvalidIdentifier(_)));
    }

    #[test]
    fn test_empty_index_contains_nothing() {
        let index = DedupIndex::empty();
        assert!(index.is_empty());
        assert!(!index.contains("/d/a.txt"));
        assert!(!index.at_limit());
    }
}
