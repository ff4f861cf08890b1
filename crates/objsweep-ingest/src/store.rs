//! Capability interfaces for the two external systems a sweep talks to.
//!
//! The core never owns a client: an [`ObjectStore`] and a [`DestinationStore`]
//! are handed to each component explicitly, so tests substitute the in-memory
//! versions from [`crate::memory`] and the binary wires in S3 and PostgreSQL.
//!
//! Implementations report failures as `anyhow::Error`; the core components
//! translate them into the typed [`objsweep_common::SweepError`] taxonomy.

use anyhow::Result;
use async_trait::async_trait;
use objsweep_common::{ObjectDescriptor, RecordValue};
use tokio::io::AsyncRead;

/// One page of a bucket listing
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectDescriptor>,
    /// Continuation token for the next page; `None` on the last page
    pub next_token: Option<String>,
}

/// Readable body of a remote object
pub type ObjectBody = Box<dyn AsyncRead + Send + Unpin>;

/// Remote object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List a single page of objects under `prefix`, continuing from `token`
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<String>,
    ) -> Result<ObjectPage>;

    /// Open the object's content as a byte stream
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody>;
}

/// Relational destination for records
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// `SELECT DISTINCT column FROM table LIMIT limit`
    async fn distinct_values(&self, table: &str, column: &str, limit: i64) -> Result<Vec<String>>;

    /// Insert all rows in one transaction, committing only if every row is
    /// accepted. Returns the number of rows inserted.
    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<RecordValue>],
    ) -> Result<u64>;
}
