//! objsweep Ingest Library
//!
//! Sweeps every object under an S3 prefix into rows of a PostgreSQL table,
//! skipping objects that are empty or already recorded.
//!
//! # Components
//!
//! - **source**: lazy, paginated enumeration of object descriptors
//! - **dedup**: identifying values already present in the destination
//! - **fetcher**: atomic download of an object to its local path
//! - **builder**: baseline records plus pluggable content-analysis extensions
//! - **sink**: batched, transactional multi-row inserts
//! - **pipeline**: the orchestrator tying them together
//!
//! External systems sit behind the [`store::ObjectStore`] and
//! [`store::DestinationStore`] traits; [`s3`] and [`postgres`] hold the
//! production implementations and [`memory`] the in-process ones.
//!
//! # Example
//!
//! ```no_run
//! use objsweep_ingest::builder::ContentChecksum;
//! use objsweep_ingest::config::SweepConfig;
//! use objsweep_ingest::pipeline::IngestionPipeline;
//! use objsweep_ingest::postgres::PgDestination;
//! use objsweep_ingest::s3::S3ObjectStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SweepConfig::from_env()?;
//!     let objects = Arc::new(S3ObjectStore::new(&config.storage).await?);
//!     let destination = Arc::new(PgDestination::connect(&config.database).await?);
//!
//!     let report = IngestionPipeline::new(config, objects, destination)
//!         .with_extension(ContentChecksum)
//!         .run(CancellationToken::new())
//!         .await?;
//!     println!("persisted {} records", report.records_persisted);
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod config;
pub mod dedup;
pub mod fetcher;
pub mod memory;
pub mod pipeline;
pub mod postgres;
pub mod s3;
pub mod sink;
pub mod source;
pub mod store;

pub use config::SweepConfig;
pub use pipeline::{IngestionPipeline, SweepReport, SweepState};
