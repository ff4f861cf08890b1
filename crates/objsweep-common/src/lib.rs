//! objsweep Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the objsweep workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the sweep error taxonomy and result alias
//! - **Types**: object descriptors and destination records
//! - **Checksums**: streaming digests of materialized files
//! - **Logging**: tracing subscriber setup shared by binaries
//!
//! # Example
//!
//! ```no_run
//! use objsweep_common::checksum::compute_file_checksum;
//! use objsweep_common::types::ChecksumAlgorithm;
//! use objsweep_common::Result;
//!
//! fn digest(path: &str) -> Result<String> {
//!     compute_file_checksum(path, ChecksumAlgorithm::Sha256)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SweepError};
pub use types::{ObjectDescriptor, Record, RecordValue};
