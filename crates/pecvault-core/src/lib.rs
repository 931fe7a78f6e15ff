//! Archiving engine for PEC (certified mail) mailboxes.
//!
//! The pipeline for one account-day: fetch messages from every
//! configured folder over IMAP, persist each as an `.eml` file,
//! regenerate CSV/JSON indexes, build a deterministic tar.gz with a
//! SHA-256 digest, and in `s3_sync` mode ship the bundle to object
//! storage with size verification. The [`Orchestrator`] runs accounts
//! concurrently and aggregates their summaries.
//!
//! Two layout modes exist:
//!
//! - `standard`: date-partitioned directories, archives kept locally
//! - `s3_sync`: a flat local mirror that never deletes messages, with
//!   only the daily bundles uploaded
//!
//! All remote operations go through a retry executor with bounded
//! exponential backoff; fatal errors (bad credentials, bad config)
//! are never retried.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod archive;
pub mod config;
mod error;
pub mod headers;
pub mod index;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod s3;
pub mod storage;
pub mod worker;

pub use config::{AccountConfig, BackupMode, RetryPolicy, S3Config, Settings};
pub use error::{Error, Result};
pub use orchestrator::{ConnectorFactory, Orchestrator};
pub use report::{ArchiveRun, RunReport, RunStatus};
pub use storage::Storage;
