//! Per-account run summaries and the aggregated run report.
//!
//! Each account-day writes a `summary.json` next to its indexes; the
//! orchestrator aggregates all account runs into one report for the
//! operator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::config::BackupMode;
use crate::s3::S3Upload;
use crate::{Error, Result};

/// Which stage of the pipeline an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// IMAP connection, authentication, or fetch failure.
    Imap,
    /// Local filesystem write failure.
    Storage,
    /// Index generation failure.
    Indexing,
    /// Archive creation failure.
    Compression,
    /// Object storage failure.
    Upload,
    /// Configuration problem discovered at run time.
    Config,
}

/// One recorded failure, kept in the summary for auditing.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Pipeline stage.
    pub kind: ErrorKind,
    /// Folder being processed, if the error was folder-scoped.
    pub folder: Option<String>,
    /// Human-readable detail.
    pub detail: String,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Records an error happening now.
    #[must_use]
    pub fn new(kind: ErrorKind, folder: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            folder,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of one account run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every folder archived, every stage succeeded.
    Completed,
    /// Some messages or folders failed but the run produced output.
    Partial,
    /// A pipeline stage failed outright.
    Failed,
}

/// Information about the produced archive.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    /// Path of the archive on disk (absent after a verified upload).
    pub path: Option<PathBuf>,
    /// Hex SHA-256 of the archive.
    pub sha256: String,
    /// Archive size in bytes.
    pub size_bytes: u64,
}

/// Summary of one account-day, serialized as `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRun {
    /// Account address.
    pub account: String,
    /// The archived date.
    pub date: NaiveDate,
    /// Backup mode the run used.
    pub mode: BackupMode,
    /// Messages stored per folder.
    pub folders: BTreeMap<String, usize>,
    /// Total messages stored this run.
    pub messages_archived: usize,
    /// Errors recorded during the run.
    pub errors: Vec<ErrorRecord>,
    /// Archive details, if compression was reached.
    pub archive: Option<ArchiveReport>,
    /// Upload details, if the run shipped to object storage.
    pub upload: Option<S3Upload>,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Overall outcome.
    pub status: RunStatus,
}

impl ArchiveRun {
    /// Derives the outcome from the recorded evidence: any stage
    /// failure marked fatal means `Failed`, any error at all means
    /// `Partial`, otherwise `Completed`.
    #[must_use]
    pub fn derive_status(errors: &[ErrorRecord], stage_failed: bool) -> RunStatus {
        if stage_failed {
            RunStatus::Failed
        } else if errors.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }
}

/// Writes `summary.json` into `dir` via a temporary name and rename.
///
/// # Errors
///
/// Returns [`Error::Indexing`] if the file cannot be written.
pub fn write_summary(dir: &Path, run: &ArchiveRun) -> Result<()> {
    let json = serde_json::to_vec_pretty(run).map_err(|e| Error::Indexing(e.to_string()))?;
    let path = dir.join("summary.json");
    let tmp = dir.join(".summary.json.tmp");
    std::fs::write(&tmp, &json)
        .map_err(|e| Error::Indexing(format!("cannot write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, &path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::Indexing(format!("cannot rename into {}: {e}", path.display()))
    })
}

/// Aggregated outcome of one orchestrated run across all accounts.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// The archived date.
    pub date: NaiveDate,
    /// Backup mode.
    pub mode: BackupMode,
    /// Worst status across all accounts.
    pub overall_status: RunStatus,
    /// Accounts attempted.
    pub accounts_processed: usize,
    /// Accounts that completed without any error.
    pub accounts_successful: usize,
    /// Messages stored across all accounts.
    pub total_messages: usize,
    /// Per-account summaries.
    pub accounts: Vec<ArchiveRun>,
}

/// Folds per-account runs into the overall report.
#[must_use]
pub fn aggregate(date: NaiveDate, mode: BackupMode, runs: Vec<ArchiveRun>) -> RunReport {
    let overall_status = runs
        .iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(RunStatus::Completed);

    RunReport {
        date,
        mode,
        overall_status,
        accounts_processed: runs.len(),
        accounts_successful: runs
            .iter()
            .filter(|r| r.status == RunStatus::Completed)
            .count(),
        total_messages: runs.iter().map(|r| r.messages_archived).sum(),
        accounts: runs,
    }
}
