//! Error types for the archival pipeline.

use thiserror::Error;

/// Errors that can occur in pipeline operations.
///
/// IMAP failures stay in [`pecvault_imap::Error`] until the pipeline
/// folds them into the run summary; every variant here is raised at
/// the failing call site with the path or object it concerns.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Message storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index generation error.
    #[error("Indexing error: {0}")]
    Indexing(String),

    /// Archive creation or digest error.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Object storage upload error.
    #[error("Upload error: {detail}")]
    Upload {
        /// What went wrong.
        detail: String,
        /// Whether a retry on a fresh request may succeed.
        transient: bool,
    },
}

impl Error {
    /// Returns true if the failure is transient and worth retrying.
    ///
    /// Uploads carry their own classification; configuration, storage,
    /// indexing and digest failures will not clear up on their own.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Upload { transient, .. } => *transient,
            Self::Config(_)
            | Self::Storage(_)
            | Self::Indexing(_)
            | Self::Compression(_) => false,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
