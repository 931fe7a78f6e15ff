//! Application configuration.
//!
//! Loaded from a TOML file; every section except `accounts` has
//! defaults. Secrets (account passwords, S3 keys) live in this file
//! too, so deployments should keep it mode 0600.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// How archived mailboxes are laid out and shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    /// Date-partitioned directories, daily archives kept locally.
    #[default]
    Standard,
    /// Flat local mirror that never deletes messages; only compressed
    /// daily bundles go to object storage.
    S3Sync,
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => f.write_str("standard"),
            Self::S3Sync => f.write_str("s3_sync"),
        }
    }
}

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    pub initial_delay_secs: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_secs: 5,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Returns the backoff delay before retry `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let secs = self.initial_delay_secs as f64
            * self
                .backoff_multiplier
                .powi(i32::try_from(attempt).unwrap_or(i32::MAX) - 1);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// IMAP client settings shared by all accounts.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    /// Per-command network timeout, in seconds.
    pub timeout_secs: u64,
    /// Messages fetched per progress batch.
    pub batch_size: usize,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            batch_size: 100,
        }
    }
}

/// Daily scheduler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Local time of day ("HH:MM") at which the daily run starts.
    pub run_time: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            run_time: "01:00".to_string(),
        }
    }
}

/// One PEC account to archive.
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    /// Full mail address; also the IMAP username.
    pub address: String,
    /// IMAP password.
    pub password: String,
    /// IMAP server hostname.
    pub host: String,
    /// IMAP server port.
    #[serde(default = "default_imap_port")]
    pub port: u16,
    /// Folders to archive, in processing order.
    pub folders: Vec<String>,
}

impl AccountConfig {
    /// Returns the local part of the address (before `@`), used for
    /// directory and key names.
    #[must_use]
    pub fn local_part(&self) -> &str {
        self.address.split('@').next().unwrap_or(&self.address)
    }
}

// Manual impl so passwords never end up in logs.
impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("address", &self.address)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("folders", &self.folders)
            .finish()
    }
}

/// Object storage settings for `s3_sync` mode.
#[derive(Clone, Deserialize)]
pub struct S3Config {
    /// Bucket name.
    pub bucket: String,
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix for all uploads.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Custom endpoint for S3-compatible stores.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Explicit access key; omit to use the ambient credential chain.
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Explicit secret key.
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id.as_deref().map(|_| "***"))
            .field(
                "secret_access_key",
                &self.secret_access_key.as_deref().map(|_| "***"),
            )
            .finish()
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root of the local archive tree.
    pub base_path: PathBuf,
    /// Storage layout and shipping mode.
    #[serde(default)]
    pub backup_mode: BackupMode,
    /// Accounts processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retry/backoff parameters for remote calls.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// IMAP client settings.
    #[serde(default)]
    pub imap: ImapSettings,
    /// Daily scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Accounts to archive.
    pub accounts: Vec<AccountConfig>,
    /// Object storage settings (required in `s3_sync` mode).
    #[serde(default)]
    pub s3: Option<S3Config>,
}

const fn default_imap_port() -> u16 {
    993
}

const fn default_concurrency() -> usize {
    4
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_prefix() -> String {
    "pec-backups".to_string()
}

impl Settings {
    /// Loads and validates settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, parsed, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let settings: Self = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing every violated constraint.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.accounts.is_empty() {
            problems.push("at least one account is required".to_string());
        }
        for account in &self.accounts {
            if account.folders.is_empty() {
                problems.push(format!("account {} has no folders", account.address));
            }
            if !account.address.contains('@') {
                problems.push(format!("account address {:?} is not a mail address", account.address));
            }
        }
        if self.concurrency == 0 {
            problems.push("concurrency must be at least 1".to_string());
        }
        if self.retry_policy.backoff_multiplier < 1.0 {
            problems.push("backoff_multiplier must be >= 1.0".to_string());
        }

        if self.backup_mode == BackupMode::S3Sync {
            match &self.s3 {
                None => problems.push("s3 section is required in s3_sync mode".to_string()),
                Some(s3) => {
                    if s3.bucket.is_empty() {
                        problems.push("s3 bucket name is required".to_string());
                    }
                    if s3.access_key_id.is_some() != s3.secret_access_key.is_some() {
                        problems.push(
                            "s3 access_key_id and secret_access_key must be given together"
                                .to_string(),
                        );
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}
