//! Per-account archiving pipeline.
//!
//! One worker owns one account for one run: fetch each configured
//! folder (with retry and reconnect-on-transient-failure), persist
//! messages, regenerate indexes, build the daily archive, and in
//! `s3_sync` mode ship and verify the bundle. Folder failures are
//! isolated: a missing folder or an exhausted retry budget is recorded
//! and the remaining folders still run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use pecvault_imap::{Client, FetchedMessage, ImapStream, SearchDate};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveArtifacts};
use crate::config::{AccountConfig, BackupMode, ImapSettings, RetryPolicy};
use crate::headers::parse_envelope;
use crate::index::{self, IndexEntry};
use crate::report::{ArchiveReport, ArchiveRun, ErrorKind, ErrorRecord, write_summary};
use crate::retry::run_with_retry;
use crate::s3::S3Uploader;
use crate::storage::{Storage, sanitize_folder_name, subject_slug};
use crate::{Error, Result};

/// The mailbox operations the pipeline needs from a session.
///
/// Implemented by the real IMAP client; tests drive the pipeline with
/// scripted sources.
pub trait MailSource {
    /// Selects a mailbox read-only and returns its message count.
    fn examine(
        &mut self,
        mailbox: &str,
    ) -> impl Future<Output = pecvault_imap::Result<u32>> + Send;
    /// Returns UIDs of messages dated `date`, ascending.
    fn uid_search_on(
        &mut self,
        date: SearchDate,
    ) -> impl Future<Output = pecvault_imap::Result<Vec<u32>>> + Send;
    /// Fetches one message by UID.
    fn uid_fetch(
        &mut self,
        uid: u32,
    ) -> impl Future<Output = pecvault_imap::Result<FetchedMessage>> + Send;
    /// Ends the session.
    fn logout(&mut self) -> impl Future<Output = pecvault_imap::Result<()>> + Send;
}

impl<S> MailSource for Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn examine(&mut self, mailbox: &str) -> pecvault_imap::Result<u32> {
        Self::examine(self, mailbox).await
    }

    async fn uid_search_on(&mut self, date: SearchDate) -> pecvault_imap::Result<Vec<u32>> {
        Self::uid_search_on(self, date).await
    }

    async fn uid_fetch(&mut self, uid: u32) -> pecvault_imap::Result<FetchedMessage> {
        Self::uid_fetch(self, uid).await
    }

    async fn logout(&mut self) -> pecvault_imap::Result<()> {
        Self::logout(self).await
    }
}

/// Builds authenticated sessions; a fresh one per (re)connect.
pub trait Connect {
    /// The session type produced. Sessions own their connection so
    /// they can live inside spawned account tasks.
    type Source: MailSource + Send + 'static;

    /// Connects and authenticates.
    fn connect(&self) -> impl Future<Output = pecvault_imap::Result<Self::Source>> + Send;
}

/// Production connector: implicit-TLS IMAP with LOGIN.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    config: pecvault_imap::Config,
    credentials: pecvault_imap::Credentials,
}

impl ImapConnector {
    /// Builds a connector for one account.
    #[must_use]
    pub fn new(account: &AccountConfig, imap: &ImapSettings) -> Self {
        let timeout = Duration::from_secs(imap.timeout_secs);
        Self {
            config: pecvault_imap::Config::new(account.host.clone())
                .port(account.port)
                .connect_timeout(timeout)
                .command_timeout(timeout),
            credentials: pecvault_imap::Credentials::new(
                account.address.clone(),
                account.password.clone(),
            ),
        }
    }
}

impl Connect for ImapConnector {
    type Source = Client<ImapStream>;

    async fn connect(&self) -> pecvault_imap::Result<Self::Source> {
        Client::connect(&self.config, &self.credentials).await
    }
}

/// Archives one account for one date.
pub struct AccountWorker<C> {
    account: AccountConfig,
    storage: Storage,
    retry: RetryPolicy,
    batch_size: usize,
    connector: C,
    uploader: Option<Arc<S3Uploader>>,
}

impl<C: Connect> AccountWorker<C> {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        account: AccountConfig,
        storage: Storage,
        retry: RetryPolicy,
        batch_size: usize,
        connector: C,
        uploader: Option<Arc<S3Uploader>>,
    ) -> Self {
        Self {
            account,
            storage,
            retry,
            batch_size,
            connector,
            uploader,
        }
    }

    /// Runs the full pipeline for `date` and returns the run summary.
    ///
    /// Never returns an error: every failure is folded into the
    /// summary so one account cannot abort its siblings.
    pub async fn process(&self, date: NaiveDate) -> ArchiveRun {
        let started_at = Utc::now();
        let mut errors: Vec<ErrorRecord> = Vec::new();
        let mut folders: BTreeMap<String, usize> = BTreeMap::new();
        let mut stage_failed = false;
        let mut archive_report: Option<ArchiveReport> = None;
        let mut upload_report = None;

        info!(
            account = %self.account.address,
            %date,
            mode = %self.storage.mode(),
            "account run started"
        );

        let account_dir =
            match self
                .storage
                .prepare(&self.account.address, date, &self.account.folders)
            {
                Ok(dir) => dir,
                Err(e) => {
                    errors.push(ErrorRecord::new(ErrorKind::Storage, None, e.to_string()));
                    return self.finish(date, folders, errors, None, None, started_at, true);
                }
            };

        // In mirror mode the global index doubles as the dedup record:
        // a message whose content hash is already indexed for its
        // folder is not written again.
        let existing_entries = if self.storage.mode() == BackupMode::S3Sync {
            match index::load_index(&account_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    errors.push(ErrorRecord::new(ErrorKind::Indexing, None, e.to_string()));
                    return self.finish(date, folders, errors, None, None, started_at, true);
                }
            }
        } else {
            Vec::new()
        };
        let mut seen: HashMap<(String, String), IndexEntry> = existing_entries
            .iter()
            .map(|e| ((e.folder.clone(), e.sha256.clone()), e.clone()))
            .collect();

        let search_date = match SearchDate::new(date.year(), date.month(), date.day()) {
            Ok(d) => d,
            Err(e) => {
                errors.push(ErrorRecord::new(ErrorKind::Config, None, e.to_string()));
                return self.finish(date, folders, errors, None, None, started_at, true);
            }
        };

        let mut session: Option<C::Source> = None;
        let mut day_entries: Vec<IndexEntry> = Vec::new();

        for folder in &self.account.folders {
            let fetched = self
                .fetch_folder_with_retry(&mut session, folder, search_date)
                .await;

            let messages = match fetched {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(
                        account = %self.account.address,
                        folder,
                        error = %e,
                        "folder skipped"
                    );
                    errors.push(ErrorRecord::new(
                        ErrorKind::Imap,
                        Some(folder.clone()),
                        e.to_string(),
                    ));
                    continue;
                }
            };

            let stored = self.store_folder(
                &account_dir,
                folder,
                date,
                &messages,
                &mut seen,
                &mut day_entries,
                &mut errors,
            );
            folders.insert(folder.clone(), stored);
        }

        if let Some(mut source) = session.take()
            && let Err(e) = source.logout().await
        {
            debug!(account = %self.account.address, error = %e, "logout failed");
        }

        // Index stage. A failure here leaves the day unreferenced, so
        // the archive and upload stages are skipped.
        let index_result = match self.storage.mode() {
            BackupMode::Standard => index::write_indexes(&account_dir, &day_entries),
            BackupMode::S3Sync => {
                let merged = index::merge(existing_entries, day_entries.clone());
                index::write_indexes(&account_dir, &merged)
            }
        };
        if let Err(e) = index_result {
            errors.push(ErrorRecord::new(ErrorKind::Indexing, None, e.to_string()));
            stage_failed = true;
        }

        if !stage_failed {
            match self.compress(&account_dir, date, &day_entries) {
                Ok(artifacts) => {
                    archive_report = Some(ArchiveReport {
                        path: Some(artifacts.archive_path.clone()),
                        sha256: artifacts.sha256.clone(),
                        size_bytes: artifacts.size_bytes,
                    });

                    if self.storage.mode() == BackupMode::S3Sync {
                        match self.ship(&artifacts, date).await {
                            Ok(upload) => {
                                if let Some(report) = archive_report.as_mut() {
                                    report.path = None;
                                }
                                upload_report = Some(upload);
                            }
                            Err(e) => {
                                errors.push(ErrorRecord::new(
                                    ErrorKind::Upload,
                                    None,
                                    e.to_string(),
                                ));
                            }
                        }
                    }
                }
                Err(e) => {
                    errors.push(ErrorRecord::new(ErrorKind::Compression, None, e.to_string()));
                    stage_failed = true;
                }
            }
        }

        let run = self.finish(
            date,
            folders,
            errors,
            archive_report,
            upload_report,
            started_at,
            stage_failed,
        );
        if let Err(e) = write_summary(&account_dir, &run) {
            warn!(account = %self.account.address, error = %e, "cannot write summary");
        }
        run
    }

    /// Fetches one folder, reconnecting on transient failure. The
    /// session slot is shared across folders so a healthy connection is
    /// reused.
    async fn fetch_folder_with_retry(
        &self,
        session: &mut Option<C::Source>,
        folder: &str,
        date: SearchDate,
    ) -> pecvault_imap::Result<Vec<FetchedMessage>> {
        let batch_size = self.batch_size.max(1);
        // The session lives in a mutex for the duration of the retry
        // loop so each attempt's future borrows only shared state; the
        // lock is never contended because attempts run one at a time.
        let slot = tokio::sync::Mutex::new(session.take());
        let slot_ref = &slot;
        let result = run_with_retry(&self.retry, folder, move || async move {
            let mut session = slot_ref.lock().await;
            let source = match session.as_mut() {
                Some(source) => source,
                None => session.insert(self.connector.connect().await?),
            };
            match fetch_folder(source, folder, date, batch_size).await {
                Ok(messages) => Ok(messages),
                Err(e) => {
                    if e.is_transient() {
                        // The stream is in an unknown state; force a
                        // fresh connection on the next attempt.
                        *session = None;
                    }
                    Err(e)
                }
            }
        })
        .await;
        *session = slot.into_inner();
        result
    }

    /// Persists fetched messages and appends their index entries.
    /// Returns the number of messages recorded for the folder.
    #[allow(clippy::too_many_arguments)]
    fn store_folder(
        &self,
        account_dir: &std::path::Path,
        folder: &str,
        date: NaiveDate,
        messages: &[FetchedMessage],
        seen: &mut HashMap<(String, String), IndexEntry>,
        day_entries: &mut Vec<IndexEntry>,
        errors: &mut Vec<ErrorRecord>,
    ) -> usize {
        let folder_name = sanitize_folder_name(folder);
        let folder_dir = account_dir.join(&folder_name);
        let mirror = self.storage.mode() == BackupMode::S3Sync;

        let mut next_seq = if mirror {
            match Storage::next_seq(&folder_dir) {
                Ok(seq) => seq,
                Err(e) => {
                    errors.push(ErrorRecord::new(
                        ErrorKind::Storage,
                        Some(folder.to_string()),
                        e.to_string(),
                    ));
                    return 0;
                }
            }
        } else {
            1
        };

        let mut stored = 0usize;
        for (position, message) in messages.iter().enumerate() {
            let sha256 = archive::sha256_bytes(&message.body);

            if mirror && let Some(existing) = seen.get(&(folder.to_string(), sha256.clone())) {
                debug!(folder, uid = message.uid, "message already mirrored");
                day_entries.push(existing.clone());
                stored += 1;
                continue;
            }

            let envelope = parse_envelope(&message.body);
            let seq = if mirror {
                next_seq
            } else {
                u32::try_from(position).unwrap_or(u32::MAX).saturating_add(1)
            };
            let slug = subject_slug(&envelope.subject);

            match self
                .storage
                .store_message(&folder_dir, seq, &slug, &message.body)
            {
                Ok(outcome) => {
                    if mirror && !outcome.existed {
                        next_seq += 1;
                    }
                    let entry = IndexEntry {
                        path: format!("{folder_name}/{}", outcome.file_name),
                        folder: folder.to_string(),
                        seq,
                        subject: envelope.subject,
                        from: envelope.from,
                        to: envelope.to,
                        date: envelope.date,
                        size_bytes: message.body.len() as u64,
                        sha256: sha256.clone(),
                        unread: message.is_unread(),
                    };
                    if mirror {
                        seen.insert((folder.to_string(), sha256), entry.clone());
                    }
                    day_entries.push(entry);
                    stored += 1;
                }
                Err(e) => {
                    errors.push(ErrorRecord::new(
                        ErrorKind::Storage,
                        Some(folder.to_string()),
                        format!("uid {}: {e}", message.uid),
                    ));
                }
            }
        }

        info!(
            account = %self.account.address,
            folder,
            %date,
            stored,
            "folder archived"
        );
        stored
    }

    /// Builds the daily archive. Standard mode archives the dated
    /// directory in place; mirror mode stages copies of the day's
    /// files so the bundle covers exactly this run.
    fn compress(
        &self,
        account_dir: &std::path::Path,
        date: NaiveDate,
        day_entries: &[IndexEntry],
    ) -> Result<ArchiveArtifacts> {
        match self.storage.mode() {
            BackupMode::Standard => {
                archive::create_archive(account_dir, account_dir, &self.account.address, date)
            }
            BackupMode::S3Sync => {
                let staging = account_dir
                    .join(date.format("%Y").to_string())
                    .join(date.format("%Y-%m-%d").to_string());
                for entry in day_entries {
                    let src = account_dir.join(&entry.path);
                    let dst = staging.join(&entry.path);
                    if let Some(parent) = dst.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            Error::Compression(format!(
                                "cannot create {}: {e}",
                                parent.display()
                            ))
                        })?;
                    }
                    std::fs::copy(&src, &dst).map_err(|e| {
                        Error::Compression(format!("cannot stage {}: {e}", src.display()))
                    })?;
                }
                std::fs::create_dir_all(&staging).map_err(|e| {
                    Error::Compression(format!("cannot create {}: {e}", staging.display()))
                })?;
                index::write_indexes(&staging, day_entries)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                archive::create_archive(&staging, &staging, &self.account.address, date)
            }
        }
    }

    /// Uploads the bundle with retry and deletes the local staging tree
    /// once the stored size is verified. Mirrored `.eml` files are
    /// never deleted.
    async fn ship(
        &self,
        artifacts: &ArchiveArtifacts,
        date: NaiveDate,
    ) -> Result<crate::s3::S3Upload> {
        let uploader = self.uploader.as_ref().ok_or_else(|| Error::Config(
            "s3_sync mode requires an s3 configuration".to_string(),
        ))?;

        let upload = run_with_retry(&self.retry, "upload", move || async move {
            uploader
                .upload_archive(artifacts, self.account.local_part(), date)
                .await
        })
        .await?;

        if let Some(staging) = artifacts.archive_path.parent() {
            std::fs::remove_dir_all(staging).map_err(|e| Error::Upload {
                detail: format!("cannot remove staging {}: {e}", staging.display()),
                transient: false,
            })?;
        }
        Ok(upload)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        date: NaiveDate,
        folders: BTreeMap<String, usize>,
        errors: Vec<ErrorRecord>,
        archive: Option<ArchiveReport>,
        upload: Option<crate::s3::S3Upload>,
        started_at: chrono::DateTime<Utc>,
        stage_failed: bool,
    ) -> ArchiveRun {
        let status = ArchiveRun::derive_status(&errors, stage_failed);
        let messages_archived = folders.values().sum();

        info!(
            account = %self.account.address,
            %date,
            messages_archived,
            errors = errors.len(),
            ?status,
            "account run finished"
        );

        ArchiveRun {
            account: self.account.address.clone(),
            date,
            mode: self.storage.mode(),
            folders,
            messages_archived,
            errors,
            archive,
            upload,
            started_at,
            finished_at: Utc::now(),
            status,
        }
    }
}

/// Runs the EXAMINE, SEARCH, FETCH sequence for one folder.
async fn fetch_folder<S: MailSource>(
    source: &mut S,
    folder: &str,
    date: SearchDate,
    batch_size: usize,
) -> pecvault_imap::Result<Vec<FetchedMessage>> {
    let exists = source.examine(folder).await?;
    let uids = source.uid_search_on(date).await?;
    debug!(folder, exists, matched = uids.len(), "mailbox searched");

    let mut messages = Vec::with_capacity(uids.len());
    for chunk in uids.chunks(batch_size) {
        for &uid in chunk {
            messages.push(source.uid_fetch(uid).await?);
        }
        debug!(
            folder,
            fetched = messages.len(),
            total = uids.len(),
            "fetch progress"
        );
    }
    Ok(messages)
}
