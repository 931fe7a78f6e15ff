//! Multi-account orchestration.
//!
//! Spawns one worker task per account, bounded by the configured
//! concurrency, and folds the per-account summaries into one run
//! report. A panicking or aborted worker counts as a failed account
//! rather than aborting the run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::{AccountConfig, BackupMode, ImapSettings, Settings};
use crate::report::{self, ArchiveRun, ErrorKind, ErrorRecord, RunReport, RunStatus};
use crate::s3::S3Uploader;
use crate::storage::Storage;
use crate::worker::{AccountWorker, Connect, ImapConnector};

/// Builds one connector per account.
///
/// The production factory yields TLS [`ImapConnector`]s; tests drive
/// the orchestrator with scripted connectors instead.
pub trait ConnectorFactory {
    /// Connector type produced for each account.
    type Conn: Connect + Send + Sync + 'static;

    /// Builds the connector for `account`.
    fn connector(&self, account: &AccountConfig) -> Self::Conn;
}

/// Production factory: implicit-TLS IMAP with the account credentials.
#[derive(Debug, Clone, Copy)]
pub struct ImapConnectorFactory {
    imap: ImapSettings,
}

impl ConnectorFactory for ImapConnectorFactory {
    type Conn = ImapConnector;

    fn connector(&self, account: &AccountConfig) -> ImapConnector {
        ImapConnector::new(account, &self.imap)
    }
}

/// Runs archive jobs for every configured account.
pub struct Orchestrator<F = ImapConnectorFactory> {
    settings: Settings,
    factory: F,
    uploader: Option<Arc<S3Uploader>>,
}

impl Orchestrator {
    /// Builds the production orchestrator.
    pub async fn new(settings: Settings) -> Self {
        let factory = ImapConnectorFactory {
            imap: settings.imap,
        };
        Self::with_factory(settings, factory).await
    }
}

impl<F: ConnectorFactory> Orchestrator<F> {
    /// Builds an orchestrator around `factory`, including the S3
    /// client in `s3_sync` mode. Bucket reachability is probed up
    /// front so credential problems show in the log before any mailbox
    /// is touched.
    pub async fn with_factory(settings: Settings, factory: F) -> Self {
        let uploader = match (&settings.backup_mode, &settings.s3) {
            (BackupMode::S3Sync, Some(s3)) => {
                let uploader = S3Uploader::new(s3).await;
                uploader.verify_bucket_access().await;
                Some(Arc::new(uploader))
            }
            _ => None,
        };
        Self {
            settings,
            factory,
            uploader,
        }
    }

    /// Archives `date` for every account and returns the aggregated
    /// report.
    pub async fn run(&self, date: NaiveDate) -> RunReport {
        info!(
            %date,
            mode = %self.settings.backup_mode,
            accounts = self.settings.accounts.len(),
            concurrency = self.settings.concurrency,
            "run started"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();
        // Task id to address, so a panicked worker stays attributable
        // in the report.
        let mut addresses: HashMap<tokio::task::Id, String> = HashMap::new();

        for account in self.settings.accounts.clone() {
            let semaphore = Arc::clone(&semaphore);
            let worker = AccountWorker::new(
                account.clone(),
                Storage::new(self.settings.base_path.clone(), self.settings.backup_mode),
                self.settings.retry_policy,
                self.settings.imap.batch_size,
                self.factory.connector(&account),
                self.uploader.clone(),
            );

            let handle = tasks.spawn(async move {
                // Closing the semaphore is not part of this design, so
                // acquire only fails if the runtime is shutting down.
                let _permit = semaphore.acquire_owned().await;
                worker.process(date).await
            });
            addresses.insert(handle.id(), account.address);
        }

        let mut runs: Vec<ArchiveRun> = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, run)) => runs.push(run),
                Err(e) => {
                    let account = addresses
                        .get(&e.id())
                        .cloned()
                        .unwrap_or_else(|| "<unknown>".to_string());
                    error!(account = %account, error = %e, "account task aborted");
                    runs.push(aborted_run(
                        account,
                        date,
                        self.settings.backup_mode,
                        &e.to_string(),
                    ));
                }
            }
        }
        runs.sort_by(|a, b| a.account.cmp(&b.account));

        let report = report::aggregate(date, self.settings.backup_mode, runs);
        info!(
            %date,
            status = ?report.overall_status,
            accounts = report.accounts_processed,
            messages = report.total_messages,
            "run finished"
        );
        report
    }
}

/// Placeholder summary for a worker that never produced one.
fn aborted_run(account: String, date: NaiveDate, mode: BackupMode, detail: &str) -> ArchiveRun {
    let now = Utc::now();
    ArchiveRun {
        account,
        date,
        mode,
        folders: std::collections::BTreeMap::new(),
        messages_archived: 0,
        errors: vec![ErrorRecord::new(ErrorKind::Config, None, detail)],
        archive: None,
        upload: None,
        started_at: now,
        finished_at: now,
        status: RunStatus::Failed,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pecvault_imap::{FetchedMessage, SearchDate};

    use super::*;
    use crate::worker::MailSource;

    /// Per-account script: refuse the login, serve a fixed message
    /// set, or blow up mid-session.
    #[derive(Clone)]
    enum Script {
        Reject,
        Serve(Vec<FetchedMessage>),
        Panic,
    }

    struct ScriptedSource {
        script: Script,
    }

    impl MailSource for ScriptedSource {
        async fn examine(&mut self, _mailbox: &str) -> pecvault_imap::Result<u32> {
            match &self.script {
                Script::Serve(messages) => Ok(u32::try_from(messages.len()).unwrap()),
                Script::Panic => panic!("session state corrupted"),
                Script::Reject => unreachable!("rejected connections never get a session"),
            }
        }

        async fn uid_search_on(&mut self, _date: SearchDate) -> pecvault_imap::Result<Vec<u32>> {
            match &self.script {
                Script::Serve(messages) => Ok(messages.iter().map(|m| m.uid).collect()),
                _ => Ok(Vec::new()),
            }
        }

        async fn uid_fetch(&mut self, uid: u32) -> pecvault_imap::Result<FetchedMessage> {
            let Script::Serve(messages) = &self.script else {
                return Err(pecvault_imap::Error::Protocol(format!("no such uid {uid}")));
            };
            messages
                .iter()
                .find(|m| m.uid == uid)
                .cloned()
                .ok_or_else(|| pecvault_imap::Error::Protocol(format!("no such uid {uid}")))
        }

        async fn logout(&mut self) -> pecvault_imap::Result<()> {
            Ok(())
        }
    }

    struct ScriptedConnector {
        script: Script,
    }

    impl Connect for ScriptedConnector {
        type Source = ScriptedSource;

        async fn connect(&self) -> pecvault_imap::Result<Self::Source> {
            match &self.script {
                Script::Reject => Err(pecvault_imap::Error::Auth(
                    "invalid credentials".to_string(),
                )),
                script => Ok(ScriptedSource {
                    script: script.clone(),
                }),
            }
        }
    }

    struct ScriptedFactory {
        scripts: HashMap<String, Script>,
    }

    impl ConnectorFactory for ScriptedFactory {
        type Conn = ScriptedConnector;

        fn connector(&self, account: &AccountConfig) -> ScriptedConnector {
            let script = self
                .scripts
                .get(&account.address)
                .cloned()
                .unwrap_or(Script::Reject);
            ScriptedConnector { script }
        }
    }

    fn message(uid: u32, subject: &str) -> FetchedMessage {
        FetchedMessage {
            uid,
            flags: vec!["\\Seen".to_string()],
            body: format!(
                "From: mittente@pec.it\r\nTo: dest@pec.it\r\nSubject: {subject}\r\n\r\nBody {uid}\r\n"
            )
            .into_bytes(),
        }
    }

    fn settings(base: &std::path::Path, addresses: &[&str]) -> Settings {
        let mut raw = format!("base_path = {base:?}\nconcurrency = 2\n");
        for address in addresses {
            raw.push_str(&format!(
                "\n[[accounts]]\n\
                 address = \"{address}\"\n\
                 password = \"secret\"\n\
                 host = \"imaps.pec.example.it\"\n\
                 folders = [\"INBOX\"]\n"
            ));
        }
        toml::from_str(&raw).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    #[tokio::test]
    async fn test_failing_account_does_not_block_the_others() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory {
            scripts: HashMap::from([
                (
                    "a@pec.it".to_string(),
                    Script::Serve(vec![message(10, "Ricevuta"), message(11, "Consegna")]),
                ),
                ("b@pec.it".to_string(), Script::Reject),
                (
                    "c@pec.it".to_string(),
                    Script::Serve(vec![message(12, "Accettazione")]),
                ),
            ]),
        };

        let settings = settings(tmp.path(), &["a@pec.it", "b@pec.it", "c@pec.it"]);
        let report = Orchestrator::with_factory(settings, factory)
            .await
            .run(date())
            .await;

        assert_eq!(report.accounts_processed, 3);
        assert_eq!(report.accounts_successful, 2);
        assert_eq!(report.overall_status, RunStatus::Partial);
        assert_eq!(report.total_messages, 3);

        let rejected = report
            .accounts
            .iter()
            .find(|r| r.account == "b@pec.it")
            .unwrap();
        assert_eq!(rejected.status, RunStatus::Partial);
        assert_eq!(rejected.messages_archived, 0);
        assert_eq!(rejected.errors[0].kind, ErrorKind::Imap);

        // The healthy accounts still produced their trees.
        assert!(
            tmp.path()
                .join("a/2024/2024-01-15/INBOX/001_Ricevuta.eml")
                .is_file()
        );
        assert!(
            tmp.path()
                .join("c/2024/2024-01-15/INBOX/001_Accettazione.eml")
                .is_file()
        );
    }

    #[tokio::test]
    async fn test_panicked_worker_stays_attributable() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory {
            scripts: HashMap::from([
                (
                    "a@pec.it".to_string(),
                    Script::Serve(vec![message(10, "Ricevuta")]),
                ),
                ("b@pec.it".to_string(), Script::Panic),
            ]),
        };

        let settings = settings(tmp.path(), &["a@pec.it", "b@pec.it"]);
        let report = Orchestrator::with_factory(settings, factory)
            .await
            .run(date())
            .await;

        assert_eq!(report.accounts_processed, 2);
        assert_eq!(report.overall_status, RunStatus::Failed);

        let aborted = report
            .accounts
            .iter()
            .find(|r| r.account == "b@pec.it")
            .unwrap();
        assert_eq!(aborted.status, RunStatus::Failed);
        assert_eq!(aborted.errors.len(), 1);
        assert_eq!(aborted.errors[0].kind, ErrorKind::Config);
    }

    #[test]
    fn test_aborted_run_is_failed() {
        let run = aborted_run(
            "a@pec.it".to_string(),
            date(),
            BackupMode::Standard,
            "task panicked",
        );
        assert_eq!(run.account, "a@pec.it");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.errors.len(), 1);
    }
}
