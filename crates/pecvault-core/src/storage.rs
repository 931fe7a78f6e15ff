//! Storage manager: mode-dependent layout and exactly-once message
//! writes.
//!
//! - standard: `<base>/<account>/<year>/<date>/<folder>/<seq>_<slug>.eml`
//! - s3_sync:  `<base>/<account>/<folder>/<seq>_<slug>.eml` (flat
//!   mirror, no date component)
//!
//! Writes go to a temporary name in the destination directory and are
//! atomically renamed into place, so a partially-written `.eml` is
//! never visible under its final name. Nothing here ever deletes a
//! stored message.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::debug;

use crate::config::BackupMode;
use crate::{Error, Result};

/// Maximum filename length (bytes of sanitized name, extension included).
const MAX_FILENAME_LEN: usize = 200;

/// Maximum length of the subject-derived slug.
const MAX_SLUG_LEN: usize = 60;

/// Replaces filesystem-hostile characters and truncates to a safe length.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if out.len() > MAX_FILENAME_LEN {
        out = out.chars().take(MAX_FILENAME_LEN).collect();
    }
    out.trim_matches(['.', ' ']).to_string()
}

/// Sanitizes an IMAP folder name into a directory name.
///
/// Spaces become underscores (`Posta inviata` → `Posta_inviata`), the
/// rest follows [`sanitize_filename`].
#[must_use]
pub fn sanitize_folder_name(folder: &str) -> String {
    sanitize_filename(&folder.replace(' ', "_"))
}

/// Derives the filename slug from a message subject.
#[must_use]
pub fn subject_slug(subject: &str) -> String {
    let slug = sanitize_filename(&subject.replace(' ', "_"));
    let slug: String = slug.chars().take(MAX_SLUG_LEN).collect();
    let slug = slug.trim_matches(['.', ' ', '_']).to_string();
    if slug.is_empty() {
        "message".to_string()
    } else {
        slug
    }
}

/// Outcome of one message write.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Absolute path of the `.eml` file.
    pub path: PathBuf,
    /// Final filename.
    pub file_name: String,
    /// True if the file already existed and the write was skipped.
    pub existed: bool,
}

/// Computes destination paths and writes message bodies exactly once.
#[derive(Debug, Clone)]
pub struct Storage {
    base: PathBuf,
    mode: BackupMode,
}

impl Storage {
    /// Creates a storage manager rooted at `base`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>, mode: BackupMode) -> Self {
        Self {
            base: base.into(),
            mode,
        }
    }

    /// The account's directory: dated in standard mode, flat in mirror
    /// mode.
    #[must_use]
    pub fn account_dir(&self, address: &str, date: NaiveDate) -> PathBuf {
        let local = sanitize_filename(address.split('@').next().unwrap_or(address));
        match self.mode {
            BackupMode::Standard => self
                .base
                .join(local)
                .join(date.format("%Y").to_string())
                .join(date.format("%Y-%m-%d").to_string()),
            BackupMode::S3Sync => self.base.join(local),
        }
    }

    /// The directory holding one folder's messages.
    #[must_use]
    pub fn folder_dir(&self, address: &str, date: NaiveDate, folder: &str) -> PathBuf {
        self.account_dir(address, date).join(sanitize_folder_name(folder))
    }

    /// Creates the account and folder directories for a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if any directory cannot be created.
    pub fn prepare(&self, address: &str, date: NaiveDate, folders: &[String]) -> Result<PathBuf> {
        let account_dir = self.account_dir(address, date);
        for folder in folders {
            let dir = account_dir.join(sanitize_folder_name(folder));
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::Storage(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        Ok(account_dir)
    }

    /// Returns the next sequence number for a folder directory.
    ///
    /// Scans existing `<seq>_*.eml` names; the listing is the source of
    /// truth, never the index. A missing directory starts at 1.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the directory cannot be listed.
    pub fn next_seq(dir: &Path) -> Result<u32> {
        if !dir.exists() {
            return Ok(1);
        }
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::Storage(format!("cannot list {}: {e}", dir.display())))?;

        let mut highest = 0u32;
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Storage(format!("cannot list {}: {e}", dir.display())))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".eml") {
                continue;
            }
            if let Some((prefix, _)) = name.split_once('_')
                && let Ok(seq) = prefix.parse::<u32>()
            {
                highest = highest.max(seq);
            }
        }
        Ok(highest + 1)
    }

    /// Writes one message under `<seq>_<slug>.eml`, skipping the write
    /// if the file already exists (re-running a prior date must neither
    /// fail nor duplicate).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the write or rename fails.
    pub fn store_message(
        &self,
        folder_dir: &Path,
        seq: u32,
        slug: &str,
        raw: &[u8],
    ) -> Result<StoredMessage> {
        let file_name = Self::file_name(seq, slug);
        let path = folder_dir.join(&file_name);

        if path.exists() {
            debug!(path = %path.display(), "message already stored, skipping write");
            return Ok(StoredMessage {
                path,
                file_name,
                existed: true,
            });
        }

        let tmp = folder_dir.join(format!(".{file_name}.tmp"));
        std::fs::write(&tmp, raw)
            .map_err(|e| Error::Storage(format!("cannot write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::Storage(format!("cannot rename into {}: {e}", path.display()))
        })?;

        debug!(path = %path.display(), bytes = raw.len(), "message stored");
        Ok(StoredMessage {
            path,
            file_name,
            existed: false,
        })
    }

    /// Builds `<seq>_<slug>.eml`, zero-padding the sequence to 3 digits.
    fn file_name(seq: u32, slug: &str) -> String {
        let mut name = format!("{seq:03}_{slug}.eml");
        if name.len() > MAX_FILENAME_LEN {
            let keep = MAX_FILENAME_LEN - ".eml".len();
            let stem: String = format!("{seq:03}_{slug}").chars().take(keep).collect();
            name = format!("{stem}.eml");
        }
        name
    }

    /// The configured backup mode.
    #[must_use]
    pub const fn mode(&self) -> BackupMode {
        self.mode
    }

    /// The configured base path.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    #[test]
    fn test_sanitize_simple_filename() {
        assert_eq!(sanitize_filename("hello.txt"), "hello.txt");
    }

    #[test]
    fn test_sanitize_invalid_chars() {
        let result = sanitize_filename("file<>:\"/\\|?*name.txt");
        for c in ['<', '>', ':', '"', '/', '\\', '|', '?', '*'] {
            assert!(!result.contains(c));
        }
    }

    #[test]
    fn test_sanitize_long_filename() {
        let result = sanitize_filename(&"a".repeat(300));
        assert!(result.len() <= 200);
    }

    #[test]
    fn test_sanitize_folder_spaces() {
        assert_eq!(sanitize_folder_name("Posta inviata"), "Posta_inviata");
        assert_eq!(sanitize_folder_name("INBOX"), "INBOX");
    }

    #[test]
    fn test_subject_slug() {
        assert_eq!(subject_slug("Ricevuta di consegna"), "Ricevuta_di_consegna");
        assert_eq!(subject_slug(""), "message");
        assert!(subject_slug(&"x".repeat(500)).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn test_standard_layout_is_dated() {
        let storage = Storage::new("/tmp/base", BackupMode::Standard);
        let dir = storage.folder_dir("test@example.com", date(), "INBOX");
        assert_eq!(
            dir,
            PathBuf::from("/tmp/base/test/2024/2024-01-15/INBOX")
        );
    }

    #[test]
    fn test_mirror_layout_is_flat() {
        let storage = Storage::new("/tmp/base", BackupMode::S3Sync);
        let dir = storage.folder_dir("test@example.com", date(), "Posta inviata");
        assert_eq!(dir, PathBuf::from("/tmp/base/test/Posta_inviata"));
    }

    #[test]
    fn test_prepare_creates_folders() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path(), BackupMode::Standard);

        let account_dir = storage
            .prepare(
                "test@example.com",
                date(),
                &["INBOX".to_string(), "Posta inviata".to_string()],
            )
            .unwrap();

        assert!(account_dir.join("INBOX").is_dir());
        assert!(account_dir.join("Posta_inviata").is_dir());
    }

    #[test]
    fn test_store_message_and_skip_on_rerun() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path(), BackupMode::Standard);
        let dir = storage.folder_dir("test@example.com", date(), "INBOX");
        std::fs::create_dir_all(&dir).unwrap();

        let stored = storage
            .store_message(&dir, 1, "Ricevuta", b"raw bytes")
            .unwrap();
        assert!(!stored.existed);
        assert_eq!(stored.file_name, "001_Ricevuta.eml");
        assert_eq!(std::fs::read(&stored.path).unwrap(), b"raw bytes");

        let again = storage
            .store_message(&dir, 1, "Ricevuta", b"different bytes")
            .unwrap();
        assert!(again.existed);
        // Original content untouched.
        assert_eq!(std::fs::read(&again.path).unwrap(), b"raw bytes");

        // No temporary files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_next_seq_continues_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("INBOX");
        std::fs::create_dir_all(&dir).unwrap();

        assert_eq!(Storage::next_seq(&dir).unwrap(), 1);

        std::fs::write(dir.join("001_a.eml"), b"x").unwrap();
        std::fs::write(dir.join("007_b.eml"), b"x").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();

        assert_eq!(Storage::next_seq(&dir).unwrap(), 8);
    }

    #[test]
    fn test_next_seq_missing_dir() {
        assert_eq!(Storage::next_seq(Path::new("/nonexistent/dir")).unwrap(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_sanitized_names_are_always_safe(name in ".*") {
            let result = sanitize_filename(&name);
            proptest::prop_assert!(result.chars().count() <= MAX_FILENAME_LEN);
            for c in ['<', '>', ':', '"', '/', '\\', '|', '?', '*'] {
                proptest::prop_assert!(!result.contains(c));
            }
            proptest::prop_assert!(!result.chars().any(char::is_control));
            proptest::prop_assert!(!result.ends_with(['.', ' ']));
        }

        #[test]
        fn prop_subject_slug_is_never_empty(subject in ".*") {
            let slug = subject_slug(&subject);
            proptest::prop_assert!(!slug.is_empty());
            proptest::prop_assert!(slug.chars().count() <= MAX_SLUG_LEN);
        }
    }
}
