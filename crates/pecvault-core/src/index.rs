//! Index generation: `index.csv` and `index.json`.
//!
//! Column order in the CSV matches the field order in the JSON so the
//! two stay interchangeable for downstream tooling. In standard mode
//! one index pair per dated directory is regenerated each run; in
//! mirror mode a single global pair per account is rewritten as the
//! path-deduplicated union of old and new entries (read-merge-write,
//! never blind append).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One persisted message, as recorded in the indexes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    /// Path relative to the directory holding the index files.
    pub path: String,
    /// Source IMAP folder (unsanitized name).
    pub folder: String,
    /// Folder-local sequence used as the filename prefix.
    pub seq: u32,
    /// Message subject.
    pub subject: String,
    /// First From address.
    pub from: String,
    /// First To address.
    pub to: String,
    /// Date header, RFC3339. Empty if missing.
    pub date: String,
    /// Raw message size in bytes.
    pub size_bytes: u64,
    /// SHA-256 of the raw message.
    pub sha256: String,
    /// True if the message lacked `\Seen` at fetch time.
    pub unread: bool,
}

/// CSV header row; must stay in step with [`IndexEntry`]'s field order.
pub const CSV_HEADER: &str = "path,folder,seq,subject,from,to,date,size_bytes,sha256,unread";

/// Writes `index.csv` and `index.json` into `dir`.
///
/// Entries are sorted by path; both files are written via a temporary
/// name and renamed into place.
///
/// # Errors
///
/// Returns [`Error::Indexing`] if either file cannot be written.
pub fn write_indexes(dir: &Path, entries: &[IndexEntry]) -> Result<()> {
    let mut sorted: Vec<&IndexEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut csv = Vec::new();
    writeln!(csv, "{CSV_HEADER}").map_err(|e| Error::Indexing(e.to_string()))?;
    for entry in &sorted {
        writeln!(
            csv,
            "{},{},{},{},{},{},{},{},{},{}",
            csv_escape(&entry.path),
            csv_escape(&entry.folder),
            entry.seq,
            csv_escape(&entry.subject),
            csv_escape(&entry.from),
            csv_escape(&entry.to),
            csv_escape(&entry.date),
            entry.size_bytes,
            entry.sha256,
            entry.unread,
        )
        .map_err(|e| Error::Indexing(e.to_string()))?;
    }
    write_atomic(&dir.join("index.csv"), &csv)?;

    let owned: Vec<&IndexEntry> = sorted;
    let json =
        serde_json::to_vec_pretty(&owned).map_err(|e| Error::Indexing(e.to_string()))?;
    write_atomic(&dir.join("index.json"), &json)?;

    Ok(())
}

/// Loads the existing `index.json` from `dir`, or an empty list if none
/// exists yet.
///
/// # Errors
///
/// Returns [`Error::Indexing`] if the file exists but cannot be read or
/// parsed.
pub fn load_index(dir: &Path) -> Result<Vec<IndexEntry>> {
    let path = dir.join("index.json");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read(&path)
        .map_err(|e| Error::Indexing(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_slice(&raw)
        .map_err(|e| Error::Indexing(format!("cannot parse {}: {e}", path.display())))
}

/// Merges existing and new entries, deduplicated by path.
///
/// Existing entries win: a message already indexed is never listed
/// twice, and re-running a date cannot rewrite history.
#[must_use]
pub fn merge(existing: Vec<IndexEntry>, new: Vec<IndexEntry>) -> Vec<IndexEntry> {
    let mut by_path: BTreeMap<String, IndexEntry> = BTreeMap::new();
    for entry in new {
        by_path.insert(entry.path.clone(), entry);
    }
    for entry in existing {
        by_path.insert(entry.path.clone(), entry);
    }
    by_path.into_values().collect()
}

/// Writes bytes to `path` via a temporary sibling and atomic rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Indexing(format!("invalid index path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&tmp, bytes)
        .map_err(|e| Error::Indexing(format!("cannot write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::Indexing(format!("cannot rename into {}: {e}", path.display()))
    })
}

/// Escapes a value per RFC 4180: quoted when it contains commas,
/// quotes, or newlines.
fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
