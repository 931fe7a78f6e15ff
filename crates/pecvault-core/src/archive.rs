//! Daily archive creation: deterministic tar.gz plus SHA-256 digest.
//!
//! The archive over a fixed directory tree is byte-for-byte
//! reproducible: members are added in lexicographic relative-path
//! order with zeroed mtime, uid and gid and a fixed mode, and the gzip
//! header carries no timestamp. Re-running a day therefore yields an
//! identical digest, which is what makes upload verification and
//! re-run auditing meaningful.

use std::fmt::Write as _;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tracing::info;
use walkdir::WalkDir;

use crate::{Error, Result};

/// Digest file name written next to each archive.
pub const DIGEST_FILE: &str = "digest.sha256";

/// Files the archive must never contain: prior archives, digests, and
/// run summaries living in the same directory.
fn is_excluded(name: &str) -> bool {
    (name.starts_with("archive-") && name.ends_with(".tar.gz"))
        || name == DIGEST_FILE
        || name == "summary.json"
        || name.ends_with(".tmp")
}

/// The archive and digest produced for one account-day.
#[derive(Debug, Clone)]
pub struct ArchiveArtifacts {
    /// Path of the tar.gz archive.
    pub archive_path: PathBuf,
    /// Path of the digest file.
    pub digest_path: PathBuf,
    /// Hex SHA-256 of the archive.
    pub sha256: String,
    /// Archive size in bytes.
    pub size_bytes: u64,
}

/// Builds `archive-<account>-<date>.tar.gz` over `source_dir` and
/// writes it into `dest_dir` together with its digest file.
///
/// Member paths inside the tar are relative to `source_dir`.
///
/// # Errors
///
/// Returns [`Error::Compression`] if the tree cannot be walked or the
/// archive cannot be written.
pub fn create_archive(
    source_dir: &Path,
    dest_dir: &Path,
    account: &str,
    date: NaiveDate,
) -> Result<ArchiveArtifacts> {
    let archive_name = format!("archive-{account}-{}.tar.gz", date.format("%Y-%m-%d"));
    let archive_path = dest_dir.join(&archive_name);

    let members = collect_members(source_dir)?;

    let tmp = dest_dir.join(format!(".{archive_name}.tmp"));
    write_tar_gz(source_dir, &tmp, &members)?;
    std::fs::rename(&tmp, &archive_path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::Compression(format!("cannot rename into {}: {e}", archive_path.display()))
    })?;

    let sha256 = sha256_file(&archive_path)?;
    let size_bytes = std::fs::metadata(&archive_path)
        .map_err(|e| Error::Compression(format!("cannot stat {}: {e}", archive_path.display())))?
        .len();

    let digest_path = dest_dir.join(DIGEST_FILE);
    let digest_tmp = dest_dir.join(format!(".{DIGEST_FILE}.tmp"));
    std::fs::write(&digest_tmp, format!("{sha256}  {archive_name}\n"))
        .map_err(|e| Error::Compression(format!("cannot write {}: {e}", digest_tmp.display())))?;
    std::fs::rename(&digest_tmp, &digest_path).map_err(|e| {
        let _ = std::fs::remove_file(&digest_tmp);
        Error::Compression(format!("cannot rename into {}: {e}", digest_path.display()))
    })?;

    info!(
        archive = %archive_path.display(),
        members = members.len(),
        bytes = size_bytes,
        %sha256,
        "archive created"
    );

    Ok(ArchiveArtifacts {
        archive_path,
        digest_path,
        sha256,
        size_bytes,
    })
}

/// Collects archive members as relative paths, sorted lexicographically.
fn collect_members(source_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut members = Vec::new();
    for entry in WalkDir::new(source_dir).follow_links(false) {
        let entry =
            entry.map_err(|e| Error::Compression(format!("cannot walk archive tree: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_excluded(&name) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| Error::Compression(format!("cannot relativize member path: {e}")))?
            .to_path_buf();
        members.push(rel);
    }
    members.sort();
    Ok(members)
}

/// Writes the tar.gz with normalized member headers.
fn write_tar_gz(source_dir: &Path, dest: &Path, members: &[PathBuf]) -> Result<()> {
    let file = std::fs::File::create(dest)
        .map_err(|e| Error::Compression(format!("cannot create {}: {e}", dest.display())))?;
    // GzEncoder leaves the gzip MTIME field zeroed unless told otherwise.
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for rel in members {
        let full = source_dir.join(rel);
        let data = std::fs::read(&full)
            .map_err(|e| Error::Compression(format!("cannot read {}: {e}", full.display())))?;

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();

        builder
            .append_data(&mut header, rel, data.as_slice())
            .map_err(|e| Error::Compression(format!("cannot append {}: {e}", rel.display())))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::Compression(format!("cannot finish tar stream: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Compression(format!("cannot finish gzip stream: {e}")))?;
    Ok(())
}

/// Streams a file through SHA-256 and returns the lowercase hex digest.
///
/// # Errors
///
/// Returns [`Error::Compression`] if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::Compression(format!("cannot open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::Compression(format!("cannot read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_digest(&hasher.finalize()))
}

/// SHA-256 of an in-memory buffer as lowercase hex.
#[must_use]
pub fn sha256_bytes(data: &[u8]) -> String {
    hex_digest(&Sha256::digest(data))
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Re-hashes the archive and checks it against the digest file.
///
/// # Errors
///
/// Returns [`Error::Compression`] if either file cannot be read or the
/// digest does not match.
pub fn verify_digest(artifacts: &ArchiveArtifacts) -> Result<()> {
    let recorded = std::fs::read_to_string(&artifacts.digest_path).map_err(|e| {
        Error::Compression(format!(
            "cannot read {}: {e}",
            artifacts.digest_path.display()
        ))
    })?;
    let recorded_hex = recorded.split_whitespace().next().unwrap_or_default();
    let actual = sha256_file(&artifacts.archive_path)?;
    if recorded_hex == actual {
        Ok(())
    } else {
        Err(Error::Compression(format!(
            "digest mismatch for {}: recorded {recorded_hex}, actual {actual}",
            artifacts.archive_path.display()
        )))
    }
}
