//! Object storage shipping for `s3_sync` mode.
//!
//! Uploads the daily archive and its digest under
//! `<prefix>/<account>/<year>/<date>/<filename>`, then verifies the
//! stored object's size with a HEAD request before the caller is
//! allowed to delete anything locally. Custom endpoints (MinIO,
//! localstack) use path-style addressing.

use std::path::Path;

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::archive::ArchiveArtifacts;
use crate::config::S3Config;
use crate::{Error, Result};

/// Record of a completed, verified upload.
#[derive(Debug, Clone, Serialize)]
pub struct S3Upload {
    /// Destination bucket.
    pub bucket: String,
    /// Key of the archive object.
    pub archive_key: String,
    /// Key of the digest object.
    pub digest_key: String,
    /// Verified archive size in bytes.
    pub size_bytes: u64,
}

/// S3 client bound to one bucket and key prefix.
#[derive(Debug, Clone)]
pub struct S3Uploader {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Uploader {
    /// Builds a client from the configuration.
    ///
    /// Explicit keys override the ambient credential chain; a custom
    /// endpoint switches to path-style addressing.
    pub async fn new(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "pecvault",
            ));
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
        }
    }

    /// Checks that the bucket is reachable with the current credentials.
    ///
    /// Failure is reported but not fatal here; the per-account upload
    /// path has its own retry and error accounting.
    pub async fn verify_bucket_access(&self) -> bool {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "bucket is reachable");
                true
            }
            Err(e) => {
                warn!(
                    bucket = %self.bucket,
                    error = %DisplayErrorContext(&e),
                    "bucket is not reachable"
                );
                false
            }
        }
    }

    /// The object key for a file belonging to one account-day.
    #[must_use]
    pub fn key_for(&self, account_local: &str, date: NaiveDate, file_name: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.prefix,
            account_local,
            date.format("%Y"),
            date.format("%Y-%m-%d"),
            file_name
        )
    }

    /// Uploads the archive and digest, then verifies the archive's
    /// stored size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Upload`] on any SDK failure or size mismatch.
    /// Network-level failures are transient; service rejections and
    /// size mismatches are fatal.
    pub async fn upload_archive(
        &self,
        artifacts: &ArchiveArtifacts,
        account_local: &str,
        date: NaiveDate,
    ) -> Result<S3Upload> {
        let archive_key = self.key_for(
            account_local,
            date,
            &file_name_of(&artifacts.archive_path)?,
        );
        let digest_key = self.key_for(account_local, date, &file_name_of(&artifacts.digest_path)?);

        self.put_file(&artifacts.archive_path, &archive_key).await?;
        self.put_file(&artifacts.digest_path, &digest_key).await?;

        let stored_size = self.head_size(&archive_key).await?;
        if stored_size != artifacts.size_bytes {
            return Err(Error::Upload {
                detail: format!(
                    "size mismatch for s3://{}/{archive_key}: local {} bytes, stored {stored_size} bytes",
                    self.bucket, artifacts.size_bytes
                ),
                transient: false,
            });
        }

        info!(
            bucket = %self.bucket,
            key = %archive_key,
            bytes = stored_size,
            "archive uploaded and verified"
        );

        Ok(S3Upload {
            bucket: self.bucket.clone(),
            archive_key,
            digest_key,
            size_bytes: stored_size,
        })
    }

    async fn put_file(&self, path: &Path, key: &str) -> Result<()> {
        let body = ByteStream::from_path(path).await.map_err(|e| Error::Upload {
            detail: format!("cannot read {}: {e}", path.display()),
            transient: false,
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, key))?;
        Ok(())
    }

    async fn head_size(&self, key: &str) -> Result<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, key))?;

        head.content_length()
            .and_then(|len| u64::try_from(len).ok())
            .ok_or_else(|| Error::Upload {
                detail: format!("no content length reported for {key}"),
                transient: false,
            })
    }
}

/// Maps an SDK error onto the transient/fatal split: connection and
/// timeout failures may clear up, service rejections will not.
fn classify_sdk_error<E, R>(error: &SdkError<E, R>, key: &str) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let transient = matches!(
        error,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    );
    Error::Upload {
        detail: format!("{key}: {}", DisplayErrorContext(error)),
        transient,
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::Upload {
            detail: format!("path {} has no file name", path.display()),
            transient: false,
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::S3Config;

    fn config() -> S3Config {
        S3Config {
            bucket: "pec-backups".to_string(),
            region: "eu-south-1".to_string(),
            prefix: "pec-backups".to_string(),
            endpoint_url: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }

    #[tokio::test]
    async fn test_key_layout() {
        let uploader = S3Uploader::new(&config()).await;
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(
            uploader.key_for("test", date, "archive-test@pec.it-2024-01-15.tar.gz"),
            "pec-backups/test/2024/2024-01-15/archive-test@pec.it-2024-01-15.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_prefix_slashes_are_trimmed() {
        let mut cfg = config();
        cfg.prefix = "/deep/prefix/".to_string();
        let uploader = S3Uploader::new(&cfg).await;
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(
            uploader.key_for("test", date, "digest.sha256"),
            "deep/prefix/test/2024/2024-01-15/digest.sha256"
        );
    }
}
