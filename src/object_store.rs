use crate::config::S3Config;
use crate::metadata_store::format_last_modified;
use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Prefix under which every image object lives in the bucket.
pub const IMAGE_KEY_PREFIX: &str = "images";

/// S3 caps object keys at 1024 characters; longer generated keys are
/// clamped, never rejected.
pub const MAX_KEY_LENGTH: usize = 1024;

/// One entry from the bucket listing.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    /// Object key within the bucket.
    pub key: String,
    /// Millisecond-precision modification timestamp.
    pub last_modified: String,
}

/// S3 access for image objects: listing, bucket management, and
/// presigned URL issuance.
pub struct ObjectStore {
    client: S3Client,
    bucket: String,
    region: String,
}

impl ObjectStore {
    /// Create a new object store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
        })
    }

    /// Check whether the image bucket exists.
    pub async fn bucket_exists(&self) -> Result<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(e).context("failed to check bucket existence")
                }
            }
        }
    }

    /// Create the image bucket if it does not exist yet.
    #[instrument(skip(self))]
    pub async fn ensure_bucket(&self) -> Result<()> {
        if self.bucket_exists().await? {
            return Ok(());
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);

        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        request.send().await.context("failed to create image bucket")?;

        info!(bucket = %self.bucket, "Created image bucket");
        Ok(())
    }

    /// List every non-empty image object under the catalog prefix.
    #[instrument(skip(self))]
    pub async fn list_images(&self) -> Result<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(IMAGE_KEY_PREFIX)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.context("failed to list image objects")?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                // Zero-byte objects are placeholders, not images
                if object.size().unwrap_or_default() <= 0 {
                    continue;
                }
                let last_modified = object
                    .last_modified()
                    .map(timestamp_from_s3)
                    .unwrap_or_default();
                entries.push(ObjectEntry {
                    key: key.to_string(),
                    last_modified,
                });
            }
        }

        debug!(count = entries.len(), "Listed image objects");
        Ok(entries)
    }

    /// Presigned GetObject URL for downloading one image.
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .context("failed to create presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("failed to presign download URL")?;

        Ok(presigned.uri().to_string())
    }

    /// Presigned PutObject URL for uploading one image.
    pub async fn presign_put(&self, key: &str, expires_in: Duration) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .context("failed to create presigning config")?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("failed to presign upload URL")?;

        Ok(presigned.uri().to_string())
    }
}

/// Generate the destination key for an uploaded image.
/// Format: images/{yyyy}/{mm}/{mm-dd-HH-MM-SS.mmm}-{uuid}.{ext}
///
/// The calendar directory groups files by month under the bucket's lexical
/// ordering, and the timestamp plus UUID suffix keeps concurrent uploads of
/// identically named files from colliding, even within one millisecond. The
/// original file extension is carried over when the source path has one.
pub fn generate_upload_key(now: DateTime<Utc>, src_path: &str) -> String {
    let dir = now.format("%Y/%m");
    let stamp = now.format("%m-%d-%H-%M-%S%.3f");
    let ext = file_extension(src_path)
        .map(|e| format!(".{e}"))
        .unwrap_or_default();

    let key = format!("{IMAGE_KEY_PREFIX}/{dir}/{stamp}-{}{ext}", Uuid::new_v4());
    clamp_key(key)
}

/// Extension of the last path component, tolerating both separator styles.
fn file_extension(path: &str) -> Option<&str> {
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => Some(&name[idx + 1..]),
        _ => None,
    }
}

fn clamp_key(mut key: String) -> String {
    if key.len() > MAX_KEY_LENGTH {
        let mut end = MAX_KEY_LENGTH;
        while !key.is_char_boundary(end) {
            end -= 1;
        }
        key.truncate(end);
    }
    key
}

fn timestamp_from_s3(ts: &aws_sdk_s3::primitives::DateTime) -> String {
    Utc.timestamp_opt(ts.secs(), ts.subsec_nanos())
        .single()
        .map(format_last_modified)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap()
            + chrono::Duration::milliseconds(123)
    }

    #[test]
    fn test_upload_key_layout() {
        let key = generate_upload_key(test_time(), "photos/src.png");

        assert!(key.starts_with("images/2024/01/01-15-10-30-45.123-"));
        assert!(key.ends_with(".png"));
    }

    #[test]
    fn test_upload_key_unique_within_same_millisecond() {
        let now = test_time();
        let first = generate_upload_key(now, "src.jpeg");
        let second = generate_upload_key(now, "src.jpeg");

        assert_ne!(first, second);
    }

    #[test]
    fn test_upload_key_without_extension() {
        let key = generate_upload_key(test_time(), "rawfile");

        assert!(!key.ends_with('.'));
        assert!(key.starts_with("images/2024/01/"));
    }

    #[test]
    fn test_upload_key_clamped_to_max_length() {
        let path = format!("src.{}", "x".repeat(2 * MAX_KEY_LENGTH));
        let key = generate_upload_key(test_time(), &path);

        assert_eq!(key.len(), MAX_KEY_LENGTH);
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("a/b/c.png"), Some("png"));
        assert_eq!(file_extension("C:\\dir\\pic.jpeg"), Some("jpeg"));
        assert_eq!(file_extension("archive.tar.gz"), Some("gz"));
        assert_eq!(file_extension("noext"), None);
        assert_eq!(file_extension(".hidden"), None);
        assert_eq!(file_extension("trailing."), None);
    }
}
