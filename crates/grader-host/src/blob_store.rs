// Blob storage for job inputs and outputs (S3).

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::path::Path;

/// Object storage used for `job.tar.gz`, `results.json`, `archive.tar.gz`
/// and `output.log`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write the object at `bucket/key` to `dest`.
    async fn download_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<()>;

    async fn put_bytes(&self, bucket: &str, key: &str, body: Bytes, content_type: &str)
        -> Result<()>;

    /// Upload a file, streaming it from disk.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path, content_type: &str)
        -> Result<()>;
}

/// `BlobStore` backed by the AWS S3 SDK. The bucket comes from each job.
pub struct S3BlobStore {
    client: S3Client,
}

impl S3BlobStore {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn download_to_file(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{bucket}/{key}"))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 object body")?
            .into_bytes();

        tokio::fs::write(dest, &data)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        tracing::debug!("Downloaded s3://{bucket}/{key} ({} bytes)", data.len());
        Ok(())
    }

    async fn put_bytes(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .with_context(|| format!("Failed to put s3://{bucket}/{key}"))?;
        Ok(())
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .with_context(|| format!("Failed to put s3://{bucket}/{key}"))?;
        Ok(())
    }
}
