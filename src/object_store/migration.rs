use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{tee, ByteRange, ObjectStore, ObjectStoreError, ObjectStream};

/// Decorator composing a primary and a fallback store for live backend
/// migration.
///
/// Reads fall back to the old backend when the new one misses; with
/// `copy_on_miss` the object is replicated onto the primary in the
/// background as it is served. Writes go to the primary only. Deletes fan
/// out to both sides so neither backend keeps a stale copy.
pub struct MigrationStore {
    primary: Arc<dyn ObjectStore>,
    fallback: Arc<dyn ObjectStore>,
    buckets: HashMap<String, String>,
    copy_on_miss: bool,
}

impl MigrationStore {
    pub fn new(
        primary: Arc<dyn ObjectStore>,
        fallback: Arc<dyn ObjectStore>,
        buckets: HashMap<String, String>,
        copy_on_miss: bool,
    ) -> Self {
        Self {
            primary,
            fallback,
            buckets,
            copy_on_miss,
        }
    }

    /// Bucket to use on the fallback side; unmapped buckets keep their name.
    fn fallback_bucket<'a>(&'a self, bucket: &'a str) -> &'a str {
        self.buckets.get(bucket).map(String::as_str).unwrap_or(bucket)
    }

    /// Serve the fallback stream while replicating it onto the primary.
    /// The caller's branch is returned immediately; the replication branch
    /// runs in the background and must never fail or stall the caller.
    async fn replicate_to_primary(
        &self,
        bucket: &str,
        key: &str,
        fallback_bucket: &str,
        stream: ObjectStream,
    ) -> ObjectStream {
        let digest = match self
            .fallback
            .get_object_md5_hash(fallback_bucket, key)
            .await
        {
            Ok(digest) => digest,
            Err(err) => {
                warn!(
                    bucket,
                    key,
                    error = %err,
                    "failed to fetch digest from fallback, skipping copy-on-miss"
                );
                return stream;
            }
        };

        let (foreground, background) = tee(stream);
        let primary = Arc::clone(&self.primary);
        let bucket = bucket.to_string();
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(err) = primary
                .send_stream(&bucket, &key, background, Some(digest))
                .await
            {
                warn!(
                    bucket,
                    key,
                    error = %err,
                    "failed to copy object to primary store"
                );
            }
        });
        foreground
    }
}

#[async_trait]
impl ObjectStore for MigrationStore {
    async fn send_stream(
        &self,
        bucket: &str,
        key: &str,
        stream: ObjectStream,
        source_md5: Option<String>,
    ) -> Result<(), ObjectStoreError> {
        // writes never touch the fallback
        self.primary
            .send_stream(bucket, key, stream, source_md5)
            .await
    }

    async fn get_object_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectStream, ObjectStoreError> {
        match self.primary.get_object_stream(bucket, key, range).await {
            Ok(stream) => Ok(stream),
            Err(err) if err.is_not_found() => {
                let fallback_bucket = self.fallback_bucket(bucket);
                let stream = self
                    .fallback
                    .get_object_stream(fallback_bucket, key, range)
                    .await?;
                // a ranged read is a partial body, never worth replicating
                if self.copy_on_miss && range.is_none() {
                    return Ok(self
                        .replicate_to_primary(bucket, key, fallback_bucket, stream)
                        .await);
                }
                Ok(stream)
            }
            Err(err) => Err(err),
        }
    }

    async fn get_object_size(&self, bucket: &str, key: &str) -> Result<u64, ObjectStoreError> {
        match self.primary.get_object_size(bucket, key).await {
            Err(err) if err.is_not_found() => {
                self.fallback
                    .get_object_size(self.fallback_bucket(bucket), key)
                    .await
            }
            other => other,
        }
    }

    async fn get_object_md5_hash(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, ObjectStoreError> {
        match self.primary.get_object_md5_hash(bucket, key).await {
            Err(err) if err.is_not_found() => {
                self.fallback
                    .get_object_md5_hash(self.fallback_bucket(bucket), key)
                    .await
            }
            other => other,
        }
    }

    async fn copy_object(
        &self,
        bucket: &str,
        src_key: &str,
        dest_key: &str,
    ) -> Result<(), ObjectStoreError> {
        match self.primary.copy_object(bucket, src_key, dest_key).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                // source only exists on the fallback: stream it across,
                // verifying against the digest the fallback reports
                let fallback_bucket = self.fallback_bucket(bucket);
                let digest = self
                    .fallback
                    .get_object_md5_hash(fallback_bucket, src_key)
                    .await?;
                let stream = self
                    .fallback
                    .get_object_stream(fallback_bucket, src_key, None)
                    .await?;
                self.primary
                    .send_stream(bucket, dest_key, stream, Some(digest))
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        let (primary_result, fallback_result) = tokio::join!(
            self.primary.delete_object(bucket, key),
            self.fallback
                .delete_object(self.fallback_bucket(bucket), key)
        );
        // both sides were attempted; report the primary failure first
        primary_result.and(fallback_result)
    }

    async fn delete_directory(&self, bucket: &str, prefix: &str) -> Result<(), ObjectStoreError> {
        let (primary_result, fallback_result) = tokio::join!(
            self.primary.delete_directory(bucket, prefix),
            self.fallback
                .delete_directory(self.fallback_bucket(bucket), prefix)
        );
        primary_result.and(fallback_result)
    }

    async fn check_if_object_exists(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<bool, ObjectStoreError> {
        match self.primary.check_if_object_exists(bucket, key).await? {
            true => Ok(true),
            false => {
                self.fallback
                    .check_if_object_exists(self.fallback_bucket(bucket), key)
                    .await
            }
        }
    }

    async fn directory_size(&self, bucket: &str, prefix: &str) -> Result<u64, ObjectStoreError> {
        match self.primary.directory_size(bucket, prefix).await {
            Err(err) if err.is_not_found() => {
                self.fallback
                    .directory_size(self.fallback_bucket(bucket), prefix)
                    .await
            }
            other => other,
        }
    }
}
