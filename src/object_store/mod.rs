mod fs;
mod gcs;
mod hash;
mod migration;
mod observer;
mod s3;

pub use fs::FsStore;
pub use gcs::GcsStore;
pub use migration::MigrationStore;
pub use observer::{observe, tee, StreamObserver};
pub use s3::S3Store;

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio_util::io::ReaderStream;

use crate::config::{BackendChoice, Settings};

/// A stream of object content, consumed at most once per operation.
pub type ObjectStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound {
        bucket: String,
        key: String,
        #[source]
        cause: Option<Cause>,
    },
    #[error("{context} ({bucket}/{key})")]
    Read {
        context: String,
        bucket: String,
        key: String,
        #[source]
        cause: Option<Cause>,
    },
    #[error("{context} ({bucket}/{key})")]
    Write {
        context: String,
        bucket: String,
        key: String,
        #[source]
        cause: Option<Cause>,
    },
    #[error("invalid settings: {0}")]
    Settings(String),
}

impl ObjectStoreError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
            cause: None,
        }
    }

    pub fn not_found_from(bucket: &str, key: &str, cause: impl Into<Cause>) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
            cause: Some(cause.into()),
        }
    }

    pub fn read(context: &str, bucket: &str, key: &str, cause: impl Into<Cause>) -> Self {
        Self::Read {
            context: context.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            cause: Some(cause.into()),
        }
    }

    pub fn read_msg(context: &str, bucket: &str, key: &str) -> Self {
        Self::Read {
            context: context.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            cause: None,
        }
    }

    pub fn write(context: &str, bucket: &str, key: &str, cause: impl Into<Cause>) -> Self {
        Self::Write {
            context: context.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            cause: Some(cause.into()),
        }
    }

    pub fn write_msg(context: &str, bucket: &str, key: &str) -> Self {
        Self::Write {
            context: context.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            cause: None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// An inclusive byte range within an object. `start` and `end` both identify
/// bytes that are part of the response; backends whose native APIs use an
/// exclusive end offset convert via [`ByteRange::len`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered, i.e. the exclusive end offset minus `start`.
    pub fn len(&self) -> u64 {
        (self.end + 1).saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// HTTP `Range` header value (inclusive on both ends, matching us).
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Abstraction over object storage backends.
///
/// Keys are `/`-delimited paths, unique within a bucket. All operations
/// stream content; none buffer a whole object in memory. Backend-native
/// failures are mapped onto [`ObjectStoreError`] exactly once, keeping the
/// native error as the source.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a stream to `bucket`/`key`.
    ///
    /// When `source_md5` is given the upload is verified against it;
    /// otherwise a digest is computed in-flight and checked against whatever
    /// confirmation the backend returns. A mismatch removes the uploaded
    /// object and fails with a write error.
    async fn send_stream(
        &self,
        bucket: &str,
        key: &str,
        stream: ObjectStream,
        source_md5: Option<String>,
    ) -> Result<(), ObjectStoreError>;

    /// Upload a local file by streaming it through [`ObjectStore::send_stream`].
    async fn send_file(&self, bucket: &str, key: &str, path: &Path) -> Result<(), ObjectStoreError> {
        let file = tokio::fs::File::open(path).await.map_err(|err| {
            ObjectStoreError::write("failed to open source file", bucket, key, err)
        })?;
        self.send_stream(bucket, key, Box::pin(ReaderStream::new(file)), None)
            .await
    }

    /// Fetch object content, optionally restricted to an inclusive byte range.
    async fn get_object_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectStream, ObjectStoreError>;

    async fn get_object_size(&self, bucket: &str, key: &str) -> Result<u64, ObjectStoreError>;

    /// The object's MD5 digest as lowercase hex, taken from backend metadata
    /// where trustworthy and computed by re-reading the content otherwise.
    async fn get_object_md5_hash(&self, bucket: &str, key: &str)
        -> Result<String, ObjectStoreError>;

    /// Server-side copy within a bucket where the backend supports it.
    async fn copy_object(
        &self,
        bucket: &str,
        src_key: &str,
        dest_key: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Idempotent delete -- removing a missing object is not an error.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;

    /// Delete every object whose key starts with `prefix`.
    async fn delete_directory(&self, bucket: &str, prefix: &str) -> Result<(), ObjectStoreError>;

    /// Absence is a normal `false` result, never an error.
    async fn check_if_object_exists(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<bool, ObjectStoreError> {
        match self.get_object_size(bucket, key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Total size in bytes of all objects whose key starts with `prefix`;
    /// zero when none exist.
    async fn directory_size(&self, bucket: &str, prefix: &str) -> Result<u64, ObjectStoreError>;
}

/// Build the backend selected by `settings`, wrapped in a [`MigrationStore`]
/// when fallback settings are present.
pub async fn from_settings(settings: &Settings) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
    let primary = build_backend(settings.backend, settings).await?;
    match &settings.fallback {
        Some(fallback_settings) => {
            let fallback = build_backend(fallback_settings.backend, settings).await?;
            Ok(Arc::new(MigrationStore::new(
                primary,
                fallback,
                fallback_settings.buckets.clone(),
                fallback_settings.copy_on_miss,
            )))
        }
        None => Ok(primary),
    }
}

async fn build_backend(
    choice: BackendChoice,
    settings: &Settings,
) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
    match choice {
        BackendChoice::Fs => {
            let store = FsStore::new(&settings.fs.base_path).map_err(|err| {
                ObjectStoreError::Settings(format!(
                    "failed to initialise filesystem store at {}: {err}",
                    settings.fs.base_path
                ))
            })?;
            Ok(Arc::new(store))
        }
        BackendChoice::S3 => Ok(Arc::new(S3Store::new(settings.s3.clone()))),
        BackendChoice::Gcs => {
            let store = GcsStore::new(settings.gcs.clone()).await.map_err(|err| {
                ObjectStoreError::Settings(format!("failed to initialise gcs client: {err}"))
            })?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_len_is_inclusive() {
        assert_eq!(ByteRange::new(0, 4).len(), 5);
        assert_eq!(ByteRange::new(5, 5).len(), 1);
        assert_eq!(ByteRange::new(3, 10).len(), 8);
    }

    #[test]
    fn byte_range_header_value() {
        assert_eq!(ByteRange::new(0, 4).header_value(), "bytes=0-4");
        assert_eq!(ByteRange::new(100, 200).header_value(), "bytes=100-200");
    }

    #[test]
    fn not_found_matches_kind() {
        let err = ObjectStoreError::not_found("bkt", "key");
        assert!(err.is_not_found());
        let err = ObjectStoreError::read_msg("boom", "bkt", "key");
        assert!(!err.is_not_found());
    }

    #[test]
    fn errors_carry_bucket_and_key() {
        let err = ObjectStoreError::write_msg("upload failed", "bkt", "proj/file");
        assert_eq!(err.to_string(), "upload failed (bkt/proj/file)");
    }
}
