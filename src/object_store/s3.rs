use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::S3Settings;

use super::{hash, observe, ByteRange, ObjectStore, ObjectStoreError, ObjectStream};

/// S3-compatible object store backend.
///
/// Buckets may carry their own credentials; clients are built lazily and
/// cached per bucket for the process lifetime. Uploads larger than the
/// configured part size go through a multipart upload, buffering at most one
/// part at a time.
pub struct S3Store {
    settings: S3Settings,
    clients: RwLock<HashMap<String, Client>>,
}

fn error_code_is_not_found<E>(err: &SdkError<E>) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(err.code(), Some("NoSuchKey") | Some("NotFound") | Some("404"))
}

// HeadObject 404s come back without an error body, so the code-based check
// is not enough on its own.
fn head_not_found(err: &SdkError<HeadObjectError>) -> bool {
    if let SdkError::ServiceError(service_err) = err {
        if service_err.err().is_not_found() {
            return true;
        }
    }
    error_code_is_not_found(err)
}

fn get_not_found(err: &SdkError<GetObjectError>) -> bool {
    if let SdkError::ServiceError(service_err) = err {
        if service_err.err().is_no_such_key() {
            return true;
        }
    }
    error_code_is_not_found(err)
}

impl S3Store {
    pub fn new(settings: S3Settings) -> Self {
        Self {
            settings,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch or build the client for `bucket`. Construction happens under
    /// the write lock so two concurrent first uses build exactly one client.
    async fn client_for_bucket(&self, bucket: &str) -> Result<Client, ObjectStoreError> {
        if let Some(client) = self.clients.read().await.get(bucket) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(bucket) {
            return Ok(client.clone());
        }

        let (access_key, secret) = match self.settings.bucket_credentials.get(bucket) {
            Some(creds) => (creds.access_key.clone(), creds.secret.clone()),
            None => match (&self.settings.access_key, &self.settings.secret) {
                (Some(key), Some(secret)) => (key.clone(), secret.clone()),
                _ => {
                    return Err(ObjectStoreError::Settings(format!(
                        "no bucket-specific or default credentials provided for bucket `{bucket}`"
                    )))
                }
            },
        };

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.settings.region.clone()))
            .credentials_provider(Credentials::new(access_key, secret, None, None, "settings"));
        if let Some(endpoint) = &self.settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if self.settings.path_style {
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());
        clients.insert(bucket.to_string(), client.clone());
        Ok(client)
    }

    /// Pull chunks from `stream` into `buf` until it holds at least
    /// `target` bytes or the stream ends. Returns whether the stream ended.
    async fn fill_buffer(
        stream: &mut ObjectStream,
        buf: &mut BytesMut,
        target: usize,
    ) -> Result<bool, std::io::Error> {
        while buf.len() < target {
            match stream.next().await {
                Some(chunk) => buf.extend_from_slice(&chunk?),
                None => return Ok(true),
            }
        }
        Ok(false)
    }

    async fn multipart_upload(
        &self,
        client: &Client,
        bucket: &str,
        key: &str,
        stream: &mut ObjectStream,
        mut buf: BytesMut,
    ) -> Result<String, ObjectStoreError> {
        let part_size = self.settings.part_size as usize;
        let create = client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                ObjectStoreError::write("failed to start multipart upload", bucket, key, err)
            })?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| {
                ObjectStoreError::write_msg("multipart upload returned no id", bucket, key)
            })?
            .to_string();

        let mut parts = Vec::new();
        let mut part_number: i32 = 1;
        let mut ended = false;
        loop {
            if !ended {
                ended = Self::fill_buffer(stream, &mut buf, part_size)
                    .await
                    .map_err(|err| {
                        self.abort_multipart_upload(client, bucket, key, &upload_id);
                        ObjectStoreError::write("failed to read upload stream", bucket, key, err)
                    })?;
            }
            if buf.is_empty() {
                break;
            }
            let part = buf.split_to(part_size.min(buf.len())).freeze();
            let uploaded = client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|err| {
                    self.abort_multipart_upload(client, bucket, key, &upload_id);
                    ObjectStoreError::write("failed to upload part", bucket, key, err)
                })?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(String::from))
                    .build(),
            );
            part_number += 1;
            if ended && buf.is_empty() {
                break;
            }
        }

        let completed = client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| {
                ObjectStoreError::write("failed to complete multipart upload", bucket, key, err)
            })?;
        Ok(normalise_etag(completed.e_tag()))
    }

    /// Best-effort cleanup of a failed multipart upload.
    fn abort_multipart_upload(&self, client: &Client, bucket: &str, key: &str, upload_id: &str) {
        let client = client.clone();
        let bucket = bucket.to_string();
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        tokio::spawn(async move {
            let _ = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await;
        });
    }

    /// Re-read the whole object and hash it locally. The expensive path,
    /// used only when the backend's confirmation is not a plain MD5.
    async fn md5_by_download(&self, bucket: &str, key: &str) -> Result<String, ObjectStoreError> {
        let stream = self.get_object_stream(bucket, key, None).await?;
        hash::stream_md5(stream)
            .await
            .map_err(|err| ObjectStoreError::read("failed to hash object", bucket, key, err))
    }
}

fn normalise_etag(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn send_stream(
        &self,
        bucket: &str,
        key: &str,
        stream: ObjectStream,
        source_md5: Option<String>,
    ) -> Result<(), ObjectStoreError> {
        let client = self.client_for_bucket(bucket).await?;
        let compute_md5 = source_md5.is_none();
        let (mut stream, observer) = observe(stream, "s3.egress", compute_md5);

        let part_size = self.settings.part_size as usize;
        let mut buf = BytesMut::new();
        let ended = Self::fill_buffer(&mut stream, &mut buf, part_size + 1)
            .await
            .map_err(|err| {
                ObjectStoreError::write("failed to read upload stream", bucket, key, err)
            })?;

        let etag = if ended {
            // fits in a single part
            let mut request = client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(buf.freeze()));
            if let Some(md5) = &source_md5 {
                let encoded = hash::hex_to_base64(md5).map_err(|err| {
                    ObjectStoreError::write("invalid source md5", bucket, key, err)
                })?;
                request = request.content_md5(encoded);
            }
            let response = request.send().await.map_err(|err| {
                ObjectStoreError::write("failed to upload object", bucket, key, err)
            })?;
            normalise_etag(response.e_tag())
        } else {
            self.multipart_upload(&client, bucket, key, &mut stream, buf)
                .await?
        };

        // With a caller-supplied digest on a single-part upload, S3 already
        // validated the Content-MD5 server side.
        let expected = match &source_md5 {
            Some(md5) if hash::is_md5_hex(&etag) => {
                return if *md5 == etag {
                    Ok(())
                } else {
                    hash::verify_md5(self, bucket, key, md5, &etag).await
                };
            }
            Some(md5) => md5.clone(),
            None => observer
                .hex_digest()
                .expect("digest requested for unverified upload"),
        };
        let actual = if hash::is_md5_hex(&etag) {
            etag
        } else {
            debug!(
                bucket,
                key, etag, "etag is not an md5 digest, re-reading object to verify upload"
            );
            self.md5_by_download(bucket, key).await?
        };
        hash::verify_md5(self, bucket, key, &expected, &actual).await
    }

    async fn get_object_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectStream, ObjectStoreError> {
        let client = self.client_for_bucket(bucket).await?;
        let mut request = client.get_object().bucket(bucket).key(key);
        if let Some(range) = range {
            request = request.range(range.header_value());
        }
        let response = request.send().await.map_err(|err| {
            if get_not_found(&err) {
                ObjectStoreError::not_found_from(bucket, key, err)
            } else {
                ObjectStoreError::read("failed to read object", bucket, key, err)
            }
        })?;
        let stream: ObjectStream =
            Box::pin(ReaderStream::new(response.body.into_async_read()));
        let (stream, _observer) = observe(stream, "s3.ingress", false);
        Ok(stream)
    }

    async fn get_object_size(&self, bucket: &str, key: &str) -> Result<u64, ObjectStoreError> {
        let client = self.client_for_bucket(bucket).await?;
        let response = client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if head_not_found(&err) {
                    ObjectStoreError::not_found_from(bucket, key, err)
                } else {
                    ObjectStoreError::read("failed to stat object", bucket, key, err)
                }
            })?;
        Ok(response.content_length().unwrap_or(0).max(0) as u64)
    }

    async fn get_object_md5_hash(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, ObjectStoreError> {
        let client = self.client_for_bucket(bucket).await?;
        let response = client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if head_not_found(&err) {
                    ObjectStoreError::not_found_from(bucket, key, err)
                } else {
                    ObjectStoreError::read("failed to stat object", bucket, key, err)
                }
            })?;
        let etag = normalise_etag(response.e_tag());
        if hash::is_md5_hex(&etag) {
            return Ok(etag);
        }
        debug!(bucket, key, etag, "etag is not an md5 digest, hashing object content");
        self.md5_by_download(bucket, key).await
    }

    async fn copy_object(
        &self,
        bucket: &str,
        src_key: &str,
        dest_key: &str,
    ) -> Result<(), ObjectStoreError> {
        let client = self.client_for_bucket(bucket).await?;
        client
            .copy_object()
            .copy_source(format!("{bucket}/{src_key}"))
            .bucket(bucket)
            .key(dest_key)
            .send()
            .await
            .map_err(|err| {
                if error_code_is_not_found(&err) {
                    ObjectStoreError::not_found_from(bucket, src_key, err)
                } else {
                    ObjectStoreError::write("failed to copy object", bucket, dest_key, err)
                }
            })?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        let client = self.client_for_bucket(bucket).await?;
        // deleting a missing key succeeds natively, keeping this idempotent
        client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                ObjectStoreError::write("failed to delete object", bucket, key, err)
            })?;
        Ok(())
    }

    async fn delete_directory(&self, bucket: &str, prefix: &str) -> Result<(), ObjectStoreError> {
        let client = self.client_for_bucket(bucket).await?;
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let listing = request.send().await.map_err(|err| {
                ObjectStoreError::write("failed to list objects for delete", bucket, prefix, err)
            })?;

            let identifiers: Vec<ObjectIdentifier> = listing
                .contents()
                .iter()
                .filter_map(|object| object.key())
                .map(|key| {
                    ObjectIdentifier::builder().key(key).build().map_err(|err| {
                        ObjectStoreError::write("invalid listed key", bucket, prefix, err)
                    })
                })
                .collect::<Result<_, _>>()?;

            if !identifiers.is_empty() {
                let delete = Delete::builder()
                    .set_objects(Some(identifiers))
                    .quiet(true)
                    .build()
                    .map_err(|err| {
                        ObjectStoreError::write("failed to build delete batch", bucket, prefix, err)
                    })?;
                client
                    .delete_objects()
                    .bucket(bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|err| {
                        ObjectStoreError::write("failed to delete objects", bucket, prefix, err)
                    })?;
            }

            if listing.is_truncated() == Some(true) {
                continuation_token = listing.next_continuation_token().map(String::from);
            } else {
                return Ok(());
            }
        }
    }

    async fn directory_size(&self, bucket: &str, prefix: &str) -> Result<u64, ObjectStoreError> {
        let client = self.client_for_bucket(bucket).await?;
        let mut total: u64 = 0;
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let listing = request.send().await.map_err(|err| {
                ObjectStoreError::read("failed to list objects", bucket, prefix, err)
            })?;
            total += listing
                .contents()
                .iter()
                .map(|object| object.size().unwrap_or(0).max(0) as u64)
                .sum::<u64>();
            if listing.is_truncated() == Some(true) {
                continuation_token = listing.next_continuation_token().map(String::from);
            } else {
                return Ok(total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_quoted_etags() {
        assert_eq!(
            normalise_etag(Some("\"5eb63bbbe01eeed093cb22bb8f5acdc3\"")),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(normalise_etag(Some("plain")), "plain");
        assert_eq!(normalise_etag(None), "");
    }

    #[test]
    fn multipart_etags_are_not_md5() {
        assert!(!hash::is_md5_hex(&normalise_etag(Some(
            "\"5eb63bbbe01eeed093cb22bb8f5acdc3-4\""
        ))));
        assert!(hash::is_md5_hex(&normalise_etag(Some(
            "\"5eb63bbbe01eeed093cb22bb8f5acdc3\""
        ))));
    }

    #[tokio::test]
    async fn missing_credentials_is_a_settings_error() {
        let store = S3Store::new(S3Settings::default());
        let err = store.client_for_bucket("unconfigured").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::Settings(_)));
    }

    #[tokio::test]
    async fn bucket_clients_are_cached() {
        let mut settings = S3Settings::default();
        settings.access_key = Some("key".to_string());
        settings.secret = Some("secret".to_string());
        let store = S3Store::new(settings);
        store.client_for_bucket("bkt").await.unwrap();
        store.client_for_bucket("bkt").await.unwrap();
        assert_eq!(store.clients.read().await.len(), 1);
    }
}
