use std::io;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::GcsSettings;

use super::{hash, observe, ByteRange, ObjectStore, ObjectStoreError, ObjectStream};

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Google Cloud Storage object store backend, speaking the JSON API directly.
///
/// Authenticates with a service account key file when configured, falling
/// back to the instance metadata server. Directory-wide deletes list the
/// matching objects and remove them with bounded concurrency to stay inside
/// backend rate limits.
pub struct GcsStore {
    client: Client,
    endpoint: String,
    access_token: tokio::sync::RwLock<String>,
    credentials_file: Option<String>,
    delete_concurrency: usize,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Object resource subset returned by uploads, stat and list calls.
#[derive(Deserialize)]
struct ObjectResource {
    name: Option<String>,
    size: Option<String>,
    #[serde(rename = "md5Hash")]
    md5_hash: Option<String>,
}

#[derive(Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// Percent-encode a key for use as a single URL path segment; in particular
/// the `/` separators inside keys must arrive as `%2F`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

impl GcsStore {
    pub async fn new(settings: GcsSettings) -> Result<Self, anyhow::Error> {
        let client = Client::builder().build()?;

        let store = Self {
            client,
            endpoint: settings
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            access_token: tokio::sync::RwLock::new(String::new()),
            credentials_file: settings.credentials_file,
            delete_concurrency: settings.delete_concurrency,
        };

        store.refresh_token().await?;
        Ok(store)
    }

    async fn refresh_token(&self) -> Result<(), anyhow::Error> {
        let token = if let Some(ref creds_path) = self.credentials_file {
            self.token_from_service_account(creds_path).await?
        } else {
            self.token_from_metadata_server().await?
        };

        let mut lock = self.access_token.write().await;
        *lock = token;
        Ok(())
    }

    async fn token_from_service_account(&self, path: &str) -> Result<String, anyhow::Error> {
        let key_json = tokio::fs::read_to_string(path).await?;
        let key: ServiceAccountKey = serde_json::from_str(&key_json)?;

        let now = chrono::Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": key.client_email,
            "scope": "https://www.googleapis.com/auth/devstorage.read_write",
            "aud": key.token_uri,
            "iat": now,
            "exp": now + 3600,
        });

        // Build JWT (header.claims.signature)
        let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "alg": "RS256",
            "typ": "JWT"
        }))?);
        let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
        let unsigned = format!("{header}.{payload}");

        let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
        let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

        let resp: TokenResponse = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?
            .json()
            .await?;

        Ok(resp.access_token)
    }

    async fn token_from_metadata_server(&self) -> Result<String, anyhow::Error> {
        let resp: TokenResponse = self
            .client
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .json()
            .await?;

        Ok(resp.access_token)
    }

    async fn token(&self) -> String {
        self.access_token.read().await.clone()
    }

    fn upload_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint,
            bucket,
            encode_key(key)
        )
    }

    fn media_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.endpoint,
            bucket,
            encode_key(key)
        )
    }

    fn metadata_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            bucket,
            encode_key(key)
        )
    }

    fn copy_url(&self, bucket: &str, src_key: &str, dest_key: &str) -> String {
        format!(
            "{}/storage/v1/b/{bucket}/o/{}/copyTo/b/{bucket}/o/{}",
            self.endpoint,
            encode_key(src_key),
            encode_key(dest_key)
        )
    }

    fn list_url(&self, bucket: &str, prefix: &str, page_token: Option<&str>) -> String {
        let mut url = format!(
            "{}/storage/v1/b/{}/o?prefix={}&fields=items(name,size),nextPageToken",
            self.endpoint,
            bucket,
            encode_key(prefix)
        );
        if let Some(token) = page_token {
            url.push_str("&pageToken=");
            url.push_str(&encode_key(token));
        }
        url
    }

    /// Fetch the object resource (stat) for `bucket`/`key`.
    async fn object_resource(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectResource, ObjectStoreError> {
        let resp = self
            .client
            .get(self.metadata_url(bucket, key))
            .bearer_auth(self.token().await)
            .send()
            .await
            .map_err(|err| ObjectStoreError::read("failed to stat object", bucket, key, err))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::not_found(bucket, key));
        }
        if !resp.status().is_success() {
            return Err(ObjectStoreError::read_msg(
                &format!("failed to stat object ({})", resp.status()),
                bucket,
                key,
            ));
        }
        resp.json()
            .await
            .map_err(|err| ObjectStoreError::read("invalid object metadata", bucket, key, err))
    }

    /// One page of a prefix listing.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        page_token: Option<&str>,
    ) -> Result<ObjectList, reqwest::Error> {
        self.client
            .get(self.list_url(bucket, prefix, page_token))
            .bearer_auth(self.token().await)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// All object names and sizes under `prefix`, following page tokens.
    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<(String, u64)>, reqwest::Error> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.list_page(bucket, prefix, page_token.as_deref()).await?;
            for item in page.items {
                let Some(name) = item.name else { continue };
                let size = item
                    .size
                    .as_deref()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                objects.push((name, size));
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(objects),
            }
        }
    }

    async fn delete_one(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        let resp = self
            .client
            .delete(self.metadata_url(bucket, key))
            .bearer_auth(self.token().await)
            .send()
            .await
            .map_err(|err| ObjectStoreError::write("failed to delete object", bucket, key, err))?;

        // 404 is fine -- object already gone
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::write_msg(
                &format!("failed to delete object ({})", resp.status()),
                bucket,
                key,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn send_stream(
        &self,
        bucket: &str,
        key: &str,
        stream: ObjectStream,
        source_md5: Option<String>,
    ) -> Result<(), ObjectStoreError> {
        let compute_md5 = source_md5.is_none();
        let (stream, observer) = observe(stream, "gcs.egress", compute_md5);

        let resp = self
            .client
            .post(self.upload_url(bucket, key))
            .bearer_auth(self.token().await)
            .header("Content-Type", "application/octet-stream")
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|err| ObjectStoreError::write("failed to upload object", bucket, key, err))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ObjectStoreError::write_msg(
                &format!("upload failed ({status}): {body}"),
                bucket,
                key,
            ));
        }

        // The upload response carries the stored object's md5; check it
        // against what the caller claimed, or what we saw going out.
        let resource: ObjectResource = resp.json().await.map_err(|err| {
            ObjectStoreError::write("invalid upload confirmation", bucket, key, err)
        })?;
        let remote_md5 = resource
            .md5_hash
            .as_deref()
            .map(hash::base64_to_hex)
            .transpose()
            .map_err(|err| {
                ObjectStoreError::write("invalid upload confirmation digest", bucket, key, err)
            })?
            .ok_or_else(|| {
                ObjectStoreError::write_msg("upload confirmation without digest", bucket, key)
            })?;

        let expected = match source_md5 {
            Some(md5) => md5,
            None => observer
                .hex_digest()
                .expect("digest requested for unverified upload"),
        };
        hash::verify_md5(self, bucket, key, &expected, &remote_md5).await
    }

    async fn get_object_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectStream, ObjectStoreError> {
        let mut request = self
            .client
            .get(self.media_url(bucket, key))
            .bearer_auth(self.token().await);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }
        let resp = request
            .send()
            .await
            .map_err(|err| ObjectStoreError::read("failed to read object", bucket, key, err))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::not_found(bucket, key));
        }
        if !resp.status().is_success() {
            return Err(ObjectStoreError::read_msg(
                &format!("failed to read object ({})", resp.status()),
                bucket,
                key,
            ));
        }
        // Our range is inclusive; the response length must equal the
        // exclusive-end conversion, `end + 1 - start`.
        if let (Some(range), Some(length)) = (range, resp.content_length()) {
            if length != range.len() {
                return Err(ObjectStoreError::read_msg(
                    &format!(
                        "unexpected range response length ({length} != {})",
                        range.len()
                    ),
                    bucket,
                    key,
                ));
            }
        }

        let stream: ObjectStream = Box::pin(
            resp.bytes_stream()
                .map_err(|err| io::Error::other(err)),
        );
        let (stream, _observer) = observe(stream, "gcs.ingress", false);
        Ok(stream)
    }

    async fn get_object_size(&self, bucket: &str, key: &str) -> Result<u64, ObjectStoreError> {
        let resource = self.object_resource(bucket, key).await?;
        resource
            .size
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| ObjectStoreError::read_msg("object metadata without size", bucket, key))
    }

    async fn get_object_md5_hash(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, ObjectStoreError> {
        let resource = self.object_resource(bucket, key).await?;
        let encoded = resource.md5_hash.as_deref().ok_or_else(|| {
            ObjectStoreError::read_msg("object metadata without digest", bucket, key)
        })?;
        hash::base64_to_hex(encoded)
            .map_err(|err| ObjectStoreError::read("invalid object digest", bucket, key, err))
    }

    async fn copy_object(
        &self,
        bucket: &str,
        src_key: &str,
        dest_key: &str,
    ) -> Result<(), ObjectStoreError> {
        let resp = self
            .client
            .post(self.copy_url(bucket, src_key, dest_key))
            .bearer_auth(self.token().await)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|err| {
                ObjectStoreError::write("failed to copy object", bucket, dest_key, err)
            })?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::not_found(bucket, src_key));
        }
        if !resp.status().is_success() {
            return Err(ObjectStoreError::write_msg(
                &format!("failed to copy object ({})", resp.status()),
                bucket,
                dest_key,
            ));
        }
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.delete_one(bucket, key).await
    }

    async fn delete_directory(&self, bucket: &str, prefix: &str) -> Result<(), ObjectStoreError> {
        let objects = self.list_prefix(bucket, prefix).await.map_err(|err| {
            ObjectStoreError::write("failed to list objects for delete", bucket, prefix, err)
        })?;
        debug!(
            bucket,
            prefix,
            count = objects.len(),
            "deleting objects under prefix"
        );

        let results: Vec<Result<(), ObjectStoreError>> = futures::stream::iter(objects)
            .map(|(name, _size)| async move { self.delete_one(bucket, &name).await })
            .buffer_unordered(self.delete_concurrency)
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn directory_size(&self, bucket: &str, prefix: &str) -> Result<u64, ObjectStoreError> {
        let objects = self
            .list_prefix(bucket, prefix)
            .await
            .map_err(|err| ObjectStoreError::read("failed to list objects", bucket, prefix, err))?;
        Ok(objects.iter().map(|(_name, size)| size).sum())
    }
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    // Strip PEM headers and decode base64
    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &der_b64)?;

    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign: {e}"))?;

    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_key_separators() {
        assert_eq!(encode_key("proj/file"), "proj%2Ffile");
        assert_eq!(encode_key("plain-key_1.bin"), "plain-key_1.bin");
        assert_eq!(encode_key("with space"), "with%20space");
    }

    #[test]
    fn parses_listing_sizes() {
        let page: ObjectList = serde_json::from_str(
            r#"{"items":[{"name":"a/1","size":"11"},{"name":"a/2","size":"22"}],"nextPageToken":"t"}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].size.as_deref(), Some("11"));
        assert_eq!(page.next_page_token.as_deref(), Some("t"));
    }

    #[test]
    fn empty_listing_deserialises() {
        let page: ObjectList = serde_json::from_str("{}").unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }
}
