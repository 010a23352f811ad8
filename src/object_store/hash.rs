//! MD5 digest utilities shared by the backends.
//!
//! Callers always deal in lowercase hex; backends that speak base64 convert
//! here at the boundary.

use std::io;

use futures::StreamExt;
use thiserror::Error;
use tracing::warn;

use super::{ObjectStore, ObjectStoreError, ObjectStream};

#[derive(Debug, Error)]
#[error("invalid md5 digest: {0}")]
pub struct InvalidDigest(String);

/// True for a plain 32-character lowercase hex MD5 digest.
pub fn is_md5_hex(candidate: &str) -> bool {
    candidate.len() == 32
        && candidate
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub fn hex_to_base64(hex: &str) -> Result<String, InvalidDigest> {
    use base64::Engine;
    if !is_md5_hex(hex) {
        return Err(InvalidDigest(hex.to_string()));
    }
    let raw: Vec<u8> = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("validated hex"))
        .collect();
    Ok(base64::engine::general_purpose::STANDARD.encode(raw))
}

pub fn base64_to_hex(encoded: &str) -> Result<String, InvalidDigest> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| InvalidDigest(encoded.to_string()))?;
    if raw.len() != 16 {
        return Err(InvalidDigest(encoded.to_string()));
    }
    Ok(raw.iter().map(|b| format!("{b:02x}")).collect())
}

/// Consume a stream computing its MD5 digest as lowercase hex.
pub async fn stream_md5(mut stream: ObjectStream) -> io::Result<String> {
    let mut context = md5::Context::new();
    while let Some(chunk) = stream.next().await {
        context.consume(&chunk?);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Compare an upload's expected digest against what the backend confirmed.
/// On mismatch the freshly written object is removed (best effort) before
/// the write error is returned, so no corrupt object is left behind.
pub async fn verify_md5(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    expected: &str,
    actual: &str,
) -> Result<(), ObjectStoreError> {
    if expected == actual {
        return Ok(());
    }
    warn!(
        bucket,
        key, expected, actual, "md5 mismatch after upload, removing object"
    );
    if let Err(err) = store.delete_object(bucket, key).await {
        warn!(bucket, key, error = %err, "failed to remove object after md5 mismatch");
    }
    Err(ObjectStoreError::write_msg(
        "md5 digest mismatch after upload",
        bucket,
        key,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_md5_hex() {
        assert!(is_md5_hex("ffffffff00000000ffffffff00000000"));
        assert!(is_md5_hex(&format!("{:x}", md5::compute(b"hello world"))));
        assert!(!is_md5_hex("FFFFFFFF00000000FFFFFFFF00000000"));
        assert!(!is_md5_hex("abc123"));
        assert!(!is_md5_hex("5d41402abc4b2a76b9719d911017c59-2"));
    }

    #[test]
    fn hex_base64_round_trip() {
        let hex = "aaaaaaaabbbbbbbbaaaaaaaabbbbbbbb";
        let b64 = hex_to_base64(hex).unwrap();
        assert_eq!(b64, "qqqqqru7u7uqqqqqu7u7uw==");
        assert_eq!(base64_to_hex(&b64).unwrap(), hex);
    }

    #[test]
    fn base64_of_wrong_length_is_rejected() {
        assert!(base64_to_hex("aGVsbG8=").is_err());
        assert!(base64_to_hex("not base64 at all!").is_err());
    }

    #[tokio::test]
    async fn stream_md5_matches_whole_buffer_digest() {
        let stream: ObjectStream = Box::pin(futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"hello ")),
            Ok(bytes::Bytes::from_static(b"world")),
        ]));
        let digest = stream_md5(stream).await.unwrap();
        assert_eq!(digest, format!("{:x}", md5::compute(b"hello world")));
    }
}
