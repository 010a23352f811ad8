use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Storage backend selector. `s3` also accepts the legacy `aws-sdk`
/// spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Fs,
    S3,
    Gcs,
}

pub fn parse_backend(value: &str) -> Result<BackendChoice, ConfigError> {
    match value {
        "fs" => Ok(BackendChoice::Fs),
        "s3" | "aws-sdk" => Ok(BackendChoice::S3),
        "gcs" => Ok(BackendChoice::Gcs),
        other => Err(ConfigError::ValidationError(format!(
            "unknown storage backend: {other}"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: BackendChoice,
    pub fs: FsSettings,
    pub s3: S3Settings,
    pub gcs: GcsSettings,
    /// When present, the selected backend becomes the primary of a
    /// migration pair with this fallback behind it.
    pub fallback: Option<FallbackSettings>,
}

#[derive(Debug, Clone)]
pub struct FsSettings {
    pub base_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketCredentials {
    pub access_key: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub access_key: Option<String>,
    pub secret: Option<String>,
    pub endpoint: Option<String>,
    pub region: String,
    /// Path-style addressing, needed for MinIO and test fakes.
    pub path_style: bool,
    /// Maximum size of a single-request upload; larger streams go through a
    /// multipart upload in parts of this size.
    pub part_size: u64,
    /// Buckets with their own credentials; anything else uses the defaults.
    pub bucket_credentials: HashMap<String, BucketCredentials>,
}

#[derive(Debug, Clone)]
pub struct GcsSettings {
    /// Path to a service account JSON key (defaults to the metadata server).
    pub credentials_file: Option<String>,
    /// API endpoint override for test fakes.
    pub endpoint: Option<String>,
    /// Worker pool size for directory-wide deletes.
    pub delete_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub backend: BackendChoice,
    /// Primary bucket name to fallback bucket name.
    pub buckets: HashMap<String, String>,
    /// Replicate objects onto the primary the first time they are read
    /// from the fallback.
    pub copy_on_miss: bool,
}

impl Default for FsSettings {
    fn default() -> Self {
        Self {
            base_path: "./objects".to_string(),
        }
    }
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            access_key: None,
            secret: None,
            endpoint: None,
            region: "us-east-1".to_string(),
            path_style: false,
            part_size: 100 * 1024 * 1024,
            bucket_credentials: HashMap::new(),
        }
    }
}

impl Default for GcsSettings {
    fn default() -> Self {
        Self {
            credentials_file: None,
            endpoint: None,
            delete_concurrency: 50,
        }
    }
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn env_json_map<T: serde::de::DeserializeOwned>(
    name: &str,
) -> Result<HashMap<String, T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|err| ConfigError::ValidationError(format!("{name} is not valid JSON: {err}"))),
        Err(_) => Ok(HashMap::new()),
    }
}

impl Settings {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let backend = match std::env::var("STORAGE_BACKEND") {
            Ok(value) => parse_backend(&value)?,
            Err(_) => {
                return Err(ConfigError::ValidationError(
                    "no storage backend specified".to_string(),
                ))
            }
        };

        let fs = FsSettings {
            base_path: std::env::var("FS_STORAGE_PATH")
                .unwrap_or_else(|_| FsSettings::default().base_path),
        };

        let s3 = S3Settings {
            access_key: std::env::var("S3_ACCESS_KEY").ok(),
            secret: std::env::var("S3_SECRET").ok(),
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            region: std::env::var("S3_REGION").unwrap_or_else(|_| S3Settings::default().region),
            path_style: env_bool("S3_PATH_STYLE"),
            part_size: std::env::var("S3_PART_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(S3Settings::default().part_size),
            bucket_credentials: env_json_map("S3_BUCKET_CREDENTIALS")?,
        };

        let gcs = GcsSettings {
            credentials_file: std::env::var("GCS_CREDENTIALS_FILE").ok(),
            endpoint: std::env::var("GCS_ENDPOINT").ok(),
            delete_concurrency: std::env::var("GCS_DELETE_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(GcsSettings::default().delete_concurrency),
        };

        let fallback = match std::env::var("FALLBACK_BACKEND") {
            Ok(value) => Some(FallbackSettings {
                backend: parse_backend(&value)?,
                buckets: env_json_map("FALLBACK_BUCKET_MAPPING")?,
                copy_on_miss: env_bool("COPY_ON_MISS"),
            }),
            Err(_) => None,
        };

        let settings = Settings {
            backend,
            fs,
            s3,
            gcs,
            fallback,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // S3 rejects multipart parts below 5 MiB
        const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
        if self.s3.part_size < MIN_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "S3_PART_SIZE must be at least {MIN_PART_SIZE} bytes"
            )));
        }
        if self.gcs.delete_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "GCS_DELETE_CONCURRENCY cannot be zero".to_string(),
            ));
        }
        if self.fs.base_path.is_empty() {
            return Err(ConfigError::ValidationError(
                "FS_STORAGE_PATH cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_values() {
        assert_eq!(parse_backend("fs").unwrap(), BackendChoice::Fs);
        assert_eq!(parse_backend("s3").unwrap(), BackendChoice::S3);
        // legacy spelling
        assert_eq!(parse_backend("aws-sdk").unwrap(), BackendChoice::S3);
        assert_eq!(parse_backend("gcs").unwrap(), BackendChoice::Gcs);
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = parse_backend("tape").unwrap_err();
        assert!(err.to_string().contains("unknown storage backend: tape"));
    }

    #[test]
    fn part_size_below_minimum_fails_validation() {
        let settings = Settings {
            backend: BackendChoice::S3,
            fs: FsSettings::default(),
            s3: S3Settings {
                part_size: 1024,
                ..S3Settings::default()
            },
            gcs: GcsSettings::default(),
            fallback: None,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn default_settings_validate() {
        let settings = Settings {
            backend: BackendChoice::Fs,
            fs: FsSettings::default(),
            s3: S3Settings::default(),
            gcs: GcsSettings::default(),
            fallback: None,
        };
        assert!(settings.validate().is_ok());
    }
}
