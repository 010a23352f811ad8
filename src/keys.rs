//! Object key validation.
//!
//! Most keys follow the project-file convention: two 24-character hex
//! identifiers joined by a slash. Callers validate before handing a key to
//! the storage layer so malformed input fails fast, before any network call.

use std::sync::OnceLock;

use regex::Regex;

use crate::object_store::ObjectStoreError;

fn project_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{24}/[0-9a-f]{24}$").expect("project key pattern compiles")
    })
}

/// Check a key against the `<project-id>/<file-id>` convention.
pub fn validate_project_key(key: &str) -> Result<(), ObjectStoreError> {
    if project_key_pattern().is_match(key) {
        Ok(())
    } else {
        Err(ObjectStoreError::Settings(format!(
            "invalid object key: {key}"
        )))
    }
}

/// Check a prefix against the `<project-id>/` convention used by
/// directory-scoped operations.
pub fn validate_project_prefix(prefix: &str) -> Result<(), ObjectStoreError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^[0-9a-f]{24}/$").expect("project prefix pattern compiles"));
    if pattern.is_match(prefix) {
        Ok(())
    } else {
        Err(ObjectStoreError::Settings(format!(
            "invalid object prefix: {prefix}"
        )))
    }
}
