//! object-vault - Uniform object persistence over local disk and cloud
//! object storage, with live backend migration
//!
//! This crate provides whole-object and byte-range reads, streaming writes
//! with content-hash verification, and directory-scoped operations across:
//! - a local filesystem backend (flattened keys, one directory per bucket)
//! - an S3-compatible backend with per-bucket credentials
//! - a GCS-compatible backend speaking the JSON API
//! - a migration decorator pairing any two backends so reads fall back to
//!   the old one (optionally replicating on first read) while writes land
//!   on the new one
//!
//! Callers hold one `Arc<dyn ObjectStore>` built by
//! [`object_store::from_settings`] and never learn which backend is behind
//! it. All failures arrive as one of the four [`object_store::ObjectStoreError`]
//! kinds; raw backend errors never escape this layer.

pub mod config;
pub mod keys;
pub mod object_store;
