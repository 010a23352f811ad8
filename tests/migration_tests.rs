use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_vault::object_store::{
    ByteRange, FsStore, MigrationStore, ObjectStore, ObjectStoreError, ObjectStream,
};

fn byte_stream(data: &'static [u8]) -> ObjectStream {
    Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(data))]))
}

async fn read_all(stream: ObjectStream) -> Vec<u8> {
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    chunks.concat()
}

/// Store wrapper counting calls, standing in for either side of a
/// migration pair.
struct CountingStore {
    inner: FsStore,
    get_streams: AtomicUsize,
    send_streams: AtomicUsize,
    deletes: AtomicUsize,
}

impl CountingStore {
    fn new(path: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: FsStore::new(path).unwrap(),
            get_streams: AtomicUsize::new(0),
            send_streams: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn send_stream(
        &self,
        bucket: &str,
        key: &str,
        stream: ObjectStream,
        source_md5: Option<String>,
    ) -> Result<(), ObjectStoreError> {
        self.send_streams.fetch_add(1, Ordering::SeqCst);
        self.inner.send_stream(bucket, key, stream, source_md5).await
    }

    async fn get_object_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectStream, ObjectStoreError> {
        self.get_streams.fetch_add(1, Ordering::SeqCst);
        self.inner.get_object_stream(bucket, key, range).await
    }

    async fn get_object_size(&self, bucket: &str, key: &str) -> Result<u64, ObjectStoreError> {
        self.inner.get_object_size(bucket, key).await
    }

    async fn get_object_md5_hash(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, ObjectStoreError> {
        self.inner.get_object_md5_hash(bucket, key).await
    }

    async fn copy_object(
        &self,
        bucket: &str,
        src_key: &str,
        dest_key: &str,
    ) -> Result<(), ObjectStoreError> {
        self.inner.copy_object(bucket, src_key, dest_key).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_object(bucket, key).await
    }

    async fn delete_directory(&self, bucket: &str, prefix: &str) -> Result<(), ObjectStoreError> {
        self.inner.delete_directory(bucket, prefix).await
    }

    async fn directory_size(&self, bucket: &str, prefix: &str) -> Result<u64, ObjectStoreError> {
        self.inner.directory_size(bucket, prefix).await
    }
}

struct Setup {
    _dir: tempfile::TempDir,
    primary: Arc<CountingStore>,
    fallback: Arc<CountingStore>,
}

fn bucket_mapping() -> HashMap<String, String> {
    HashMap::from([("bkt".to_string(), "fb".to_string())])
}

impl Setup {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let primary = CountingStore::new(&dir.path().join("primary"));
        let fallback = CountingStore::new(&dir.path().join("fallback"));
        Self {
            _dir: dir,
            primary,
            fallback,
        }
    }

    fn migration(&self, copy_on_miss: bool) -> MigrationStore {
        MigrationStore::new(
            Arc::clone(&self.primary) as Arc<dyn ObjectStore>,
            Arc::clone(&self.fallback) as Arc<dyn ObjectStore>,
            bucket_mapping(),
            copy_on_miss,
        )
    }
}

async fn wait_until_exists(store: &FsStore, bucket: &str, key: &str) {
    for _ in 0..100 {
        if store.check_if_object_exists(bucket, key).await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("object {bucket}/{key} never appeared");
}

#[tokio::test]
async fn primary_hit_does_not_consult_fallback() {
    let setup = Setup::new();
    setup
        .primary
        .send_stream("bkt", "k", byte_stream(b"primary data"), None)
        .await
        .unwrap();
    let migration = setup.migration(false);

    let stream = migration.get_object_stream("bkt", "k", None).await.unwrap();
    assert_eq!(read_all(stream).await, b"primary data");
    assert_eq!(setup.fallback.get_streams.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn miss_falls_back_with_mapped_bucket() {
    let setup = Setup::new();
    // the object lives under the *fallback* bucket name
    setup
        .fallback
        .send_stream("fb", "k", byte_stream(b"old data"), None)
        .await
        .unwrap();
    let migration = setup.migration(false);

    let stream = migration.get_object_stream("bkt", "k", None).await.unwrap();
    assert_eq!(read_all(stream).await, b"old data");

    // copy_on_miss is off: nothing was replicated
    assert_eq!(setup.primary.send_streams.load(Ordering::SeqCst), 0);
    assert!(!setup
        .primary
        .check_if_object_exists("bkt", "k")
        .await
        .unwrap());
}

#[tokio::test]
async fn copy_on_miss_replicates_to_primary() {
    let setup = Setup::new();
    setup
        .fallback
        .send_stream("fb", "k", byte_stream(b"replicate me"), None)
        .await
        .unwrap();
    let migration = setup.migration(true);

    let stream = migration.get_object_stream("bkt", "k", None).await.unwrap();
    // the caller sees the bytes regardless of the background copy
    assert_eq!(read_all(stream).await, b"replicate me");

    wait_until_exists(&setup.primary.inner, "bkt", "k").await;
    let replicated = setup
        .primary
        .get_object_stream("bkt", "k", None)
        .await
        .unwrap();
    assert_eq!(read_all(replicated).await, b"replicate me");
    assert_eq!(
        setup.primary.inner.get_object_md5_hash("bkt", "k").await.unwrap(),
        setup.fallback.inner.get_object_md5_hash("fb", "k").await.unwrap()
    );
    // the fallback stream was only opened once and teed
    assert_eq!(setup.fallback.get_streams.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ranged_miss_is_served_but_not_replicated() {
    let setup = Setup::new();
    setup
        .fallback
        .send_stream("fb", "k", byte_stream(b"hello world"), None)
        .await
        .unwrap();
    let migration = setup.migration(true);

    let stream = migration
        .get_object_stream("bkt", "k", Some(ByteRange::new(0, 4)))
        .await
        .unwrap();
    assert_eq!(read_all(stream).await, b"hello");

    // partial bodies must never be copied across
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(setup.primary.send_streams.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn both_sides_missing_is_not_found() {
    let setup = Setup::new();
    let migration = setup.migration(true);
    let err = migration
        .get_object_stream("bkt", "k", None)
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn unexpected_primary_error_short_circuits() {
    let setup = Setup::new();
    setup
        .fallback
        .send_stream("fb", "k", byte_stream(b"present"), None)
        .await
        .unwrap();
    // turn the primary's bucket into a plain file so reads fail with
    // something other than not-found
    tokio::fs::write(setup._dir.path().join("primary").join("bkt"), b"junk")
        .await
        .unwrap();
    let migration = setup.migration(false);

    let err = migration
        .get_object_stream("bkt", "k", None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ObjectStoreError::Read { .. }));
    // the fallback was never consulted
    assert_eq!(setup.fallback.get_streams.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn writes_go_to_primary_only() {
    let setup = Setup::new();
    let migration = setup.migration(false);

    migration
        .send_stream("bkt", "k", byte_stream(b"new data"), None)
        .await
        .unwrap();

    assert!(setup
        .primary
        .check_if_object_exists("bkt", "k")
        .await
        .unwrap());
    assert_eq!(setup.fallback.send_streams.load(Ordering::SeqCst), 0);
    assert!(!setup
        .fallback
        .check_if_object_exists("fb", "k")
        .await
        .unwrap());
}

#[tokio::test]
async fn delete_fans_out_to_both_sides() {
    let setup = Setup::new();
    setup
        .primary
        .send_stream("bkt", "k", byte_stream(b"new"), None)
        .await
        .unwrap();
    setup
        .fallback
        .send_stream("fb", "k", byte_stream(b"old"), None)
        .await
        .unwrap();
    let migration = setup.migration(false);

    migration.delete_object("bkt", "k").await.unwrap();

    assert!(!setup
        .primary
        .check_if_object_exists("bkt", "k")
        .await
        .unwrap());
    assert!(!setup
        .fallback
        .check_if_object_exists("fb", "k")
        .await
        .unwrap());
    assert_eq!(setup.primary.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(setup.fallback.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_fallback_delete_still_deletes_primary() {
    let setup = Setup::new();
    setup
        .primary
        .send_stream("bkt", "k", byte_stream(b"new"), None)
        .await
        .unwrap();
    // break the fallback's bucket so its delete fails
    tokio::fs::write(setup._dir.path().join("fallback").join("fb"), b"junk")
        .await
        .unwrap();
    let migration = setup.migration(false);

    let err = migration.delete_object("bkt", "k").await.unwrap_err();
    assert!(matches!(err, ObjectStoreError::Write { .. }));
    // the primary delete was still attempted and succeeded
    assert_eq!(setup.primary.deletes.load(Ordering::SeqCst), 1);
    assert!(!setup
        .primary
        .check_if_object_exists("bkt", "k")
        .await
        .unwrap());
}

#[tokio::test]
async fn delete_directory_fans_out() {
    let setup = Setup::new();
    setup
        .primary
        .send_stream("bkt", "a/1", byte_stream(b"new"), None)
        .await
        .unwrap();
    setup
        .fallback
        .send_stream("fb", "a/2", byte_stream(b"old"), None)
        .await
        .unwrap();
    let migration = setup.migration(false);

    migration.delete_directory("bkt", "a/").await.unwrap();

    assert!(!setup
        .primary
        .check_if_object_exists("bkt", "a/1")
        .await
        .unwrap());
    assert!(!setup
        .fallback
        .check_if_object_exists("fb", "a/2")
        .await
        .unwrap());
}

#[tokio::test]
async fn copy_falls_back_to_streaming_copy() {
    let setup = Setup::new();
    setup
        .fallback
        .send_stream("fb", "src", byte_stream(b"copy across"), None)
        .await
        .unwrap();
    let migration = setup.migration(false);

    migration.copy_object("bkt", "src", "dest").await.unwrap();

    let copied = setup
        .primary
        .get_object_stream("bkt", "dest", None)
        .await
        .unwrap();
    assert_eq!(read_all(copied).await, b"copy across");
}

#[tokio::test]
async fn copy_with_both_sides_missing_is_not_found() {
    let setup = Setup::new();
    let migration = setup.migration(false);
    let err = migration
        .copy_object("bkt", "src", "dest")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn exists_consults_fallback() {
    let setup = Setup::new();
    setup
        .fallback
        .send_stream("fb", "k", byte_stream(b"old"), None)
        .await
        .unwrap();
    let migration = setup.migration(false);

    assert!(migration.check_if_object_exists("bkt", "k").await.unwrap());
    assert!(!migration
        .check_if_object_exists("bkt", "missing")
        .await
        .unwrap());
}

#[tokio::test]
async fn size_and_digest_fall_back() {
    let setup = Setup::new();
    setup
        .fallback
        .send_stream("fb", "k", byte_stream(b"hello world"), None)
        .await
        .unwrap();
    let migration = setup.migration(false);

    assert_eq!(migration.get_object_size("bkt", "k").await.unwrap(), 11);
    assert_eq!(
        migration.get_object_md5_hash("bkt", "k").await.unwrap(),
        format!("{:x}", md5::compute(b"hello world"))
    );
}
