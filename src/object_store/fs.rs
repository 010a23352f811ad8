use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio_util::io::ReaderStream;

use super::{hash, observe, ByteRange, ObjectStore, ObjectStoreError, ObjectStream};

/// Local filesystem object store.
///
/// Each bucket is a directory under the base path. Keys are flattened into
/// single filenames (`/` becomes `_`) so a key like `proj/file` never creates
/// nested directories; prefix operations scan the bucket directory for the
/// flattened prefix.
pub struct FsStore {
    base_path: PathBuf,
}

fn flatten_key(key: &str) -> String {
    key.replace('/', "_")
}

impl FsStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(bucket).join(flatten_key(key))
    }

    fn map_read_err(err: io::Error, bucket: &str, key: &str) -> ObjectStoreError {
        if err.kind() == io::ErrorKind::NotFound {
            ObjectStoreError::not_found_from(bucket, key, err)
        } else {
            ObjectStoreError::read("failed to read object from disk", bucket, key, err)
        }
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn send_stream(
        &self,
        bucket: &str,
        key: &str,
        stream: ObjectStream,
        source_md5: Option<String>,
    ) -> Result<(), ObjectStoreError> {
        let dir = self.bucket_dir(bucket);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| ObjectStoreError::write("failed to create bucket directory", bucket, key, err))?;

        let (mut stream, observer) = observe(stream, "fs.egress", source_md5.is_some());

        // Write to a temp file first so a failed upload never leaves a
        // partial object under the real name.
        let tmp_path = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|err| ObjectStoreError::write("failed to create temp file", bucket, key, err))?;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ObjectStoreError::write(
                        "failed to read upload stream",
                        bucket,
                        key,
                        err,
                    ));
                }
            };
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ObjectStoreError::write(
                    "failed to write object to disk",
                    bucket,
                    key,
                    err,
                ));
            }
        }
        let flushed = match file.flush().await {
            Ok(()) => file.sync_all().await,
            Err(err) => Err(err),
        };
        if let Err(err) = flushed {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::write(
                "failed to flush object to disk",
                bucket,
                key,
                err,
            ));
        }
        drop(file);

        let final_path = self.object_path(bucket, key);
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::write(
                "failed to move object into place",
                bucket,
                key,
                err,
            ));
        }

        if let Some(expected) = source_md5 {
            let computed = observer
                .hex_digest()
                .expect("digest requested for verified upload");
            hash::verify_md5(self, bucket, key, &expected, &computed).await?;
        }
        Ok(())
    }

    async fn get_object_stream(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectStream, ObjectStoreError> {
        let path = self.object_path(bucket, key);
        let mut file = File::open(&path)
            .await
            .map_err(|err| Self::map_read_err(err, bucket, key))?;

        let stream: ObjectStream = match range {
            Some(range) => {
                file.seek(SeekFrom::Start(range.start))
                    .await
                    .map_err(|err| Self::map_read_err(err, bucket, key))?;
                Box::pin(ReaderStream::new(file.take(range.len())))
            }
            None => Box::pin(ReaderStream::new(file)),
        };
        let (stream, _observer) = observe(stream, "fs.ingress", false);
        Ok(stream)
    }

    async fn get_object_size(&self, bucket: &str, key: &str) -> Result<u64, ObjectStoreError> {
        let path = self.object_path(bucket, key);
        let meta = fs::metadata(&path)
            .await
            .map_err(|err| Self::map_read_err(err, bucket, key))?;
        Ok(meta.len())
    }

    async fn get_object_md5_hash(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, ObjectStoreError> {
        let stream = self.get_object_stream(bucket, key, None).await?;
        hash::stream_md5(stream)
            .await
            .map_err(|err| ObjectStoreError::read("failed to hash object", bucket, key, err))
    }

    async fn copy_object(
        &self,
        bucket: &str,
        src_key: &str,
        dest_key: &str,
    ) -> Result<(), ObjectStoreError> {
        let src = self.object_path(bucket, src_key);
        let dest = self.object_path(bucket, dest_key);
        fs::copy(&src, &dest).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ObjectStoreError::not_found_from(bucket, src_key, err)
            } else {
                ObjectStoreError::write("failed to copy object on disk", bucket, dest_key, err)
            }
        })?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.object_path(bucket, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // already gone -- deletes are idempotent
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ObjectStoreError::write(
                "failed to delete object from disk",
                bucket,
                key,
                err,
            )),
        }
    }

    async fn delete_directory(&self, bucket: &str, prefix: &str) -> Result<(), ObjectStoreError> {
        let flattened = flatten_key(prefix);
        let dir = self.bucket_dir(bucket);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(ObjectStoreError::write(
                    "failed to list bucket directory",
                    bucket,
                    prefix,
                    err,
                ))
            }
        };
        while let Some(entry) = entries.next_entry().await.map_err(|err| {
            ObjectStoreError::write("failed to list bucket directory", bucket, prefix, err)
        })? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&flattened) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(ObjectStoreError::write(
                        "failed to delete object from disk",
                        bucket,
                        prefix,
                        err,
                    ))
                }
            }
        }
        Ok(())
    }

    async fn directory_size(&self, bucket: &str, prefix: &str) -> Result<u64, ObjectStoreError> {
        let flattened = flatten_key(prefix);
        let dir = self.bucket_dir(bucket);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(ObjectStoreError::read(
                    "failed to list bucket directory",
                    bucket,
                    prefix,
                    err,
                ))
            }
        };
        let mut total = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|err| {
            ObjectStoreError::read("failed to list bucket directory", bucket, prefix, err)
        })? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&flattened) {
                continue;
            }
            let meta = entry.metadata().await.map_err(|err| {
                ObjectStoreError::read("failed to stat object", bucket, prefix, err)
            })?;
            total += meta.len();
        }
        Ok(total)
    }
}
