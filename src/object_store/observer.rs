//! Pass-through stream instrumentation.
//!
//! [`observe`] wraps a content stream so that bytes flowing through it are
//! counted and, optionally, fed into a running MD5 context, without altering
//! the data or swallowing errors. [`tee`] duplicates one source stream into
//! two independent consumers for the migration copy-on-miss path.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::ObjectStream;

/// Handle onto a metered stream, usable after the stream has been consumed.
#[derive(Clone)]
pub struct StreamObserver {
    bytes: Arc<AtomicU64>,
    hasher: Option<Arc<Mutex<md5::Context>>>,
}

impl StreamObserver {
    /// Bytes seen so far (total once the stream has ended).
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Lowercase hex MD5 of the bytes seen so far, if hashing was requested.
    pub fn hex_digest(&self) -> Option<String> {
        let hasher = self.hasher.as_ref()?;
        let context = hasher.lock().expect("md5 context lock poisoned").clone();
        Some(format!("{:x}", context.compute()))
    }
}

struct MeteredStream {
    inner: ObjectStream,
    bytes: Arc<AtomicU64>,
    hasher: Option<Arc<Mutex<md5::Context>>>,
    label: &'static str,
    finished: bool,
}

impl Stream for MeteredStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                if let Some(hasher) = &this.hasher {
                    hasher
                        .lock()
                        .expect("md5 context lock poisoned")
                        .consume(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                if !this.finished {
                    this.finished = true;
                    debug!(
                        metric = this.label,
                        bytes = this.bytes.load(Ordering::Relaxed),
                        error = %err,
                        "stream failed"
                    );
                }
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    debug!(
                        metric = this.label,
                        bytes = this.bytes.load(Ordering::Relaxed),
                        "stream complete"
                    );
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wrap `stream` in a metering stage labelled `label` (e.g. `"s3.ingress"`).
/// When `with_md5` is set, an MD5 digest accumulates as bytes pass through,
/// available from the returned [`StreamObserver`] once the stream ends.
pub fn observe(
    stream: ObjectStream,
    label: &'static str,
    with_md5: bool,
) -> (ObjectStream, StreamObserver) {
    let bytes = Arc::new(AtomicU64::new(0));
    let hasher = with_md5.then(|| Arc::new(Mutex::new(md5::Context::new())));
    let observer = StreamObserver {
        bytes: Arc::clone(&bytes),
        hasher: hasher.clone(),
    };
    let metered = MeteredStream {
        inner: stream,
        bytes,
        hasher,
        label,
        finished: false,
    };
    (Box::pin(metered), observer)
}

// Foreground consumers read at their own pace; this bound is what throttles
// the source when the caller is slow.
const TEE_CHANNEL_CAPACITY: usize = 16;

/// Duplicate `source` into two streams consuming the same bytes.
///
/// The first stream is back-pressured: the source is only read as fast as
/// that consumer drains it. The second stream buffers without limit so that
/// a slow or stalled secondary consumer can never hold up the first one.
/// Dropping either receiver simply ends its branch; the pump keeps feeding
/// the survivor until the source is exhausted, so an abandoned foreground
/// read still lets a background replication run to completion.
pub fn tee(mut source: ObjectStream) -> (ObjectStream, ObjectStream) {
    let (primary_tx, mut primary_rx) = mpsc::channel::<io::Result<Bytes>>(TEE_CHANNEL_CAPACITY);
    let (secondary_tx, mut secondary_rx) = mpsc::unbounded_channel::<io::Result<Bytes>>();

    tokio::spawn(async move {
        let mut primary_open = true;
        let mut secondary_open = true;
        while let Some(item) = source.next().await {
            match item {
                Ok(chunk) => {
                    if secondary_open && secondary_tx.send(Ok(chunk.clone())).is_err() {
                        secondary_open = false;
                    }
                    if primary_open && primary_tx.send(Ok(chunk)).await.is_err() {
                        primary_open = false;
                    }
                }
                Err(err) => {
                    // io::Error is not Clone; give each branch its own copy.
                    if secondary_open {
                        let _ = secondary_tx.send(Err(io::Error::new(err.kind(), err.to_string())));
                        secondary_open = false;
                    }
                    if primary_open {
                        let _ = primary_tx.send(Err(err)).await;
                        primary_open = false;
                    }
                    return;
                }
            }
            if !primary_open && !secondary_open {
                return;
            }
        }
    });

    let primary = Box::pin(futures::stream::poll_fn(move |cx| primary_rx.poll_recv(cx)));
    let secondary = Box::pin(futures::stream::poll_fn(move |cx| {
        secondary_rx.poll_recv(cx)
    }));
    (primary, secondary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn chunked(parts: Vec<&'static [u8]>) -> ObjectStream {
        Box::pin(futures::stream::iter(
            parts.into_iter().map(|p| Ok(Bytes::from_static(p))),
        ))
    }

    #[tokio::test]
    async fn observe_counts_bytes_and_hashes() {
        let (stream, observer) = observe(chunked(vec![b"hello", b" ", b"world"]), "test", true);
        let collected: Vec<Bytes> = stream.try_collect().await.unwrap();
        let joined: Vec<u8> = collected.concat();
        assert_eq!(joined, b"hello world");
        assert_eq!(observer.bytes(), 11);
        assert_eq!(
            observer.hex_digest().unwrap(),
            format!("{:x}", md5::compute(b"hello world"))
        );
    }

    #[tokio::test]
    async fn observe_without_md5_has_no_digest() {
        let (stream, observer) = observe(chunked(vec![b"data"]), "test", false);
        let _: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(observer.bytes(), 4);
        assert!(observer.hex_digest().is_none());
    }

    #[tokio::test]
    async fn tee_feeds_both_consumers() {
        let (a, b) = tee(chunked(vec![b"one", b"two", b"three"]));
        let a_bytes: Vec<Bytes> = a.try_collect().await.unwrap();
        let b_bytes: Vec<Bytes> = b.try_collect().await.unwrap();
        assert_eq!(a_bytes.concat(), b"onetwothree");
        assert_eq!(b_bytes.concat(), b"onetwothree");
    }

    #[tokio::test]
    async fn tee_survives_dropped_consumer() {
        let (a, b) = tee(chunked(vec![b"payload"]));
        drop(a);
        let b_bytes: Vec<Bytes> = b.try_collect().await.unwrap();
        assert_eq!(b_bytes.concat(), b"payload");
    }

    #[tokio::test]
    async fn tee_propagates_errors_to_both() {
        let source: ObjectStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ok")),
            Err(io::Error::other("upstream died")),
        ]));
        let (a, b) = tee(source);
        let a_result: Result<Vec<Bytes>, _> = a.try_collect().await;
        let b_result: Result<Vec<Bytes>, _> = b.try_collect().await;
        assert!(a_result.is_err());
        assert!(b_result.is_err());
    }
}
