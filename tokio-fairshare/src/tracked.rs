//! Per-transfer reader that reports progress to its [`Controller`](crate::Controller).
//!
//! A [`TrackedReader`] sits on top of a throttled source. Every read adds the bytes handed to the
//! caller to a lock-free counter that the controller samples when it recomputes limits, and the
//! controller pushes new limits back through the same shared [`Progress`] handle.
//!
//! Closing (or dropping) the reader deregisters the transfer exactly once.
use std::{
    fmt, io,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use pin_project::{pin_project, pinned_drop};
use tokio::io::{AsyncRead, BufReader, ReadBuf};

use crate::{
    io::Close,
    registry::TransferId,
    throttler::{DynamicRate, Rate, ThrottledReader},
};

/// Receives the close notification of a tracked reader.
pub trait TransferOwner: Send + Sync {
    /// Deregister `id`. Unknown ids must be ignored.
    fn release(&self, id: &TransferId);
}

/// Progress counter and limit knob shared between a reader and its registry record.
#[derive(Debug)]
pub(crate) struct Progress {
    bytes_read: AtomicU64,
    limit: Arc<DynamicRate>,
}

impl Progress {
    pub(crate) fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            bytes_read: AtomicU64::new(0),
            limit: DynamicRate::new(limit),
        })
    }

    #[inline]
    pub(crate) fn record(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub(crate) fn limit(&self) -> u64 {
        self.limit.rate()
    }

    pub(crate) fn set_limit(&self, limit: u64) {
        self.limit.set(limit);
    }
}

/// A throttled reader registered as one transfer on a controller.
///
/// Obtained from [`Controller::acquire_reader`](crate::Controller::acquire_reader). Reads are
/// paced by the limit the controller last assigned; errors and EOF from the source pass through
/// untouched.
#[pin_project(PinnedDrop)]
pub struct TrackedReader<T> {
    #[pin]
    inner: ThrottledReader<BufReader<T>, Arc<DynamicRate>>,
    id: TransferId,
    progress: Arc<Progress>,
    owner: Weak<dyn TransferOwner>,
    released: bool,
}

impl<T: AsyncRead> TrackedReader<T> {
    pub(crate) fn new(
        id: TransferId,
        source: T,
        progress: Arc<Progress>,
        owner: Weak<dyn TransferOwner>,
    ) -> Self {
        Self::from_buf_reader(id, BufReader::new(source), progress, owner)
    }

    /// Like [`new`](Self::new) with an explicit read buffer capacity.
    pub(crate) fn with_capacity(
        id: TransferId,
        capacity: usize,
        source: T,
        progress: Arc<Progress>,
        owner: Weak<dyn TransferOwner>,
    ) -> Self {
        Self::from_buf_reader(id, BufReader::with_capacity(capacity, source), progress, owner)
    }

    fn from_buf_reader(
        id: TransferId,
        source: BufReader<T>,
        progress: Arc<Progress>,
        owner: Weak<dyn TransferOwner>,
    ) -> Self {
        Self {
            inner: ThrottledReader::new(source, progress.limit.clone()),
            id,
            progress,
            owner,
            released: false,
        }
    }
}

impl<T> TrackedReader<T> {
    pub fn id(&self) -> &TransferId {
        &self.id
    }

    /// Bytes handed to the caller so far. Safe to call while reads are in flight.
    pub fn bytes_read(&self) -> u64 {
        self.progress.bytes_read()
    }

    /// The ceiling currently enforced on this transfer, in bytes per second.
    pub fn limit(&self) -> u64 {
        self.progress.limit()
    }

    /// Replace the enforced ceiling; takes effect on the next read.
    ///
    /// The controller overwrites this on the next registry change.
    pub fn update_limit(&self, limit: u64) {
        self.progress.set_limit(limit);
    }
}

fn release_once(released: &mut bool, owner: &Weak<dyn TransferOwner>, id: &TransferId) {
    if std::mem::replace(released, true) {
        return;
    }
    if let Some(owner) = owner.upgrade() {
        owner.release(id);
    }
}

impl<T: AsyncRead + Close> TrackedReader<T> {
    /// Close the source and deregister the transfer.
    ///
    /// The transfer is released even when the source fails to close; the source's error is
    /// returned as is.
    ///
    /// Consumes the reader, so it is only reachable while the reader is unpinned or `T: Unpin`.
    /// A reader over a `!Unpin` source that has been pinned (e.g. with `tokio::pin!`) can only be
    /// released by dropping it, which skips the source's [`Close`].
    pub fn close(mut self) -> io::Result<()> {
        let res = self.inner.close();
        release_once(&mut self.released, &self.owner, &self.id);
        res
    }
}

#[pinned_drop]
impl<T> PinnedDrop for TrackedReader<T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        release_once(this.released, this.owner, this.id);
    }
}

impl<T: AsyncRead> AsyncRead for TrackedReader<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        let res = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len().saturating_sub(before) as u64;
            if n > 0 {
                this.progress.record(n);
            }
        }
        res
    }
}

impl<T: fmt::Debug> fmt::Debug for TrackedReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedReader")
            .field("id", &self.id)
            .field("bytes_read", &self.bytes_read())
            .field("limit", &self.limit())
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[derive(Default)]
    struct RecordingOwner {
        released: Mutex<Vec<TransferId>>,
    }

    impl TransferOwner for RecordingOwner {
        fn release(&self, id: &TransferId) {
            self.released.lock().push(id.clone());
        }
    }

    struct BrokenClose<'a>(&'a [u8]);

    impl AsyncRead for BrokenClose<'_> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl Close for BrokenClose<'_> {
        fn close(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"))
        }
    }

    #[pin_project]
    struct NotUnpin {
        data: &'static [u8],
        #[pin]
        _pin: std::marker::PhantomPinned,
    }

    impl AsyncRead for NotUnpin {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(self.project().data).poll_read(cx, buf)
        }
    }

    fn tracked<T: AsyncRead>(
        source: T,
        limit: u64,
        owner: &Arc<RecordingOwner>,
    ) -> TrackedReader<T> {
        let owner: Weak<dyn TransferOwner> = Arc::downgrade(owner) as Weak<dyn TransferOwner>;
        TrackedReader::new(TransferId::from("t-1"), source, Progress::new(limit), owner)
    }

    #[tokio::test(start_paused = true)]
    async fn counts_bytes_across_chunk_sizes() {
        let owner = Arc::new(RecordingOwner::default());
        let (mut w, r) = duplex(64);
        let mut reader = tracked(r, 1_000_000, &owner);

        let chunks: [&[u8]; 4] = [b"a", b"bcd", b"efghijk", b"lmnopqrstuvwxyz"];
        tokio::spawn(async move {
            for chunk in chunks {
                let _ = w.write_all(chunk).await;
            }
        });

        let mut total = 0;
        for size in [1usize, 2, 5, 100] {
            let mut buf = vec![0u8; size];
            total += reader.read(&mut buf).await.unwrap();
            assert_eq!(reader.bytes_read(), total as u64);
        }
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(reader.bytes_read(), 26);
    }

    #[tokio::test(start_paused = true)]
    async fn eof_does_not_count() {
        let owner = Arc::new(RecordingOwner::default());
        let src: &[u8] = b"";
        let mut reader = tracked(src, 10, &owner);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.bytes_read(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_pass_through_unmodified() {
        struct Failing;
        impl AsyncRead for Failing {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "stalled")))
            }
        }

        let owner = Arc::new(RecordingOwner::default());
        let mut reader = tracked(Failing, 10, &owner);
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(err.to_string(), "stalled");
        assert_eq!(reader.bytes_read(), 0);
    }

    #[test]
    fn update_limit_is_visible_to_throttler() {
        let owner = Arc::new(RecordingOwner::default());
        let src: &[u8] = b"abc";
        let reader = tracked(src, 10, &owner);
        reader.update_limit(42);
        assert_eq!(reader.limit(), 42);
    }

    #[test]
    fn close_notifies_owner_once() {
        let owner = Arc::new(RecordingOwner::default());
        let src: &[u8] = b"abc";
        let reader = tracked(src, 10, &owner);

        reader.close().unwrap();

        assert_eq!(*owner.released.lock(), vec![TransferId::from("t-1")]);
    }

    #[test]
    fn drop_without_close_notifies_owner() {
        let owner = Arc::new(RecordingOwner::default());
        let src: &[u8] = b"abc";
        drop(tracked(src, 10, &owner));
        assert_eq!(owner.released.lock().len(), 1);
    }

    #[test]
    fn close_error_is_returned_and_owner_still_notified() {
        let owner = Arc::new(RecordingOwner::default());
        let reader = tracked(BrokenClose(b"abc"), 10, &owner);

        let err = reader.close().unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(owner.released.lock().len(), 1);
    }

    #[test]
    fn dropped_owner_is_ignored() {
        let owner = Arc::new(RecordingOwner::default());
        let src: &[u8] = b"abc";
        let reader = tracked(src, 10, &owner);
        drop(owner);
        reader.close().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_reader_is_released_by_drop() {
        let owner = Arc::new(RecordingOwner::default());
        {
            let source = NotUnpin {
                data: b"pinned",
                _pin: std::marker::PhantomPinned,
            };
            let reader = tracked(source, 1000, &owner);
            tokio::pin!(reader);

            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"pinned");
            assert_eq!(reader.bytes_read(), 6);
            assert!(owner.released.lock().is_empty());
        }

        assert_eq!(*owner.released.lock(), vec![TransferId::from("t-1")]);
    }
}
