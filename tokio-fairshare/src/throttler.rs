//! Read-side throttling for Tokio I/O.
//!
//! [`ThrottledReader`] limits how many bytes per second are yielded from an [`AsyncBufRead`]
//! source. The limit comes from a [`Rate`] knob: either a fixed `u64` or a shared
//! [`DynamicRate`] that can be retuned while reads are in flight.
//!
//! Rates are expressed in **bytes per second**. A rate of `0` **stalls** the reader until a
//! positive rate is set; it never means "unlimited".
//!
//! ## Static configuration
//! ```no_run
//! use tokio::io::{self, AsyncReadExt, BufReader};
//! use tokio::fs::File;
//! use tokio_fairshare::throttler::ThrottledReader;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let file = File::open("large.bin").await?;
//! let mut reader = ThrottledReader::new(BufReader::new(file), 64 * 1024u64); // 64 KiB/s
//!
//! let mut out = Vec::new();
//! reader.read_to_end(&mut out).await?;
//! # Ok(()) }
//! ```
//!
//! ## Dynamic configuration
//! ```no_run
//! use std::sync::Arc;
//! use tokio::io::{self, AsyncReadExt, BufReader};
//! use tokio::net::TcpStream;
//! use tokio_fairshare::throttler::{DynamicRate, ThrottledReader};
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let rate: Arc<DynamicRate> = DynamicRate::new(1024);
//! let stream = TcpStream::connect("127.0.0.1:12345").await?;
//! let mut reader = ThrottledReader::new(BufReader::new(stream), rate.clone());
//!
//! let mut buf = [0u8; 16];
//! reader.read_exact(&mut buf).await?;
//! rate.set(16); // later reads are paced at 16 B/s
//! reader.read_exact(&mut buf).await?;
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - A leaky-bucket token counter backed by [`tokio::time::Instant`] and `Sleep`. After idle
//!   periods the bucket holds at most one second of tokens.
//! - Stored tokens are clamped to the current rate on every refill, so lowering the rate takes
//!   effect on the next read rather than after the old burst drains.
//! - The inner type must be [`AsyncBufRead`] so only part of the buffered data is consumed when
//!   the budget is tight; pair it with `tokio::io::BufReader` if necessary.
use std::{
    fmt, io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, ready},
    time::Duration,
};

use futures::FutureExt;
use pin_project::pin_project;
use tokio::{
    io::{AsyncBufRead, AsyncRead, ReadBuf},
    time::{Instant, Sleep, sleep},
};

use crate::io::Close;

/// Upper bound on how long a starved reader sleeps before re-checking its rate.
const MAX_WAIT: Duration = Duration::from_millis(100);

/// A pluggable **bytes-per-second** rate knob.
///
/// A rate of `0` pauses the throttled stream until the rate becomes positive.
pub trait Rate: Unpin {
    /// Return the current rate in **bytes per second**.
    fn rate(&self) -> u64;
}

impl Rate for u64 {
    fn rate(&self) -> u64 {
        *self
    }
}

/// A lock-free, shareable rate knob (`bytes/sec`) you can update at runtime.
///
/// Internally an `AtomicU64`; every throttler holding the same `Arc` observes updates on its
/// next poll.
#[derive(Debug, Default)]
pub struct DynamicRate {
    rate: AtomicU64,
}

impl DynamicRate {
    /// Create a new handle with the given rate in **bytes per second**.
    pub fn new(rate: u64) -> Arc<Self> {
        Arc::new(Self {
            rate: AtomicU64::new(rate),
        })
    }

    /// Update the rate in **bytes per second**. `0` stalls readers.
    pub fn set(&self, rate: u64) {
        self.rate.store(rate, Ordering::Release);
    }
}

impl Rate for DynamicRate {
    fn rate(&self) -> u64 {
        self.rate.load(Ordering::Acquire)
    }
}

impl Rate for Arc<DynamicRate> {
    fn rate(&self) -> u64 {
        self.rate.load(Ordering::Acquire)
    }
}

struct LeakyBucket<R> {
    rate: R,
    tokens: u64,
    last_update: Instant,
    // Created on first wait so buckets can be built outside a runtime.
    sleep: Option<Pin<Box<Sleep>>>,
    sleeping: bool,
}

impl<R: Rate> LeakyBucket<R> {
    fn new(rate: R) -> Self {
        let tokens = rate.rate();
        Self {
            rate,
            tokens,
            last_update: Instant::now(),
            sleep: None,
            sleeping: false,
        }
    }

    fn refill(&mut self, rate: u64) {
        // allow 1s burst at the current rate
        self.tokens = self.tokens.min(rate);

        let now = Instant::now();
        let since = now.duration_since(self.last_update).as_nanos();
        let added = since * rate as u128 / 1_000_000_000;
        if added == 0 {
            // Keep accumulating across very short polls
            return;
        }

        self.last_update = now;
        let tokens = (self.tokens as u128).saturating_add(added).min(rate as u128);
        self.tokens = tokens as u64;
    }

    fn poll_acquire(&mut self, cx: &mut Context<'_>, want: usize) -> Poll<usize> {
        if self.sleeping {
            if let Some(timer) = self.sleep.as_mut() {
                ready!(timer.poll_unpin(cx));
            }
            self.sleeping = false;
        }

        if want == 0 {
            return Poll::Ready(0);
        }

        loop {
            let rate = self.rate.rate();
            if rate > 0 {
                self.refill(rate);
                let grant = (want as u64).min(self.tokens);
                if grant > 0 {
                    return Poll::Ready(grant as usize);
                }
            } else {
                // Stalled: nothing accrues while the rate is zero.
                self.last_update = Instant::now();
            }

            // Sleep long enough to accrue ~1 KiB, capped at MAX_WAIT.
            let wait = match rate {
                0 => MAX_WAIT,
                rate => Duration::from_millis((1024 * 1000 / rate).max(1)).min(MAX_WAIT),
            };
            let deadline = Instant::now() + wait;
            let timer = self.sleep.get_or_insert_with(|| Box::pin(sleep(wait)));
            timer.as_mut().reset(deadline);
            self.sleeping = true;

            ready!(timer.poll_unpin(cx));
            self.sleeping = false;
        }
    }

    fn consume(&mut self, used: usize) {
        self.tokens = self.tokens.saturating_sub(used as u64);
    }
}

/// A read-side throttler for buffered sources.
///
/// Wraps any `T: AsyncBufRead` and limits how many bytes are yielded to callers per unit of
/// time by copying only the granted prefix of the inner buffer into the caller's `ReadBuf`.
///
/// ```no_run
/// use tokio::io::{self, duplex, BufReader};
/// use tokio_fairshare::throttler::ThrottledReader;
///
/// # #[tokio::main]
/// # async fn main() -> io::Result<()> {
/// let (_w, r) = duplex(128);
/// let _tr = ThrottledReader::new(BufReader::new(r), 32u64); // 32 B/s
/// # Ok(()) }
/// ```
#[pin_project]
pub struct ThrottledReader<T, R> {
    #[pin]
    inner: T,
    lb: LeakyBucket<R>,
}

impl<T, R: Rate> ThrottledReader<T, R> {
    /// Wrap `inner` and enforce the given rate.
    ///
    /// You may pass a fixed `u64` or a dynamic handle like `Arc<DynamicRate>`.
    pub fn new(inner: T, rate: R) -> Self {
        Self {
            inner,
            lb: LeakyBucket::new(rate),
        }
    }
}

impl<T: Close, R> Close for ThrottledReader<T, R> {
    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

impl<T: AsyncBufRead, R: Rate> AsyncRead for ThrottledReader<T, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        // 1. wait for buffered data (or EOF / error)
        let rem = ready!(this.inner.as_mut().poll_fill_buf(cx))?;
        let want = rem.len().min(buf.remaining());
        if want == 0 {
            return Poll::Ready(Ok(()));
        }

        // 2. ask for capacity
        let grant = ready!(this.lb.poll_acquire(cx, want));

        // 3. the inner buffer stays filled while we slept, so re-borrow it
        let rem = ready!(this.inner.as_mut().poll_fill_buf(cx))?;
        let grant = grant.min(rem.len());
        buf.put_slice(&rem[..grant]);
        this.inner.consume(grant);
        this.lb.consume(grant);

        Poll::Ready(Ok(()))
    }
}

impl<T: fmt::Debug, R> fmt::Debug for ThrottledReader<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledReader")
            .field("inner", &self.inner)
            .field("tokens", &self.lb.tokens)
            .finish()
    }
}
