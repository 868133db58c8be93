//! I/O extension traits and helpers.
//!
//! - [`Close`] lets a source report an error when a tracked transfer is closed explicitly.
//! - [`FairShareReadExt`] registers any `AsyncRead` with a controller via an extension method.
//!
//! ```no_run
//! use tokio::fs::File;
//! use tokio::io::{self, AsyncReadExt};
//! use tokio_fairshare::{Controller, io::FairShareReadExt};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = Controller::new(1024 * 1024)?;
//! let file = File::open("archive.tar").await?;
//! let size = file.metadata().await?.len();
//!
//! let mut reader = file.share_via(&controller, size)?;
//! let mut out = Vec::new();
//! reader.read_to_end(&mut out).await?;
//! reader.close()?;
//! # Ok(()) }
//! ```
use std::io;

use tokio::{
    fs::File,
    io::{AsyncRead, BufReader, DuplexStream, Empty, SimplexStream},
};

use crate::{Error, controller::Controller, tracked::TrackedReader};

/// Explicit close for byte sources.
///
/// Dropping a Tokio source already releases its OS resources; this trait exists for sources
/// that can fail on close (remote object handles, checksumming wrappers, ...), so that
/// [`TrackedReader::close`] can hand the failure back to the caller unmodified.
///
/// Types with nothing to report implement this as a **no-op** returning `Ok(())`. Buffered
/// wrappers forward to the inner source.
pub trait Close {
    fn close(&mut self) -> io::Result<()>;
}

impl Close for File {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for tokio::net::TcpStream {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for tokio::net::tcp::OwnedReadHalf {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl Close for tokio::net::UnixStream {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for DuplexStream {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for SimplexStream {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for Empty {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Close for &[u8] {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T> Close for io::Cursor<T> {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<R: AsyncRead + Close> Close for BufReader<R> {
    fn close(&mut self) -> io::Result<()> {
        self.get_mut().close()
    }
}

impl<T: Close + ?Sized> Close for Box<T> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Read-side ergonomics for fair-share adapters.
///
/// Implemented for all `AsyncRead`.
pub trait FairShareReadExt: AsyncRead {
    /// Register this reader as a transfer of `declared_size` bytes on `controller`.
    ///
    /// Shorthand for [`Controller::acquire_reader`].
    fn share_via(
        self,
        controller: &Controller,
        declared_size: u64,
    ) -> Result<TrackedReader<Self>, Error>
    where
        Self: Sized,
    {
        controller.acquire_reader(self, declared_size)
    }
}

impl<T: AsyncRead> FairShareReadExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::io::{BufReader, ReadBuf};

    struct FailingClose;

    impl AsyncRead for FailingClose {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl Close for FailingClose {
        fn close(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "remote hung up"))
        }
    }

    #[test]
    fn buf_reader_forwards_close() {
        let mut r = BufReader::new(Box::new(FailingClose));
        let err = r.close().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test(start_paused = true)]
    async fn ext_share_via_registers_transfer() {
        let controller = Controller::new(100).unwrap();
        let src: &[u8] = b"abc";
        let reader = src.share_via(&controller, 3).unwrap();
        assert_eq!(controller.len(), 1);
        assert_eq!(reader.limit(), 100);
        reader.close().unwrap();
        assert!(controller.is_empty());
    }
}
