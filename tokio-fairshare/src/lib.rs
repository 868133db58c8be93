//! Fair bandwidth sharing for concurrent Tokio readers.
//!
//! A [`Controller`] owns one throughput budget (bytes/second). Each transfer registered with it
//! gets a [`TrackedReader`] whose read rate is capped by a limit the controller recomputes
//! whenever a transfer starts or finishes. Limits are proportional to `1 / remaining bytes`, so
//! transfers near completion get the biggest share and free up the budget sooner.
//!
//! ```no_run
//! use tokio::io::{self, AsyncReadExt};
//! use tokio_fairshare::Controller;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = Controller::new(1000)?;
//!
//! let small: &[u8] = &[0u8; 100];
//! let large: &[u8] = &[0u8; 400];
//! let mut a = controller.acquire_reader(small, 100)?;
//! let b = controller.acquire_reader(large, 400)?;
//! assert_eq!((a.limit(), b.limit()), (800, 200));
//!
//! let mut out = Vec::new();
//! a.read_to_end(&mut out).await?;
//! a.close()?; // `b` now gets the whole budget
//! assert_eq!(b.limit(), 1000);
//! # Ok(()) }
//! ```
//!
//! Modules:
//! - [`controller`]: the budget owner and its registry.
//! - [`tracked`]: the per-transfer reader.
//! - [`throttler`]: the leaky-bucket rate limiter readers are paced by.
//! - [`io`]: the [`io::Close`] trait and extension methods.
pub mod controller;
mod error;
pub mod io;
mod registry;
pub mod throttler;
pub mod tracked;

pub use controller::Controller;
pub use error::Error;
pub use registry::{TransferId, TransferStatus};
pub use tracked::{TrackedReader, TransferOwner};
