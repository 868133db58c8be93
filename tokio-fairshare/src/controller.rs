//! Bandwidth controller shared by concurrent transfers.
//!
//! A [`Controller`] owns a fixed budget (bytes/second) and a registry of active transfers. Every
//! time a transfer is acquired or released, the controller recomputes each transfer's limit so
//! that the limits add up to at most the budget, with transfers closest to completion getting the
//! largest share.
//!
//! ```no_run
//! use tokio::io::{self, AsyncReadExt};
//! use tokio::fs::File;
//! use tokio_fairshare::Controller;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = Controller::new(512 * 1024)?; // 512 KiB/s shared
//!
//! let mut tasks = Vec::new();
//! for path in ["a.bin", "b.bin"] {
//!     let controller = controller.clone();
//!     tasks.push(tokio::spawn(async move {
//!         let file = File::open(path).await?;
//!         let size = file.metadata().await?.len();
//!         let mut reader = controller
//!             .acquire_reader(file, size)
//!             .map_err(io::Error::other)?;
//!         let mut sink = io::sink();
//!         io::copy(&mut reader, &mut sink).await?;
//!         reader.close()
//!     }));
//! }
//! for task in tasks {
//!     task.await??;
//! }
//! # Ok(()) }
//! ```
//!
//! ## Consistency
//! - Registry changes and the limit pushes they cause run under one mutex, so they are observed
//!   as a unit.
//! - Byte counters are plain atomics updated on the read path without that mutex; a recompute may
//!   see a counter that is a few bytes behind a concurrent read.
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::{
    Error,
    registry::{Registry, TransferId, TransferStatus},
    tracked::{Progress, TrackedReader, TransferOwner},
};

/// Splits a fixed bandwidth budget across registered readers.
///
/// Cheap to clone; clones share the same budget and registry. Independent controllers are fully
/// isolated from each other.
#[derive(Debug, Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    budget: u64,
    registry: Mutex<Registry>,
}

impl TransferOwner for Shared {
    fn release(&self, id: &TransferId) {
        let mut registry = self.registry.lock();
        if !registry.remove(id) {
            return;
        }
        registry.recompute(self.budget);
        let active = registry.len();
        drop(registry);

        debug!(%id, active, "transfer released");
    }
}

impl Controller {
    /// Create a controller that hands out at most `budget` bytes per second in total.
    ///
    /// Returns [`Error::ZeroBudget`] when `budget` is `0`.
    pub fn new(budget: u64) -> Result<Self, Error> {
        if budget == 0 {
            return Err(Error::ZeroBudget);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                budget,
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    /// Register `source` as a transfer of `declared_size` bytes and return its reader.
    ///
    /// The reader starts at a provisional limit equal to the whole budget, which the recompute
    /// triggered by this registration immediately replaces. Closing or dropping the reader
    /// releases the transfer.
    ///
    /// Returns [`Error::ZeroDeclaredSize`] when `declared_size` is `0`.
    pub fn acquire_reader<T: AsyncRead>(
        &self,
        source: T,
        declared_size: u64,
    ) -> Result<TrackedReader<T>, Error> {
        self.register(declared_size, |id, progress, owner| {
            TrackedReader::new(id, source, progress, owner)
        })
    }

    /// Like [`acquire_reader`](Self::acquire_reader), buffering up to `capacity` bytes of the
    /// source at a time.
    pub fn acquire_reader_with_capacity<T: AsyncRead>(
        &self,
        source: T,
        declared_size: u64,
        capacity: usize,
    ) -> Result<TrackedReader<T>, Error> {
        self.register(declared_size, |id, progress, owner| {
            TrackedReader::with_capacity(id, capacity, source, progress, owner)
        })
    }

    fn register<T>(
        &self,
        declared_size: u64,
        build: impl FnOnce(TransferId, Arc<Progress>, Weak<dyn TransferOwner>) -> TrackedReader<T>,
    ) -> Result<TrackedReader<T>, Error> {
        if declared_size == 0 {
            return Err(Error::ZeroDeclaredSize);
        }

        let id = TransferId::generate();
        let progress = Progress::new(self.shared.budget);
        let owner = Arc::downgrade(&self.shared) as Weak<dyn TransferOwner>;
        let reader = build(id.clone(), progress.clone(), owner);

        let mut registry = self.shared.registry.lock();
        registry.insert(id.clone(), declared_size, progress);
        registry.recompute(self.shared.budget);
        let active = registry.len();
        drop(registry);

        debug!(%id, declared_size, limit = reader.limit(), active, "transfer acquired");
        Ok(reader)
    }

    /// Deregister `id` and rebalance the remaining transfers.
    ///
    /// Unknown or already released ids are ignored.
    pub fn release(&self, id: &TransferId) {
        self.shared.release(id)
    }

    /// The total budget in bytes per second.
    pub fn budget(&self) -> u64 {
        self.shared.budget
    }

    /// Number of registered transfers.
    pub fn len(&self) -> usize {
        self.shared.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one transfer, if it is still registered.
    pub fn transfer(&self, id: &TransferId) -> Option<TransferStatus> {
        self.shared.registry.lock().status(id)
    }

    /// Snapshot of every registered transfer, in no particular order.
    pub fn transfers(&self) -> Vec<TransferStatus> {
        self.shared.registry.lock().statuses()
    }
}
