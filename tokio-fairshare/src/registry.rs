//! Transfer registry and the limit recomputation pass.
//!
//! Each transfer is weighted by the inverse of its remaining bytes, so transfers close to
//! completion receive a larger share of the budget:
//!
//! ```text
//! weight(i) = 1 / remaining(i)
//! limit(i)  = floor(budget * weight(i) / sum(weight))
//! ```
//!
//! The units lost to flooring are then handed out one at a time to the transfers with the
//! largest remainders, so freshly assigned limits add up to exactly the budget and at least one
//! transfer gets a positive limit even when the budget is smaller than the number of transfers.
//!
//! Weights are kept in `u128` fixed point (`2^64 / remaining`) so limits are exact.
use std::{collections::HashMap, fmt, sync::Arc};

use ahash::RandomState;
use nanoid::nanoid;
use serde::Serialize;
use tracing::trace;

use crate::tracked::Progress;

/// `1.0` in the fixed-point weight representation.
const WEIGHT_SCALE: u128 = 1 << 64;

/// Opaque, unique identifier of a registered transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub(crate) fn generate() -> Self {
        Self(nanoid!())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Point-in-time view of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferStatus {
    pub id: TransferId,
    pub declared_size: u64,
    pub bytes_read: u64,
    pub limit: u64,
}

#[derive(Debug)]
struct Transfer {
    declared_size: u64,
    progress: Arc<Progress>,
    // scratch for `recompute`
    weight: u128,
    share: u64,
    remainder: u128,
}

impl Transfer {
    fn status(&self, id: &TransferId) -> TransferStatus {
        TransferStatus {
            id: id.clone(),
            declared_size: self.declared_size,
            bytes_read: self.progress.bytes_read(),
            limit: self.progress.limit(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    transfers: HashMap<TransferId, Transfer, RandomState>,
}

impl Registry {
    pub(crate) fn insert(&mut self, id: TransferId, declared_size: u64, progress: Arc<Progress>) {
        let replaced = self.transfers.insert(
            id,
            Transfer {
                declared_size,
                progress,
                weight: 0,
                share: 0,
                remainder: 0,
            },
        );
        debug_assert!(replaced.is_none(), "transfer id reused");
    }

    /// Returns `false` when `id` was not registered.
    pub(crate) fn remove(&mut self, id: &TransferId) -> bool {
        self.transfers.remove(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.transfers.len()
    }

    pub(crate) fn status(&self, id: &TransferId) -> Option<TransferStatus> {
        self.transfers.get(id).map(|t| t.status(id))
    }

    pub(crate) fn statuses(&self) -> Vec<TransferStatus> {
        self.transfers.iter().map(|(id, t)| t.status(id)).collect()
    }

    /// Push a fresh limit to every transfer that still has bytes left.
    ///
    /// Transfers with nothing remaining keep their previous limit. When no transfer has bytes
    /// left, nothing is pushed at all. Otherwise the pushed limits add up to `budget`.
    pub(crate) fn recompute(&mut self, budget: u64) {
        let mut total: u128 = 0;
        for t in self.transfers.values_mut() {
            let remaining = t.declared_size.saturating_sub(t.progress.bytes_read());
            t.weight = match remaining {
                0 => 0,
                remaining => WEIGHT_SCALE / remaining as u128,
            };
            total += t.weight;
        }

        if total == 0 {
            trace!(active = self.transfers.len(), "no remaining work, limits unchanged");
            return;
        }

        let mut assigned: u64 = 0;
        for t in self.transfers.values_mut() {
            if t.weight == 0 {
                t.share = 0;
                t.remainder = 0;
                continue;
            }
            // budget < 2^64 and weight <= 2^64, so the product fits in u128
            let exact = budget as u128 * t.weight;
            t.share = (exact / total) as u64;
            t.remainder = exact % total;
            assigned += t.share;
        }

        // The remainders add up to `leftover * total` and each is below `total`, so more than
        // `leftover` transfers have a positive remainder.
        let leftover = budget - assigned;
        for _ in 0..leftover {
            let Some(t) = self
                .transfers
                .values_mut()
                .filter(|t| t.remainder > 0)
                .max_by_key(|t| t.remainder)
            else {
                break;
            };
            t.share += 1;
            t.remainder = 0;
        }

        for (id, t) in &self.transfers {
            if t.weight == 0 {
                continue;
            }
            t.progress.set_limit(t.share);
            trace!(%id, declared_size = t.declared_size, limit = t.share, "limit updated");
        }
    }
}
