//! Exclusive lock table for the pessimistic path
//!
//! One mutex per registered product. Acquisition always walks the requested
//! set in ascending product-id order, and each individual lock waits at most
//! the configured timeout. A failed acquisition drops every lock collected
//! so far; the returned guard releases everything on drop, covering both
//! success and failure exit paths.

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::Arc;
use std::time::Duration;
use stockade_core::{ProductId, Result, StockadeError};
use tracing::trace;

type ProductLockGuard = ArcMutexGuard<RawMutex, ()>;

/// Per-product exclusive lock table
///
/// Entries are created when a product is registered and removed when it is
/// dropped from the ledger. The table itself is never locked as a whole.
#[derive(Default)]
pub(crate) struct LockTable {
    locks: DashMap<ProductId, Arc<Mutex<()>>>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Create a lock entry for a newly registered product
    pub(crate) fn register(&self, product_id: ProductId) {
        self.locks.entry(product_id).or_default();
    }

    /// Acquire exclusive locks over the given products
    ///
    /// `product_ids` must already be sorted ascending and deduplicated;
    /// the ledger's `acquire_exclusive` is the only caller and enforces it.
    ///
    /// # Errors
    /// - `ProductNotFound` if a product has no lock entry
    /// - `LockTimeout` if any single lock cannot be acquired within
    ///   `timeout`; no locks remain held afterwards
    pub(crate) fn acquire(
        &self,
        product_ids: &[ProductId],
        timeout: Duration,
    ) -> Result<StockGuard> {
        let mut held: Vec<(ProductId, ProductLockGuard)> = Vec::with_capacity(product_ids.len());

        for &product_id in product_ids {
            // Clone the Arc out before locking so the map shard is not
            // held across the (possibly long) lock wait.
            let lock = self
                .locks
                .get(&product_id)
                .map(|entry| Arc::clone(entry.value()))
                .ok_or(StockadeError::ProductNotFound(product_id))?;

            match lock.try_lock_arc_for(timeout) {
                Some(lock_guard) => {
                    trace!(product = %product_id, "acquired exclusive product lock");
                    held.push((product_id, lock_guard));
                }
                None => {
                    // `held` drops here, releasing everything acquired so far.
                    return Err(StockadeError::LockTimeout { product_id });
                }
            }
        }

        Ok(StockGuard { held })
    }
}

/// Scoped exclusive access to a set of products
///
/// Holding the guard is what entitles a caller to `decrement_locked`.
/// Locks are released when the guard is dropped, on every exit path.
pub struct StockGuard {
    held: Vec<(ProductId, ProductLockGuard)>,
}

impl StockGuard {
    /// Whether this guard holds the exclusive lock for `product_id`
    pub fn covers(&self, product_id: ProductId) -> bool {
        self.held.iter().any(|(id, _)| *id == product_id)
    }

    /// Products covered by this guard, in acquisition (ascending) order
    pub fn products(&self) -> impl Iterator<Item = ProductId> + '_ {
        self.held.iter().map(|(id, _)| *id)
    }

    /// Number of locks held
    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Whether the guard holds no locks
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl std::fmt::Debug for StockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockGuard")
            .field("products", &self.held.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .finish()
    }
}
