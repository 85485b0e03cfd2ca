//! Versioned per-product stock records
//!
//! Each record carries `available` and a monotonically increasing `version`
//! stamp, incremented on every successful mutation. For a single product the
//! sequence of successful decrements is totally ordered by that counter; no
//! two successful mutations can observe the same prior version.
//!
//! `contention_class` is written only through the admin surface (the
//! offline classification job); the reservation path reads it in batch via
//! `contention_classes`.

use crate::guard::{LockTable, StockGuard};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use stockade_core::{ContentionClass, ProductId, Result, StockadeError};
use tracing::debug;

/// Internal per-product record
struct StockRecord {
    available: u64,
    version: u64,
    contention_class: ContentionClass,
    active: bool,
}

/// Point-in-time copy of a stock record, for tests and observability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    /// Product this snapshot describes
    pub product_id: ProductId,
    /// Sellable quantity at snapshot time
    pub available: u64,
    /// Version stamp at snapshot time
    pub version: u64,
    /// Offline contention classification
    pub contention_class: ContentionClass,
    /// Whether the product is sellable at all
    pub active: bool,
}

/// Authoritative per-product available-quantity counter store
///
/// Thread-safe; per-product mutations are serialized by the underlying
/// map's per-key locking, so a compare-and-swap can never interleave with
/// another mutation of the same record.
pub struct StockLedger {
    records: DashMap<ProductId, StockRecord>,
    locks: LockTable,
}

impl StockLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        StockLedger {
            records: DashMap::new(),
            locks: LockTable::new(),
        }
    }

    // === Admin surface (out-of-band, not the reservation path) ===

    /// Register a product with its initial stock
    ///
    /// Creates the record (classified `Standard` until the classification
    /// job says otherwise) and its exclusive-lock entry.
    ///
    /// # Errors
    /// Returns `InvalidRequest` if the product is already registered.
    pub fn register(&self, product_id: ProductId, initial_quantity: u64) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(product_id) {
            Entry::Occupied(_) => Err(StockadeError::invalid_request(format!(
                "product {} is already registered",
                product_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(StockRecord {
                    available: initial_quantity,
                    version: 0,
                    contention_class: ContentionClass::Standard,
                    active: true,
                });
                self.locks.register(product_id);
                debug!(product = %product_id, quantity = initial_quantity, "registered product");
                Ok(())
            }
        }
    }

    /// Mark a product inactive; subsequent `get`s behave as unknown
    pub fn deactivate(&self, product_id: ProductId) -> Result<()> {
        let mut record = self
            .records
            .get_mut(&product_id)
            .ok_or(StockadeError::ProductNotFound(product_id))?;
        record.active = false;
        Ok(())
    }

    /// Set a product's contention class (classification job only)
    pub fn set_contention_class(
        &self,
        product_id: ProductId,
        class: ContentionClass,
    ) -> Result<()> {
        let mut record = self
            .records
            .get_mut(&product_id)
            .ok_or(StockadeError::ProductNotFound(product_id))?;
        record.contention_class = class;
        Ok(())
    }

    /// Batched authoritative read of contention classes
    ///
    /// Unknown or inactive products are simply absent from the result; the
    /// strategy selector treats them as pessimistic.
    pub fn contention_classes(
        &self,
        product_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, ContentionClass>> {
        let mut classes = HashMap::with_capacity(product_ids.len());
        for product_id in product_ids {
            if let Some(record) = self.records.get(product_id) {
                if record.active {
                    classes.insert(*product_id, record.contention_class);
                }
            }
        }
        Ok(classes)
    }

    // === Read path ===

    /// Read a product's `(available_quantity, version)` without locking
    ///
    /// # Errors
    /// Returns `ProductNotFound` if the product is unknown or inactive.
    pub fn get(&self, product_id: ProductId) -> Result<(u64, u64)> {
        let record = self.active_record(product_id)?;
        Ok((record.available, record.version))
    }

    /// Point-in-time copy of the full record
    pub fn snapshot(&self, product_id: ProductId) -> Result<StockSnapshot> {
        let record = self
            .records
            .get(&product_id)
            .ok_or(StockadeError::ProductNotFound(product_id))?;
        Ok(StockSnapshot {
            product_id,
            available: record.available,
            version: record.version,
            contention_class: record.contention_class,
            active: record.active,
        })
    }

    // === Mutation path ===

    /// Atomic compare-and-swap decrement
    ///
    /// Succeeds only if the record's version still equals
    /// `expected_version` and `available >= quantity`; on success decrements
    /// and bumps the version.
    ///
    /// # Errors
    /// - `Conflict` if the version moved since the caller's read
    /// - `InsufficientStock` if the quantity cannot be covered
    /// - `ProductNotFound` if unknown or inactive
    pub fn decrement_if_version(
        &self,
        product_id: ProductId,
        quantity: u64,
        expected_version: u64,
    ) -> Result<u64> {
        let mut record = self.active_record_mut(product_id)?;
        if record.version != expected_version {
            return Err(StockadeError::Conflict {
                product_id,
                expected: expected_version,
                actual: record.version,
            });
        }
        if record.available < quantity {
            return Err(StockadeError::InsufficientStock {
                product_id,
                requested: quantity,
                available: record.available,
            });
        }
        record.available -= quantity;
        record.version += 1;
        Ok(record.version)
    }

    /// Decrement under an already-held exclusive guard
    ///
    /// The guard serializes all pessimistic access to the product, so this
    /// never fails on version.
    ///
    /// # Errors
    /// - `InvalidRequest` if `guard` does not cover the product
    /// - `InsufficientStock` if the quantity cannot be covered
    /// - `ProductNotFound` if unknown or inactive
    pub fn decrement_locked(
        &self,
        guard: &StockGuard,
        product_id: ProductId,
        quantity: u64,
    ) -> Result<u64> {
        if !guard.covers(product_id) {
            return Err(StockadeError::invalid_request(format!(
                "exclusive guard does not cover product {}",
                product_id
            )));
        }
        let mut record = self.active_record_mut(product_id)?;
        if record.available < quantity {
            return Err(StockadeError::InsufficientStock {
                product_id,
                requested: quantity,
                available: record.available,
            });
        }
        record.available -= quantity;
        record.version += 1;
        Ok(record.version)
    }

    /// Return stock to the ledger (release or rollback)
    ///
    /// Always succeeds for known products, inactive ones included: stock
    /// held before a deactivation must still be returnable.
    pub fn increment(&self, product_id: ProductId, quantity: u64) -> Result<u64> {
        let mut record = self
            .records
            .get_mut(&product_id)
            .ok_or(StockadeError::ProductNotFound(product_id))?;
        record.available += quantity;
        record.version += 1;
        Ok(record.version)
    }

    /// Acquire exclusive locks across a product set
    ///
    /// Ids are sorted ascending and deduplicated before acquisition so that
    /// concurrent callers locking overlapping sets in different orders
    /// cannot deadlock. Each lock waits at most `timeout`.
    ///
    /// # Errors
    /// - `ProductNotFound` if any product is unknown or inactive
    /// - `LockTimeout` naming the product whose lock could not be acquired;
    ///   no locks remain held afterwards
    pub fn acquire_exclusive(
        &self,
        product_ids: &[ProductId],
        timeout: Duration,
    ) -> Result<StockGuard> {
        let mut ordered: Vec<ProductId> = product_ids.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        // Reject unknown/inactive products before taking any lock.
        for &product_id in &ordered {
            self.active_record(product_id).map(|_| ())?;
        }

        self.locks.acquire(&ordered, timeout)
    }

    // === Internal helpers ===

    fn active_record(
        &self,
        product_id: ProductId,
    ) -> Result<dashmap::mapref::one::Ref<'_, ProductId, StockRecord>> {
        let record = self
            .records
            .get(&product_id)
            .ok_or(StockadeError::ProductNotFound(product_id))?;
        if !record.active {
            return Err(StockadeError::ProductNotFound(product_id));
        }
        Ok(record)
    }

    fn active_record_mut(
        &self,
        product_id: ProductId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, ProductId, StockRecord>> {
        let record = self
            .records
            .get_mut(&product_id)
            .ok_or(StockadeError::ProductNotFound(product_id))?;
        if !record.active {
            return Err(StockadeError::ProductNotFound(product_id));
        }
        Ok(record)
    }
}

impl Default for StockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ledger_with(quantity: u64) -> (StockLedger, ProductId) {
        let ledger = StockLedger::new();
        let product_id = ProductId::new();
        ledger.register(product_id, quantity).unwrap();
        (ledger, product_id)
    }

    #[test]
    fn test_register_and_get() {
        let (ledger, p) = ledger_with(10);
        assert_eq!(ledger.get(p).unwrap(), (10, 0));
    }

    #[test]
    fn test_double_register_rejected() {
        let (ledger, p) = ledger_with(10);
        assert!(matches!(
            ledger.register(p, 5),
            Err(StockadeError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_get_unknown_product() {
        let ledger = StockLedger::new();
        let p = ProductId::new();
        assert_eq!(ledger.get(p), Err(StockadeError::ProductNotFound(p)));
    }

    #[test]
    fn test_inactive_product_behaves_as_unknown() {
        let (ledger, p) = ledger_with(10);
        ledger.deactivate(p).unwrap();
        assert_eq!(ledger.get(p), Err(StockadeError::ProductNotFound(p)));
        assert_eq!(
            ledger.decrement_if_version(p, 1, 0),
            Err(StockadeError::ProductNotFound(p))
        );
        // Increment still works so held stock can be returned.
        assert!(ledger.increment(p, 1).is_ok());
    }

    #[test]
    fn test_cas_decrement_success() {
        let (ledger, p) = ledger_with(10);
        let new_version = ledger.decrement_if_version(p, 3, 0).unwrap();
        assert_eq!(new_version, 1);
        assert_eq!(ledger.get(p).unwrap(), (7, 1));
    }

    #[test]
    fn test_cas_version_mismatch() {
        let (ledger, p) = ledger_with(10);
        ledger.decrement_if_version(p, 1, 0).unwrap();
        let err = ledger.decrement_if_version(p, 1, 0).unwrap_err();
        assert_eq!(
            err,
            StockadeError::Conflict {
                product_id: p,
                expected: 0,
                actual: 1
            }
        );
        // Failed CAS must not mutate.
        assert_eq!(ledger.get(p).unwrap(), (9, 1));
    }

    #[test]
    fn test_cas_insufficient_stock() {
        let (ledger, p) = ledger_with(3);
        let err = ledger.decrement_if_version(p, 5, 0).unwrap_err();
        assert_eq!(
            err,
            StockadeError::InsufficientStock {
                product_id: p,
                requested: 5,
                available: 3
            }
        );
        assert_eq!(ledger.get(p).unwrap(), (3, 0));
    }

    #[test]
    fn test_locked_decrement_requires_guard_coverage() {
        let (ledger, p) = ledger_with(10);
        let other = ProductId::new();
        ledger.register(other, 1).unwrap();

        let guard = ledger
            .acquire_exclusive(&[other], Duration::from_millis(50))
            .unwrap();
        let err = ledger.decrement_locked(&guard, p, 1).unwrap_err();
        assert!(matches!(err, StockadeError::InvalidRequest(_)));
    }

    #[test]
    fn test_locked_decrement_and_release_roundtrip() {
        let (ledger, p) = ledger_with(10);
        {
            let guard = ledger
                .acquire_exclusive(&[p], Duration::from_millis(50))
                .unwrap();
            assert_eq!(ledger.decrement_locked(&guard, p, 4).unwrap(), 1);
        }
        let version_after_increment = ledger.increment(p, 4).unwrap();
        let (available, version) = ledger.get(p).unwrap();
        assert_eq!(available, 10);
        // Version is strictly greater than before the round-trip.
        assert_eq!(version, 2);
        assert_eq!(version, version_after_increment);
    }

    #[test]
    fn test_acquire_exclusive_sorts_and_dedups() {
        let (ledger, a) = ledger_with(1);
        let b = ProductId::new();
        ledger.register(b, 1).unwrap();

        let guard = ledger
            .acquire_exclusive(&[b, a, b], Duration::from_millis(50))
            .unwrap();
        assert_eq!(guard.len(), 2);
        let order: Vec<ProductId> = guard.products().collect();
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(order, sorted);
    }

    #[test]
    fn test_version_total_order_under_concurrent_cas() {
        let (ledger, p) = ledger_with(1000);
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(thread::spawn(move || {
                let mut succeeded = 0u64;
                for _ in 0..100 {
                    let (_, version) = ledger.get(p).unwrap();
                    if ledger.decrement_if_version(p, 1, version).is_ok() {
                        succeeded += 1;
                    }
                }
                succeeded
            }));
        }

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let (available, version) = ledger.get(p).unwrap();
        assert_eq!(available, 1000 - total);
        assert_eq!(version, total);
    }
}
