//! Reservation orchestration
//!
//! One `reserve` call runs end to end:
//!
//! 1. Validate preconditions (non-empty, quantities > 0, no duplicates)
//! 2. Consult the circuit breaker; Open forces everything pessimistic,
//!    HalfOpen carves out exactly one optimistic trial item
//! 3. Batch-resolve strategies for the remaining items
//! 4. Pessimistic items: one exclusive guard over the whole set (ascending
//!    id order), validate all, then decrement and insert holds
//! 5. Optimistic items: read versions, validate all, compare-and-swap each;
//!    on conflict roll the attempt's own decrements back and retry with
//!    backoff; exhausted retries fall back to the pessimistic path
//! 6. Link the order id and return the full hold set
//!
//! Failure of any step compensates everything the call already did: a
//! failed `reserve` leaves no ledger mutation and no reservation rows.

use crate::breaker::{BreakerDecision, CircuitBreaker};
use crate::events::{EventSink, ReservationEvent};
use crate::config::RetryConfig;
use crate::selector::StrategySelector;
use crate::store::ReservationStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stockade_core::{
    LockStrategy, OrderId, ProductId, ReleaseReason, Reservation, ReservationId, Result,
    StockadeError,
};
use stockade_ledger::StockLedger;
use tracing::{debug, error, warn};

/// One requested line item: product and quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveItem {
    /// Product to hold stock of
    pub product_id: ProductId,
    /// Quantity to hold, must be > 0
    pub quantity: u64,
}

impl ReserveItem {
    /// Convenience constructor
    pub fn new(product_id: ProductId, quantity: u64) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// Orchestrates multi-item reservation attempts against the stock ledger
///
/// All collaborators are explicit dependencies; in particular the breaker
/// is shared process-wide state passed in, never reached through a global.
pub struct ReservationEngine {
    ledger: Arc<StockLedger>,
    store: Arc<ReservationStore>,
    selector: Arc<StrategySelector>,
    breaker: Arc<CircuitBreaker>,
    sink: Arc<dyn EventSink>,
    retry: RetryConfig,
    lock_timeout: Duration,
    reservation_ttl: chrono::Duration,
}

impl ReservationEngine {
    /// Create an engine over the given collaborators
    pub fn new(
        ledger: Arc<StockLedger>,
        store: Arc<ReservationStore>,
        selector: Arc<StrategySelector>,
        breaker: Arc<CircuitBreaker>,
        sink: Arc<dyn EventSink>,
        retry: RetryConfig,
        lock_timeout: Duration,
        reservation_ttl: chrono::Duration,
    ) -> Self {
        Self {
            ledger,
            store,
            selector,
            breaker,
            sink,
            retry,
            lock_timeout,
            reservation_ttl,
        }
    }

    /// The reservation store (reaper and tests)
    pub fn store(&self) -> &Arc<ReservationStore> {
        &self.store
    }

    /// The stock ledger (admin surface and tests)
    pub fn ledger(&self) -> &Arc<StockLedger> {
        &self.ledger
    }

    /// Reserve stock for a set of items
    ///
    /// On success every item has a matching `Held` reservation and the
    /// ledger is decremented accordingly. On failure nothing is held and
    /// nothing is decremented, whichever internal path failed.
    ///
    /// # Errors
    /// Caller-visible failures only: `InvalidRequest` (preconditions),
    /// `ProductNotFound`, `InsufficientStock`, `LockTimeout`.
    pub fn reserve(
        &self,
        items: &[ReserveItem],
        order_id: Option<OrderId>,
    ) -> Result<Vec<Reservation>> {
        self.validate_items(items)?;

        let decision = self.breaker.decision();
        let (pessimistic, optimistic) = self.partition_items(items, decision)?;
        let trial = decision == BreakerDecision::TrialOne && !optimistic.is_empty();

        let mut created: Vec<Reservation> = Vec::with_capacity(items.len());

        let outcome = self
            .execute_pessimistic(&pessimistic, &mut created)
            .map_err(|err| {
                // The trial attempt never ran; the slot must go back or the
                // breaker stays half-open with the slot permanently taken.
                if trial {
                    self.breaker.cancel_trial();
                }
                err
            })
            .and_then(|()| self.execute_optimistic(&optimistic, trial, &mut created));

        if let Err(err) = outcome {
            self.undo_created(&created);
            return Err(err);
        }

        if let Some(order_id) = order_id {
            for reservation in &mut created {
                self.store.link_order(reservation.id, order_id)?;
                reservation.order_id = Some(order_id);
            }
        }

        debug!(
            items = items.len(),
            pessimistic = pessimistic.len(),
            optimistic = optimistic.len(),
            "reservation complete"
        );
        Ok(created)
    }

    /// Commit held reservations (the decrement becomes permanent)
    ///
    /// Idempotent: already-committed ids are no-ops. No ledger mutation;
    /// the stock was decremented when the hold was created.
    ///
    /// # Errors
    /// `ReservationNotFound` for unknown ids and `InvalidRequest` for
    /// released or expired ids, both checked across the whole batch before
    /// any transition is applied.
    pub fn commit(&self, reservation_ids: &[ReservationId]) -> Result<()> {
        self.store.ensure_commitable(reservation_ids)?;
        let now = Utc::now();
        for &id in reservation_ids {
            self.store.mark_committed(id, now)?;
        }
        Ok(())
    }

    /// Release reservations, returning their stock to the ledger
    ///
    /// Idempotent: already-released ids are no-ops and do not increment
    /// the ledger a second time.
    ///
    /// # Errors
    /// `ReservationNotFound` for unknown ids and `InvalidRequest` for
    /// committed ids, both checked across the whole batch before any
    /// transition is applied.
    pub fn release(&self, reservation_ids: &[ReservationId], reason: ReleaseReason) -> Result<()> {
        self.store.ensure_releasable(reservation_ids)?;
        let now = Utc::now();
        let mut released = 0usize;
        for &id in reservation_ids {
            if let Some((product_id, quantity)) = self.store.mark_released(id, now)? {
                self.ledger.increment(product_id, quantity)?;
                released += 1;
            }
        }
        if released > 0 {
            self.sink.emit(&ReservationEvent::Released {
                count: released,
                reason,
            });
        }
        Ok(())
    }

    // === Reserve internals ===

    fn validate_items(&self, items: &[ReserveItem]) -> Result<()> {
        if items.is_empty() {
            return Err(StockadeError::invalid_request(
                "reserve requires at least one item",
            ));
        }
        let mut seen = HashSet::with_capacity(items.len());
        for item in items {
            if item.quantity == 0 {
                return Err(StockadeError::invalid_request(format!(
                    "quantity must be > 0 for product {}",
                    item.product_id
                )));
            }
            if !seen.insert(item.product_id) {
                return Err(StockadeError::invalid_request(format!(
                    "duplicate product {} in reserve call",
                    item.product_id
                )));
            }
        }
        Ok(())
    }

    /// Split items into pessimistic and optimistic sets per the breaker
    /// decision and the strategy selector
    fn partition_items(
        &self,
        items: &[ReserveItem],
        decision: BreakerDecision,
    ) -> Result<(Vec<ReserveItem>, Vec<ReserveItem>)> {
        if decision == BreakerDecision::SuppressAll {
            return Ok((items.to_vec(), Vec::new()));
        }

        let ids: Vec<ProductId> = items.iter().map(|i| i.product_id).collect();
        let strategies = self.selector.strategies_for(&ids)?;

        let mut pessimistic = Vec::new();
        let mut optimistic = Vec::new();
        for item in items {
            match strategies
                .get(&item.product_id)
                .copied()
                .unwrap_or(LockStrategy::Pessimistic)
            {
                LockStrategy::Pessimistic => pessimistic.push(*item),
                LockStrategy::Optimistic => optimistic.push(*item),
            }
        }

        if decision == BreakerDecision::TrialOne {
            if optimistic.is_empty() {
                // Nothing to try; hand the trial slot back.
                self.breaker.cancel_trial();
            } else {
                // Exactly one trial item while half-open: the lowest
                // product id, for determinism. The rest go pessimistic.
                optimistic.sort_unstable_by_key(|i| i.product_id);
                let trial_item = optimistic.remove(0);
                pessimistic.extend(optimistic.drain(..));
                optimistic.push(trial_item);
            }
        }

        Ok((pessimistic, optimistic))
    }

    /// Reserve a batch under one exclusive guard
    ///
    /// Validates every item before mutating anything, so an insufficient
    /// product fails the call with no partial reservations left behind.
    fn execute_pessimistic(
        &self,
        items: &[ReserveItem],
        created: &mut Vec<Reservation>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let ids: Vec<ProductId> = items.iter().map(|i| i.product_id).collect();
        let guard = match self.ledger.acquire_exclusive(&ids, self.lock_timeout) {
            Ok(guard) => guard,
            Err(err) => {
                if let StockadeError::LockTimeout { product_id } = err {
                    self.sink.emit(&ReservationEvent::LockTimeout { product_id });
                }
                return Err(err);
            }
        };

        // Validate all quantities before the first decrement.
        for item in items {
            let (available, _) = self.ledger.get(item.product_id)?;
            if available < item.quantity {
                return Err(StockadeError::InsufficientStock {
                    product_id: item.product_id,
                    requested: item.quantity,
                    available,
                });
            }
        }

        // Build the rows first so nothing can fail between the first
        // decrement and the last insert.
        let now = Utc::now();
        let expires_at = now + self.reservation_ttl;
        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            rows.push(Reservation::new(
                item.product_id,
                item.quantity,
                LockStrategy::Pessimistic,
                now,
                expires_at,
            )?);
        }

        let mut applied: Vec<(ProductId, u64)> = Vec::with_capacity(items.len());
        for item in items {
            match self
                .ledger
                .decrement_locked(&guard, item.product_id, item.quantity)
            {
                Ok(_) => applied.push((item.product_id, item.quantity)),
                Err(err) => {
                    // An optimistic writer raced us between validate and
                    // decrement; undo this batch and fail the call.
                    self.compensate(&applied);
                    return Err(err);
                }
            }
        }

        for row in rows {
            self.store.insert(row.clone());
            created.push(row);
        }
        Ok(())
        // Guard drops here, releasing the locks on every exit path above.
    }

    /// Reserve a batch via compare-and-swap with bounded retry
    ///
    /// Each attempt is all-or-nothing: a conflict rolls back the attempt's
    /// own decrements (compensating increments, the savepoint equivalent)
    /// before retrying from the read step. Exhausted retries fall back to
    /// the pessimistic path rather than failing the call.
    fn execute_optimistic(
        &self,
        items: &[ReserveItem],
        trial: bool,
        created: &mut Vec<Reservation>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let max_attempts = if trial { 1 } else { self.retry.max_retries + 1 };
        let mut attempt = 0usize;

        loop {
            attempt += 1;

            // Read without locking, then validate everything before
            // mutating anything. Failing here is not an optimistic outcome:
            // nothing about concurrency was learned, so the breaker window
            // stays untouched and a granted trial slot goes back.
            let mut versions = Vec::with_capacity(items.len());
            for item in items {
                let (available, version) = match self.ledger.get(item.product_id) {
                    Ok(read) => read,
                    Err(err) => {
                        if trial {
                            self.breaker.cancel_trial();
                        }
                        return Err(err);
                    }
                };
                if available < item.quantity {
                    if trial {
                        self.breaker.cancel_trial();
                    }
                    return Err(StockadeError::InsufficientStock {
                        product_id: item.product_id,
                        requested: item.quantity,
                        available,
                    });
                }
                versions.push(version);
            }

            let mut applied: Vec<(ProductId, u64)> = Vec::with_capacity(items.len());
            let mut conflicted = false;
            for (item, &version) in items.iter().zip(versions.iter()) {
                match self
                    .ledger
                    .decrement_if_version(item.product_id, item.quantity, version)
                {
                    Ok(_) => applied.push((item.product_id, item.quantity)),
                    Err(StockadeError::Conflict { .. }) => {
                        conflicted = true;
                        break;
                    }
                    Err(err) => {
                        // Non-conflict swap errors (product deactivated
                        // between read and swap) say nothing about
                        // optimistic-concurrency health; keep them out of
                        // the breaker window.
                        self.compensate(&applied);
                        if trial {
                            self.breaker.cancel_trial();
                        }
                        return Err(err);
                    }
                }
            }

            if !conflicted {
                let now = Utc::now();
                let expires_at = now + self.reservation_ttl;
                for item in items {
                    let row = Reservation::new(
                        item.product_id,
                        item.quantity,
                        LockStrategy::Optimistic,
                        now,
                        expires_at,
                    )?;
                    self.store.insert(row.clone());
                    created.push(row);
                }
                self.breaker.record_success();
                return Ok(());
            }

            // Roll this attempt's decrements back to the pre-attempt state.
            self.compensate(&applied);
            self.breaker.record_failure();

            if attempt >= max_attempts || started.elapsed() >= self.retry.max_elapsed() {
                break;
            }
            std::thread::sleep(self.retry.backoff_delay(attempt - 1));
        }

        // Retries exhausted: the unresolved items fall back to the
        // pessimistic path, which keeps the call correct under contention.
        warn!(
            items = items.len(),
            attempts = attempt,
            "optimistic reservation contended, falling back"
        );
        self.sink.emit(&ReservationEvent::OptimisticFallback {
            products: items.iter().map(|i| i.product_id).collect(),
            attempts: attempt,
        });
        self.execute_pessimistic(items, created)
    }

    /// Compensating increments for decrements applied within one attempt
    fn compensate(&self, applied: &[(ProductId, u64)]) {
        for &(product_id, quantity) in applied {
            if let Err(err) = self.ledger.increment(product_id, quantity) {
                // Unreachable for registered products; log loudly if the
                // ledger ever rejects a compensation.
                error!(product = %product_id, error = %err, "compensating increment failed");
            }
        }
    }

    /// Undo everything a failed `reserve` call created
    ///
    /// Rows are deleted, not released: the call never returned them to
    /// anyone, so they must not exist at all afterwards.
    fn undo_created(&self, created: &[Reservation]) {
        for reservation in created {
            if self.store.remove(reservation.id).is_some() {
                if let Err(err) = self
                    .ledger
                    .increment(reservation.product_id, reservation.quantity)
                {
                    error!(
                        reservation = %reservation.id,
                        error = %err,
                        "rollback increment failed"
                    );
                }
            }
        }
    }
}
