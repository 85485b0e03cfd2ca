//! Reservation store: durable record of every inventory hold
//!
//! The store owns the reservation state machine. It performs only state
//! transitions; pairing a transition with the matching ledger mutation is
//! the engine's job (insert with decrement, release with increment).
//!
//! Commit and release are idempotent so interrupted callers and the reaper
//! can safely re-run a batch.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stockade_core::{
    OrderId, Reservation, ReservationId, ReservationState, Result, StockadeError,
};
use tracing::trace;

/// In-memory reservation record store
///
/// Thread-safe; per-reservation transitions are serialized by the map's
/// per-key locking.
pub struct ReservationStore {
    reservations: DashMap<ReservationId, Reservation>,
}

impl ReservationStore {
    /// Create an empty store
    pub fn new() -> Self {
        ReservationStore {
            reservations: DashMap::new(),
        }
    }

    /// Insert a freshly created hold
    ///
    /// The engine calls this immediately after the paired ledger decrement,
    /// and never returns success to its caller unless both happened.
    pub fn insert(&self, reservation: Reservation) -> ReservationId {
        let id = reservation.id;
        trace!(reservation = %id, product = %reservation.product_id, "inserted hold");
        self.reservations.insert(id, reservation);
        id
    }

    /// Remove a row entirely (failed-call cleanup only)
    ///
    /// A failed `reserve` must leave no residual state; rows created
    /// earlier in the same call are deleted, not released, because the
    /// call never returned them to anyone.
    pub(crate) fn remove(&self, id: ReservationId) -> Option<Reservation> {
        self.reservations.remove(&id).map(|(_, r)| r)
    }

    /// Fetch a copy of a reservation
    pub fn get(&self, id: ReservationId) -> Result<Reservation> {
        self.reservations
            .get(&id)
            .map(|r| r.clone())
            .ok_or(StockadeError::ReservationNotFound(id))
    }

    /// Fail unless every id in the batch can accept a commit
    ///
    /// Checked before any transition is applied so a batch holding a
    /// released id rejects as a whole instead of committing a prefix. A
    /// concurrent transition between this check and the apply loop can
    /// still fail the batch midway; the transitions are idempotent, so
    /// re-running the batch after such a failure is safe.
    pub fn ensure_commitable(&self, ids: &[ReservationId]) -> Result<()> {
        for &id in ids {
            let r = self
                .reservations
                .get(&id)
                .ok_or(StockadeError::ReservationNotFound(id))?;
            if !r.can_commit() && r.state != ReservationState::Committed {
                return Err(StockadeError::invalid_request(format!(
                    "cannot commit reservation {} in state {}",
                    id, r.state
                )));
            }
        }
        Ok(())
    }

    /// Fail unless every id in the batch can accept a release
    ///
    /// Same whole-batch contract and concurrency caveat as
    /// [`ensure_commitable`](Self::ensure_commitable).
    pub fn ensure_releasable(&self, ids: &[ReservationId]) -> Result<()> {
        for &id in ids {
            let r = self
                .reservations
                .get(&id)
                .ok_or(StockadeError::ReservationNotFound(id))?;
            if !r.can_release() && r.state != ReservationState::Released {
                return Err(StockadeError::invalid_request(format!(
                    "cannot release reservation {} in state {}",
                    id, r.state
                )));
            }
        }
        Ok(())
    }

    /// Link a reservation to the caller's order
    pub fn link_order(&self, id: ReservationId, order_id: OrderId) -> Result<()> {
        let mut r = self
            .reservations
            .get_mut(&id)
            .ok_or(StockadeError::ReservationNotFound(id))?;
        r.order_id = Some(order_id);
        Ok(())
    }

    /// Transition Held → Committed
    ///
    /// Returns `true` if the transition happened, `false` if the
    /// reservation was already committed (idempotent no-op).
    ///
    /// # Errors
    /// - `ReservationNotFound` for unknown ids
    /// - `InvalidRequest` if the reservation was released or expired;
    ///   committing returned stock would break the ledger pairing
    pub fn mark_committed(&self, id: ReservationId, now: DateTime<Utc>) -> Result<bool> {
        let mut r = self
            .reservations
            .get_mut(&id)
            .ok_or(StockadeError::ReservationNotFound(id))?;
        match r.state {
            ReservationState::Held => {
                r.state = ReservationState::Committed;
                r.committed_at = Some(now);
                Ok(true)
            }
            ReservationState::Committed => Ok(false),
            state => Err(StockadeError::invalid_request(format!(
                "cannot commit reservation {} in state {}",
                id, state
            ))),
        }
    }

    /// Transition Held or Expired → Released
    ///
    /// Returns the `(product_id, quantity)` the caller must return to the
    /// ledger, or `None` if the reservation was already released
    /// (idempotent no-op, no second increment).
    ///
    /// # Errors
    /// - `ReservationNotFound` for unknown ids
    /// - `InvalidRequest` if the reservation is committed
    pub fn mark_released(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Option<(stockade_core::ProductId, u64)>> {
        let mut r = self
            .reservations
            .get_mut(&id)
            .ok_or(StockadeError::ReservationNotFound(id))?;
        match r.state {
            ReservationState::Held | ReservationState::Expired => {
                r.state = ReservationState::Released;
                r.released_at = Some(now);
                Ok(Some((r.product_id, r.quantity)))
            }
            ReservationState::Released => Ok(None),
            ReservationState::Committed => Err(StockadeError::invalid_request(format!(
                "cannot release committed reservation {}",
                id
            ))),
        }
    }

    /// Transition Held → Expired if past due at `now`
    ///
    /// Returns `true` if the marker was set. A reservation that was
    /// committed or released between selection and marking is skipped, so
    /// the reaper can re-run a pass without harm.
    pub fn mark_expired(&self, id: ReservationId, now: DateTime<Utc>) -> Result<bool> {
        let mut r = self
            .reservations
            .get_mut(&id)
            .ok_or(StockadeError::ReservationNotFound(id))?;
        if r.is_expired_at(now) {
            r.state = ReservationState::Expired;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Held reservations past their time-to-live at `now`
    ///
    /// The predicate is stateless and re-evaluated each pass; a crashed
    /// pass misses nothing on re-run. Also picks up Expired markers left
    /// behind by an interrupted pass so their release is retried.
    pub fn expired_candidates(&self, now: DateTime<Utc>) -> Vec<ReservationId> {
        self.reservations
            .iter()
            .filter(|r| r.is_expired_at(now) || r.state == ReservationState::Expired)
            .map(|r| r.id)
            .collect()
    }

    /// Number of reservations currently in the given state
    pub fn count_in_state(&self, state: ReservationState) -> usize {
        self.reservations.iter().filter(|r| r.state == state).count()
    }

    /// Total quantity currently held or committed for a product
    ///
    /// Used by the oversell property tests.
    pub fn outstanding_for(&self, product_id: stockade_core::ProductId) -> u64 {
        self.reservations
            .iter()
            .filter(|r| {
                r.product_id == product_id
                    && matches!(
                        r.state,
                        ReservationState::Held | ReservationState::Committed
                    )
            })
            .map(|r| r.quantity)
            .sum()
    }
}

impl Default for ReservationStore {
    fn default() -> Self {
        Self::new()
    }
}
