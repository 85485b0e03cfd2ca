//! Reservation records and lifecycle states
//!
//! A reservation is a temporary hold against available stock, created
//! atomically with the matching ledger decrement.
//!
//! State transitions:
//! - `Held` → `Committed` (decrement becomes permanent)
//! - `Held` → `Released` (stock returned)
//! - `Held` → `Expired` (reaper marker, consumed by the release that follows)
//! - `Expired` → `Released`
//!
//! Terminal states (no transitions allowed):
//! - `Committed`
//! - `Released`

use crate::error::{Result, StockadeError};
use crate::types::{LockStrategy, OrderId, ProductId, ReservationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Stock is decremented and held, awaiting commit or release
    Held,
    /// The hold became a permanent sale; no further ledger change
    Committed,
    /// Stock was returned to the ledger
    Released,
    /// Past its time-to-live; transient marker consumed by the reaper
    Expired,
}

impl ReservationState {
    /// Whether no further transitions are allowed from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationState::Committed | ReservationState::Released)
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationState::Held => write!(f, "held"),
            ReservationState::Committed => write!(f, "committed"),
            ReservationState::Released => write!(f, "released"),
            ReservationState::Expired => write!(f, "expired"),
        }
    }
}

/// Why a reservation was released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The caller gave the hold up (payment failed, cart abandoned)
    CallerRequested,
    /// The hold outlived its time-to-live and was reaped
    Expired,
    /// The engine undid a partially-built reservation set
    Rollback,
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseReason::CallerRequested => write!(f, "caller_requested"),
            ReleaseReason::Expired => write!(f, "expired"),
            ReleaseReason::Rollback => write!(f, "rollback"),
        }
    }
}

/// A temporary hold against available stock
///
/// Created atomically with the matching ledger decrement. `committed_at`
/// and `released_at` are set exactly once, mutually exclusive, only when
/// leaving `Held` (or `Expired`, for releases).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique reservation identifier
    pub id: ReservationId,
    /// Product this hold is against
    pub product_id: ProductId,
    /// Order the caller linked, if any
    pub order_id: Option<OrderId>,
    /// Held quantity, always > 0
    pub quantity: u64,
    /// Current lifecycle state
    pub state: ReservationState,
    /// Locking strategy that created this hold, recorded for observability
    pub strategy_used: LockStrategy,
    /// When the hold was created
    pub created_at: DateTime<Utc>,
    /// When the hold lapses if neither committed nor released
    pub expires_at: DateTime<Utc>,
    /// Set exactly once when the hold is committed
    pub committed_at: Option<DateTime<Utc>>,
    /// Set exactly once when the hold is released
    pub released_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Create a new held reservation
    ///
    /// # Errors
    /// Returns `InvalidRequest` if `quantity` is zero or `expires_at` is
    /// not strictly after `created_at`.
    pub fn new(
        product_id: ProductId,
        quantity: u64,
        strategy_used: LockStrategy,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        if quantity == 0 {
            return Err(StockadeError::invalid_request(format!(
                "reservation quantity must be > 0 for product {}",
                product_id
            )));
        }
        if expires_at <= created_at {
            return Err(StockadeError::invalid_request(format!(
                "reservation expiry {} must be after creation {}",
                expires_at, created_at
            )));
        }
        Ok(Reservation {
            id: ReservationId::new(),
            product_id,
            order_id: None,
            quantity,
            state: ReservationState::Held,
            strategy_used,
            created_at,
            expires_at,
            committed_at: None,
            released_at: None,
        })
    }

    /// Whether the hold is past its time-to-live at `now`
    ///
    /// Only meaningful for `Held` reservations; the predicate is stateless
    /// so a reaper pass can be re-run safely after a crash.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Held && self.expires_at <= now
    }

    /// Whether this reservation can still be committed
    pub fn can_commit(&self) -> bool {
        self.state == ReservationState::Held
    }

    /// Whether this reservation can still be released
    pub fn can_release(&self) -> bool {
        matches!(self.state, ReservationState::Held | ReservationState::Expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn held(quantity: u64) -> Reservation {
        let now = Utc::now();
        Reservation::new(
            ProductId::new(),
            quantity,
            LockStrategy::Pessimistic,
            now,
            now + Duration::seconds(60),
        )
        .unwrap()
    }

    #[test]
    fn test_new_reservation_is_held() {
        let r = held(3);
        assert_eq!(r.state, ReservationState::Held);
        assert_eq!(r.quantity, 3);
        assert!(r.order_id.is_none());
        assert!(r.committed_at.is_none());
        assert!(r.released_at.is_none());
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let now = Utc::now();
        let err = Reservation::new(
            ProductId::new(),
            0,
            LockStrategy::Optimistic,
            now,
            now + Duration::seconds(60),
        )
        .unwrap_err();
        assert!(matches!(err, StockadeError::InvalidRequest(_)));
    }

    #[test]
    fn test_expiry_must_follow_creation() {
        let now = Utc::now();
        let err =
            Reservation::new(ProductId::new(), 1, LockStrategy::Optimistic, now, now).unwrap_err();
        assert!(matches!(err, StockadeError::InvalidRequest(_)));
    }

    #[test]
    fn test_expiry_predicate() {
        let now = Utc::now();
        let r = Reservation::new(
            ProductId::new(),
            1,
            LockStrategy::Pessimistic,
            now - Duration::seconds(120),
            now - Duration::seconds(60),
        )
        .unwrap();
        assert!(r.is_expired_at(now));
        assert!(!r.is_expired_at(now - Duration::seconds(90)));
    }

    #[test]
    fn test_expiry_predicate_ignores_terminal_states() {
        let now = Utc::now();
        let mut r = Reservation::new(
            ProductId::new(),
            1,
            LockStrategy::Pessimistic,
            now - Duration::seconds(120),
            now - Duration::seconds(60),
        )
        .unwrap();
        r.state = ReservationState::Committed;
        assert!(!r.is_expired_at(now));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ReservationState::Committed.is_terminal());
        assert!(ReservationState::Released.is_terminal());
        assert!(!ReservationState::Held.is_terminal());
        assert!(!ReservationState::Expired.is_terminal());
    }

    #[test]
    fn test_can_release_from_expired() {
        let mut r = held(1);
        r.state = ReservationState::Expired;
        assert!(r.can_release());
        assert!(!r.can_commit());
    }
}
