//! Error types for the reservation service
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Only `ProductNotFound`, `ReservationNotFound`, `InsufficientStock` and
//! `LockTimeout` are caller-visible failures of `reserve`. `Conflict` is
//! retried internally by the engine and `Unavailable` is recovered locally
//! via fallback stores; neither reaches the caller directly.

use crate::types::{ProductId, ReservationId};
use thiserror::Error;

/// Result type alias for stockade operations
pub type Result<T> = std::result::Result<T, StockadeError>;

/// Error types for the reservation service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StockadeError {
    /// Product unknown to the ledger, or deactivated
    #[error("product not found: {0}")]
    ProductNotFound(ProductId),

    /// Reservation identifier unknown to the store
    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// Requested quantity exceeds availability at validation time
    #[error(
        "insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        /// Product that could not cover the request
        product_id: ProductId,
        /// Quantity the caller asked for
        requested: u64,
        /// Quantity actually available
        available: u64,
    },

    /// Optimistic version mismatch (compare-and-swap lost the race)
    #[error("version conflict on product {product_id}: expected {expected}, found {actual}")]
    Conflict {
        /// Product whose version moved under us
        product_id: ProductId,
        /// Version the caller read
        expected: u64,
        /// Version found at swap time
        actual: u64,
    },

    /// Exclusive guard could not be acquired within the bounded wait
    #[error("timed out acquiring exclusive lock for product {product_id}")]
    LockTimeout {
        /// Product whose lock acquisition timed out
        product_id: ProductId,
    },

    /// A backing store (strategy cache, breaker state) is unreachable
    ///
    /// Recovered locally via fallback to the authoritative store; surfaced
    /// only as a degraded-mode signal, never as a failure of `reserve`.
    #[error("backend unavailable: {backend}")]
    Unavailable {
        /// Name of the unreachable backend
        backend: String,
    },

    /// Precondition violation: empty item set, zero quantity, duplicate
    /// product ids, invalid expiry window, or an illegal state transition
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StockadeError {
    /// Convenience constructor for precondition violations
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        StockadeError::InvalidRequest(msg.into())
    }

    /// Whether the engine may retry the failed operation internally
    ///
    /// Only optimistic conflicts are retried; everything else is either
    /// surfaced to the caller or handled by a fallback path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StockadeError::Conflict { .. })
    }

    /// Whether this error is visible to callers of `reserve`
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            StockadeError::ProductNotFound(_)
                | StockadeError::ReservationNotFound(_)
                | StockadeError::InsufficientStock { .. }
                | StockadeError::LockTimeout { .. }
                | StockadeError::InvalidRequest(_)
        )
    }
}
