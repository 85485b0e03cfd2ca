//! Observability events
//!
//! The engine emits structured events at the boundary with the (excluded)
//! monitoring stack: breaker phase transitions, optimistic fallbacks, lock
//! timeouts, degraded-mode flips, and reaper pass summaries. Format and
//! transport are the sink implementor's concern; the default sink logs
//! through `tracing`.

use crate::breaker::BreakerPhase;
use serde::Serialize;
use stockade_core::{ProductId, ReleaseReason};
use tracing::{info, warn};

/// Structured event emitted by the reservation core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReservationEvent {
    /// The circuit breaker changed phase
    BreakerTransition {
        /// Phase before the transition
        from: BreakerPhase,
        /// Phase after the transition
        to: BreakerPhase,
    },
    /// Optimistic retries were exhausted and the items fell back to the
    /// pessimistic path
    OptimisticFallback {
        /// Products that fell back
        products: Vec<ProductId>,
        /// Attempts made before giving up
        attempts: usize,
    },
    /// A pessimistic guard acquisition timed out
    LockTimeout {
        /// Product whose lock could not be acquired
        product_id: ProductId,
    },
    /// A backing store became unreachable and a fallback took over
    DegradedMode {
        /// Name of the unreachable backend
        backend: String,
    },
    /// A reservation batch was released
    Released {
        /// Number of reservations released
        count: usize,
        /// Why they were released
        reason: ReleaseReason,
    },
    /// Summary of one expiry reaper pass
    ReaperPass {
        /// Held reservations found past their time-to-live
        expired: usize,
        /// Reservations actually released (stock returned)
        released: usize,
    },
}

/// Sink for reservation events
///
/// Implementations must be cheap and non-blocking; the engine emits from
/// hot paths. Transport to an external monitoring system is out of scope.
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn emit(&self, event: &ReservationEvent);
}

/// Default sink: structured logging via `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ReservationEvent) {
        match event {
            ReservationEvent::BreakerTransition { from, to } => {
                warn!(?from, ?to, "circuit breaker phase transition");
            }
            ReservationEvent::OptimisticFallback { products, attempts } => {
                warn!(
                    products = products.len(),
                    attempts, "optimistic retries exhausted, falling back to pessimistic path"
                );
            }
            ReservationEvent::LockTimeout { product_id } => {
                warn!(product = %product_id, "exclusive lock acquisition timed out");
            }
            ReservationEvent::DegradedMode { backend } => {
                warn!(backend = %backend, "backend unreachable, running degraded");
            }
            ReservationEvent::Released { count, reason } => {
                info!(count, reason = %reason, "reservations released");
            }
            ReservationEvent::ReaperPass { expired, released } => {
                info!(expired, released, "expiry reaper pass complete");
            }
        }
    }
}

/// Sink that discards every event, for tests and benchmarks
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &ReservationEvent) {}
}
