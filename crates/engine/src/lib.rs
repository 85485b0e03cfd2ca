//! Reservation engine: adaptive locking over the stock ledger
//!
//! This crate orchestrates one multi-item reservation attempt end to end:
//! the circuit breaker and strategy selector decide per-item locking, the
//! engine executes the pessimistic items under one ordered exclusive guard
//! and the optimistic items via bounded-retry compare-and-swap with a
//! correctness-preserving fallback to the pessimistic path, and the expiry
//! reaper returns stale holds to stock in the background.
//!
//! Components:
//! - [`ReservationStore`]: durable record of each hold and its lifecycle
//! - [`StrategySelector`]: cached product → strategy classification
//! - [`CircuitBreaker`]: rolling-window guard over the optimistic path
//! - [`ReservationEngine`]: `reserve` / `commit` / `release`
//! - [`ExpiryReaper`]: idempotent `run_once` sweep plus an owned interval
//!   thread
//! - [`Stockade`]: builder-wired facade over all of the above

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod breaker;
pub mod config;
pub mod engine;
pub mod events;
pub mod reaper;
pub mod selector;
pub mod store;

mod facade;

pub use breaker::{
    BreakerConfig, BreakerDecision, BreakerPhase, BreakerStateStore, CircuitBreaker,
    InMemoryBreakerStore,
};
pub use config::{ReaperConfig, RetryConfig, SelectorConfig, StockadeConfig, CONFIG_FILE_NAME};
pub use engine::{ReservationEngine, ReserveItem};
pub use events::{EventSink, NullSink, ReservationEvent, TracingSink};
pub use reaper::{ExpiryReaper, ReaperHandle, ReaperStats};
pub use selector::{ClassCache, ContentionSource, InMemoryClassCache, StrategySelector};
pub use store::ReservationStore;

pub use facade::{Stockade, StockadeBuilder};

// Re-export the foundational types so engine users need only this crate.
pub use stockade_core::{
    ContentionClass, LockStrategy, OrderId, ProductId, ReleaseReason, Reservation, ReservationId,
    ReservationState, Result, StockadeError,
};
pub use stockade_ledger::{StockGuard, StockLedger, StockSnapshot};
