//! Stock Ledger: authoritative per-product availability counters
//!
//! The ledger is the single source of truth for sellable stock and the only
//! component permitted to mutate `available_quantity`/`version`. All
//! mutation goes through its compare-and-swap or locked-decrement
//! operations; no caller reads-then-writes these fields directly.
//!
//! Two mutation protocols share the same primitive operations:
//! - **Optimistic**: `get` without locking, then `decrement_if_version`
//!   (compare-and-swap against the record's version stamp)
//! - **Pessimistic**: `acquire_exclusive` over a product set, then
//!   `decrement_locked` under the returned guard
//!
//! Locks are always acquired in ascending product-id order to prevent
//! circular-wait deadlocks between callers locking overlapping sets.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod guard;
mod store;

pub use guard::StockGuard;
pub use store::{StockLedger, StockSnapshot};
