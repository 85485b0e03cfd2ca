//! Stockade: an adaptive inventory reservation service
//!
//! Stockade prevents overselling of finite stock under concurrent demand.
//! Every reservation is a versioned hold against a per-product ledger;
//! holds commit, release, or expire, and expired stock returns to the
//! pool. Locking strategy is chosen per product: exclusive guards for
//! contended products, compare-and-swap for the long tail, with a circuit
//! breaker that suppresses the optimistic path when it keeps losing.
//!
//! ```no_run
//! use stockade::{ProductId, ReserveItem, Stockade};
//!
//! # fn main() -> stockade::Result<()> {
//! let service = Stockade::with_defaults()?;
//! let shirt = ProductId::new();
//! service.register_product(shirt, 100)?;
//!
//! let holds = service.reserve(&[ReserveItem::new(shirt, 2)], None)?;
//! let ids: Vec<_> = holds.iter().map(|h| h.id).collect();
//! service.commit(&ids)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use stockade_engine::*;
