//! Core types for the stockade reservation service
//!
//! This crate defines the foundational types used throughout the system:
//! - ProductId / ReservationId / OrderId: identifier newtypes
//! - ContentionClass / LockStrategy: adaptive locking vocabulary
//! - Reservation: the inventory-hold record and its lifecycle states
//! - Error: the error taxonomy shared by every component

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod reservation;
pub mod types;

pub use error::{Result, StockadeError};
pub use reservation::{Reservation, ReservationState, ReleaseReason};
pub use types::{ContentionClass, LockStrategy, OrderId, ProductId, ReservationId};
