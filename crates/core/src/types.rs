//! Identifier and classification types
//!
//! This module defines the identifier newtypes:
//! - ProductId: identifies a stock record in the ledger
//! - ReservationId: identifies an inventory hold
//! - OrderId: caller-supplied order reference, linked after reservation
//!
//! plus the adaptive-locking vocabulary (ContentionClass, LockStrategy).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a product's stock record
///
/// A ProductId is a wrapper around a UUID v4. ProductIds are ordered
/// (byte order of the underlying UUID) because the exclusive-locking
/// protocol acquires product locks in ascending id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(Uuid);

impl ProductId {
    /// Create a new random ProductId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a ProductId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse a ProductId from a string representation
    ///
    /// Accepts standard UUID format (with or without hyphens).
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this ProductId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ProductId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a reservation (inventory hold)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Create a new random ReservationId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a ReservationId from a string representation
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this ReservationId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied order identifier
///
/// The reservation core never creates orders; it only links reservations
/// to an order id the caller provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Create a new random OrderId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an OrderId from a string representation
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Offline classification of a product's expected concurrent demand
///
/// Written by an out-of-band classification job; the reservation path
/// only reads it. Drives the default locking strategy for a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionClass {
    /// Frequent concurrent demand (flash sales, scarce items)
    High,
    /// Normal demand
    Standard,
    /// Rarely contended
    Low,
}

impl ContentionClass {
    /// Default locking strategy for this class
    ///
    /// High contention serializes through exclusive locks; everything else
    /// is optimistic by default.
    pub fn default_strategy(&self) -> LockStrategy {
        match self {
            ContentionClass::High => LockStrategy::Pessimistic,
            ContentionClass::Standard | ContentionClass::Low => LockStrategy::Optimistic,
        }
    }
}

impl fmt::Display for ContentionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentionClass::High => write!(f, "high"),
            ContentionClass::Standard => write!(f, "standard"),
            ContentionClass::Low => write!(f, "low"),
        }
    }
}

/// Locking strategy used for a single reserved item
///
/// Recorded on each reservation for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// Exclusive lock held across read-validate-decrement
    Pessimistic,
    /// Lock-free read, version-checked compare-and-swap decrement
    Optimistic,
}

impl fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStrategy::Pessimistic => write!(f, "pessimistic"),
            LockStrategy::Optimistic => write!(f, "optimistic"),
        }
    }
}
