//! Property tests for the stock ledger
//!
//! These verify the ledger's core invariants over arbitrary operation
//! sequences:
//!
//! 1. `available_quantity` never goes negative (decrements that would
//!    undershoot are rejected without mutating)
//! 2. `version` is strictly monotonic: every successful mutation bumps it
//!    by exactly one, failed operations leave it untouched
//! 3. Conservation: available always equals initial - decremented + incremented

use proptest::prelude::*;
use std::time::Duration;
use stockade_core::ProductId;
use stockade_ledger::StockLedger;

/// One step in a generated operation sequence
#[derive(Debug, Clone)]
enum Op {
    /// CAS decrement using the current version (always version-valid)
    CasDecrement(u64),
    /// CAS decrement with a deliberately stale version
    StaleCasDecrement(u64),
    /// Locked decrement under a fresh exclusive guard
    LockedDecrement(u64),
    /// Return stock
    Increment(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..20).prop_map(Op::CasDecrement),
        (1u64..20).prop_map(Op::StaleCasDecrement),
        (1u64..20).prop_map(Op::LockedDecrement),
        (1u64..20).prop_map(Op::Increment),
    ]
}

proptest! {
    #[test]
    fn ledger_invariants_hold(
        initial in 0u64..200,
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let ledger = StockLedger::new();
        let product = ProductId::new();
        ledger.register(product, initial).unwrap();

        let mut expected_available = initial;
        let mut expected_version = 0u64;

        for op in ops {
            let (_, version_before) = ledger.get(product).unwrap();
            prop_assert_eq!(version_before, expected_version);

            let succeeded = match op {
                Op::CasDecrement(qty) => {
                    match ledger.decrement_if_version(product, qty, version_before) {
                        Ok(_) => {
                            expected_available -= qty;
                            true
                        }
                        Err(_) => {
                            // Only insufficient stock can fail here.
                            prop_assert!(qty > expected_available);
                            false
                        }
                    }
                }
                Op::StaleCasDecrement(qty) => {
                    // A stale version must always be rejected without mutation,
                    // except at version 0 where "stale" equals current.
                    if version_before == 0 {
                        match ledger.decrement_if_version(product, qty, 0) {
                            Ok(_) => {
                                expected_available -= qty;
                                true
                            }
                            Err(_) => false,
                        }
                    } else {
                        prop_assert!(ledger
                            .decrement_if_version(product, qty, version_before - 1)
                            .is_err());
                        false
                    }
                }
                Op::LockedDecrement(qty) => {
                    let guard = ledger
                        .acquire_exclusive(&[product], Duration::from_millis(100))
                        .unwrap();
                    match ledger.decrement_locked(&guard, product, qty) {
                        Ok(_) => {
                            expected_available -= qty;
                            true
                        }
                        Err(_) => {
                            prop_assert!(qty > expected_available);
                            false
                        }
                    }
                }
                Op::Increment(qty) => {
                    ledger.increment(product, qty).unwrap();
                    expected_available += qty;
                    true
                }
            };

            if succeeded {
                expected_version += 1;
            }

            let (available, version) = ledger.get(product).unwrap();
            prop_assert_eq!(available, expected_available);
            prop_assert_eq!(version, expected_version);
        }
    }
}
