//! Expiry reaper
//!
//! Holds carry a TTL. The reaper scans for holds whose deadline has
//! passed, marks them expired, then releases them so their stock returns
//! to the ledger. Both transitions are idempotent row-level updates, so a
//! pass that dies halfway leaves rows a later pass finishes.
//!
//! `ExpiryReaper::run_once` is the whole algorithm and is directly
//! testable; `ReaperHandle` wraps it in an owned background thread with a
//! stop flag and a condvar so shutdown does not wait out the interval.

use crate::events::{EventSink, ReservationEvent};
use crate::store::ReservationStore;
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use stockade_ledger::StockLedger;
use tracing::{debug, error, info};

/// Outcome of one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    /// Candidate holds whose deadline had passed
    pub scanned: usize,
    /// Holds newly transitioned to expired this pass
    pub expired: usize,
    /// Holds released and returned to the ledger this pass
    pub released: usize,
}

/// Scans for past-deadline holds and returns their stock
pub struct ExpiryReaper {
    store: Arc<ReservationStore>,
    ledger: Arc<StockLedger>,
    sink: Arc<dyn EventSink>,
}

impl ExpiryReaper {
    /// Create a reaper over the given store and ledger
    pub fn new(
        store: Arc<ReservationStore>,
        ledger: Arc<StockLedger>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            ledger,
            sink,
        }
    }

    /// Run one full pass at the current time
    pub fn run_once(&self) -> ReaperStats {
        self.run_at(Utc::now())
    }

    /// Run one full pass as-of an explicit instant
    ///
    /// Candidates include rows already marked expired by an earlier
    /// interrupted pass; those skip the first transition and go straight
    /// to release.
    pub fn run_at(&self, now: chrono::DateTime<chrono::Utc>) -> ReaperStats {
        let candidates = self.store.expired_candidates(now);
        let mut stats = ReaperStats {
            scanned: candidates.len(),
            ..ReaperStats::default()
        };

        for id in candidates {
            match self.store.mark_expired(id, now) {
                Ok(true) => stats.expired += 1,
                Ok(false) => {}
                Err(err) => {
                    // Raced with a commit or release; the row is settled.
                    debug!(reservation = %id, error = %err, "skipping settled hold");
                    continue;
                }
            }
            match self.store.mark_released(id, now) {
                Ok(Some((product_id, quantity))) => {
                    if let Err(err) = self.ledger.increment(product_id, quantity) {
                        error!(
                            reservation = %id,
                            product = %product_id,
                            error = %err,
                            "reaper increment failed"
                        );
                        continue;
                    }
                    stats.released += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(reservation = %id, error = %err, "skipping settled hold");
                }
            }
        }

        if stats.scanned > 0 {
            self.sink.emit(&ReservationEvent::ReaperPass {
                expired: stats.expired,
                released: stats.released,
            });
        }
        stats
    }
}

/// Shared between the handle and the background thread
struct ReaperShared {
    stop: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

/// Owned background reaper thread
///
/// Dropping the handle stops the thread promptly; the condvar cuts the
/// interval sleep short instead of waiting it out.
pub struct ReaperHandle {
    shared: Arc<ReaperShared>,
    thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Spawn a background thread running a pass every `interval`
    pub fn spawn(reaper: ExpiryReaper, interval: Duration) -> Self {
        let shared = Arc::new(ReaperShared {
            stop: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("stockade-reaper".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "reaper started");
                loop {
                    {
                        let mut guard = thread_shared.wake_lock.lock();
                        if !thread_shared.stop.load(Ordering::Acquire) {
                            let _ = thread_shared.wake.wait_for(&mut guard, interval);
                        }
                    }
                    if thread_shared.stop.load(Ordering::Acquire) {
                        break;
                    }
                    let stats = reaper.run_once();
                    if stats.released > 0 {
                        debug!(
                            expired = stats.expired,
                            released = stats.released,
                            "reaper pass released holds"
                        );
                    }
                }
                info!("reaper stopped");
            });
        // Builder::spawn only fails when the OS cannot create a thread;
        // record the handle if it exists and carry on otherwise.
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "failed to spawn reaper thread");
                None
            }
        };
        Self { shared, thread }
    }

    /// Signal the thread to stop and wait for it to exit
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        {
            let _guard = self.shared.wake_lock.lock();
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("reaper thread panicked");
            }
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::CapturingSink;
    use chrono::Duration as ChronoDuration;
    use stockade_core::{LockStrategy, ProductId, Reservation, ReservationState};

    fn setup() -> (Arc<ReservationStore>, Arc<StockLedger>, CapturingSink, ExpiryReaper) {
        let sink = CapturingSink::default();
        let store = Arc::new(ReservationStore::new());
        let ledger = Arc::new(StockLedger::new());
        let reaper = ExpiryReaper::new(store.clone(), ledger.clone(), Arc::new(sink.clone()));
        (store, ledger, sink, reaper)
    }

    fn held(
        store: &ReservationStore,
        ledger: &StockLedger,
        product_id: ProductId,
        quantity: u64,
        ttl_secs: i64,
    ) -> stockade_core::ReservationId {
        let now = Utc::now();
        let row = Reservation::new(
            product_id,
            quantity,
            LockStrategy::Pessimistic,
            now,
            now + ChronoDuration::seconds(ttl_secs),
        )
        .unwrap();
        let (_, version) = ledger.get(product_id).unwrap();
        ledger.decrement_if_version(product_id, quantity, version).unwrap();
        store.insert(row)
    }

    #[test]
    fn test_expired_hold_restores_stock() {
        let (store, ledger, sink, reaper) = setup();
        let p = ProductId::new();
        ledger.register(p, 10).unwrap();
        let id = held(&store, &ledger, p, 4, 60);
        assert_eq!(ledger.get(p).unwrap().0, 6);

        // A pass "one day later" reaps the hold.
        let stats = reaper.run_at(Utc::now() + ChronoDuration::days(1));
        assert_eq!(stats, ReaperStats { scanned: 1, expired: 1, released: 1 });
        assert_eq!(store.get(id).unwrap().state, ReservationState::Released);
        assert_eq!(ledger.get(p).unwrap().0, 10);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, ReservationEvent::ReaperPass { released: 1, .. })));
    }

    #[test]
    fn test_unexpired_holds_left_alone() {
        let (store, ledger, _sink, reaper) = setup();
        let p = ProductId::new();
        ledger.register(p, 10).unwrap();
        held(&store, &ledger, p, 4, 3600);

        let stats = reaper.run_once();
        assert_eq!(stats, ReaperStats::default());
        assert_eq!(store.count_in_state(ReservationState::Held), 1);
        assert_eq!(ledger.get(p).unwrap().0, 6);
    }

    #[test]
    fn test_committed_holds_never_reaped() {
        let (store, ledger, _sink, reaper) = setup();
        let p = ProductId::new();
        ledger.register(p, 10).unwrap();
        let id = held(&store, &ledger, p, 4, 60);
        store.mark_committed(id, Utc::now()).unwrap();

        let stats = reaper.run_at(Utc::now() + ChronoDuration::days(1));
        assert_eq!(stats.released, 0);
        assert_eq!(store.get(id).unwrap().state, ReservationState::Committed);
        assert_eq!(ledger.get(p).unwrap().0, 6);
    }

    #[test]
    fn test_second_pass_is_a_noop() {
        let (store, ledger, _sink, reaper) = setup();
        let p = ProductId::new();
        ledger.register(p, 10).unwrap();
        held(&store, &ledger, p, 4, 60);

        let later = Utc::now() + ChronoDuration::days(1);
        let first = reaper.run_at(later);
        assert_eq!(first.released, 1);
        // Idempotent: the stock is not returned twice.
        let second = reaper.run_at(later);
        assert_eq!(second.released, 0);
        assert_eq!(ledger.get(p).unwrap().0, 10);
    }

    #[test]
    fn test_interrupted_pass_finishes_later() {
        let (store, ledger, _sink, reaper) = setup();
        let p = ProductId::new();
        ledger.register(p, 10).unwrap();
        let id = held(&store, &ledger, p, 4, 60);

        // Simulate a pass that marked the row expired and then died.
        let later = Utc::now() + ChronoDuration::days(1);
        assert!(store.mark_expired(id, later).unwrap());
        assert_eq!(ledger.get(p).unwrap().0, 6);

        let stats = reaper.run_at(later);
        assert_eq!(stats.released, 1);
        assert_eq!(ledger.get(p).unwrap().0, 10);
    }

    #[test]
    fn test_background_thread_reaps_and_stops() {
        let (store, ledger, _sink, reaper) = setup();
        let p = ProductId::new();
        ledger.register(p, 10).unwrap();
        // Already expired when inserted.
        let now = Utc::now();
        let row = Reservation::new(
            p,
            4,
            LockStrategy::Pessimistic,
            now - ChronoDuration::seconds(120),
            now - ChronoDuration::seconds(60),
        )
        .unwrap();
        let (_, version) = ledger.get(p).unwrap();
        ledger.decrement_if_version(p, 4, version).unwrap();
        store.insert(row);

        let mut handle = ReaperHandle::spawn(reaper, Duration::from_millis(10));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ledger.get(p).unwrap().0 != 10 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert_eq!(ledger.get(p).unwrap().0, 10);
        assert_eq!(store.count_in_state(ReservationState::Released), 1);
    }
}
