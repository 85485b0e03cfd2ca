//! Circuit breaker over the optimistic reservation path
//!
//! Classic three-phase breaker:
//!
//! ```text
//! Closed ──[failure rate over window >= threshold, min samples met]──> Open
//!                                                                       │
//!                                                                       │ [cooldown elapsed]
//!                                                                       ▼
//!                                                                   HalfOpen
//!                                                                       │
//!                 ┌─────────────────────────────────────────────────────┤
//!                 │ [trial success]                      [trial failure] │
//!                 ▼                                                      ▼
//!              Closed (counters reset)                   Open (cooldown restarts)
//! ```
//!
//! While the breaker is Open the engine treats every item as pessimistic
//! regardless of the strategy selector's answer. HalfOpen admits exactly
//! one trial attempt at a time.
//!
//! Phase snapshots are persisted through a primary state store with an
//! authoritative fallback (same data, slower medium) so the protection is
//! never silently disabled by an infrastructure failure of the fast path.
//! If both stores fail, the breaker keeps working on its in-process state
//! and only a degraded-mode event is emitted.

use crate::events::{EventSink, ReservationEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stockade_core::{Result, StockadeError};
use tracing::debug;

/// Breaker phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    /// Requests flow normally; outcomes feed the rolling window
    Closed,
    /// Optimistic attempts suppressed until the cooldown elapses
    Open,
    /// Exactly one trial attempt admitted at a time
    HalfOpen,
}

/// What the engine should do with optimistic items right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Closed: optimistic items proceed normally
    Allow,
    /// Open (or half-open with the trial slot taken): everything pessimistic
    SuppressAll,
    /// Half-open: route exactly one item as an optimistic trial
    TrialOne,
}

/// Breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Number of most recent outcomes kept in the rolling window
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Minimum outcomes in the window before the failure rate is trusted
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Failure rate (0..=1) at or above which the breaker opens
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,
    /// How long the breaker stays open before probing recovery, in ms
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_window_size() -> usize {
    50
}
fn default_min_samples() -> usize {
    10
}
fn default_failure_rate_threshold() -> f64 {
    0.5
}
fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            min_samples: default_min_samples(),
            failure_rate_threshold: default_failure_rate_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    /// Cooldown as a Duration
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Persistence for breaker phase snapshots
///
/// Implementations may fail; the breaker falls back from the primary to
/// the authoritative store and keeps its in-process state regardless.
pub trait BreakerStateStore: Send + Sync {
    /// Persist the current phase
    fn save(&self, phase: BreakerPhase) -> Result<()>;
    /// Load the last persisted phase, if any
    fn load(&self) -> Result<Option<BreakerPhase>>;
}

/// Trivial in-process state store
#[derive(Default)]
pub struct InMemoryBreakerStore {
    phase: Mutex<Option<BreakerPhase>>,
}

impl InMemoryBreakerStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerStateStore for InMemoryBreakerStore {
    fn save(&self, phase: BreakerPhase) -> Result<()> {
        *self.phase.lock() = Some(phase);
        Ok(())
    }

    fn load(&self) -> Result<Option<BreakerPhase>> {
        Ok(*self.phase.lock())
    }
}

struct BreakerInner {
    phase: BreakerPhase,
    /// Rolling outcome window, `true` = failure
    window: VecDeque<bool>,
    failures: usize,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn record_outcome(&mut self, failure: bool, window_size: usize) {
        if self.window.len() == window_size {
            if let Some(evicted) = self.window.pop_front() {
                if evicted {
                    self.failures -= 1;
                }
            }
        }
        self.window.push_back(failure);
        if failure {
            self.failures += 1;
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures as f64 / self.window.len() as f64
        }
    }

    fn reset_window(&mut self) {
        self.window.clear();
        self.failures = 0;
    }
}

/// Rolling-window circuit breaker for optimistic reservation attempts
///
/// Passed to the engine as an explicit dependency, never reached through
/// a process-global. The reservation engine is the only mutator.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    primary: Arc<dyn BreakerStateStore>,
    fallback: Arc<dyn BreakerStateStore>,
    persistence_degraded: AtomicBool,
    sink: Arc<dyn EventSink>,
}

impl CircuitBreaker {
    /// Create a breaker with in-memory state stores
    pub fn new(config: BreakerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self::with_stores(
            config,
            Arc::new(InMemoryBreakerStore::new()),
            Arc::new(InMemoryBreakerStore::new()),
            sink,
        )
    }

    /// Create a breaker persisting through `primary`, falling back to
    /// `fallback`
    ///
    /// The phase is restored from whichever store answers first. A
    /// restored Open phase restarts its cooldown from now — the original
    /// `opened_at` did not survive the process boundary.
    pub fn with_stores(
        config: BreakerConfig,
        primary: Arc<dyn BreakerStateStore>,
        fallback: Arc<dyn BreakerStateStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let restored = primary
            .load()
            .or_else(|_| fallback.load())
            .unwrap_or(None)
            .unwrap_or(BreakerPhase::Closed);
        let opened_at = match restored {
            BreakerPhase::Open => Some(Instant::now()),
            _ => None,
        };
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerInner {
                phase: restored,
                window: VecDeque::new(),
                failures: 0,
                opened_at,
                trial_in_flight: false,
            }),
            primary,
            fallback,
            persistence_degraded: AtomicBool::new(false),
            sink,
        }
    }

    /// Current phase (observability and tests)
    pub fn phase(&self) -> BreakerPhase {
        self.inner.lock().phase
    }

    /// Decide how optimistic items should be routed right now
    ///
    /// In Open phase this also performs the cooldown-elapsed transition to
    /// HalfOpen; the caller that observes `TrialOne` owns the trial slot
    /// until it reports an outcome or cancels.
    pub fn decision(&self) -> BreakerDecision {
        let mut inner = self.inner.lock();
        match inner.phase {
            BreakerPhase::Closed => BreakerDecision::Allow,
            BreakerPhase::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown())
                    .unwrap_or(true);
                if cooled_down {
                    self.transition(&mut inner, BreakerPhase::HalfOpen);
                    inner.trial_in_flight = true;
                    BreakerDecision::TrialOne
                } else {
                    BreakerDecision::SuppressAll
                }
            }
            BreakerPhase::HalfOpen => {
                if inner.trial_in_flight {
                    BreakerDecision::SuppressAll
                } else {
                    inner.trial_in_flight = true;
                    BreakerDecision::TrialOne
                }
            }
        }
    }

    /// Return an unused trial slot
    ///
    /// Called when a reservation that was granted `TrialOne` turns out to
    /// have no optimistic-classified item to try.
    pub fn cancel_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == BreakerPhase::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Record a successful optimistic outcome
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.phase {
            BreakerPhase::Closed => {
                let window_size = self.config.window_size;
                inner.record_outcome(false, window_size);
            }
            BreakerPhase::HalfOpen => {
                // Trial succeeded: close and reset counters.
                inner.trial_in_flight = false;
                inner.reset_window();
                inner.opened_at = None;
                self.transition(&mut inner, BreakerPhase::Closed);
            }
            // A stale outcome from before the breaker opened; drop it.
            BreakerPhase::Open => {}
        }
    }

    /// Record a failed optimistic outcome
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.phase {
            BreakerPhase::Closed => {
                let window_size = self.config.window_size;
                inner.record_outcome(true, window_size);
                if inner.window.len() >= self.config.min_samples
                    && inner.failure_rate() >= self.config.failure_rate_threshold
                {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, BreakerPhase::Open);
                }
            }
            BreakerPhase::HalfOpen => {
                // Trial failed: back to Open, cooldown restarts.
                inner.trial_in_flight = false;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerPhase::Open);
            }
            BreakerPhase::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerPhase) {
        let from = inner.phase;
        if from == to {
            return;
        }
        debug!(?from, ?to, "breaker transition");
        inner.phase = to;
        self.sink
            .emit(&ReservationEvent::BreakerTransition { from, to });
        self.persist(to);
    }

    fn persist(&self, phase: BreakerPhase) {
        let result = self
            .primary
            .save(phase)
            .or_else(|_| self.fallback.save(phase));
        match result {
            Ok(()) => {
                self.persistence_degraded.store(false, Ordering::Relaxed);
            }
            Err(StockadeError::Unavailable { backend }) => {
                if !self.persistence_degraded.swap(true, Ordering::Relaxed) {
                    self.sink.emit(&ReservationEvent::DegradedMode { backend });
                }
            }
            Err(err) => {
                debug!(error = %err, "breaker state persistence failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::CapturingSink;
    use crate::events::NullSink;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            window_size: 10,
            min_samples: 4,
            failure_rate_threshold: 0.5,
            cooldown_ms: 20,
        }
    }

    fn breaker(config: BreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(config, Arc::new(NullSink))
    }

    fn drive_open(b: &CircuitBreaker) {
        for _ in 0..4 {
            b.record_failure();
        }
        assert_eq!(b.phase(), BreakerPhase::Open);
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let b = breaker(fast_config());
        assert_eq!(b.phase(), BreakerPhase::Closed);
        assert_eq!(b.decision(), BreakerDecision::Allow);
    }

    #[test]
    fn test_opens_at_threshold_with_min_samples() {
        let b = breaker(fast_config());
        // Three failures: below min_samples, stays closed.
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.phase(), BreakerPhase::Closed);
        // Fourth failure reaches min_samples with 100% failure rate.
        b.record_failure();
        assert_eq!(b.phase(), BreakerPhase::Open);
        assert_eq!(b.decision(), BreakerDecision::SuppressAll);
    }

    #[test]
    fn test_successes_keep_rate_below_threshold() {
        let b = breaker(fast_config());
        for _ in 0..6 {
            b.record_success();
        }
        for _ in 0..4 {
            b.record_failure();
        }
        // 4 failures over 10 outcomes = 0.4 < 0.5
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }

    #[test]
    fn test_window_eviction_forgets_old_outcomes() {
        let config = BreakerConfig {
            window_size: 4,
            min_samples: 4,
            failure_rate_threshold: 0.75,
            cooldown_ms: 20,
        };
        let b = breaker(config);
        b.record_failure();
        b.record_failure();
        // Four successes push both failures out of the window.
        for _ in 0..4 {
            b.record_success();
        }
        b.record_failure();
        b.record_failure();
        // Window is [S, S, F, F]: rate 0.5 < 0.75, still closed.
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        let b = breaker(fast_config());
        drive_open(&b);
        std::thread::sleep(Duration::from_millis(25));

        assert_eq!(b.decision(), BreakerDecision::TrialOne);
        assert_eq!(b.phase(), BreakerPhase::HalfOpen);
        // Second caller while the trial is in flight.
        assert_eq!(b.decision(), BreakerDecision::SuppressAll);
    }

    #[test]
    fn test_trial_success_closes_and_resets() {
        let b = breaker(fast_config());
        drive_open(&b);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(b.decision(), BreakerDecision::TrialOne);

        b.record_success();
        assert_eq!(b.phase(), BreakerPhase::Closed);

        // Counters were reset: a single failure is below min_samples.
        b.record_failure();
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }

    #[test]
    fn test_trial_failure_reopens_with_fresh_cooldown() {
        let b = breaker(fast_config());
        drive_open(&b);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(b.decision(), BreakerDecision::TrialOne);

        b.record_failure();
        assert_eq!(b.phase(), BreakerPhase::Open);
        // Cooldown restarted: immediately after, still suppressed.
        assert_eq!(b.decision(), BreakerDecision::SuppressAll);
    }

    #[test]
    fn test_cancel_trial_frees_the_slot() {
        let b = breaker(fast_config());
        drive_open(&b);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(b.decision(), BreakerDecision::TrialOne);

        b.cancel_trial();
        assert_eq!(b.decision(), BreakerDecision::TrialOne);
    }

    #[test]
    fn test_transition_events_emitted() {
        let sink = CapturingSink::default();
        let b = CircuitBreaker::new(fast_config(), Arc::new(sink.clone()));
        drive_open(&b);

        let events = sink.events();
        assert!(events.contains(&ReservationEvent::BreakerTransition {
            from: BreakerPhase::Closed,
            to: BreakerPhase::Open,
        }));
    }

    #[test]
    fn test_restore_from_fallback_store() {
        struct DeadStore;
        impl BreakerStateStore for DeadStore {
            fn save(&self, _phase: BreakerPhase) -> Result<()> {
                Err(StockadeError::Unavailable {
                    backend: "breaker-primary".to_string(),
                })
            }
            fn load(&self) -> Result<Option<BreakerPhase>> {
                Err(StockadeError::Unavailable {
                    backend: "breaker-primary".to_string(),
                })
            }
        }

        let fallback = Arc::new(InMemoryBreakerStore::new());
        fallback.save(BreakerPhase::Open).unwrap();

        let sink = CapturingSink::default();
        let b = CircuitBreaker::with_stores(
            fast_config(),
            Arc::new(DeadStore),
            fallback.clone(),
            Arc::new(sink.clone()),
        );
        // Restored Open with a fresh cooldown.
        assert_eq!(b.phase(), BreakerPhase::Open);

        // Persistence goes through the fallback; degraded mode only fires
        // when both stores are unreachable.
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(b.decision(), BreakerDecision::TrialOne);
        b.record_success();
        assert_eq!(fallback.load().unwrap(), Some(BreakerPhase::Closed));
        assert!(sink
            .events()
            .iter()
            .all(|e| !matches!(e, ReservationEvent::DegradedMode { .. })));
    }

    #[test]
    fn test_both_stores_dead_degrades_but_keeps_working() {
        struct DeadStore(&'static str);
        impl BreakerStateStore for DeadStore {
            fn save(&self, _phase: BreakerPhase) -> Result<()> {
                Err(StockadeError::Unavailable {
                    backend: self.0.to_string(),
                })
            }
            fn load(&self) -> Result<Option<BreakerPhase>> {
                Ok(None)
            }
        }

        let sink = CapturingSink::default();
        let b = CircuitBreaker::with_stores(
            fast_config(),
            Arc::new(DeadStore("breaker-primary")),
            Arc::new(DeadStore("breaker-fallback")),
            Arc::new(sink.clone()),
        );
        drive_open(&b);

        // Still opened in-process despite persistence being down.
        assert_eq!(b.phase(), BreakerPhase::Open);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, ReservationEvent::DegradedMode { .. })));
    }
}
