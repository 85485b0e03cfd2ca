//! Locking strategy selection
//!
//! Maps each product to a locking strategy from its cached contention
//! classification. Lookups are batched: one cache read per call, one
//! authoritative read per miss set, never a round-trip per product.
//!
//! Safe default: with the feature disabled (the initial state, before any
//! contention data exists) every product is pessimistic. If the cache
//! backend is unreachable the whole batch falls through to the
//! authoritative source; repeated unreachability flips a process-wide
//! degraded-mode flag that is observability-only and never blocks a caller.

use crate::events::{EventSink, ReservationEvent};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stockade_core::{ContentionClass, LockStrategy, ProductId, Result};
use stockade_ledger::StockLedger;
use tracing::debug;

/// Authoritative source of contention classes
///
/// The ledger implements this directly; the classification job writes
/// through the ledger's admin surface and this trait only reads.
pub trait ContentionSource: Send + Sync {
    /// Batched read; unknown products are absent from the result
    fn contention_classes(
        &self,
        product_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, ContentionClass>>;
}

impl ContentionSource for StockLedger {
    fn contention_classes(
        &self,
        product_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, ContentionClass>> {
        StockLedger::contention_classes(self, product_ids)
    }
}

/// Cache backend over the authoritative contention classes
///
/// Allowed to fail (`Unavailable`): the selector then reads the whole
/// batch from the authoritative source instead.
pub trait ClassCache: Send + Sync {
    /// Batched cache read; misses are absent from the result
    fn get_many(&self, product_ids: &[ProductId]) -> Result<HashMap<ProductId, ContentionClass>>;
    /// Populate the cache after an authoritative read
    fn put_many(&self, entries: &HashMap<ProductId, ContentionClass>) -> Result<()>;
}

/// In-process TTL cache
pub struct InMemoryClassCache {
    entries: DashMap<ProductId, (ContentionClass, Instant)>,
    ttl: Duration,
}

impl InMemoryClassCache {
    /// Create a cache whose entries expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }
}

impl ClassCache for InMemoryClassCache {
    fn get_many(&self, product_ids: &[ProductId]) -> Result<HashMap<ProductId, ContentionClass>> {
        let now = Instant::now();
        let mut found = HashMap::new();
        for product_id in product_ids {
            if let Some(entry) = self.entries.get(product_id) {
                let (class, stored_at) = *entry;
                if now.duration_since(stored_at) < self.ttl {
                    found.insert(*product_id, class);
                }
            }
        }
        Ok(found)
    }

    fn put_many(&self, entries: &HashMap<ProductId, ContentionClass>) -> Result<()> {
        let now = Instant::now();
        for (product_id, class) in entries {
            self.entries.insert(*product_id, (*class, now));
        }
        Ok(())
    }
}

/// Maps products to locking strategies via the cached classification
pub struct StrategySelector {
    source: Arc<dyn ContentionSource>,
    cache: Arc<dyn ClassCache>,
    enabled: bool,
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
    sink: Arc<dyn EventSink>,
}

impl StrategySelector {
    /// Create a selector
    ///
    /// `enabled = false` is the required initial behavior: every product
    /// resolves to pessimistic until contention data exists.
    pub fn new(
        source: Arc<dyn ContentionSource>,
        cache: Arc<dyn ClassCache>,
        enabled: bool,
        failure_threshold: u32,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            source,
            cache,
            enabled,
            failure_threshold,
            consecutive_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            sink,
        }
    }

    /// Whether adaptive selection is enabled at all
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Process-wide degraded-mode flag (cache backend unreachable)
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Resolve strategies for a batch of products
    ///
    /// Unknown products resolve to pessimistic. Cache failures fall back
    /// transparently to the authoritative source for the whole batch.
    pub fn strategies_for(
        &self,
        product_ids: &[ProductId],
    ) -> Result<HashMap<ProductId, LockStrategy>> {
        if !self.enabled {
            return Ok(product_ids
                .iter()
                .map(|&id| (id, LockStrategy::Pessimistic))
                .collect());
        }

        let mut classes = match self.cache.get_many(product_ids) {
            Ok(cached) => {
                self.note_cache_success();
                cached
            }
            Err(err) => {
                debug!(error = %err, "strategy cache read failed, using authoritative source");
                self.note_cache_failure();
                HashMap::new()
            }
        };

        let misses: Vec<ProductId> = product_ids
            .iter()
            .copied()
            .filter(|id| !classes.contains_key(id))
            .collect();

        if !misses.is_empty() {
            let authoritative = self.source.contention_classes(&misses)?;
            if self.cache.put_many(&authoritative).is_err() {
                self.note_cache_failure();
            }
            classes.extend(authoritative);
        }

        Ok(product_ids
            .iter()
            .map(|&id| {
                let strategy = classes
                    .get(&id)
                    .map(|class| class.default_strategy())
                    .unwrap_or(LockStrategy::Pessimistic);
                (id, strategy)
            })
            .collect())
    }

    fn note_cache_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.degraded.store(false, Ordering::Relaxed);
    }

    fn note_cache_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold && !self.degraded.swap(true, Ordering::Relaxed) {
            self.sink.emit(&ReservationEvent::DegradedMode {
                backend: "strategy-cache".to_string(),
            });
        }
    }
}
