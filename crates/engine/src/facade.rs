//! Top-level service handle
//!
//! `Stockade` owns every collaborator and is the surface an embedding
//! application talks to. Construction goes through `StockadeBuilder`,
//! which wires the ledger, reservation store, selector, breaker and
//! engine from one `StockadeConfig` and lets tests swap the event sink
//! or the breaker's state stores.

use crate::breaker::{BreakerPhase, BreakerStateStore, CircuitBreaker, InMemoryBreakerStore};
use crate::config::StockadeConfig;
use crate::engine::{ReservationEngine, ReserveItem};
use crate::events::{EventSink, TracingSink};
use crate::reaper::{ExpiryReaper, ReaperHandle, ReaperStats};
use crate::selector::{ClassCache, InMemoryClassCache, StrategySelector};
use crate::store::ReservationStore;
use std::sync::Arc;
use stockade_core::{
    ContentionClass, OrderId, ProductId, ReleaseReason, Reservation, ReservationId, Result,
};
use stockade_ledger::{StockLedger, StockSnapshot};
use tracing::info;

/// Builds a [`Stockade`] from a config plus optional overrides
pub struct StockadeBuilder {
    config: StockadeConfig,
    sink: Arc<dyn EventSink>,
    cache: Option<Arc<dyn ClassCache>>,
    breaker_stores: Option<(Arc<dyn BreakerStateStore>, Arc<dyn BreakerStateStore>)>,
}

impl StockadeBuilder {
    /// Start from the given config
    pub fn new(config: StockadeConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink),
            cache: None,
            breaker_stores: None,
        }
    }

    /// Replace the event sink (tests use a capturing sink)
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the strategy class cache backend
    pub fn with_class_cache(mut self, cache: Arc<dyn ClassCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the breaker's primary and fallback state stores
    pub fn with_breaker_stores(
        mut self,
        primary: Arc<dyn BreakerStateStore>,
        fallback: Arc<dyn BreakerStateStore>,
    ) -> Self {
        self.breaker_stores = Some((primary, fallback));
        self
    }

    /// Validate the config and wire everything up
    ///
    /// # Errors
    /// `InvalidRequest` when the config fails validation.
    pub fn build(self) -> Result<Stockade> {
        self.config.validate()?;

        let ledger = Arc::new(StockLedger::new());
        let store = Arc::new(ReservationStore::new());
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemoryClassCache::new(self.config.selector.cache_ttl())));
        let selector = Arc::new(StrategySelector::new(
            ledger.clone(),
            cache,
            self.config.selector.enabled,
            self.config.selector.failure_threshold,
            self.sink.clone(),
        ));
        let breaker = match self.breaker_stores {
            Some((primary, fallback)) => Arc::new(CircuitBreaker::with_stores(
                self.config.breaker.clone(),
                primary,
                fallback,
                self.sink.clone(),
            )),
            None => Arc::new(CircuitBreaker::with_stores(
                self.config.breaker.clone(),
                Arc::new(InMemoryBreakerStore::new()),
                Arc::new(InMemoryBreakerStore::new()),
                self.sink.clone(),
            )),
        };
        let engine = ReservationEngine::new(
            ledger.clone(),
            store.clone(),
            selector.clone(),
            breaker.clone(),
            self.sink.clone(),
            self.config.retry.clone(),
            self.config.lock_timeout(),
            self.config.reservation_ttl(),
        );

        info!(
            adaptive = self.config.selector.enabled,
            ttl_ms = self.config.reservation_ttl_ms,
            "stockade initialized"
        );
        Ok(Stockade {
            config: self.config,
            ledger,
            store,
            selector,
            breaker,
            engine,
            sink: self.sink,
            reaper_handle: None,
        })
    }
}

/// The assembled reservation service
pub struct Stockade {
    config: StockadeConfig,
    ledger: Arc<StockLedger>,
    store: Arc<ReservationStore>,
    selector: Arc<StrategySelector>,
    breaker: Arc<CircuitBreaker>,
    engine: ReservationEngine,
    sink: Arc<dyn EventSink>,
    reaper_handle: Option<ReaperHandle>,
}

impl Stockade {
    /// Build with all defaults (adaptive selection off)
    pub fn with_defaults() -> Result<Self> {
        StockadeBuilder::new(StockadeConfig::default()).build()
    }

    /// Start building with explicit config
    pub fn builder(config: StockadeConfig) -> StockadeBuilder {
        StockadeBuilder::new(config)
    }

    // === Admin surface ===

    /// Register a product with its starting quantity
    pub fn register_product(&self, product_id: ProductId, initial_quantity: u64) -> Result<()> {
        self.ledger.register(product_id, initial_quantity)
    }

    /// Retire a product from new reservations
    pub fn deactivate_product(&self, product_id: ProductId) -> Result<()> {
        self.ledger.deactivate(product_id)
    }

    /// Set a product's contention classification
    pub fn set_contention_class(
        &self,
        product_id: ProductId,
        class: ContentionClass,
    ) -> Result<()> {
        self.ledger.set_contention_class(product_id, class)
    }

    /// Point-in-time stock view
    pub fn stock(&self, product_id: ProductId) -> Result<StockSnapshot> {
        self.ledger.snapshot(product_id)
    }

    // === Reservation surface ===

    /// Reserve stock for a set of items
    pub fn reserve(
        &self,
        items: &[ReserveItem],
        order_id: Option<OrderId>,
    ) -> Result<Vec<Reservation>> {
        self.engine.reserve(items, order_id)
    }

    /// Commit held reservations
    pub fn commit(&self, reservation_ids: &[ReservationId]) -> Result<()> {
        self.engine.commit(reservation_ids)
    }

    /// Release reservations, returning their stock
    pub fn release(&self, reservation_ids: &[ReservationId], reason: ReleaseReason) -> Result<()> {
        self.engine.release(reservation_ids, reason)
    }

    /// Look up a reservation by id
    pub fn reservation(&self, id: ReservationId) -> Result<Reservation> {
        self.store.get(id)
    }

    // === Background expiry ===

    /// Run one expiry pass synchronously
    pub fn run_reaper_once(&self) -> ReaperStats {
        self.reaper().run_once()
    }

    /// Start the background reaper thread at the configured interval
    ///
    /// Idempotent: a second call while running is a no-op. The thread is
    /// stopped when the service drops or [`stop_reaper`](Self::stop_reaper)
    /// is called.
    pub fn start_reaper(&mut self) {
        if self.reaper_handle.is_none() {
            self.reaper_handle = Some(ReaperHandle::spawn(
                self.reaper(),
                self.config.reaper.interval(),
            ));
        }
    }

    /// Stop the background reaper thread if running
    pub fn stop_reaper(&mut self) {
        if let Some(mut handle) = self.reaper_handle.take() {
            handle.stop();
        }
    }

    fn reaper(&self) -> ExpiryReaper {
        ExpiryReaper::new(self.store.clone(), self.ledger.clone(), self.sink.clone())
    }

    // === Introspection ===

    /// Current breaker phase
    pub fn breaker_phase(&self) -> BreakerPhase {
        self.breaker.phase()
    }

    /// Whether the strategy cache backend is degraded
    pub fn selector_degraded(&self) -> bool {
        self.selector.is_degraded()
    }

    /// The config this service was built with
    pub fn config(&self) -> &StockadeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockade_core::{LockStrategy, ReservationState};

    #[test]
    fn test_defaults_build_and_reserve() {
        let service = Stockade::with_defaults().unwrap();
        let p = ProductId::new();
        service.register_product(p, 10).unwrap();

        let holds = service.reserve(&[ReserveItem::new(p, 3)], None).unwrap();
        assert_eq!(holds.len(), 1);
        // Adaptive selection defaults off.
        assert_eq!(holds[0].strategy_used, LockStrategy::Pessimistic);
        assert_eq!(service.stock(p).unwrap().available, 7);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = StockadeConfig::default();
        config.reservation_ttl_ms = 0;
        assert!(Stockade::builder(config).build().is_err());
    }

    #[test]
    fn test_full_lifecycle_through_facade() {
        let service = Stockade::with_defaults().unwrap();
        let p = ProductId::new();
        service.register_product(p, 5).unwrap();

        let order = OrderId::new();
        let holds = service
            .reserve(&[ReserveItem::new(p, 2)], Some(order))
            .unwrap();
        let ids: Vec<ReservationId> = holds.iter().map(|r| r.id).collect();
        service.commit(&ids).unwrap();

        let committed = service.reservation(ids[0]).unwrap();
        assert_eq!(committed.state, ReservationState::Committed);
        assert_eq!(committed.order_id, Some(order));
        assert_eq!(service.stock(p).unwrap().available, 3);
    }

    #[test]
    fn test_reaper_runs_through_facade() {
        let mut config = StockadeConfig::default();
        config.reservation_ttl_ms = 1;
        let service = Stockade::builder(config).build().unwrap();
        let p = ProductId::new();
        service.register_product(p, 5).unwrap();

        service.reserve(&[ReserveItem::new(p, 4)], None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));

        let stats = service.run_reaper_once();
        assert_eq!(stats.released, 1);
        assert_eq!(service.stock(p).unwrap().available, 5);
    }

    #[test]
    fn test_deactivated_product_not_reservable() {
        let service = Stockade::with_defaults().unwrap();
        let p = ProductId::new();
        service.register_product(p, 5).unwrap();
        service.deactivate_product(p).unwrap();

        assert!(matches!(
            service.reserve(&[ReserveItem::new(p, 1)], None),
            Err(stockade_core::StockadeError::ProductNotFound(_))
        ));
    }
}
