// =============================================================================
// Engine Root
// =============================================================================
//
// The composition root: wires the strategy registry, exchange port, risk
// engine, position book, event bus, and scheduler into one running engine.
// Fatal startup errors (bad config, unknown strategy) are returned from
// `build`; once running, failures are non-fatal and surface as events on the
// bus rather than aborting the process.
//
// The shared handles every background task clones out of (event bus,
// position book, account) are constructed once here and cloned into each
// binding's trading loop rather than each loop owning its own copy.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info};

use crate::config::{ConfigError, EngineConfig};
use crate::event_bus::{EventBus, OverflowPolicy, Subscription};
use crate::exchange::binance::BinanceExchange;
use crate::exchange::circuit_breaker::CircuitBreaker;
use crate::exchange::paper::{PaperExchange, PaperFees};
use crate::exchange::retry::RetryPolicy;
use crate::exchange::{ExchangePort, Guarded};
use crate::position_book::PositionBook;
use crate::risk::RiskEngine;
use crate::scheduler::Scheduler;
use crate::strategy::{StrategyError, StrategyRegistry};
use crate::trading_loop::TradingLoop;
use crate::types::{AccountState, Event, EventEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("strategy build failed: {0}")]
    Strategy(#[from] StrategyError),
    #[error("unsupported venue '{0}'")]
    UnsupportedVenue(String),
}

/// Either exchange adapter, type-erased behind one enum so the Engine Root
/// can hold a single homogeneous set of trading loops regardless of which
/// venue the config names.
enum Venue {
    Paper(Arc<Guarded<PaperExchange>>),
    Binance(Arc<Guarded<BinanceExchange>>),
}

pub struct Engine {
    event_bus: Arc<EventBus>,
    position_book: Arc<PositionBook>,
    scheduler: Arc<Scheduler>,
    account: Arc<RwLock<AccountState>>,
    venue: Venue,
}

impl Engine {
    /// Build the engine from validated configuration. Fails fast (before any
    /// background task is spawned) on a bad venue name or an unknown
    /// strategy referenced by a binding.
    pub fn build(config: &EngineConfig) -> Result<Self, EngineError> {
        let registry = StrategyRegistry::with_builtins();
        let bindings = config.validate_bindings(&registry)?;

        let retry = RetryPolicy::default();
        let breaker = CircuitBreaker::new(
            config.circuit_breaker_trip_threshold,
            Duration::from_secs(config.circuit_breaker_cooldown_secs),
        );

        let venue = match config.venue.as_str() {
            "paper" => Venue::Paper(Arc::new(Guarded::new(
                PaperExchange::new(config.starting_cash, PaperFees::default()),
                "paper",
                retry,
                breaker,
                config.requests_per_minute,
                config.order_rate_limit_per_minute,
            ))),
            "binance" => {
                let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
                let secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
                Venue::Binance(Arc::new(Guarded::new(
                    BinanceExchange::new(api_key, secret),
                    "binance",
                    retry,
                    breaker,
                    config.requests_per_minute,
                    config.order_rate_limit_per_minute,
                )))
            }
            other => return Err(EngineError::UnsupportedVenue(other.to_string())),
        };

        let event_bus = Arc::new(EventBus::new());
        let position_book = Arc::new(PositionBook::new());
        let account = Arc::new(RwLock::new(AccountState::new(config.starting_cash)));
        let scheduler = Arc::new(Scheduler::new(
            Scheduler::default_capacity(bindings.len()),
            Duration::from_secs(config.update_interval_secs),
        ));

        let risk_engine = Arc::new(RiskEngine::new(config.risk));

        let engine = Self { event_bus, position_book, scheduler, account, venue };
        engine.spawn_bindings(bindings, &registry, risk_engine, config)?;
        Ok(engine)
    }

    fn spawn_bindings(
        &self,
        bindings: Vec<crate::types::InstrumentBinding>,
        registry: &StrategyRegistry,
        risk_engine: Arc<RiskEngine>,
        config: &EngineConfig,
    ) -> Result<(), EngineError> {
        for binding in bindings {
            let strategy = registry.build(&binding.strategy_name, &binding.strategy_parameters)?;
            let period = binding.timeframe.duration().to_std().unwrap_or(Duration::from_secs(60));
            let jitter = Duration::from_secs(config.scheduler_jitter_secs);
            let binding_key = binding.key();
            let bar_history_limit = config.bar_history_limit;

            match &self.venue {
                Venue::Paper(exchange) => self.spawn_one(
                    binding,
                    exchange.clone(),
                    risk_engine.clone(),
                    strategy,
                    bar_history_limit,
                    period,
                    jitter,
                    binding_key,
                ),
                Venue::Binance(exchange) => self.spawn_one(
                    binding,
                    exchange.clone(),
                    risk_engine.clone(),
                    strategy,
                    bar_history_limit,
                    period,
                    jitter,
                    binding_key,
                ),
            };
        }
        Ok(())
    }

    fn spawn_one<P: ExchangePort + 'static>(
        &self,
        binding: crate::types::InstrumentBinding,
        exchange: Arc<P>,
        risk_engine: Arc<RiskEngine>,
        strategy: Box<dyn crate::strategy::Strategy>,
        bar_history_limit: usize,
        period: Duration,
        jitter: Duration,
        binding_key: String,
    ) {
        let trading_loop = TradingLoop::new(
            binding,
            exchange,
            risk_engine,
            self.position_book.clone(),
            self.event_bus.clone(),
            self.account.clone(),
            strategy,
            bar_history_limit,
        );
        // Shared behind a Mutex so the per-tick closure below can clone an
        // owned handle into each future it returns rather than borrowing
        // `trading_loop` across calls (a plain `FnMut() -> impl Future`
        // can't name a future that borrows its closure's captured state).
        let shared = Arc::new(tokio::sync::Mutex::new(trading_loop));
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .spawn_binding(binding_key, period, jitter, move || {
                    let shared = shared.clone();
                    async move {
                        shared.lock().await.tick().await;
                    }
                })
                .await;
        });
    }

    /// Start dispatching ticks. Safe to call only once; calling it again
    /// after `stop` has no effect (the scheduler is already Stopped).
    pub async fn start(&self) {
        self.scheduler.start();
        self.publish_lifecycle_event(Event::EngineStarted).await;
        info!("engine started");
    }

    /// Subscribe to engine events (observers: logging, persistence,
    /// notifications — wiring them in is out of scope here, but the
    /// subscription mechanism itself must exist for them to attach to).
    pub fn subscribe(&self, capacity: usize, policy: OverflowPolicy) -> Subscription {
        self.event_bus.subscribe(capacity, policy)
    }

    pub fn account_snapshot(&self) -> AccountState {
        *self.account.read()
    }

    /// Request a graceful shutdown: stop dispatching new ticks, wait up to
    /// `deadline` for in-flight ones to finish, then report stopped.
    pub async fn stop(&self, deadline: Duration) {
        self.scheduler.stop(deadline).await;
        self.publish_lifecycle_event(Event::EngineStopped).await;
        info!("engine stopped");
    }

    /// Surface a non-fatal runtime fault (e.g. a panic caught at the trading
    /// loop's per-tick boundary) as an event rather than crashing the
    /// process.
    pub async fn report_fault(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "engine fault");
        self.publish_lifecycle_event(Event::EngineFault { reason }).await;
    }

    async fn publish_lifecycle_event(&self, event: Event) {
        self.event_bus.publish(EventEnvelope::new(None, crate::types::new_correlation_id(), event)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BindingConfig;
    use crate::types::Timeframe;

    fn paper_config_with_binding() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.bindings.push(BindingConfig {
            symbol: "XRPUSDT".to_string(),
            timeframe: Timeframe::M1,
            strategy: "sma_crossover".to_string(),
            parameters: serde_json::Map::new(),
            fixed_quantity: None,
            max_allocation_fraction: 0.1,
            risk_overrides: None,
        });
        config
    }

    #[tokio::test]
    async fn build_fails_fast_on_unknown_strategy() {
        let mut config = paper_config_with_binding();
        config.bindings[0].strategy = "does_not_exist".to_string();
        assert!(matches!(Engine::build(&config), Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn build_fails_fast_on_unsupported_venue() {
        let mut config = paper_config_with_binding();
        config.venue = "kraken".to_string();
        assert!(matches!(Engine::build(&config), Err(EngineError::UnsupportedVenue(_))));
    }

    #[tokio::test]
    async fn start_and_stop_round_trips_without_panicking() {
        let config = paper_config_with_binding();
        let engine = Engine::build(&config).unwrap();
        let sub = engine.subscribe(16, OverflowPolicy::DropOldest);

        engine.start().await;
        let started = sub.recv().await;
        assert!(matches!(started.event, Event::EngineStarted));

        engine.stop(Duration::from_millis(200)).await;
    }
}
