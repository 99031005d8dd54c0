// =============================================================================
// Exchange Port
// =============================================================================
//
// The single seam between the trading loop and the outside world. Every venue
// adapter (paper, Binance) implements `ExchangePort`; retry, circuit-breaking,
// and rate-limiting are applied uniformly around any adapter by `Guarded`
// rather than duplicated inside each adapter.

pub mod binance;
pub mod circuit_breaker;
pub mod paper;
pub mod rate_limit;
pub mod retry;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::types::{Bar, Fill, OrderIntent, Timeframe};
use circuit_breaker::CircuitBreaker;
use rate_limit::RateLimiter;
use retry::RetryPolicy;

/// The two error classes the engine's retry/circuit-breaker logic switches
/// on, per the Exchange Port contract.
#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("transient exchange error: {message}")]
    Transient { message: String },
    #[error("permanent exchange error: {message}")]
    Permanent { message: String },
    #[error("circuit open for venue {venue}")]
    CircuitOpen { venue: String },
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient { .. })
    }
}

/// Capabilities any exchange adapter must provide, paper or live.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Fetch the last `limit` closed bars for `symbol` at `timeframe`, ordered
    /// oldest to newest.
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError>;

    /// Submit a market order and block until it is filled or rejected.
    async fn submit_market_order(&self, intent: &OrderIntent) -> Result<Fill, ExchangeError>;

    /// Best-effort last traded price; monotonic per the venue's feed.
    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError>;

    /// Remote position size for reconciliation, if the venue exposes one.
    async fn get_remote_position(&self, _symbol: &str) -> Result<Option<f64>, ExchangeError> {
        Ok(None)
    }
}

/// Wraps any `ExchangePort` with retry, circuit-breaking, and rate-limiting,
/// applied uniformly regardless of which venue sits underneath.
pub struct Guarded<P: ExchangePort> {
    inner: P,
    venue: String,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    request_limiter: RateLimiter,
    order_limiter: RateLimiter,
}

impl<P: ExchangePort> Guarded<P> {
    pub fn new(
        inner: P,
        venue: impl Into<String>,
        retry: RetryPolicy,
        breaker: CircuitBreaker,
        requests_per_minute: u32,
        order_rate_limit: u32,
    ) -> Self {
        Self {
            inner,
            venue: venue.into(),
            retry,
            breaker,
            request_limiter: RateLimiter::per_minute(requests_per_minute),
            order_limiter: RateLimiter::per_minute(order_rate_limit),
        }
    }

    async fn guard_call<F, Fut, T>(&self, limiter: &RateLimiter, op_name: &str, call: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        if !self.breaker.allow_request() {
            return Err(ExchangeError::CircuitOpen {
                venue: self.venue.clone(),
            });
        }

        limiter.acquire().await;

        let result = self
            .retry
            .run(|| call())
            .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.is_transient() => {
                self.breaker.record_failure();
                warn!(venue = %self.venue, op = op_name, "exchange call exhausted retries");
            }
            Err(_) => {
                // Permanent errors don't count against the transient-failure
                // trip counter, but auth failures still warrant operator
                // visibility via the returned error.
            }
        }

        result
    }
}

#[async_trait]
impl<P: ExchangePort> ExchangePort for Guarded<P> {
    #[instrument(skip(self), name = "exchange::fetch_bars")]
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError> {
        self.guard_call(&self.request_limiter, "fetch_bars", || {
            self.inner.fetch_bars(symbol, timeframe, limit)
        })
        .await
    }

    #[instrument(skip(self, intent), name = "exchange::submit_market_order")]
    async fn submit_market_order(&self, intent: &OrderIntent) -> Result<Fill, ExchangeError> {
        self.guard_call(&self.order_limiter, "submit_market_order", || {
            self.inner.submit_market_order(intent)
        })
        .await
    }

    #[instrument(skip(self), name = "exchange::current_price")]
    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.guard_call(&self.request_limiter, "current_price", || {
            self.inner.current_price(symbol)
        })
        .await
    }

    async fn get_remote_position(&self, symbol: &str) -> Result<Option<f64>, ExchangeError> {
        self.guard_call(&self.request_limiter, "get_remote_position", || {
            self.inner.get_remote_position(symbol)
        })
        .await
    }
}
