// =============================================================================
// Paper Exchange Adapter
// =============================================================================
//
// Synthesises fills at the latest bar close plus configurable slippage and
// fee, and maintains a simulated cash ledger. Never issues a network call;
// bars are seeded into it directly (by a backtest harness or by whatever
// feeds it live bars fetched through a separate read-only adapter).
//
// Fills instantly at the requested price, mints a synthetic order id, never
// touches the network.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use super::{ExchangeError, ExchangePort};
use crate::types::{Bar, Fill, OrderIntent, Side, Timeframe};

/// Fraction of price lost to slippage and the flat fee rate, applied the
/// same way regardless of side (buy pays slightly more, sell receives
/// slightly less).
#[derive(Debug, Clone, Copy)]
pub struct PaperFees {
    pub slippage_fraction: f64,
    pub fee_fraction: f64,
}

impl Default for PaperFees {
    fn default() -> Self {
        Self { slippage_fraction: 0.0, fee_fraction: 0.0 }
    }
}

struct Ledger {
    cash_balance: f64,
}

/// Simulated exchange backed by an in-memory bar store and cash ledger.
pub struct PaperExchange {
    bars: RwLock<HashMap<String, Vec<Bar>>>,
    fees: PaperFees,
    ledger: RwLock<Ledger>,
    /// Remaining number of `submit_market_order` calls to fail with a
    /// transient error before resuming normal fills. Test-only knob for
    /// exercising retry/quarantine paths against a deterministic failure.
    fail_next_orders: AtomicUsize,
}

impl PaperExchange {
    pub fn new(starting_cash: f64, fees: PaperFees) -> Self {
        Self {
            bars: RwLock::new(HashMap::new()),
            fees,
            ledger: RwLock::new(Ledger { cash_balance: starting_cash }),
            fail_next_orders: AtomicUsize::new(0),
        }
    }

    /// Seed or append bars for `symbol`. Later bars must be newer than
    /// whatever is already stored; the trading loop's own validation catches
    /// malformed windows downstream, so this just appends.
    pub fn push_bar(&self, symbol: &str, bar: Bar) {
        self.bars.write().entry(symbol.to_string()).or_default().push(bar);
    }

    pub fn cash_balance(&self) -> f64 {
        self.ledger.read().cash_balance
    }

    /// Fail the next `n` `submit_market_order` calls with a transient error,
    /// leaving the ledger untouched each time.
    pub fn fail_next_orders(&self, n: usize) {
        self.fail_next_orders.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExchangePort for PaperExchange {
    async fn fetch_bars(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let store = self.bars.read();
        let series = store.get(symbol).ok_or_else(|| ExchangeError::Permanent {
            message: format!("paper exchange has no bars seeded for {symbol}"),
        })?;
        let start = series.len().saturating_sub(limit);
        Ok(series[start..].to_vec())
    }

    async fn submit_market_order(&self, intent: &OrderIntent) -> Result<Fill, ExchangeError> {
        let remaining = self.fail_next_orders.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_orders.store(remaining - 1, Ordering::SeqCst);
            return Err(ExchangeError::Transient { message: "simulated transient failure".to_string() });
        }

        let last_close = {
            let store = self.bars.read();
            store
                .get(&intent.symbol)
                .and_then(|s| s.last())
                .map(|b| b.close)
                .ok_or_else(|| ExchangeError::Permanent {
                    message: format!("no bars seeded for {}", intent.symbol),
                })?
        };

        let slip = last_close * self.fees.slippage_fraction;
        let average_price = match intent.side {
            Side::Buy => last_close + slip,
            Side::Sell => last_close - slip,
        };
        let notional = average_price * intent.quantity;
        let fee = notional * self.fees.fee_fraction;

        {
            let mut ledger = self.ledger.write();
            match intent.side {
                Side::Buy => ledger.cash_balance -= notional + fee,
                Side::Sell => ledger.cash_balance += notional - fee,
            }
        }

        Ok(Fill {
            order_id: Uuid::new_v4().to_string(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            filled_quantity: intent.quantity,
            average_price,
            timestamp: chrono::Utc::now(),
            fees: fee,
        })
    }

    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.bars
            .read()
            .get(symbol)
            .and_then(|s| s.last())
            .map(|b| b.close)
            .ok_or_else(|| ExchangeError::Permanent {
                message: format!("no bars seeded for {symbol}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderReason;
    use chrono::{TimeZone, Utc};

    fn bar(close: f64) -> Bar {
        Bar {
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[tokio::test]
    async fn fetch_bars_returns_seeded_series() {
        let exchange = PaperExchange::new(1000.0, PaperFees::default());
        exchange.push_bar("XRPUSDT", bar(1.0));
        exchange.push_bar("XRPUSDT", bar(1.1));
        let bars = exchange.fetch_bars("XRPUSDT", Timeframe::M15, 10).await.unwrap();
        assert_eq!(bars.len(), 2);
    }

    #[tokio::test]
    async fn fetch_bars_unknown_symbol_is_permanent_error() {
        let exchange = PaperExchange::new(1000.0, PaperFees::default());
        let err = exchange.fetch_bars("NOPE", Timeframe::M15, 10).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn buy_fills_at_last_close_with_no_fees() {
        let exchange = PaperExchange::new(1000.0, PaperFees::default());
        exchange.push_bar("XRPUSDT", bar(2.0));
        let intent = OrderIntent {
            symbol: "XRPUSDT".to_string(),
            side: Side::Buy,
            quantity: 10.0,
            reason: OrderReason::Entry,
            reference_price: 2.0,
        };
        let fill = exchange.submit_market_order(&intent).await.unwrap();
        assert_eq!(fill.average_price, 2.0);
        assert_eq!(fill.fees, 0.0);
        assert_eq!(exchange.cash_balance(), 1000.0 - 20.0);
    }

    #[tokio::test]
    async fn buy_with_slippage_and_fee_costs_more_than_notional() {
        let fees = PaperFees { slippage_fraction: 0.001, fee_fraction: 0.001 };
        let exchange = PaperExchange::new(1000.0, fees);
        exchange.push_bar("XRPUSDT", bar(2.0));
        let intent = OrderIntent {
            symbol: "XRPUSDT".to_string(),
            side: Side::Buy,
            quantity: 10.0,
            reason: OrderReason::Entry,
            reference_price: 2.0,
        };
        let fill = exchange.submit_market_order(&intent).await.unwrap();
        assert!(fill.average_price > 2.0);
        assert!(fill.fees > 0.0);
        assert!(exchange.cash_balance() < 1000.0 - 20.0);
    }

    #[tokio::test]
    async fn sell_credits_cash_balance() {
        let exchange = PaperExchange::new(1000.0, PaperFees::default());
        exchange.push_bar("XRPUSDT", bar(2.0));
        let intent = OrderIntent {
            symbol: "XRPUSDT".to_string(),
            side: Side::Sell,
            quantity: 5.0,
            reason: OrderReason::TakeProfit,
            reference_price: 2.0,
        };
        exchange.submit_market_order(&intent).await.unwrap();
        assert_eq!(exchange.cash_balance(), 1010.0);
    }
}
