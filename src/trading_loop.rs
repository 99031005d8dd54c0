// =============================================================================
// Trading Loop
// =============================================================================
//
// Per-binding, per-tick orchestration: fetch bars, maintain the position,
// consult the strategy, size and submit orders, publish events. One
// `TradingLoop` instance is owned by exactly one scheduled binding; the
// Scheduler calls `tick()` once per bar close.
//
// Each step (fetch -> indicators -> decision -> execution) is logged and
// guarded independently, parameterized per binding rather than hard-coded
// to one symbol.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, instrument};

use crate::event_bus::EventBus;
use crate::exchange::{ExchangeError, ExchangePort};
use crate::indicators::atr::calculate_atr;
use crate::position_book::{ExitTrigger, PositionBook};
use crate::risk::{RiskContext, RiskEngine, RiskOverrides};
use crate::strategy::Strategy;
use crate::types::{
    validate_bar_window, AccountState, Event, EventEnvelope, InstrumentBinding, OrderIntent, OrderReason, Side,
    SignalKind,
};

pub struct TradingLoop<P: ExchangePort> {
    binding: InstrumentBinding,
    exchange: Arc<P>,
    risk_engine: Arc<RiskEngine>,
    position_book: Arc<PositionBook>,
    event_bus: Arc<EventBus>,
    account: Arc<RwLock<AccountState>>,
    strategy: Box<dyn Strategy>,
    bar_history_limit: usize,
}

impl<P: ExchangePort> TradingLoop<P> {
    pub fn new(
        binding: InstrumentBinding,
        exchange: Arc<P>,
        risk_engine: Arc<RiskEngine>,
        position_book: Arc<PositionBook>,
        event_bus: Arc<EventBus>,
        account: Arc<RwLock<AccountState>>,
        strategy: Box<dyn Strategy>,
        bar_history_limit: usize,
    ) -> Self {
        Self {
            binding,
            exchange,
            risk_engine,
            position_book,
            event_bus,
            account,
            strategy,
            bar_history_limit,
        }
    }

    fn overrides(&self) -> Option<&RiskOverrides> {
        self.binding.risk_overrides.as_ref()
    }

    async fn publish(&self, correlation_id: &str, event: Event) {
        self.event_bus
            .publish(EventEnvelope::new(Some(self.binding.symbol.clone()), correlation_id, event))
            .await;
    }

    /// Run one tick: fetch, validate, maintain the position, decide, act.
    #[instrument(skip(self), fields(binding = %self.binding.key()))]
    pub async fn tick(&mut self) {
        let correlation_id = crate::types::new_correlation_id();

        let bars = match self
            .exchange
            .fetch_bars(&self.binding.symbol, self.binding.timeframe, self.bar_history_limit)
            .await
        {
            Ok(bars) => bars,
            Err(err) => {
                self.publish(&correlation_id, Event::OrderFailed { reason: err.to_string() }).await;
                return;
            }
        };

        if let Err(reason) = validate_bar_window(&bars) {
            self.publish(&correlation_id, Event::BarRejected { reason }).await;
            return;
        }
        self.publish(&correlation_id, Event::BarFetched { count: bars.len() }).await;

        let last_price = bars.last().expect("validated window is non-empty").close;
        let symbol = self.binding.symbol.clone();

        if self.position_book.is_open(&symbol) {
            self.position_book.mark_price(&symbol, last_price);
            self.recompute_equity();

            // A position left `Closing` by a failed exit order on a prior
            // tick is retried here with its originally recorded reason,
            // rather than falling through to trailing/price-trigger logic
            // that only applies to a still-`Open` position.
            if self.position_book.is_closing(&symbol) {
                self.retry_pending_exit(&correlation_id, last_price).await;
                self.publish(&correlation_id, Event::HeartbeatTick { summary: format!("{symbol}: exit retried") })
                    .await;
                return;
            }

            if let Some(new_stop) =
                self.position_book.update_trailing(&symbol, last_price, &self.risk_engine, self.overrides())
            {
                self.publish(&correlation_id, Event::TrailingAdjusted { position_id: symbol.clone(), new_stop })
                    .await;
            }

            if let Some(trigger) = self.position_book.evaluate_exits(&symbol, last_price) {
                self.handle_price_exit(&correlation_id, trigger, last_price).await;
                self.publish(&correlation_id, Event::HeartbeatTick { summary: format!("{symbol}: exit handled") })
                    .await;
                return;
            }
        }

        let signal = self.strategy.on_bar(&bars);
        self.publish(&correlation_id, Event::SignalGenerated { signal }).await;

        let has_position = self.position_book.is_open(&symbol);
        match (signal.kind, has_position) {
            (SignalKind::Hold, _) => {}
            (SignalKind::Sell, false) => {} // nothing to sell
            (SignalKind::Buy, true) => {}   // no pyramiding; already in a position
            (SignalKind::Sell, true) => {
                self.handle_strategy_exit(&correlation_id).await;
            }
            (SignalKind::Buy, false) => {
                self.handle_entry(&correlation_id, &bars, last_price).await;
            }
        }

        self.publish(&correlation_id, Event::HeartbeatTick { summary: format!("{symbol}: tick complete") }).await;
    }

    async fn handle_price_exit(&self, correlation_id: &str, trigger: ExitTrigger, last_price: f64) {
        let reason = match trigger {
            ExitTrigger::StopLoss => OrderReason::StopLoss,
            ExitTrigger::TakeProfit => OrderReason::TakeProfit,
        };
        self.submit_exit(correlation_id, reason, last_price).await;
        match trigger {
            ExitTrigger::StopLoss => {
                self.publish(correlation_id, Event::StopTriggered { position_id: self.binding.symbol.clone() }).await
            }
            ExitTrigger::TakeProfit => {
                self.publish(correlation_id, Event::TakeProfitTriggered { position_id: self.binding.symbol.clone() })
                    .await
            }
        }
    }

    async fn handle_strategy_exit(&self, correlation_id: &str) {
        let Some(snapshot) = self.position_book.snapshot(&self.binding.symbol) else { return };
        self.submit_exit(correlation_id, OrderReason::StrategyExit, snapshot.entry_price).await;
    }

    /// Resubmit the exit order for a position already marked `Closing` by a
    /// prior tick whose exchange call failed, using the reason recorded at
    /// the time the exit was first decided.
    async fn retry_pending_exit(&self, correlation_id: &str, reference_price: f64) {
        let symbol = &self.binding.symbol;
        let reason = self.position_book.pending_exit_reason(symbol).unwrap_or(OrderReason::Manual);
        self.submit_exit(correlation_id, reason, reference_price).await;
    }

    /// Submit an exit order for the symbol's full open quantity. A failure
    /// here is escalated, not swallowed: the position is marked Closing
    /// (recording `reason` for a retry) and stays that way until a later
    /// tick's `retry_pending_exit` succeeds, since we've already decided to
    /// exit.
    async fn submit_exit(&self, correlation_id: &str, reason: OrderReason, reference_price: f64) {
        let symbol = &self.binding.symbol;
        let Some(snapshot) = self.position_book.snapshot(symbol) else { return };

        let intent = OrderIntent { symbol: symbol.clone(), side: Side::Sell, quantity: snapshot.quantity, reason, reference_price };
        self.position_book.mark_closing(symbol, reason);
        self.publish(correlation_id, Event::OrderSubmitted { intent: intent.clone() }).await;

        match self.exchange.submit_market_order(&intent).await {
            Ok(fill) => {
                if let Some(closed) = self.position_book.close(symbol, &fill, reason) {
                    let realized_pnl = (fill.average_price - closed.entry_price) * closed.quantity;
                    self.apply_fill_to_account(&fill, Side::Sell, realized_pnl);
                    self.publish(correlation_id, Event::OrderFilled { fill: fill.clone() }).await;
                    self.publish(
                        correlation_id,
                        Event::PositionClosed {
                            position_id: symbol.clone(),
                            exit_price: fill.average_price,
                            realized_pnl,
                            reason: reason.to_string(),
                        },
                    )
                    .await;
                }
            }
            Err(err) => {
                error!(symbol = %symbol, %err, "exit order failed; position remains Closing and will retry next tick");
                self.publish(correlation_id, Event::OrderFailed { reason: err.to_string() }).await;
            }
        }
    }

    async fn handle_entry(&self, correlation_id: &str, bars: &[crate::types::Bar], last_price: f64) {
        let symbol = &self.binding.symbol;
        let atr_period = self.risk_engine.atr_period(self.overrides());
        let atr = calculate_atr(bars, atr_period);

        let ctx = RiskContext {
            account: *self.account.read(),
            bar: *bars.last().expect("non-empty"),
            atr,
            open_positions_count: self.position_book.open_positions_count(),
            aggregate_open_risk: self.position_book.aggregate_open_risk(),
            daily_realized_pnl: self.account.read().realized_pnl,
            kelly_win_probability: self.position_book.kelly_win_probability(),
            kelly_win_loss_ratio: self.position_book.kelly_win_loss_ratio(),
        };

        let sized = match self.risk_engine.evaluate_entry(self.overrides(), &ctx) {
            Ok(sized) => sized,
            Err(rejection) => {
                self.publish(correlation_id, Event::RiskRejected { reason: rejection.to_string() }).await;
                return;
            }
        };

        let intent = OrderIntent {
            symbol: symbol.clone(),
            side: Side::Buy,
            quantity: sized.quantity,
            reason: OrderReason::Entry,
            reference_price: last_price,
        };
        self.publish(correlation_id, Event::OrderSubmitted { intent: intent.clone() }).await;

        match self.exchange.submit_market_order(&intent).await {
            Ok(fill) => {
                self.position_book.open(symbol, sized, &fill);
                self.apply_fill_to_account(&fill, Side::Buy, 0.0);
                self.publish(correlation_id, Event::OrderFilled { fill: fill.clone() }).await;
                self.publish(
                    correlation_id,
                    Event::PositionOpened {
                        position_id: symbol.clone(),
                        entry_price: fill.average_price,
                        size: fill.filled_quantity,
                    },
                )
                .await;
            }
            Err(ExchangeError::Transient { .. }) | Err(ExchangeError::CircuitOpen { .. }) | Err(ExchangeError::Permanent { .. }) => {
                // An entry order failing, whatever the class, leaves state
                // unchanged: there was no position before this tick and
                // there still isn't one. Unlike an exit, there's nothing to
                // escalate to a pending state.
                self.publish(correlation_id, Event::OrderFailed { reason: "entry order submission failed".to_string() }).await;
            }
        }
    }

    /// Apply a fill's cash effect and, for an exit, its realized PnL, then
    /// recompute equity against the Position Book's current mark-to-market
    /// total. Must be called after the Position Book reflects the fill
    /// (position opened for a buy, closed for a sell) so the recomputed
    /// equity doesn't miss or double-count the position in question.
    fn apply_fill_to_account(&self, fill: &crate::types::Fill, side: Side, realized_pnl_delta: f64) {
        {
            let mut account = self.account.write();
            let notional = fill.filled_quantity * fill.average_price + fill.fees;
            match side {
                Side::Buy => account.cash_balance -= notional,
                Side::Sell => account.cash_balance += fill.filled_quantity * fill.average_price - fill.fees,
            }
            account.realized_pnl += realized_pnl_delta;
        }
        self.recompute_equity();
    }

    /// Equity = cash plus the mark-to-market value of every open position
    /// across all bindings (the Position Book is shared engine-wide), not
    /// just this binding's own symbol.
    fn recompute_equity(&self) {
        let market_value = self.position_book.open_market_value();
        let unrealized = self.position_book.unrealized_pnl();
        let mut account = self.account.write();
        account.unrealized_pnl = unrealized;
        account.equity = account.cash_balance + market_value;
    }
}
