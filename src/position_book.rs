// =============================================================================
// Position Book
// =============================================================================
//
// Single source of truth for open positions, keyed by symbol. Owns the
// CREATED -> OPEN -> CLOSING -> CLOSED state machine, evaluates stop-loss /
// take-profit exits in priority order, and advances the trailing-stop state
// machine each tick by delegating the rule to the Risk Engine.
//
// Backed by a `parking_lot::RwLock`-guarded map with a single writer per
// symbol, extended here with the richer position lifecycle and
// trailing-stop bookkeeping.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::risk::{RiskEngine, RiskOverrides, SizedEntry, TrailingState};
use crate::types::{Fill, OrderReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Created,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub trailing_state: TrailingState,
    pub peak_price: f64,
    pub status: PositionStatus,
    pub opened_at: chrono::DateTime<chrono::Utc>,
    /// Last price observed for this symbol, used to mark-to-market the
    /// account's equity and unrealized PnL between fills.
    pub last_mark_price: f64,
    /// Set when an exit order is submitted (`mark_closing`) so a failed exit
    /// can be resubmitted with the same reason on a later tick instead of
    /// being lost when the position falls back to `Closing` with no memory
    /// of why.
    pub pending_exit_reason: Option<OrderReason>,
}

impl Position {
    fn invariants_hold(&self) -> bool {
        (self.status != PositionStatus::Open || self.quantity > 0.0)
            && self.stop_loss < self.entry_price
            && self.entry_price < self.target
            && (self.trailing_state == TrailingState::Inactive || self.peak_price >= self.entry_price)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PositionSnapshot {
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target: f64,
}

/// Priority order for exit evaluation: stop-loss beats take-profit beats a
/// strategy-originated SELL signal (the strategy SELL branch is handled by
/// the trading loop, not here — this only covers price-triggered exits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
}

struct TradeOutcome {
    won: bool,
    win_loss_ratio_component: Option<f64>,
}

const TRADE_HISTORY_WINDOW: usize = 50;

pub struct PositionBook {
    positions: RwLock<HashMap<String, Position>>,
    trade_history: RwLock<VecDeque<TradeOutcome>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self { positions: RwLock::new(HashMap::new()), trade_history: RwLock::new(VecDeque::new()) }
    }

    pub fn is_open(&self, symbol: &str) -> bool {
        self.positions
            .read()
            .get(symbol)
            .map(|p| matches!(p.status, PositionStatus::Open | PositionStatus::Closing))
            .unwrap_or(false)
    }

    pub fn snapshot(&self, symbol: &str) -> Option<PositionSnapshot> {
        self.positions.read().get(symbol).map(|p| PositionSnapshot {
            quantity: p.quantity,
            entry_price: p.entry_price,
            stop_loss: p.stop_loss,
            target: p.target,
        })
    }

    pub fn open_positions_count(&self) -> usize {
        self.positions.read().values().filter(|p| p.status == PositionStatus::Open).count()
    }

    pub fn aggregate_open_risk(&self) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .map(|p| p.quantity * (p.entry_price - p.stop_loss).max(0.0))
            .sum()
    }

    /// True if the symbol has a position in `Closing` — an exit order has
    /// been submitted but isn't confirmed filled yet.
    pub fn is_closing(&self, symbol: &str) -> bool {
        self.positions.read().get(symbol).map(|p| p.status == PositionStatus::Closing).unwrap_or(false)
    }

    /// The reason recorded for a symbol's pending exit, if any.
    pub fn pending_exit_reason(&self, symbol: &str) -> Option<OrderReason> {
        self.positions.read().get(symbol).and_then(|p| p.pending_exit_reason)
    }

    /// Record the latest observed price for a symbol's open or closing
    /// position, for mark-to-market accounting. No-op if the symbol has no
    /// tracked position.
    pub fn mark_price(&self, symbol: &str, price: f64) {
        if let Some(position) = self.positions.write().get_mut(symbol) {
            if matches!(position.status, PositionStatus::Open | PositionStatus::Closing) {
                position.last_mark_price = price;
            }
        }
    }

    /// Sum of `quantity * last_mark_price` across open/closing positions —
    /// the market value backing `AccountState.equity` alongside cash.
    pub fn open_market_value(&self) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| matches!(p.status, PositionStatus::Open | PositionStatus::Closing))
            .map(|p| p.quantity * p.last_mark_price)
            .sum()
    }

    /// Sum of unrealized PnL across open/closing positions, mirroring
    /// `open_market_value`'s selection.
    pub fn unrealized_pnl(&self) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| matches!(p.status, PositionStatus::Open | PositionStatus::Closing))
            .map(|p| p.quantity * (p.last_mark_price - p.entry_price))
            .sum()
    }

    /// Rolling win probability from the last [`TRADE_HISTORY_WINDOW`] closed
    /// trades, for the Kelly sizing method. `None` until at least one trade
    /// has closed.
    pub fn kelly_win_probability(&self) -> Option<f64> {
        let history = self.trade_history.read();
        if history.is_empty() {
            return None;
        }
        let wins = history.iter().filter(|t| t.won).count();
        Some(wins as f64 / history.len() as f64)
    }

    pub fn kelly_win_loss_ratio(&self) -> Option<f64> {
        let history = self.trade_history.read();
        let ratios: Vec<f64> = history.iter().filter_map(|t| t.win_loss_ratio_component).collect();
        if ratios.is_empty() {
            return None;
        }
        Some(ratios.iter().sum::<f64>() / ratios.len() as f64)
    }

    /// Open a new position from a sized, risk-approved entry and its fill.
    /// Panics (a programmer error, caught by the trading loop's per-tick
    /// panic boundary) if a position is already open for the symbol.
    pub fn open(&self, symbol: &str, sized: SizedEntry, fill: &Fill) {
        let position = Position {
            symbol: symbol.to_string(),
            quantity: fill.filled_quantity,
            entry_price: fill.average_price,
            stop_loss: sized.stop_loss,
            target: sized.target,
            trailing_state: TrailingState::Inactive,
            peak_price: fill.average_price,
            status: PositionStatus::Open,
            opened_at: fill.timestamp,
            last_mark_price: fill.average_price,
            pending_exit_reason: None,
        };
        debug_assert!(position.invariants_hold(), "position invariants violated on open");
        self.positions.write().insert(symbol.to_string(), position);
    }

    /// Check whether the current price has triggered a stop-loss or
    /// take-profit exit, stop-loss taking priority.
    pub fn evaluate_exits(&self, symbol: &str, last_price: f64) -> Option<ExitTrigger> {
        let positions = self.positions.read();
        let position = positions.get(symbol)?;
        if position.status != PositionStatus::Open {
            return None;
        }
        if last_price <= position.stop_loss {
            Some(ExitTrigger::StopLoss)
        } else if last_price >= position.target {
            Some(ExitTrigger::TakeProfit)
        } else {
            None
        }
    }

    /// Advance the trailing-stop state machine for one tick. Returns the new
    /// stop-loss if it moved, so the caller can emit a `TrailingAdjusted`
    /// event.
    pub fn update_trailing(
        &self,
        symbol: &str,
        last_price: f64,
        risk_engine: &RiskEngine,
        overrides: Option<&RiskOverrides>,
    ) -> Option<f64> {
        let mut positions = self.positions.write();
        let position = positions.get_mut(symbol)?;
        if position.status != PositionStatus::Open {
            return None;
        }

        let (new_state, new_peak, new_stop) = risk_engine.advance_trailing(
            overrides,
            position.trailing_state,
            position.entry_price,
            position.peak_price,
            position.stop_loss,
            last_price,
        );

        let moved = new_stop != position.stop_loss;
        position.trailing_state = new_state;
        position.peak_price = new_peak;
        position.stop_loss = new_stop;
        debug_assert!(position.invariants_hold(), "position invariants violated by trailing update");

        moved.then_some(new_stop)
    }

    /// Mark a position as closing (an exit order has been submitted but not
    /// yet confirmed filled), recording why so a failed order can be
    /// resubmitted with the same reason on a later tick.
    pub fn mark_closing(&self, symbol: &str, reason: OrderReason) {
        if let Some(position) = self.positions.write().get_mut(symbol) {
            position.status = PositionStatus::Closing;
            position.pending_exit_reason = Some(reason);
        }
    }

    /// Finalize the close with the exit fill, recording the trade outcome
    /// for Kelly sizing, and remove the position from the book.
    pub fn close(&self, symbol: &str, exit_fill: &Fill, _reason: OrderReason) -> Option<Position> {
        let mut positions = self.positions.write();
        let mut position = positions.remove(symbol)?;
        position.status = PositionStatus::Closed;

        let pnl = (exit_fill.average_price - position.entry_price) * position.quantity;
        let risked = (position.entry_price - position.stop_loss).max(f64::EPSILON);
        let mut history = self.trade_history.write();
        history.push_back(TradeOutcome {
            won: pnl > 0.0,
            win_loss_ratio_component: if pnl > 0.0 { Some(pnl.abs() / (position.quantity * risked)) } else { None },
        });
        while history.len() > TRADE_HISTORY_WINDOW {
            history.pop_front();
        }

        Some(position)
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}
