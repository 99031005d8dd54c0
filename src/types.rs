// =============================================================================
// Core data types shared across the Aurora trading engine
// =============================================================================
//
// These types are deliberately plain data: no behaviour, no I/O. Every
// component in the engine (indicators, strategies, risk, the position book,
// the event bus) speaks in terms of the types defined here.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Bar (OHLCV candle)
// ---------------------------------------------------------------------------

/// One closed OHLCV bar.
///
/// Invariant: `low <= min(open, close) <= max(open, close) <= high` and
/// `volume >= 0`. Callers that construct bars from an untrusted source
/// (the Exchange Port) must validate this before using the bar; see
/// [`Bar::is_consistent`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Check the OHLC/volume invariant for a single bar.
    pub fn is_consistent(&self) -> bool {
        if !(self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite())
        {
            return false;
        }
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        self.low <= body_lo && body_hi <= self.high && self.volume >= 0.0
    }
}

/// Validate a sequence of bars: no duplicate or out-of-order timestamps,
/// no NaNs, and each bar internally consistent.
pub fn validate_bar_window(bars: &[Bar]) -> Result<(), String> {
    if bars.is_empty() {
        return Err("empty bar window".to_string());
    }
    for (i, bar) in bars.iter().enumerate() {
        if !bar.is_consistent() {
            return Err(format!("bar at index {i} fails OHLCV invariant"));
        }
        if i > 0 && bars[i - 1].timestamp >= bar.timestamp {
            return Err(format!(
                "bar timestamps not strictly monotonic at index {i}"
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// A bar timeframe, expressed per venue convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Wall-clock duration of one bar.
    pub fn duration(self) -> chrono::Duration {
        match self {
            Timeframe::M1 => chrono::Duration::minutes(1),
            Timeframe::M5 => chrono::Duration::minutes(5),
            Timeframe::M15 => chrono::Duration::minutes(15),
            Timeframe::H1 => chrono::Duration::hours(1),
            Timeframe::H4 => chrono::Duration::hours(4),
            Timeframe::D1 => chrono::Duration::days(1),
        }
    }

    /// Venue wire representation, e.g. `"15m"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A strategy's verdict for the current bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// A strategy's decision for the current bar, with an optional confidence
/// score and a reference to the bar it was computed from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    /// Strength in `[0, 1]`, if the strategy emits one.
    pub strength: Option<f64>,
    pub reference_timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn hold(reference_timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: SignalKind::Hold,
            strength: None,
            reference_timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Order intent / fill
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Why an order is being submitted — drives position bookkeeping once the
/// fill comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderReason {
    Entry,
    StopLoss,
    TakeProfit,
    Trailing,
    StrategyExit,
    Manual,
}

impl std::fmt::Display for OrderReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::StopLoss => write!(f, "stop_loss"),
            Self::TakeProfit => write!(f, "take_profit"),
            Self::Trailing => write!(f, "trailing"),
            Self::StrategyExit => write!(f, "strategy_exit"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A request to buy or sell a quantity of `symbol`, produced by the Trading
/// Loop and consumed by the Exchange Port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub reason: OrderReason,
    pub reference_price: f64,
}

/// An exchange-confirmed execution of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub filled_quantity: f64,
    pub average_price: f64,
    pub timestamp: DateTime<Utc>,
    pub fees: f64,
}

// ---------------------------------------------------------------------------
// Account state
// ---------------------------------------------------------------------------

/// Derived account snapshot, refreshed after each fill.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountState {
    pub cash_balance: f64,
    pub equity: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

impl AccountState {
    pub fn new(starting_cash: f64) -> Self {
        Self {
            cash_balance: starting_cash,
            equity: starting_cash,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Instrument binding
// ---------------------------------------------------------------------------

/// A persistent `(symbol, timeframe, strategy, parameters)` registration.
/// Immutable once registered; re-binding a symbol means removing and
/// re-adding it rather than mutating one in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentBinding {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub strategy_name: String,
    #[serde(default)]
    pub strategy_parameters: serde_json::Map<String, serde_json::Value>,
    pub fixed_quantity: Option<f64>,
    pub max_allocation_fraction: f64,
    #[serde(default)]
    pub risk_overrides: Option<crate::risk::RiskOverrides>,
}

impl InstrumentBinding {
    /// Stable key identifying this binding for scheduling/locking purposes.
    pub fn key(&self) -> String {
        format!("{}@{}/{}", self.symbol, self.timeframe, self.strategy_name)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A unique id correlating all events emitted while processing one tick.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Tagged union over every event the engine can publish.
///
/// Every variant is paired with a symbol (where applicable) and a
/// correlation id via the enclosing [`EventEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Event {
    BarFetched { count: usize },
    BarRejected { reason: String },
    SignalGenerated { signal: Signal },
    RiskRejected { reason: String },
    OrderSubmitted { intent: OrderIntent },
    OrderFilled { fill: Fill },
    OrderFailed { reason: String },
    PositionOpened { position_id: String, entry_price: f64, size: f64 },
    PositionClosed { position_id: String, exit_price: f64, realized_pnl: f64, reason: String },
    StopTriggered { position_id: String },
    TakeProfitTriggered { position_id: String },
    TrailingAdjusted { position_id: String, new_stop: f64 },
    HeartbeatTick { summary: String },
    EngineStarted,
    EngineStopped,
    EngineFault { reason: String },
}

/// Wraps an [`Event`] with the envelope fields every event carries:
/// timestamp, an optional symbol, and a correlation id shared by every event
/// emitted while processing one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub timestamp: DateTime<Utc>,
    pub symbol: Option<String>,
    pub correlation_id: String,
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(symbol: Option<String>, correlation_id: impl Into<String>, event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            symbol,
            correlation_id: correlation_id.into(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts_secs: i64, o: f64, h: f64, l: f64, c: f64, v: f64) -> Bar {
        Bar {
            timestamp: DateTime::from_timestamp(ts_secs, 0).unwrap(),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    #[test]
    fn bar_consistency_accepts_valid_bar() {
        assert!(bar(0, 1.0, 1.2, 0.9, 1.1, 10.0).is_consistent());
    }

    #[test]
    fn bar_consistency_rejects_high_below_body() {
        assert!(!bar(0, 1.0, 0.95, 0.9, 1.1, 10.0).is_consistent());
    }

    #[test]
    fn bar_consistency_rejects_negative_volume() {
        assert!(!bar(0, 1.0, 1.2, 0.9, 1.1, -1.0).is_consistent());
    }

    #[test]
    fn validate_window_rejects_empty() {
        assert!(validate_bar_window(&[]).is_err());
    }

    #[test]
    fn validate_window_rejects_non_monotonic() {
        let bars = vec![bar(10, 1.0, 1.1, 0.9, 1.0, 1.0), bar(5, 1.0, 1.1, 0.9, 1.0, 1.0)];
        assert!(validate_bar_window(&bars).is_err());
    }

    #[test]
    fn validate_window_accepts_monotonic() {
        let bars = vec![
            bar(0, 1.0, 1.1, 0.9, 1.0, 1.0),
            bar(60, 1.0, 1.1, 0.9, 1.05, 1.0),
        ];
        assert!(validate_bar_window(&bars).is_ok());
    }

    #[test]
    fn binding_key_is_stable() {
        let binding = InstrumentBinding {
            symbol: "XRPUSDT".to_string(),
            timeframe: Timeframe::M15,
            strategy_name: "sma_crossover".to_string(),
            strategy_parameters: Default::default(),
            fixed_quantity: None,
            max_allocation_fraction: 0.1,
            risk_overrides: None,
        };
        assert_eq!(binding.key(), "XRPUSDT@15m/sma_crossover");
    }
}
