// =============================================================================
// Risk Engine
// =============================================================================
//
// Turns a BUY signal into a sized, stopped order, or a reasoned rejection.
// Two responsibilities: choose a position size and initial stop/target via
// one of three sizing algorithms, then run the candidate through five
// ordered aggregate checks that short-circuit on first failure.
//
// Trailing-stop state transitions also live here (the Risk Engine owns the
// *rule*; the Position Book owns the *state* and calls `advance_trailing`
// each tick).

use serde::{Deserialize, Serialize};

use crate::types::{AccountState, Bar};

/// Three-state trailing-stop machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrailingState {
    Inactive,
    Armed,
    Tracking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingMethod {
    FixedFraction,
    VolatilityScaled,
    Kelly,
}

/// Global risk parameters; a binding may override any subset via
/// [`RiskOverrides`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_risk_per_trade: f64,
    pub max_risk_total: f64,
    pub max_open_trades: usize,
    pub max_allocation: f64,
    pub daily_target_profit: Option<f64>,
    pub default_stop_loss_pct: f64,
    pub target_profit_pct: f64,
    pub use_atr_for_stops: bool,
    pub atr_multiplier: f64,
    pub atr_period: usize,
    pub use_trailing_stop: bool,
    pub trailing_stop_activation_pct: f64,
    pub trailing_stop_distance_pct: f64,
    pub sizing_method: SizingMethod,
    /// Apply half-Kelly (multiply the raw Kelly fraction by 0.5) before
    /// clipping. Default `true`, per the Kelly sizing algorithm's default.
    pub kelly_half: bool,
    pub kelly_max_fraction: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade: 0.01,
            max_risk_total: 0.05,
            max_open_trades: 5,
            max_allocation: 0.2,
            daily_target_profit: None,
            default_stop_loss_pct: 0.03,
            target_profit_pct: 0.05,
            use_atr_for_stops: false,
            atr_multiplier: 2.0,
            atr_period: 14,
            use_trailing_stop: false,
            trailing_stop_activation_pct: 0.02,
            trailing_stop_distance_pct: 0.015,
            sizing_method: SizingMethod::FixedFraction,
            kelly_half: true,
            kelly_max_fraction: 0.2,
        }
    }
}

/// Per-binding overrides of the global [`RiskConfig`]. Any field left `None`
/// falls back to the global value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskOverrides {
    pub max_risk_per_trade: Option<f64>,
    pub max_allocation: Option<f64>,
    pub default_stop_loss_pct: Option<f64>,
    pub target_profit_pct: Option<f64>,
    pub use_trailing_stop: Option<bool>,
}

impl RiskConfig {
    pub fn merge(&self, overrides: Option<&RiskOverrides>) -> RiskConfig {
        let mut merged = *self;
        if let Some(o) = overrides {
            if let Some(v) = o.max_risk_per_trade {
                merged.max_risk_per_trade = v;
            }
            if let Some(v) = o.max_allocation {
                merged.max_allocation = v;
            }
            if let Some(v) = o.default_stop_loss_pct {
                merged.default_stop_loss_pct = v;
            }
            if let Some(v) = o.target_profit_pct {
                merged.target_profit_pct = v;
            }
            if let Some(v) = o.use_trailing_stop {
                merged.use_trailing_stop = v;
            }
        }
        merged
    }
}

/// Reason code attached to a `RiskRejected` event — not an error in the Rust
/// sense, an expected decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskRejection {
    PerTradeRisk,
    AggregateRisk,
    MaxOpenTrades,
    MaxAllocation,
    DailyTargetReached,
    SizeNonPositive,
}

impl std::fmt::Display for RiskRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PerTradeRisk => "per_trade_risk",
            Self::AggregateRisk => "aggregate_risk",
            Self::MaxOpenTrades => "max_open_trades",
            Self::MaxAllocation => "max_allocation",
            Self::DailyTargetReached => "daily_target_reached",
            Self::SizeNonPositive => "size_non_positive",
        };
        write!(f, "{s}")
    }
}

/// A fully sized, stopped candidate produced by the Risk Engine for a BUY
/// signal.
#[derive(Debug, Clone, Copy)]
pub struct SizedEntry {
    pub quantity: f64,
    pub stop_loss: f64,
    pub target: f64,
}

/// Everything the Risk Engine needs beyond `RiskConfig` to evaluate one
/// candidate entry: the account, the current bar, and the aggregate state of
/// positions open across *other* bindings (the Position Book is the source
/// of truth for these, queried by the caller).
pub struct RiskContext {
    pub account: AccountState,
    pub bar: Bar,
    pub atr: Option<f64>,
    pub open_positions_count: usize,
    pub aggregate_open_risk: f64,
    pub daily_realized_pnl: f64,
    /// Rolling win probability and win/loss ratio from the Position Book's
    /// closed-trade history, used only by the Kelly sizing method.
    pub kelly_win_probability: Option<f64>,
    pub kelly_win_loss_ratio: Option<f64>,
}

pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// The ATR look-back a caller should compute before calling
    /// [`RiskEngine::evaluate_entry`], accounting for per-binding overrides.
    pub fn atr_period(&self, overrides: Option<&RiskOverrides>) -> usize {
        self.config.merge(overrides).atr_period
    }

    /// Evaluate a BUY candidate against the five ordered aggregate checks,
    /// short-circuiting on first failure.
    pub fn evaluate_entry(
        &self,
        overrides: Option<&RiskOverrides>,
        ctx: &RiskContext,
    ) -> Result<SizedEntry, RiskRejection> {
        let config = self.config.merge(overrides);
        let entry = ctx.bar.close;

        let stop_loss = self.compute_stop_loss(entry, ctx.atr, &config);
        let target = entry * (1.0 + config.target_profit_pct);

        let quantity = self.compute_quantity(entry, stop_loss, ctx, &config);
        if quantity <= 0.0 {
            return Err(RiskRejection::SizeNonPositive);
        }

        let per_trade_risk = quantity * (entry - stop_loss).max(0.0);
        let equity = ctx.account.equity;

        // 1. Per-trade risk <= max_risk_per_trade of equity.
        if per_trade_risk > config.max_risk_per_trade * equity + f64::EPSILON {
            return Err(RiskRejection::PerTradeRisk);
        }

        // 2. Aggregate risk across open positions + candidate <= max_risk_total.
        if ctx.aggregate_open_risk + per_trade_risk > config.max_risk_total * equity + f64::EPSILON {
            return Err(RiskRejection::AggregateRisk);
        }

        // 3. Open positions count < max_open_trades.
        if ctx.open_positions_count >= config.max_open_trades {
            return Err(RiskRejection::MaxOpenTrades);
        }

        // 4. Candidate notional <= max_allocation * equity.
        let notional = quantity * entry;
        if notional > config.max_allocation * equity + f64::EPSILON {
            return Err(RiskRejection::MaxAllocation);
        }

        // 5. Daily realized PnL hasn't reached daily_target_profit.
        if let Some(target_profit) = config.daily_target_profit {
            if ctx.daily_realized_pnl >= target_profit * equity {
                return Err(RiskRejection::DailyTargetReached);
            }
        }

        Ok(SizedEntry { quantity, stop_loss, target })
    }

    fn compute_stop_loss(&self, entry: f64, atr: Option<f64>, config: &RiskConfig) -> f64 {
        if config.use_atr_for_stops {
            if let Some(atr) = atr {
                return entry - config.atr_multiplier * atr;
            }
        }
        entry * (1.0 - config.default_stop_loss_pct)
    }

    fn compute_quantity(&self, entry: f64, stop_loss: f64, ctx: &RiskContext, config: &RiskConfig) -> f64 {
        let equity = ctx.account.equity;
        match config.sizing_method {
            SizingMethod::FixedFraction => {
                let per_unit_risk = entry - stop_loss;
                if per_unit_risk <= 0.0 {
                    return 0.0;
                }
                ((equity * config.max_risk_per_trade) / per_unit_risk).floor()
            }
            SizingMethod::VolatilityScaled => {
                let Some(atr) = ctx.atr else { return 0.0 };
                let per_unit_risk = config.atr_multiplier * atr;
                if per_unit_risk <= 0.0 {
                    return 0.0;
                }
                ((equity * config.max_risk_per_trade) / per_unit_risk).floor()
            }
            SizingMethod::Kelly => {
                let (Some(p), Some(b)) = (ctx.kelly_win_probability, ctx.kelly_win_loss_ratio) else {
                    return 0.0;
                };
                if b <= 0.0 {
                    return 0.0;
                }
                let raw = (p * b - (1.0 - p)) / b;
                let scaled = if config.kelly_half { raw * 0.5 } else { raw };
                let clipped = scaled.clamp(0.0, config.kelly_max_fraction);
                if entry <= 0.0 {
                    return 0.0;
                }
                ((equity * clipped) / entry).floor()
            }
        }
    }

    /// Advance the trailing-stop state machine for one tick. Called by the
    /// Position Book with the position's current trailing state, peak price,
    /// and stop; returns the (possibly unchanged) new state.
    pub fn advance_trailing(
        &self,
        overrides: Option<&RiskOverrides>,
        state: TrailingState,
        entry: f64,
        peak_price: f64,
        stop_loss: f64,
        last_price: f64,
    ) -> (TrailingState, f64, f64) {
        let config = self.config.merge(overrides);
        if !config.use_trailing_stop {
            return (state, peak_price, stop_loss);
        }

        let new_peak = peak_price.max(last_price);
        let unrealized_gain_pct = (last_price - entry) / entry;

        match state {
            TrailingState::Inactive => {
                if unrealized_gain_pct >= config.trailing_stop_activation_pct {
                    (TrailingState::Armed, new_peak, stop_loss)
                } else {
                    (TrailingState::Inactive, peak_price, stop_loss)
                }
            }
            TrailingState::Armed | TrailingState::Tracking => {
                let candidate_stop = new_peak * (1.0 - config.trailing_stop_distance_pct);
                let new_stop = stop_loss.max(candidate_stop);
                (TrailingState::Tracking, new_peak, new_stop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn base_ctx(equity: f64, close: f64) -> RiskContext {
        RiskContext {
            account: AccountState::new(equity),
            bar: bar(close),
            atr: None,
            open_positions_count: 0,
            aggregate_open_risk: 0.0,
            daily_realized_pnl: 0.0,
            kelly_win_probability: None,
            kelly_win_loss_ratio: None,
        }
    }

    #[test]
    fn fixed_fraction_sizing_matches_hand_computed_value() {
        let config = RiskConfig { max_risk_per_trade: 0.01, default_stop_loss_pct: 0.05, ..RiskConfig::default() };
        let engine = RiskEngine::new(config);
        let ctx = base_ctx(1000.0, 100.0);
        let sized = engine.evaluate_entry(None, &ctx).unwrap();
        // stop = 100 * 0.95 = 95; per-unit risk = 5; budget = 1000*0.01 = 10.
        assert_eq!(sized.stop_loss, 95.0);
        assert_eq!(sized.quantity, 2.0);
        assert_eq!(sized.target, 105.0);
    }

    #[test]
    fn per_trade_risk_rejects_when_budget_too_small_for_one_unit() {
        let config = RiskConfig { max_risk_per_trade: 0.0001, default_stop_loss_pct: 0.05, ..RiskConfig::default() };
        let engine = RiskEngine::new(config);
        let ctx = base_ctx(1000.0, 100.0);
        let err = engine.evaluate_entry(None, &ctx).unwrap_err();
        assert_eq!(err, RiskRejection::SizeNonPositive);
    }

    #[test]
    fn aggregate_risk_gate_rejects_second_binding() {
        // Two bindings each want to risk 3% of equity; max_risk_total is 5%.
        let config = RiskConfig {
            max_risk_per_trade: 0.03,
            max_risk_total: 0.05,
            default_stop_loss_pct: 0.03,
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(config);

        let mut ctx = base_ctx(1000.0, 100.0);
        let first = engine.evaluate_entry(None, &ctx).unwrap();
        let first_risk = first.quantity * (100.0 - first.stop_loss);

        ctx.aggregate_open_risk = first_risk;
        let second = engine.evaluate_entry(None, &ctx);
        assert_eq!(second.unwrap_err(), RiskRejection::AggregateRisk);
    }

    #[test]
    fn max_open_trades_gate_rejects_when_at_capacity() {
        let config = RiskConfig { max_open_trades: 2, ..RiskConfig::default() };
        let engine = RiskEngine::new(config);
        let mut ctx = base_ctx(1000.0, 100.0);
        ctx.open_positions_count = 2;
        let err = engine.evaluate_entry(None, &ctx).unwrap_err();
        assert_eq!(err, RiskRejection::MaxOpenTrades);
    }

    #[test]
    fn max_allocation_gate_rejects_oversized_notional() {
        let config = RiskConfig {
            max_risk_per_trade: 0.5,
            default_stop_loss_pct: 0.01,
            max_allocation: 0.1,
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(config);
        let ctx = base_ctx(1000.0, 100.0);
        let err = engine.evaluate_entry(None, &ctx).unwrap_err();
        assert_eq!(err, RiskRejection::MaxAllocation);
    }

    #[test]
    fn daily_target_reached_blocks_new_entries() {
        let config = RiskConfig { daily_target_profit: Some(0.02), ..RiskConfig::default() };
        let engine = RiskEngine::new(config);
        let mut ctx = base_ctx(1000.0, 100.0);
        ctx.daily_realized_pnl = 25.0; // 2.5% of equity, past the 2% target.
        let err = engine.evaluate_entry(None, &ctx).unwrap_err();
        assert_eq!(err, RiskRejection::DailyTargetReached);
    }

    #[test]
    fn overrides_take_precedence_over_global_config() {
        let config = RiskConfig { default_stop_loss_pct: 0.05, ..RiskConfig::default() };
        let engine = RiskEngine::new(config);
        let overrides = RiskOverrides { default_stop_loss_pct: Some(0.10), ..RiskOverrides::default() };
        let ctx = base_ctx(1000.0, 100.0);
        let sized = engine.evaluate_entry(Some(&overrides), &ctx).unwrap();
        assert_eq!(sized.stop_loss, 90.0);
    }

    #[test]
    fn volatility_scaled_sizing_uses_atr() {
        let config = RiskConfig {
            sizing_method: SizingMethod::VolatilityScaled,
            atr_multiplier: 2.0,
            max_risk_per_trade: 0.02,
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(config);
        let mut ctx = base_ctx(1000.0, 100.0);
        ctx.atr = Some(1.0);
        let sized = engine.evaluate_entry(None, &ctx).unwrap();
        // stop = 100 - 2*1 = 98; per-unit risk = 2; budget = 1000*0.02=20 => qty=10.
        assert_eq!(sized.stop_loss, 98.0);
        assert_eq!(sized.quantity, 10.0);
    }

    #[test]
    fn volatility_scaled_without_atr_rejects_as_non_positive_size() {
        let config = RiskConfig { sizing_method: SizingMethod::VolatilityScaled, ..RiskConfig::default() };
        let engine = RiskEngine::new(config);
        let ctx = base_ctx(1000.0, 100.0);
        let err = engine.evaluate_entry(None, &ctx).unwrap_err();
        assert_eq!(err, RiskRejection::SizeNonPositive);
    }

    #[test]
    fn kelly_sizing_applies_half_kelly_by_default() {
        let config = RiskConfig {
            sizing_method: SizingMethod::Kelly,
            kelly_half: true,
            kelly_max_fraction: 1.0,
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(config);
        let mut ctx = base_ctx(1000.0, 100.0);
        ctx.kelly_win_probability = Some(0.6);
        ctx.kelly_win_loss_ratio = Some(2.0);
        // raw f = (0.6*2 - 0.4)/2 = (1.2-0.4)/2 = 0.4; half-Kelly = 0.2.
        // qty = floor(1000*0.2/100) = 2.
        let sized = engine.evaluate_entry(None, &ctx).unwrap();
        assert_eq!(sized.quantity, 2.0);
    }

    #[test]
    fn kelly_fraction_clips_to_max() {
        let config = RiskConfig {
            sizing_method: SizingMethod::Kelly,
            kelly_half: false,
            kelly_max_fraction: 0.1,
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(config);
        let mut ctx = base_ctx(1000.0, 100.0);
        ctx.kelly_win_probability = Some(0.9);
        ctx.kelly_win_loss_ratio = Some(3.0);
        // raw f = (0.9*3 - 0.1)/3 = (2.7-0.1)/3 = 0.8667, clipped to 0.1.
        let sized = engine.evaluate_entry(None, &ctx).unwrap();
        assert_eq!(sized.quantity, 1.0); // floor(1000*0.1/100) = 1
    }

    #[test]
    fn trailing_stays_inactive_below_activation_threshold() {
        let config = RiskConfig { use_trailing_stop: true, ..RiskConfig::default() };
        let engine = RiskEngine::new(config);
        let (state, peak, stop) =
            engine.advance_trailing(None, TrailingState::Inactive, 1.06, 1.06, 1.0282, 1.07);
        assert_eq!(state, TrailingState::Inactive);
        assert_eq!(peak, 1.06);
        assert_eq!(stop, 1.0282);
    }

    #[test]
    fn trailing_arms_once_activation_threshold_crossed() {
        let config = RiskConfig {
            use_trailing_stop: true,
            trailing_stop_activation_pct: 0.02,
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(config);
        let (state, peak, _stop) =
            engine.advance_trailing(None, TrailingState::Inactive, 1.06, 1.06, 1.0282, 1.082);
        assert_eq!(state, TrailingState::Armed);
        assert_eq!(peak, 1.082);
    }

    #[test]
    fn trailing_ratchets_up_monotonically() {
        let config = RiskConfig {
            use_trailing_stop: true,
            trailing_stop_activation_pct: 0.02,
            trailing_stop_distance_pct: 0.015,
            ..RiskConfig::default()
        };
        let engine = RiskEngine::new(config);
        let (state, peak, stop) =
            engine.advance_trailing(None, TrailingState::Armed, 1.06, 1.082, 1.0282, 1.10);
        assert_eq!(state, TrailingState::Tracking);
        assert_eq!(peak, 1.10);
        // new stop = 1.10 * (1 - 0.015) = 1.0835
        assert!((stop - 1.0835).abs() < 1e-9);

        // A pullback that doesn't make a new peak must not lower the stop.
        let (state2, peak2, stop2) =
            engine.advance_trailing(None, state, 1.06, peak, stop, 1.095);
        assert_eq!(state2, TrailingState::Tracking);
        assert_eq!(peak2, 1.10);
        assert_eq!(stop2, stop);
    }
}
