// =============================================================================
// RSI + Bollinger Composite Strategy
// =============================================================================
//
// BUY when price pierces the lower Bollinger band and RSI is below the
// oversold threshold — both conditions must hold on the same bar. SELL is
// the mirror image (price above the upper band and RSI overbought), used to
// exit a long when no stop or target has fired yet.

use super::{param_f64, param_usize, ParameterKind, ParameterSpec, Strategy, StrategyError};
use crate::indicators::bollinger::calculate_bollinger;
use crate::indicators::rsi::current_rsi;
use crate::types::{Bar, Signal, SignalKind};

pub struct RsiBollinger {
    bb_period: usize,
    bb_num_std: f64,
    rsi_period: usize,
    oversold: f64,
    overbought: f64,
}

impl Strategy for RsiBollinger {
    fn on_bar(&mut self, bar_window: &[Bar]) -> Signal {
        let Some(last_bar) = bar_window.last() else {
            return Signal::hold(chrono::Utc::now());
        };
        let reference_timestamp = last_bar.timestamp;
        let closes: Vec<f64> = bar_window.iter().map(|b| b.close).collect();

        let (Some(bb), Some((rsi, _))) = (
            calculate_bollinger(&closes, self.bb_period, self.bb_num_std),
            current_rsi(&closes, self.rsi_period),
        ) else {
            return Signal::hold(reference_timestamp);
        };

        let price = last_bar.close;
        if price <= bb.lower && rsi < self.oversold {
            Signal { kind: SignalKind::Buy, strength: None, reference_timestamp }
        } else if price >= bb.upper && rsi > self.overbought {
            Signal { kind: SignalKind::Sell, strength: None, reference_timestamp }
        } else {
            Signal::hold(reference_timestamp)
        }
    }
}

pub fn declare_parameters() -> Vec<ParameterSpec> {
    vec![
        ParameterSpec { name: "bb_period", kind: ParameterKind::Integer, default: serde_json::json!(20) },
        ParameterSpec { name: "bb_num_std", kind: ParameterKind::Float, default: serde_json::json!(2.0) },
        ParameterSpec { name: "rsi_period", kind: ParameterKind::Integer, default: serde_json::json!(14) },
        ParameterSpec { name: "oversold", kind: ParameterKind::Float, default: serde_json::json!(30.0) },
        ParameterSpec { name: "overbought", kind: ParameterKind::Float, default: serde_json::json!(70.0) },
    ]
}

pub fn build(
    parameters: &serde_json::Map<String, serde_json::Value>,
) -> Result<Box<dyn Strategy>, StrategyError> {
    let bb_period = param_usize(parameters, "bb_period", 20)?;
    let bb_num_std = param_f64(parameters, "bb_num_std", 2.0)?;
    let rsi_period = param_usize(parameters, "rsi_period", 14)?;
    let oversold = param_f64(parameters, "oversold", 30.0)?;
    let overbought = param_f64(parameters, "overbought", 70.0)?;

    if bb_period == 0 || rsi_period == 0 {
        return Err(StrategyError::InvalidParameter {
            name: "bb_period/rsi_period".to_string(),
            reason: "must be nonzero".to_string(),
        });
    }
    if bb_num_std <= 0.0 {
        return Err(StrategyError::InvalidParameter {
            name: "bb_num_std".to_string(),
            reason: "must be positive".to_string(),
        });
    }
    if oversold >= overbought {
        return Err(StrategyError::InvalidParameter {
            name: "oversold/overbought".to_string(),
            reason: format!("oversold ({oversold}) must be < overbought ({overbought})"),
        });
    }

    Ok(Box::new(RsiBollinger { bb_period, bb_num_std, rsi_period, oversold, overbought }))
}
