// =============================================================================
// RSI Mean-Reversion Strategy
// =============================================================================
//
// BUY when RSI drops to or below the oversold threshold; SELL when it rises
// to or above the overbought threshold. A hysteresis gate prevents repeated
// signals while RSI lingers in the extreme zone: once triggered, the same
// side won't fire again until RSI has recrossed back past the threshold plus
// a configurable margin.

use super::{param_f64, param_usize, ParameterKind, ParameterSpec, Strategy, StrategyError};
use crate::indicators::rsi::current_rsi;
use crate::types::{Bar, Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Idle,
    WaitingAboveOversold,
    WaitingBelowOverbought,
}

pub struct RsiMeanReversion {
    period: usize,
    oversold: f64,
    overbought: f64,
    hysteresis: f64,
    gate: Gate,
}

impl Strategy for RsiMeanReversion {
    fn on_bar(&mut self, bar_window: &[Bar]) -> Signal {
        let reference_timestamp = match bar_window.last() {
            Some(b) => b.timestamp,
            None => return Signal::hold(chrono::Utc::now()),
        };

        let closes: Vec<f64> = bar_window.iter().map(|b| b.close).collect();
        let Some((rsi, _label)) = current_rsi(&closes, self.period) else {
            return Signal::hold(reference_timestamp);
        };

        match self.gate {
            Gate::WaitingAboveOversold => {
                if rsi >= self.oversold + self.hysteresis {
                    self.gate = Gate::Idle;
                }
                return Signal::hold(reference_timestamp);
            }
            Gate::WaitingBelowOverbought => {
                if rsi <= self.overbought - self.hysteresis {
                    self.gate = Gate::Idle;
                }
                return Signal::hold(reference_timestamp);
            }
            Gate::Idle => {}
        }

        if rsi <= self.oversold {
            self.gate = Gate::WaitingAboveOversold;
            Signal {
                kind: SignalKind::Buy,
                strength: Some(((self.oversold - rsi) / self.oversold).clamp(0.0, 1.0)),
                reference_timestamp,
            }
        } else if rsi >= self.overbought {
            self.gate = Gate::WaitingBelowOverbought;
            Signal {
                kind: SignalKind::Sell,
                strength: Some(((rsi - self.overbought) / (100.0 - self.overbought)).clamp(0.0, 1.0)),
                reference_timestamp,
            }
        } else {
            Signal::hold(reference_timestamp)
        }
    }
}

pub fn declare_parameters() -> Vec<ParameterSpec> {
    vec![
        ParameterSpec { name: "period", kind: ParameterKind::Integer, default: serde_json::json!(14) },
        ParameterSpec { name: "oversold", kind: ParameterKind::Float, default: serde_json::json!(30.0) },
        ParameterSpec { name: "overbought", kind: ParameterKind::Float, default: serde_json::json!(70.0) },
        ParameterSpec { name: "hysteresis", kind: ParameterKind::Float, default: serde_json::json!(5.0) },
    ]
}

pub fn build(
    parameters: &serde_json::Map<String, serde_json::Value>,
) -> Result<Box<dyn Strategy>, StrategyError> {
    let period = param_usize(parameters, "period", 14)?;
    let oversold = param_f64(parameters, "oversold", 30.0)?;
    let overbought = param_f64(parameters, "overbought", 70.0)?;
    let hysteresis = param_f64(parameters, "hysteresis", 5.0)?;

    if period == 0 {
        return Err(StrategyError::InvalidParameter {
            name: "period".to_string(),
            reason: "must be nonzero".to_string(),
        });
    }
    if !(0.0..100.0).contains(&oversold) || !(0.0..=100.0).contains(&overbought) || oversold >= overbought {
        return Err(StrategyError::InvalidParameter {
            name: "oversold/overbought".to_string(),
            reason: format!("oversold ({oversold}) must be < overbought ({overbought}), both in [0,100)"),
        });
    }

    Ok(Box::new(RsiMeanReversion {
        period,
        oversold,
        overbought,
        hysteresis,
        gate: Gate::Idle,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: Utc.timestamp_opt(i as i64 * 60, 0).unwrap(),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    fn default_params() -> serde_json::Map<String, serde_json::Value> {
        let mut p = serde_json::Map::new();
        p.insert("period".to_string(), serde_json::json!(14));
        p
    }

    #[test]
    fn build_rejects_oversold_above_overbought() {
        let mut p = serde_json::Map::new();
        p.insert("oversold".to_string(), serde_json::json!(80.0));
        p.insert("overbought".to_string(), serde_json::json!(20.0));
        assert!(build(&p).is_err());
    }

    #[test]
    fn descending_prices_trigger_buy_on_oversold_rsi() {
        let mut strategy = build(&default_params()).unwrap();
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect(); // RSI -> 0
        let signal = strategy.on_bar(&bars(&closes));
        assert_eq!(signal.kind, SignalKind::Buy);
    }

    #[test]
    fn ascending_prices_trigger_sell_on_overbought_rsi() {
        let mut strategy = build(&default_params()).unwrap();
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect(); // RSI -> 100
        let signal = strategy.on_bar(&bars(&closes));
        assert_eq!(signal.kind, SignalKind::Sell);
    }

    #[test]
    fn hysteresis_gate_suppresses_repeated_buy_signals() {
        let mut strategy = build(&default_params()).unwrap();
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect(); // RSI == 0
        let first = strategy.on_bar(&bars(&closes));
        assert_eq!(first.kind, SignalKind::Buy);

        // RSI is still deep oversold on the next tick — the gate must
        // suppress a second BUY until RSI recovers past oversold+hysteresis.
        let second = strategy.on_bar(&bars(&closes));
        assert_eq!(second.kind, SignalKind::Hold);
    }

    #[test]
    fn gate_reopens_once_rsi_clears_the_hysteresis_margin() {
        let mut strategy = build(&default_params()).unwrap();
        let descending: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let first = strategy.on_bar(&bars(&descending));
        assert_eq!(first.kind, SignalKind::Buy);

        // Flat market lifts RSI back to neutral (50), clearing the gate.
        let flat = vec![100.0; 30];
        let cleared = strategy.on_bar(&bars(&flat));
        assert_eq!(cleared.kind, SignalKind::Hold);

        // A fresh plunge should now be able to trigger BUY again.
        let third = strategy.on_bar(&bars(&descending));
        assert_eq!(third.kind, SignalKind::Buy);
    }

    #[test]
    fn neutral_rsi_holds() {
        let mut strategy = build(&default_params()).unwrap();
        let closes = vec![100.0; 30];
        let signal = strategy.on_bar(&bars(&closes));
        assert_eq!(signal.kind, SignalKind::Hold);
    }
}
