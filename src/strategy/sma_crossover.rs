// =============================================================================
// SMA Crossover Strategy
// =============================================================================
//
// BUY when the short SMA crosses above the long SMA; SELL when it crosses
// back below. No internal state beyond the declared window lengths — the
// crossover is recomputed from the bar window on every call.

use super::{param_usize, ParameterKind, ParameterSpec, Strategy, StrategyError};
use crate::indicators::crossover::{series_crossover, Crossover};
use crate::indicators::sma::calculate_sma;
use crate::types::{Bar, Signal, SignalKind};

pub struct SmaCrossover {
    short_period: usize,
    long_period: usize,
}

impl Strategy for SmaCrossover {
    fn on_bar(&mut self, bar_window: &[Bar]) -> Signal {
        let reference_timestamp = match bar_window.last() {
            Some(b) => b.timestamp,
            None => return Signal::hold(chrono::Utc::now()),
        };

        let closes: Vec<f64> = bar_window.iter().map(|b| b.close).collect();
        let short = calculate_sma(&closes, self.short_period);
        let long = calculate_sma(&closes, self.long_period);

        // Both series need to be aligned on the same trailing window to
        // compare point-for-point; take the shorter series' length from the
        // tail of the longer one.
        let len = short.len().min(long.len());
        if len < 2 {
            return Signal::hold(reference_timestamp);
        }
        let short_tail = &short[short.len() - len..];
        let long_tail = &long[long.len() - len..];

        let kind = match series_crossover(short_tail, long_tail) {
            Crossover::CrossUp => SignalKind::Buy,
            Crossover::CrossDown => SignalKind::Sell,
            Crossover::None => SignalKind::Hold,
        };

        Signal { kind, strength: None, reference_timestamp }
    }
}

pub fn declare_parameters() -> Vec<ParameterSpec> {
    vec![
        ParameterSpec {
            name: "short",
            kind: ParameterKind::Integer,
            default: serde_json::json!(9),
        },
        ParameterSpec {
            name: "long",
            kind: ParameterKind::Integer,
            default: serde_json::json!(21),
        },
    ]
}

pub fn build(
    parameters: &serde_json::Map<String, serde_json::Value>,
) -> Result<Box<dyn Strategy>, StrategyError> {
    let short_period = param_usize(parameters, "short", 9)?;
    let long_period = param_usize(parameters, "long", 21)?;
    if short_period == 0 || long_period == 0 || short_period >= long_period {
        return Err(StrategyError::InvalidParameter {
            name: "short/long".to_string(),
            reason: format!("short ({short_period}) must be nonzero and less than long ({long_period})"),
        });
    }
    Ok(Box::new(SmaCrossover { short_period, long_period }))
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

    #[test]
    fn build_rejects_short_not_less_than_long() {
        let mut params = serde_json::Map::new();
        params.insert("short".to_string(), serde_json::json!(10));
        params.insert("long".to_string(), serde_json::json!(5));
        assert!(build(&params).is_err());
    }

    #[test]
    fn build_rejects_zero_short() {
        let mut params = serde_json::Map::new();
        params.insert("short".to_string(), serde_json::json!(0));
        assert!(build(&params).is_err());
    }

    #[test]
    fn holds_on_insufficient_data() {
        let mut params = serde_json::Map::new();
        params.insert("short".to_string(), serde_json::json!(3));
        params.insert("long".to_string(), serde_json::json!(5));
        let mut strategy = build(&params).unwrap();
        let signal = strategy.on_bar(&bars(&[1.0, 1.01, 1.02]));
        assert_eq!(signal.kind, SignalKind::Hold);
    }

    #[test]
    fn breakout_bar_crosses_short_sma_above_long() {
        let mut params = serde_json::Map::new();
        params.insert("short".to_string(), serde_json::json!(3));
        params.insert("long".to_string(), serde_json::json!(5));
        let mut strategy = build(&params).unwrap();
        // Flat for six bars, then a sharp rally — the short SMA (fewer
        // points to dilute the rally) jumps above the long SMA.
        let closes = [1.10, 1.10, 1.10, 1.10, 1.10, 1.10, 1.30];
        let signal = strategy.on_bar(&bars(&closes));
        assert_eq!(signal.kind, SignalKind::Buy);
    }

    #[test]
    fn breakdown_bar_crosses_short_sma_below_long() {
        let mut params = serde_json::Map::new();
        params.insert("short".to_string(), serde_json::json!(3));
        params.insert("long".to_string(), serde_json::json!(5));
        let mut strategy = build(&params).unwrap();
        let closes = [1.10, 1.10, 1.10, 1.10, 1.10, 1.10, 0.90];
        let signal = strategy.on_bar(&bars(&closes));
        assert_eq!(signal.kind, SignalKind::Sell);
    }

    #[test]
    fn flat_series_holds() {
        let mut params = serde_json::Map::new();
        params.insert("short".to_string(), serde_json::json!(3));
        params.insert("long".to_string(), serde_json::json!(5));
        let mut strategy = build(&params).unwrap();
        let signal = strategy.on_bar(&bars(&[1.0; 10]));
        assert_eq!(signal.kind, SignalKind::Hold);
    }
}
