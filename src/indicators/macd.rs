// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line    = EMA(fast) - EMA(slow)
// Signal line  = EMA(signal_period) of the MACD line
// Histogram    = MACD line - Signal line
//
// Standard defaults are 12/26/9; the strategy layer is free to override them
// via its declared parameters.

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD reading for `closes`.
///
/// Returns `None` when any of the three EMAs cannot be computed — i.e. fewer
/// than `slow_period + signal_period` closes, or a degenerate period of zero.
pub fn calculate_macd(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast_period == 0 || slow_period == 0 || signal_period == 0 || fast_period >= slow_period {
        return None;
    }

    let fast_ema = calculate_ema(closes, fast_period);
    let slow_ema = calculate_ema(closes, slow_period);
    if fast_ema.is_empty() || slow_ema.is_empty() {
        return None;
    }

    // Slow EMA starts later than fast EMA; align both series on the slow
    // EMA's timeline by dropping the fast series' leading values.
    let offset = slow_period - fast_period;
    if fast_ema.len() <= offset {
        return None;
    }
    let aligned_fast = &fast_ema[offset..];
    let len = aligned_fast.len().min(slow_ema.len());
    if len == 0 {
        return None;
    }

    let macd_line: Vec<f64> = aligned_fast[aligned_fast.len() - len..]
        .iter()
        .zip(&slow_ema[slow_ema.len() - len..])
        .map(|(f, s)| f - s)
        .collect();

    if macd_line.len() < signal_period {
        return None;
    }

    let signal_series = calculate_ema(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_line.last()?;
    let histogram = macd - signal;

    if !macd.is_finite() || !signal.is_finite() || !histogram.is_finite() {
        return None;
    }

    Some(MacdResult { macd, signal, histogram })
}

/// Convenience wrapper using the standard 12/26/9 parameters.
pub fn calculate_macd_default(closes: &[f64]) -> Option<MacdResult> {
    calculate_macd(closes, 12, 26, 9)
}
