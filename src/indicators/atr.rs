// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// ATR measures market volatility by decomposing the entire range of a bar.
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is then the smoothed average of TR using Wilder's method:
//   ATR_0   = SMA of first `period` TR values
//   ATR_t   = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Default period: 14
// =============================================================================

use crate::types::Bar;

/// Compute the most recent ATR value from a slice of bars using Wilder's
/// smoothing method.
///
/// # Arguments
/// - `candles` — slice of bars (oldest first).
/// - `period`  — look-back window for the ATR calculation.
///
/// # Returns
/// `None` when:
/// - `period` is zero.
/// - There are fewer than `period + 1` candles (we need `period` TR values,
///   each requiring a previous candle for the True Range calculation).
/// - Any intermediate value is non-finite.
pub fn calculate_atr(candles: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    // --- Step 1: Compute True Range for each consecutive pair ----------------
    let mut tr_values: Vec<f64> = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    if tr_values.len() < period {
        return None;
    }

    // --- Step 2: Seed ATR with SMA of first `period` TR values ---------------
    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    // --- Step 3: Wilder's smoothing for remaining TR values ------------------
    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    if atr.is_finite() {
        Some(atr)
    } else {
        None
    }
}

/// Calculate ATR as a percentage of the current price.
///
/// Useful for comparing volatility across assets with different price scales.
pub fn calculate_atr_pct(candles: &[Bar], period: usize) -> Option<f64> {
    let atr = calculate_atr(candles, period)?;
    let last_close = candles.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

/// Convenience function: compute ATR with the standard 14-period default.
pub fn calculate(candles: &[Bar]) -> Option<f64> {
    calculate_atr(candles, 14)
}
