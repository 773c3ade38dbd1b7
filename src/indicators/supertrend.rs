// =============================================================================
// Supertrend — ATR-band trend-following indicator
// =============================================================================
//
// hl2         = (high + low) / 2
// upperband   = hl2 + mult * ATR
// lowerband   = hl2 - mult * ATR
// final bands carry monotonically: the final upper band only tightens while
// price stays below it (and resets on a close above); the final lower band
// mirrors this on the other side. Direction flips to +1 when close breaks
// above the previous final upper band, to -1 when it breaks below the
// previous final lower band, and otherwise carries forward.
// =============================================================================

use crate::market_data::bar_cache::Candle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupertrendResult {
    pub trend: f64,
    /// +1 bullish, -1 bearish.
    pub direction: i8,
}

fn true_range(prev_close: f64, high: f64, low: f64) -> f64 {
    let hl = high - low;
    let hc = (high - prev_close).abs();
    let lc = (low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Compute the Supertrend value as of the last candle in `candles`, using a
/// plain rolling-mean ATR (matching the reference implementation this
/// indicator is grounded on) rather than Wilder smoothing.
///
/// Returns `None` when there are fewer than `period + 1` candles.
pub fn supertrend(candles: &[Candle], period: usize, mult: f64) -> Option<SupertrendResult> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let n = candles.len();
    let mut tr = vec![0.0; n];
    for i in 1..n {
        tr[i] = true_range(candles[i - 1].close, candles[i].high, candles[i].low);
    }

    let mut atr = vec![f64::NAN; n];
    for i in period..n {
        let window = &tr[i + 1 - period..=i];
        atr[i] = window.iter().sum::<f64>() / period as f64;
    }

    let mut final_upper = vec![0.0; n];
    let mut final_lower = vec![0.0; n];
    let mut direction = vec![1i8; n];

    for i in period..n {
        let hl2 = (candles[i].high + candles[i].low) / 2.0;
        let upper = hl2 + mult * atr[i];
        let lower = hl2 - mult * atr[i];

        if i == period {
            final_upper[i] = upper;
            final_lower[i] = lower;
            direction[i] = 1;
            continue;
        }

        final_upper[i] = if candles[i - 1].close > final_upper[i - 1] {
            upper
        } else {
            upper.min(final_upper[i - 1])
        };
        final_lower[i] = if candles[i - 1].close < final_lower[i - 1] {
            lower
        } else {
            lower.max(final_lower[i - 1])
        };

        direction[i] = if candles[i].close > final_upper[i - 1] {
            1
        } else if candles[i].close < final_lower[i - 1] {
            -1
        } else {
            direction[i - 1]
        };
    }

    let last = n - 1;
    let trend = if direction[last] > 0 {
        final_lower[last]
    } else {
        final_upper[last]
    };

    if !trend.is_finite() {
        return None;
    }

    Some(SupertrendResult {
        trend,
        direction: direction[last],
    })
}
