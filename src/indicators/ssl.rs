// =============================================================================
// SSL Channel — direction flips on close crossing SMA(high)/SMA(low)
// =============================================================================
//
// sma_hi = SMA(high, length); sma_lo = SMA(low, length)
// direction flips to +1 when close > sma_hi, -1 when close < sma_lo, else
// carries the previous direction. ssl_up/ssl_dn are then chosen by direction:
// direction < 0 => ssl_up = sma_hi, ssl_dn = sma_lo (channel has flipped bearish)
// direction >=0 => ssl_up = sma_lo, ssl_dn = sma_hi
// =============================================================================

use crate::market_data::bar_cache::Candle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SslResult {
    pub ssl_up: f64,
    pub ssl_dn: f64,
    /// +1 bullish, -1 bearish, 0 only possible before the first crossing.
    pub direction: i8,
}

fn sma(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Compute the SSL channel value at the last candle of `candles`, using a
/// rolling `length`-period SMA of highs/lows. Returns `None` when there are
/// fewer than `length` candles.
pub fn ssl_channel(candles: &[Candle], length: usize) -> Option<SslResult> {
    if length == 0 || candles.len() < length {
        return None;
    }

    let mut direction: i8 = 0;
    let mut sma_hi = 0.0;
    let mut sma_lo = 0.0;

    for i in (length - 1)..candles.len() {
        let window = &candles[i + 1 - length..=i];
        let highs: Vec<f64> = window.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = window.iter().map(|c| c.low).collect();
        sma_hi = sma(&highs);
        sma_lo = sma(&lows);
        let close = candles[i].close;
        if close > sma_hi {
            direction = 1;
        } else if close < sma_lo {
            direction = -1;
        }
        // else: carry previous direction
    }

    let (ssl_up, ssl_dn) = if direction < 0 {
        (sma_hi, sma_lo)
    } else {
        (sma_lo, sma_hi)
    };

    Some(SslResult {
        ssl_up,
        ssl_dn,
        direction,
    })
}
