// =============================================================================
// Heikin-Ashi — smoothed candles using averaged OHLC
// =============================================================================
//
// ha_close   = (o + h + l + c) / 4
// ha_open[0] = o[0]
// ha_open[i] = (ha_open[i-1] + ha_close[i-1]) / 2
// ha_high    = max(h, ha_open, ha_close)
// ha_low     = min(h, ha_open, ha_close)
// body_dir   = sign(ha_close - ha_open)   (+1 bullish body, -1 bearish, 0 doji)
// =============================================================================

use crate::market_data::bar_cache::Candle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub body_dir: i8,
}

/// Compute the full Heikin-Ashi series for `candles`, aligned index-for-index
/// with the input. Returns an empty `Vec` for empty input.
pub fn heikin_ashi(candles: &[Candle]) -> Vec<HaBar> {
    if candles.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(candles.len());
    let first = &candles[0];
    let mut ha_open = first.open;
    let mut ha_close = (first.open + first.high + first.low + first.close) / 4.0;

    for (i, c) in candles.iter().enumerate() {
        if i > 0 {
            ha_open = (ha_open + ha_close) / 2.0;
            ha_close = (c.open + c.high + c.low + c.close) / 4.0;
        }
        let ha_high = c.high.max(ha_open).max(ha_close);
        let ha_low = c.low.min(ha_open).min(ha_close);
        let body_dir = match (ha_close - ha_open).signum() as i32 {
            d if d > 0 => 1,
            d if d < 0 => -1,
            _ => 0,
        } as i8;

        out.push(HaBar {
            open: ha_open,
            high: ha_high,
            low: ha_low,
            close: ha_close,
            body_dir,
        });
    }

    out
}

/// Check whether the last `n` Heikin-Ashi body directions are all equal to
/// `sign` (used by `strategy::evaluate` to gate on three aligned HA bodies).
pub fn last_n_same_sign(bars: &[HaBar], n: usize, sign: i8) -> bool {
    if bars.len() < n {
        return false;
    }
    bars[bars.len() - n..].iter().all(|b| b.body_dir == sign)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 1.0,
            quote_volume: 1.0,
            trades: 1,
            taker_base: 0.5,
            taker_quote: 0.5,
        }
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(heikin_ashi(&[]).is_empty());
    }

    #[test]
    fn first_bar_seeds_from_raw_open() {
        let bars = heikin_ashi(&[candle(100.0, 110.0, 90.0, 105.0)]);
        assert_eq!(bars.len(), 1);
        assert!((bars[0].open - 100.0).abs() < 1e-9);
        assert!((bars[0].close - 101.25).abs() < 1e-9);
    }

    #[test]
    fn three_rising_bars_have_bullish_bodies() {
        let candles: Vec<Candle> = (0..5)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 3.0, base - 1.0, base + 2.5)
            })
            .collect();
        let bars = heikin_ashi(&candles);
        assert!(last_n_same_sign(&bars, 3, 1));
    }

    #[test]
    fn last_n_same_sign_false_on_mixed() {
        let candles = vec![
            candle(100.0, 102.0, 99.0, 101.0),
            candle(101.0, 103.0, 100.0, 100.0),
            candle(100.0, 101.0, 95.0, 96.0),
        ];
        let bars = heikin_ashi(&candles);
        assert!(!last_n_same_sign(&bars, 3, 1));
        assert!(!last_n_same_sign(&bars, 3, -1));
    }
}
