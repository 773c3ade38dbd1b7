// =============================================================================
// Taker-flow direction — order-heat proxy from kline taker-buy volume
// =============================================================================
//
// For each of the last `n` bars: contributes +1 if (taker_base/volume > 0.5
// AND close moved up or flat), -1 if the mirror image, else 0. The aggregate
// maps to +1 when it reaches `n - 1`, -1 when it reaches `-(n - 1)`, else 0.
// =============================================================================

use crate::market_data::bar_cache::Candle;

/// Aggregate taker-flow direction over the last `n` bars of `candles`.
/// Returns 0 (neutral) if there are fewer than `n + 1` candles — a taker-flow
/// reading needs a previous close to determine each bar's price direction.
pub fn taker_flow_direction(candles: &[Candle], n: usize) -> i32 {
    if n == 0 || candles.len() < n + 1 {
        return 0;
    }

    let start = candles.len() - n;
    let mut sum = 0i32;
    for i in start..candles.len() {
        let vol = candles[i].volume + 1e-12;
        let frac = candles[i].taker_base / vol;
        let price_dir = (candles[i].close - candles[i - 1].close).signum();

        let bar_dir = if frac > 0.5 && price_dir >= 0.0 {
            1
        } else if frac < 0.5 && price_dir <= 0.0 {
            -1
        } else {
            0
        };
        sum += bar_dir;
    }

    let n = n as i32;
    if sum >= n - 1 {
        1
    } else if sum <= -(n - 1) {
        -1
    } else {
        0
    }
}
