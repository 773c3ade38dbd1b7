// =============================================================================
// Order-block detection — break-of-structure zones for retest confirmation
// =============================================================================
//
// Scans for a break-of-structure against the last swing high/low where the
// close moves past the swing by at least `impulse_atr_mult * ATR`. The
// source order-block candle is the most recent opposing body within 10 bars
// of the break; zones expire after `max_age` bars.
// =============================================================================

use crate::indicators::atr::calculate_atr;
use crate::market_data::bar_cache::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObSide {
    Bull,
    Bear,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderBlock {
    pub side: ObSide,
    /// Index (within the scanned slice) of the breakout bar.
    pub break_idx: usize,
    /// Index of the source (opposing) candle.
    pub src_idx: usize,
    pub low: f64,
    pub high: f64,
}

/// `true` when index `i` is a local swing high/low over `lookback` bars on
/// each side (a simple centred-window fractal, mirroring the Python
/// reference's `_is_swing`).
fn is_swing_high(values: &[f64], i: usize, lookback: usize) -> bool {
    if i < lookback || i + lookback >= values.len() {
        return false;
    }
    let window = &values[i - lookback..=i + lookback];
    let v = values[i];
    window.iter().all(|&w| v >= w)
}

fn is_swing_low(values: &[f64], i: usize, lookback: usize) -> bool {
    if i < lookback || i + lookback >= values.len() {
        return false;
    }
    let window = &values[i - lookback..=i + lookback];
    let v = values[i];
    window.iter().all(|&w| v <= w)
}

/// Detect all order-block zones within `candles` (oldest-first), discarding
/// any whose breakout bar is more than `max_age` bars behind the last candle.
pub fn detect_order_blocks(
    candles: &[Candle],
    atr_period: usize,
    swing_lookback: usize,
    impulse_atr_mult: f64,
    max_age: usize,
) -> Vec<OrderBlock> {
    if candles.len() < atr_period + 2 {
        return Vec::new();
    }

    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let opens: Vec<f64> = candles.iter().map(|c| c.open).collect();

    let mut last_swing_high: Option<(usize, f64)> = None;
    let mut last_swing_low: Option<(usize, f64)> = None;
    let mut zones = Vec::new();

    for i in 0..candles.len() {
        if is_swing_high(&highs, i, swing_lookback) {
            last_swing_high = Some((i, highs[i]));
        }
        if is_swing_low(&lows, i, swing_lookback) {
            last_swing_low = Some((i, lows[i]));
        }

        // ATR "as of" bar i, computed from the prefix ending at i.
        let atr_here = match calculate_atr(&candles[..=i], atr_period) {
            Some(a) if a > 0.0 => a,
            _ => continue,
        };

        if let Some((_, swing_high)) = last_swing_high {
            if closes[i] > swing_high && (closes[i] - swing_high) >= impulse_atr_mult * atr_here {
                let lo_bound = i.saturating_sub(10);
                if let Some(src) = (lo_bound..i).rev().find(|&j| closes[j] < opens[j]) {
                    zones.push(OrderBlock {
                        side: ObSide::Bull,
                        break_idx: i,
                        src_idx: src,
                        low: lows[src],
                        high: opens[src].max(closes[src]),
                    });
                }
            }
        }

        if let Some((_, swing_low)) = last_swing_low {
            if closes[i] < swing_low && (swing_low - closes[i]) >= impulse_atr_mult * atr_here {
                let lo_bound = i.saturating_sub(10);
                if let Some(src) = (lo_bound..i).rev().find(|&j| closes[j] > opens[j]) {
                    zones.push(OrderBlock {
                        side: ObSide::Bear,
                        break_idx: i,
                        src_idx: src,
                        low: opens[src].min(closes[src]),
                        high: highs[src],
                    });
                }
            }
        }
    }

    let last_idx = candles.len() - 1;
    zones.retain(|z| last_idx - z.break_idx <= max_age);
    zones
}

/// Whether candle `i`'s high/low range touches `zone`, widened by `tol_pct`
/// on each side.
pub fn retest_hits(candles: &[Candle], zone: &OrderBlock, i: usize, tol_pct: f64) -> bool {
    let hi = candles[i].high;
    let lo = candles[i].low;
    let low_z = zone.low * (1.0 - tol_pct);
    let high_z = zone.high * (1.0 + tol_pct);
    !(hi < low_z || lo > high_z)
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
    fn no_zones_on_flat_market() {
        let candles = vec![candle(100.0, 101.0, 99.0, 100.0); 40];
        let zones = detect_order_blocks(&candles, 14, 3, 1.5, 200);
        assert!(zones.is_empty());
    }

    #[test]
    fn bullish_breakout_produces_bull_zone() {
        let mut candles = vec![candle(100.0, 101.0, 99.0, 100.0); 20];
        // Down candle that will serve as the OB source.
        candles.push(candle(100.0, 100.5, 97.0, 98.0));
        // A couple of quiet bars, then a strong impulse breakout.
        candles.push(candle(98.0, 99.0, 97.5, 98.5));
        candles.push(candle(98.5, 130.0, 98.0, 128.0));
        let zones = detect_order_blocks(&candles, 14, 3, 0.5, 200);
        assert!(zones.iter().any(|z| z.side == ObSide::Bull));
    }

    #[test]
    fn retest_hits_within_tolerance() {
        let candles = vec![candle(100.0, 101.0, 99.5, 100.0)];
        let zone = OrderBlock {
            side: ObSide::Bull,
            break_idx: 0,
            src_idx: 0,
            low: 99.0,
            high: 100.0,
        };
        assert!(retest_hits(&candles, &zone, 0, 0.001));
    }
}
