// =============================================================================
// Strategy evaluator — simple (single timeframe) and advanced (multi timeframe)
// =============================================================================
//
// `evaluate_simple` and `evaluate` are pure functions over bar slices: same
// input, same output, no hidden state. Side effects (order placement, state
// mutation) live entirely in `orchestrator.rs` and `position_state.rs`.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::atr::calculate_atr;
use crate::indicators::bands::bands;
use crate::indicators::ema::calculate_ema;
use crate::indicators::heikin_ashi::heikin_ashi;
use crate::indicators::order_block::{detect_order_blocks, retest_hits, ObSide};
use crate::indicators::rsi::calculate_rsi;
use crate::indicators::ssl::ssl_channel;
use crate::indicators::supertrend::supertrend;
use crate::indicators::taker_flow::taker_flow_direction;
use crate::market_data::Candle;

/// Immutable snapshot of the parameters both evaluators are configured with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StrategyParams {
    pub rsi_period: usize,
    pub hab_rsi_low: f64,
    pub hab_rsi_high: f64,
    pub bands_length: usize,
    pub bands_multiplier: f64,
    pub retest_tolerance_pct: f64,
    pub atr_period: usize,
    pub sl_atr_mult: f64,
    pub tp1_atr_mult: f64,
    pub tp2_atr_mult: f64,
    pub smart_close_adj_pct: f64,
}

/// Order-block confirmation configuration, separate from `StrategyParams`
/// because it is process-wide, not per-evaluation (matches `CFG.ob_*`).
#[derive(Debug, Clone, Copy)]
pub struct OrderBlockConfig {
    pub enabled: bool,
    pub lookback: usize,
    pub impulse_atr_mult: f64,
    pub retest_tol: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeLevels {
    pub entry: f64,
    pub sl: f64,
    pub tp1: f64,
    pub tp2: f64,
}

/// Sum type replacing the reference's nullable-field `Signal` dataclass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    None,
    Long(TradeLevels),
    Short(TradeLevels),
}

impl Signal {
    pub fn side(&self) -> Option<SignalSide> {
        match self {
            Signal::None => None,
            Signal::Long(_) => Some(SignalSide::Long),
            Signal::Short(_) => Some(SignalSide::Short),
        }
    }
}

fn closes_of(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

fn ob_confirms(
    candles: &[Candle],
    params: &StrategyParams,
    ob: &OrderBlockConfig,
    side: SignalSide,
) -> bool {
    if !ob.enabled {
        return true;
    }
    let window_start = candles.len().saturating_sub(ob.lookback);
    let window = &candles[window_start..];
    let zones = detect_order_blocks(window, params.atr_period, 3, ob.impulse_atr_mult, ob.lookback);
    let i = window.len() - 1;
    let want = match side {
        SignalSide::Long => ObSide::Bull,
        SignalSide::Short => ObSide::Bear,
    };
    zones
        .iter()
        .any(|z| z.side == want && retest_hits(window, z, i, ob.retest_tol))
}

/// Single-timeframe evaluator: an EMA-ATR envelope with an RSI and EMA-slope
/// gate, optionally confirmed by an order-block retest.
pub fn evaluate_simple(
    candles: &[Candle],
    params: &StrategyParams,
    ob: &OrderBlockConfig,
) -> Signal {
    let min_len = params.bands_length.max(50) + 10;
    if candles.len() < min_len.max(50) {
        return Signal::None;
    }

    let closes = closes_of(candles);
    let length = params.bands_length.clamp(10, 200);
    let ema = calculate_ema(&closes, length);
    let atr_val = match calculate_atr(candles, params.atr_period) {
        Some(a) => a,
        None => return Signal::None,
    };
    let rsi_series = calculate_rsi(&closes, params.rsi_period);

    if ema.is_empty() || rsi_series.is_empty() || ema.len() < 4 {
        return Signal::None;
    }

    let i = candles.len() - 1;
    let price = closes[i];
    let ema_i = *ema.last().unwrap();
    // ema[i] vs ema[i-3]: since `calculate_ema` starts at index `length - 1`
    // of `closes`, the EMA series' own last-vs-3-back comparison is
    // equivalent as long as at least 4 EMA points exist.
    let ema_prev3 = ema[ema.len() - 4];
    let rsi_val = *rsi_series.last().unwrap();

    let b = match bands(&closes, length, params.bands_multiplier) {
        Some(b) => b,
        None => return Signal::None,
    };

    let ema_slope_up = ema_i > ema_prev3;
    let ema_slope_dn = ema_i < ema_prev3;

    if price <= b.lower && rsi_val <= params.hab_rsi_low && ema_slope_up {
        if !ob_confirms(candles, params, ob, SignalSide::Long) {
            return Signal::None;
        }
        let entry = price;
        let sl = entry - params.sl_atr_mult * atr_val;
        let tp1 = entry + params.tp1_atr_mult * atr_val;
        let tp2 = entry + params.tp2_atr_mult * atr_val;
        return Signal::Long(TradeLevels { entry, sl, tp1, tp2 });
    }

    if price >= b.upper && rsi_val >= params.hab_rsi_high && ema_slope_dn {
        if !ob_confirms(candles, params, ob, SignalSide::Short) {
            return Signal::None;
        }
        let entry = price;
        let sl = entry + params.sl_atr_mult * atr_val;
        let tp1 = entry - params.tp1_atr_mult * atr_val;
        let tp2 = entry - params.tp2_atr_mult * atr_val;
        return Signal::Short(TradeLevels { entry, sl, tp1, tp2 });
    }

    Signal::None
}

/// Whether the timeframe's RSI moved up (resp. down) over its last 3 bars,
/// used as the multi-timeframe confirmation gate in `evaluate`.
fn mtf_rsi_direction(candles: &[Candle], rsi_period: usize) -> Option<(bool, bool)> {
    let closes = closes_of(candles);
    let rsi_series = calculate_rsi(&closes, rsi_period);
    if rsi_series.len() < 3 {
        return None;
    }
    let last = rsi_series[rsi_series.len() - 1];
    let back3 = rsi_series[rsi_series.len() - 3];
    Some((last >= back3, last <= back3))
}

/// Four-timeframe evaluator. `candles_*` are oldest-first bar slices for the
/// entry timeframe and each confirming higher timeframe.
#[allow(clippy::too_many_arguments)]
pub fn evaluate(
    candles_entry: &[Candle],
    candles_fast: &[Candle],
    candles_slow1: &[Candle],
    candles_slow2: &[Candle],
    params: &StrategyParams,
    ob: &OrderBlockConfig,
) -> Signal {
    if candles_entry.len() < 50 {
        return Signal::None;
    }
    let i = candles_entry.len() - 1;

    let ha = heikin_ashi(candles_entry);
    if ha.len() < 3 {
        return Signal::None;
    }
    let body_sum: i32 = ha[ha.len() - 3..].iter().map(|b| b.body_dir as i32).sum();
    if body_sum != 3 && body_sum != -3 {
        return Signal::None;
    }

    let flow_dir = taker_flow_direction(candles_entry, 3);

    let b = match bands(&closes_of(candles_entry), params.bands_length, params.bands_multiplier) {
        Some(b) => b,
        None => return Signal::None,
    };
    let touched_lower = candles_entry[i].low <= b.lower;
    let touched_upper = candles_entry[i].high >= b.upper;

    let retest_lower_ok = (candles_entry[i].close - b.lower).abs() / b.lower.max(1e-9)
        <= params.retest_tolerance_pct;
    let retest_upper_ok = (candles_entry[i].close - b.upper).abs() / b.upper.max(1e-9)
        <= params.retest_tolerance_pct;

    let rsi_series = calculate_rsi(&closes_of(candles_entry), params.rsi_period);
    let rsi_val = match rsi_series.last() {
        Some(v) => *v,
        None => return Signal::None,
    };

    let (fast_up, fast_dn) = match mtf_rsi_direction(candles_fast, params.rsi_period) {
        Some(v) => v,
        None => return Signal::None,
    };
    let (slow1_up, slow1_dn) = match mtf_rsi_direction(candles_slow1, params.rsi_period) {
        Some(v) => v,
        None => return Signal::None,
    };
    let (slow2_up, slow2_dn) = match mtf_rsi_direction(candles_slow2, params.rsi_period) {
        Some(v) => v,
        None => return Signal::None,
    };
    let mtf_up = fast_up && slow1_up && slow2_up;
    let mtf_dn = fast_dn && slow1_dn && slow2_dn;

    let ssl = match ssl_channel(candles_entry, 10) {
        Some(s) => s,
        None => return Signal::None,
    };
    let st = match supertrend(candles_entry, 10, 3.0) {
        Some(s) => s,
        None => return Signal::None,
    };

    let atr_val = match calculate_atr(candles_entry, params.atr_period) {
        Some(a) => a,
        None => return Signal::None,
    };
    let price = candles_entry[i].close;

    if body_sum == 3
        && flow_dir >= 0
        && touched_lower
        && retest_lower_ok
        && rsi_val <= params.hab_rsi_low
        && mtf_up
        && ssl.direction > 0
        && st.direction > 0
        && ob_confirms(candles_entry, params, ob, SignalSide::Long)
    {
        let entry = price;
        let sl = (price - params.sl_atr_mult * atr_val).max(candles_entry[i].low);
        let tp1 = price + params.tp1_atr_mult * atr_val;
        let tp2 = price + params.tp2_atr_mult * atr_val;
        return Signal::Long(TradeLevels { entry, sl, tp1, tp2 });
    }

    if body_sum == -3
        && flow_dir <= 0
        && touched_upper
        && retest_upper_ok
        && rsi_val >= params.hab_rsi_high
        && mtf_dn
        && ssl.direction < 0
        && st.direction < 0
        && ob_confirms(candles_entry, params, ob, SignalSide::Short)
    {
        let entry = price;
        let sl = (price + params.sl_atr_mult * atr_val).min(candles_entry[i].high);
        let tp1 = price - params.tp1_atr_mult * atr_val;
        let tp2 = price - params.tp2_atr_mult * atr_val;
        return Signal::Short(TradeLevels { entry, sl, tp1, tp2 });
    }

    Signal::None
}

/// Post-signal MTF-EMA gate: on the fast timeframe, require EMA20>EMA50 for
/// long / EMA20<EMA50 for short, else downgrade the signal to `None`.
pub fn apply_mtf_ema_filter(signal: Signal, candles_fast: &[Candle]) -> Signal {
    let side = match signal.side() {
        Some(s) => s,
        None => return signal,
    };
    let closes = closes_of(candles_fast);
    let ema20 = calculate_ema(&closes, 20);
    let ema50 = calculate_ema(&closes, 50);
    let (Some(&e20), Some(&e50)) = (ema20.last(), ema50.last()) else {
        return signal;
    };
    match side {
        SignalSide::Long if e20 > e50 => signal,
        SignalSide::Short if e20 < e50 => signal,
        _ => Signal::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> StrategyParams {
        StrategyParams {
            rsi_period: 14,
            hab_rsi_low: 25.0,
            hab_rsi_high: 80.0,
            bands_length: 20,
            bands_multiplier: 1.0,
            retest_tolerance_pct: 0.01,
            atr_period: 14,
            sl_atr_mult: 0.4,
            tp1_atr_mult: 0.8,
            tp2_atr_mult: 1.2,
            smart_close_adj_pct: 0.001,
        }
    }

    fn no_ob() -> OrderBlockConfig {
        OrderBlockConfig {
            enabled: false,
            lookback: 300,
            impulse_atr_mult: 1.5,
            retest_tol: 0.001,
        }
    }

    fn candle(o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 100.0,
            quote_volume: 100.0 * c,
            trades: 10,
            taker_base: 50.0,
            taker_quote: 50.0 * c,
        }
    }

    #[test]
    fn evaluate_simple_insufficient_data_is_none() {
        let candles = vec![candle(100.0, 101.0, 99.0, 100.0); 10];
        assert_eq!(evaluate_simple(&candles, &params(), &no_ob()), Signal::None);
    }

    #[test]
    fn evaluate_simple_long_on_dip_with_low_rsi_and_upward_ema() {
        // A long, gentle uptrend feeding into a sharp one-bar dip below the
        // lower band, with RSI still depressed from the dip.
        let mut candles: Vec<Candle> = Vec::new();
        for i in 0..80 {
            let base = 100.0 + i as f64 * 0.05;
            candles.push(candle(base, base + 0.3, base - 0.3, base));
        }
        let last_base = candles.last().unwrap().close;
        candles.push(candle(last_base, last_base, last_base - 6.0, last_base - 6.0));

        let sig = evaluate_simple(&candles, &params(), &no_ob());
        match sig {
            Signal::Long(levels) => {
                assert!(levels.sl < levels.entry);
                assert!(levels.tp1 > levels.entry);
                assert!(levels.tp2 > levels.tp1);
            }
            other => panic!("expected Long signal, got {other:?}"),
        }
    }

    #[test]
    fn evaluate_advanced_rejects_mixed_ha_bodies() {
        // Heikin-Ashi bodies alternating sign over the last 3 bars must
        // reject regardless of any other gate.
        let mut candles: Vec<Candle> = Vec::new();
        for i in 0..60 {
            let base = 100.0 + (i % 2) as f64 * 5.0;
            candles.push(candle(base, base + 1.0, base - 1.0, base));
        }
        let sig = evaluate(&candles, &candles, &candles, &candles, &params(), &no_ob());
        assert_eq!(sig, Signal::None);
    }

    #[test]
    fn mtf_ema_filter_downgrades_long_against_the_trend() {
        let mut candles: Vec<Candle> = Vec::new();
        for i in 0..60 {
            let base = 100.0 - i as f64 * 0.2;
            candles.push(candle(base, base + 0.2, base - 0.2, base));
        }
        let levels = TradeLevels {
            entry: 100.0,
            sl: 99.0,
            tp1: 101.0,
            tp2: 102.0,
        };
        let result = apply_mtf_ema_filter(Signal::Long(levels), &candles);
        assert_eq!(result, Signal::None);
    }

    #[test]
    fn mtf_ema_filter_passes_none_through_unchanged() {
        let candles = vec![candle(100.0, 101.0, 99.0, 100.0); 60];
        assert_eq!(apply_mtf_ema_filter(Signal::None, &candles), Signal::None);
    }
}
