// =============================================================================
// Position state machine — Absent / Opening / Open(tp1_hit, be_done)
// =============================================================================
//
// Grounded on `original_source/async_trader.py`'s `ACTIVE` dict and the three
// functions that mutate it: `maybe_move_to_lock_profit` (breakeven),
// `apply_tp2_trailing` (ATR trailing stop) and `consume_user_events` (fill
// and close tracking). The reference keeps a loose dict of fields; this
// module gives that dict a real sum type so illegal states (e.g. `tp1_hit`
// on a position that was never opened) aren't representable.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::strategy::TradeLevels;
use crate::types::Side;

/// A tracked open position and the one-shot flags its lifecycle depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: String,
    pub side: Side,
    pub entry: f64,
    pub sl: f64,
    pub tp1: f64,
    pub tp2: f64,
    pub atr_at_entry: f64,
    pub qty: f64,
    /// Set once the TP1 reduce-only order fills; gates breakeven.
    pub tp1_hit: bool,
    /// Set once the stop has been moved to lock in profit; one-shot.
    pub be_done: bool,
}

impl OpenPosition {
    pub fn new(symbol: impl Into<String>, side: Side, levels: TradeLevels, atr: f64, qty: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            entry: levels.entry,
            sl: levels.sl,
            tp1: levels.tp1,
            tp2: levels.tp2,
            atr_at_entry: atr,
            qty,
            tp1_hit: false,
            be_done: false,
        }
    }
}

/// Per-symbol lifecycle state. `Opening` is a brief transitional state held
/// only between order submission and the account-update confirming the fill
/// so a crash mid-submission cannot leave two entries racing for the same
/// symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum PositionState {
    Absent,
    Opening { symbol: String, side: Side },
    Open(OpenPosition),
}

impl Default for PositionState {
    fn default() -> Self {
        Self::Absent
    }
}

impl PositionState {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    pub fn as_open(&self) -> Option<&OpenPosition> {
        match self {
            Self::Open(p) => Some(p),
            _ => None,
        }
    }
}

/// A requested stop-loss replacement: cancel the existing SL order, place a
/// new one at `new_sl`. The orchestrator executes this against the exchange;
/// this module only ever decides *whether* and *where*.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopUpdate {
    pub new_sl: f64,
}

/// Mirrors `maybe_move_to_lock_profit`: once price has moved `be_trigger_atr_mult
/// * atr` in the position's favour, move the stop to lock in
/// `lock_profit_atr_mult * atr` of profit, but only if that target is
/// strictly more favourable than the current stop (spec.md §4.4: "AND
/// `target = entry + lock_profit·atr > current sl`", `async_trader.py:56,70`).
/// Fires at most once per position (`be_done` is one-shot); independent of
/// `tp1_hit` — the reference checks only `be_done` before attempting the lock.
pub fn maybe_breakeven(
    pos: &mut OpenPosition,
    last_price: f64,
    be_trigger_atr_mult: f64,
    lock_profit_atr_mult: f64,
) -> Option<StopUpdate> {
    if pos.be_done {
        return None;
    }
    let atr = pos.atr_at_entry;
    let be_trigger = be_trigger_atr_mult * atr;
    let lock = lock_profit_atr_mult * atr;

    let target_sl = match pos.side {
        Side::Buy => {
            if last_price - pos.entry < be_trigger {
                return None;
            }
            let target = pos.entry + lock;
            if target <= pos.sl {
                return None;
            }
            target
        }
        Side::Sell => {
            if pos.entry - last_price < be_trigger {
                return None;
            }
            let target = pos.entry - lock;
            if target >= pos.sl {
                return None;
            }
            target
        }
    };

    pos.sl = target_sl;
    pos.be_done = true;
    Some(StopUpdate { new_sl: target_sl })
}

/// Mirrors `apply_tp2_trailing`: once TP1 has filled, ratchet the stop
/// toward price by `trail_atr_mult * atr`, never loosening it. Returns
/// `None` when the candidate stop would not improve on the current one.
/// Gated on `tp1_hit`, not `be_done` — the reference's trailing and
/// breakeven gates are independent one-shot/recurring checks, not a strict
/// sequence.
pub fn maybe_trail(
    pos: &mut OpenPosition,
    last_price: f64,
    trail_atr_mult: f64,
) -> Option<StopUpdate> {
    if !pos.tp1_hit {
        return None;
    }
    let atr = pos.atr_at_entry;
    let candidate = match pos.side {
        Side::Buy => last_price - trail_atr_mult * atr,
        Side::Sell => last_price + trail_atr_mult * atr,
    };

    let improved = match pos.side {
        Side::Buy => candidate > pos.sl,
        Side::Sell => candidate < pos.sl,
    };
    if !improved {
        return None;
    }

    pos.sl = candidate;
    Some(StopUpdate { new_sl: candidate })
}

/// Runs the breakeven gate then the trailing gate in sequence — the order
/// `bars_loop` calls `maybe_move_to_lock_profit` then `apply_tp2_trailing`
/// in, unconditionally, every closed bar. Both may fire in the same bar
/// (e.g. a position that already has `tp1_hit` crossing the breakeven
/// trigger for the first time): each produces its own cancel-then-replace
/// stop order, applied in the order returned.
pub fn maybe_manage_stop(
    pos: &mut OpenPosition,
    last_price: f64,
    be_trigger_atr_mult: f64,
    lock_profit_atr_mult: f64,
    trail_atr_mult: f64,
) -> Vec<StopUpdate> {
    let mut updates = Vec::with_capacity(2);
    if let Some(u) = maybe_breakeven(pos, last_price, be_trigger_atr_mult, lock_profit_atr_mult) {
        updates.push(u);
    }
    if let Some(u) = maybe_trail(pos, last_price, trail_atr_mult) {
        updates.push(u);
    }
    updates
}

/// Mirrors the `ORDER_TRADE_UPDATE` branch of `consume_user_events`: the
/// first FILLED `TAKE_PROFIT_MARKET` flips `tp1_hit`. Later TP fills
/// (TP2, or a repeated TP1 notification) are no-ops.
pub fn on_order_filled(pos: &mut OpenPosition, order_type: &str) {
    if order_type == "TAKE_PROFIT_MARKET" && !pos.tp1_hit {
        pos.tp1_hit = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_pos() -> OpenPosition {
        OpenPosition {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            entry: 100.0,
            sl: 99.0,
            tp1: 101.0,
            tp2: 102.0,
            atr_at_entry: 1.0,
            qty: 1.0,
            tp1_hit: false,
            be_done: false,
        }
    }

    #[test]
    fn breakeven_does_not_require_tp1_hit() {
        let mut pos = long_pos();
        // tp1_hit is false, but the reference gates breakeven on be_done only.
        let update = maybe_breakeven(&mut pos, 101.0, 0.8, 0.1).expect("should fire");
        assert!((update.new_sl - 100.1).abs() < 1e-9);
        assert!(pos.be_done);
    }

    #[test]
    fn breakeven_waits_for_trigger_distance() {
        let mut pos = long_pos();
        // Only 0.5 atr in favour, trigger requires 0.8.
        assert!(maybe_breakeven(&mut pos, 100.5, 0.8, 0.1).is_none());
    }

    #[test]
    fn breakeven_fires_once_and_locks_profit() {
        let mut pos = long_pos();
        let update = maybe_breakeven(&mut pos, 101.0, 0.8, 0.1).expect("should fire");
        assert!((update.new_sl - 100.1).abs() < 1e-9);
        assert!(pos.be_done);
        // Second call is a no-op even if price keeps moving favourably.
        assert!(maybe_breakeven(&mut pos, 105.0, 0.8, 0.1).is_none());
    }

    #[test]
    fn trailing_requires_tp1_hit() {
        let mut pos = long_pos();
        assert!(maybe_trail(&mut pos, 110.0, 1.0).is_none());
    }

    #[test]
    fn trailing_only_tightens_never_loosens() {
        let mut pos = long_pos();
        pos.tp1_hit = true;
        pos.be_done = true;
        pos.sl = 100.1;
        // Price far above entry: candidate sl = 109.0 - 1.0 = 108.0 > 100.1 -> improves.
        let update = maybe_trail(&mut pos, 109.0, 1.0).expect("should tighten");
        assert!((update.new_sl - 108.0).abs() < 1e-9);
        assert!((pos.sl - 108.0).abs() < 1e-9);

        // Price retraces: candidate sl = 103.0 - 1.0 = 102.0 < 108.0 -> would loosen, rejected.
        assert!(maybe_trail(&mut pos, 103.0, 1.0).is_none());
        assert!((pos.sl - 108.0).abs() < 1e-9);
    }

    #[test]
    fn short_side_breakeven_and_trailing_move_stop_downward() {
        let mut pos = long_pos();
        pos.side = Side::Sell;
        pos.entry = 100.0;
        pos.sl = 101.0;
        pos.tp1_hit = true;

        let update = maybe_breakeven(&mut pos, 99.0, 0.8, 0.1).expect("should fire");
        assert!((update.new_sl - 99.9).abs() < 1e-9);

        let update = maybe_trail(&mut pos, 90.0, 1.0).expect("should tighten");
        assert!((update.new_sl - 91.0).abs() < 1e-9);
    }

    #[test]
    fn manage_stop_can_fire_both_gates_in_one_bar() {
        let mut pos = long_pos();
        pos.tp1_hit = true;
        // Price jumps straight past the breakeven trigger and the trailing
        // distance in a single bar; both `maybe_move_to_lock_profit` and
        // `apply_tp2_trailing` are called unconditionally every bar in the
        // reference, so both may produce a replacement in the same tick.
        let updates = maybe_manage_stop(&mut pos, 110.0, 0.8, 0.1, 1.0);
        assert_eq!(updates.len(), 2);
        assert!((updates[0].new_sl - 100.1).abs() < 1e-9);
        assert!((updates[1].new_sl - 109.0).abs() < 1e-9);
        assert!((pos.sl - 109.0).abs() < 1e-9);
    }

    #[test]
    fn manage_stop_is_empty_when_neither_gate_fires() {
        let mut pos = long_pos();
        assert!(maybe_manage_stop(&mut pos, 100.0, 0.8, 0.1, 1.0).is_empty());
    }

    #[test]
    fn tp1_fill_flips_flag_once() {
        let mut pos = long_pos();
        on_order_filled(&mut pos, "TAKE_PROFIT_MARKET");
        assert!(pos.tp1_hit);
        // A second TP fill notification (TP2) leaves the flag untouched.
        on_order_filled(&mut pos, "TAKE_PROFIT_MARKET");
        assert!(pos.tp1_hit);
    }

    #[test]
    fn position_state_helpers() {
        let state = PositionState::Absent;
        assert!(state.is_absent());
        assert!(!state.is_open());

        let state = PositionState::Open(long_pos());
        assert!(state.is_open());
        assert!(state.as_open().is_some());
    }
}
