// =============================================================================
// Risk Engine — pre-trade gates protecting capital and trade cadence
// =============================================================================
//
// Five gates, checked in the bar loop immediately before an entry is
// submitted (spec.md §4.7):
//   1. Open positions  — `open_positions < max_open_positions`.
//   2. Daily trades    — `daily_trades < max_daily_trades`.
//   3. Daily drawdown   — `daily_pnl > -daily_dd_limit_usdt`.
//   4. Losing streak   — `losing_streak < max_losing_streak`.
//   5. Cooldown        — no active cooldown for `(symbol, side)`.
//
// Kept from the teacher almost entirely: the `RwLock<Inner>` split, the
// UTC day-rollover double-checked-locking pattern, and the gate-order
// convention. Extended with the `cooldown` map from
// `original_source/async_trader.py`'s per-(symbol,side) re-entry guard and
// `config.py`'s `max_open_positions`; the percentage-of-capital breakers
// (daily loss %, max drawdown %) are replaced by the spec's absolute-USDT
// and count-based gates.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::Side;

/// Snapshot of a single gate for `/risk`-style status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

/// Full snapshot of the risk engine's internal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub risk_mode: String,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub losing_streak: u32,
    #[serde(default)]
    pub daily_trades: u32,
    #[serde(default)]
    pub daily_wins: u32,
    #[serde(default)]
    pub daily_losses: u32,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerInfo>,
    #[serde(default)]
    pub current_date: String,
}

struct Inner {
    daily_pnl: f64,
    losing_streak: u32,
    daily_trades: u32,
    daily_wins: u32,
    daily_losses: u32,
    current_date: String,
    /// Last bar tick an entry was opened on, per (symbol, side).
    cooldown: HashMap<(String, Side), u64>,
}

/// Configuration limits supplied at construction time.
pub struct RiskEngine {
    state: RwLock<Inner>,
    max_open_positions: u32,
    max_daily_trades: u32,
    daily_dd_limit_usdt: f64,
    max_losing_streak: u32,
    cooldown_bars: u64,
}

impl RiskEngine {
    pub fn new(
        max_open_positions: u32,
        max_daily_trades: u32,
        daily_dd_limit_usdt: f64,
        max_losing_streak: u32,
        cooldown_bars: u64,
    ) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            max_open_positions,
            max_daily_trades, daily_dd_limit_usdt, max_losing_streak, cooldown_bars,
            "RiskEngine initialised"
        );

        Self {
            state: RwLock::new(Inner {
                daily_pnl: 0.0,
                losing_streak: 0,
                daily_trades: 0,
                daily_wins: 0,
                daily_losses: 0,
                current_date: today,
                cooldown: HashMap::new(),
            }),
            max_open_positions,
            max_daily_trades,
            daily_dd_limit_usdt,
            max_losing_streak,
            cooldown_bars,
        }
    }

    /// Record the realised PnL of a closed trade and update the losing
    /// streak. Does not touch `daily_trades` — that increments at entry,
    /// via [`Self::record_entry`], per spec.md §4.7's "Entry" transition.
    pub fn record_trade_result(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        s.daily_pnl += pnl;
        if pnl >= 0.0 {
            s.daily_wins += 1;
            s.losing_streak = 0;
        } else {
            s.daily_losses += 1;
            s.losing_streak += 1;
        }

        debug!(
            pnl,
            daily_pnl = s.daily_pnl,
            losing_streak = s.losing_streak,
            "trade result recorded"
        );
    }

    /// Record a new entry: increments `daily_trades` and starts the
    /// cooldown for `(symbol, side)` at `bar_tick` (a monotonically
    /// increasing bar counter the caller maintains).
    pub fn record_entry(&self, symbol: &str, side: Side, bar_tick: u64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.daily_trades += 1;
        s.cooldown.insert((symbol.to_string(), side), bar_tick);
    }

    /// Check whether an entry on `(symbol, side)` is currently allowed.
    /// `open_positions` is the caller's current count of open positions
    /// (the risk engine does not itself track `ACTIVE`). `bar_tick` is the
    /// same monotonically increasing counter passed to `record_entry`.
    pub fn can_trade(
        &self,
        open_positions: u32,
        symbol: &str,
        side: Side,
        bar_tick: u64,
    ) -> (bool, Option<String>) {
        self.maybe_reset_daily();
        let s = self.state.read();

        if open_positions >= self.max_open_positions {
            let msg = format!(
                "Open Positions gate tripped: {} open (limit {})",
                open_positions, self.max_open_positions
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        if s.daily_trades >= self.max_daily_trades {
            let msg = format!(
                "Daily Trades gate tripped: {} trades today (limit {})",
                s.daily_trades, self.max_daily_trades
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        if s.daily_pnl <= -self.daily_dd_limit_usdt {
            let msg = format!(
                "Daily Drawdown gate tripped: {:.2} USDT lost (limit {:.2})",
                -s.daily_pnl, self.daily_dd_limit_usdt
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        if s.losing_streak >= self.max_losing_streak {
            let msg = format!(
                "Losing Streak gate tripped: {} consecutive losses (limit {})",
                s.losing_streak, self.max_losing_streak
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        if let Some(&last_entry) = s.cooldown.get(&(symbol.to_string(), side)) {
            if bar_tick.saturating_sub(last_entry) < self.cooldown_bars {
                let msg = format!(
                    "Cooldown gate tripped for {symbol} {side}: {} bars since last entry (cooldown {})",
                    bar_tick.saturating_sub(last_entry),
                    self.cooldown_bars
                );
                return (false, Some(msg));
            }
        }

        (true, None)
    }

    pub fn get_state(&self) -> RiskState {
        self.maybe_reset_daily();
        let s = self.state.read();
        RiskState {
            risk_mode: self.risk_mode(&s),
            daily_pnl: s.daily_pnl,
            losing_streak: s.losing_streak,
            daily_trades: s.daily_trades,
            daily_wins: s.daily_wins,
            daily_losses: s.daily_losses,
            circuit_breakers: self.build_circuit_breaker_info(&s),
            current_date: s.current_date.clone(),
        }
    }

    /// Forcefully reset daily statistics (the `/risk reset`-style admin path).
    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self::do_reset(&mut s, &today);
        info!(date = %today, "daily risk counters reset (manual)");
    }

    /// If the calendar date has changed since the last check, reset all
    /// daily counters (spec.md's "daily_trades is zero on the first event
    /// after a UTC day boundary", extended here to the other daily
    /// counters for consistency).
    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                "date rolled — resetting daily risk counters"
            );
            Self::do_reset(&mut s, &today);
        }
    }

    fn do_reset(s: &mut Inner, date: &str) {
        s.daily_pnl = 0.0;
        s.losing_streak = 0;
        s.daily_trades = 0;
        s.daily_wins = 0;
        s.daily_losses = 0;
        s.current_date = date.to_string();
    }

    fn risk_mode(&self, s: &Inner) -> String {
        if s.daily_pnl <= -self.daily_dd_limit_usdt
            || s.losing_streak >= self.max_losing_streak
            || s.daily_trades >= self.max_daily_trades
        {
            "BREAKER_TRIPPED".to_string()
        } else if s.daily_pnl <= -self.daily_dd_limit_usdt * 0.75
            || s.losing_streak as f64 >= self.max_losing_streak as f64 * 0.75
        {
            "Cautious".to_string()
        } else {
            "Normal".to_string()
        }
    }

    fn build_circuit_breaker_info(&self, s: &Inner) -> Vec<CircuitBreakerInfo> {
        vec![
            CircuitBreakerInfo {
                name: "Daily Drawdown".to_string(),
                current: (-s.daily_pnl).max(0.0),
                limit: self.daily_dd_limit_usdt,
                tripped: s.daily_pnl <= -self.daily_dd_limit_usdt,
            },
            CircuitBreakerInfo {
                name: "Losing Streak".to_string(),
                current: s.losing_streak as f64,
                limit: self.max_losing_streak as f64,
                tripped: s.losing_streak >= self.max_losing_streak,
            },
            CircuitBreakerInfo {
                name: "Daily Trades".to_string(),
                current: s.daily_trades as f64,
                limit: self.max_daily_trades as f64,
                tripped: s.daily_trades >= self.max_daily_trades,
            },
        ]
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("max_open_positions", &self.max_open_positions)
            .field("max_daily_trades", &self.max_daily_trades)
            .field("daily_dd_limit_usdt", &self.daily_dd_limit_usdt)
            .field("max_losing_streak", &self.max_losing_streak)
            .field("cooldown_bars", &self.cooldown_bars)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(3, 50, 10.0, 3, 3)
    }

    #[test]
    fn allows_trade_with_clean_state() {
        let r = engine();
        let (ok, reason) = r.can_trade(0, "BTCUSDT", Side::Buy, 100);
        assert!(ok);
        assert!(reason.is_none());
    }

    #[test]
    fn open_positions_gate_trips_at_max() {
        let r = engine();
        let (ok, reason) = r.can_trade(3, "BTCUSDT", Side::Buy, 100);
        assert!(!ok);
        assert!(reason.unwrap().contains("Open Positions"));
    }

    #[test]
    fn daily_drawdown_gate_trips_on_loss_exceeding_limit() {
        let r = engine();
        r.record_trade_result(-11.0);
        let (ok, reason) = r.can_trade(0, "BTCUSDT", Side::Buy, 100);
        assert!(!ok);
        assert!(reason.unwrap().contains("Daily Drawdown"));
    }

    #[test]
    fn losing_streak_gate_trips_after_n_losses() {
        let r = engine();
        r.record_trade_result(-1.0);
        r.record_trade_result(-1.0);
        r.record_trade_result(-1.0);
        let (ok, reason) = r.can_trade(0, "BTCUSDT", Side::Buy, 100);
        assert!(!ok);
        assert!(reason.unwrap().contains("Losing Streak"));
    }

    #[test]
    fn a_win_resets_the_losing_streak() {
        let r = engine();
        r.record_trade_result(-1.0);
        r.record_trade_result(-1.0);
        r.record_trade_result(5.0);
        let (ok, _) = r.can_trade(0, "BTCUSDT", Side::Buy, 100);
        assert!(ok);
    }

    #[test]
    fn daily_trades_gate_trips_at_max() {
        let r = RiskEngine::new(10, 2, 100.0, 10, 0);
        r.record_entry("BTCUSDT", Side::Buy, 1);
        r.record_entry("ETHUSDT", Side::Sell, 2);
        let (ok, reason) = r.can_trade(0, "SOLUSDT", Side::Buy, 3);
        assert!(!ok);
        assert!(reason.unwrap().contains("Daily Trades"));
    }

    #[test]
    fn cooldown_blocks_immediate_re_entry_on_same_symbol_and_side() {
        let r = engine();
        r.record_entry("BTCUSDT", Side::Buy, 10);
        let (ok, reason) = r.can_trade(0, "BTCUSDT", Side::Buy, 11);
        assert!(!ok);
        assert!(reason.unwrap().contains("Cooldown"));
    }

    #[test]
    fn cooldown_clears_after_enough_bars() {
        let r = engine();
        r.record_entry("BTCUSDT", Side::Buy, 10);
        let (ok, _) = r.can_trade(0, "BTCUSDT", Side::Buy, 13);
        assert!(ok);
    }

    #[test]
    fn cooldown_is_scoped_to_symbol_and_side() {
        let r = engine();
        r.record_entry("BTCUSDT", Side::Buy, 10);
        let (ok, _) = r.can_trade(0, "BTCUSDT", Side::Sell, 11);
        assert!(ok);
        let (ok, _) = r.can_trade(0, "ETHUSDT", Side::Buy, 11);
        assert!(ok);
    }
}
