// =============================================================================
// Configuration — environment-loaded, process-wide immutable snapshot
// =============================================================================
//
// Thin `std::env`/`dotenv` reader, the "environment-based configuration
// loading" collaborator spec.md §1 treats as out of scope for the hard
// engineering. The engine only ever depends on the `Config` value this
// module produces, not on how it got there.
//
// Field names and defaults are transcribed from `original_source/config.py`
// (the authoritative source for every default value in spec.md §6's table).
// =============================================================================

use std::str::FromStr;

use crate::types::{RunMode, SizingMode, StrategyMode};

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct Config {
    // --- Credentials ---------------------------------------------------
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub admin_user_id: String,
    pub state_path: String,

    // --- Sizing ----------------------------------------------------------
    pub leverage: i32,
    pub order_usdt_size: f64,
    pub risk_usdt_per_trade: f64,
    pub sizing_mode: SizingMode,

    // --- Universe ----------------------------------------------------------
    pub max_concurrent_symbols: usize,
    pub symbol_refresh_hours: u64,
    pub exclude_symbols: Vec<String>,
    pub preferred_price_max: f64,
    pub low_price_priority_max: f64,

    // --- Timeframes ----------------------------------------------------------
    pub entry_tf: String,
    pub mtf_fast: String,
    pub mtf_slow1: String,
    pub mtf_slow2: String,

    // --- Strategy ----------------------------------------------------------
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
    pub simple_mode: bool,

    // --- Position management ----------------------------------------------------------
    pub trailing_enabled: bool,
    pub be_trigger_atr_mult: f64,
    pub lock_profit_atr_mult: f64,
    pub trail_atr_mult: f64,

    // --- Operating mode ----------------------------------------------------------
    pub run_mode: RunMode,
    pub paused: bool,

    // --- Risk ----------------------------------------------------------
    pub max_open_positions: u32,
    pub max_daily_trades: u32,
    pub daily_dd_limit_usdt: f64,
    pub max_losing_streak: u32,
    pub cooldown_bars: i64,

    // --- Resilience ----------------------------------------------------------
    pub order_retry_max: u32,
    pub order_retry_backoff_ms: u64,
    pub time_drift_max_ms: i64,

    // --- Order-block filter ----------------------------------------------------------
    pub ob_enabled: bool,
    pub ob_lookback: usize,
    pub ob_impulse_atr: f64,
    pub ob_retest_tol: f64,

    // --- Entry refinements ----------------------------------------------------------
    pub maker_offset_bps: f64,
    pub maker_wait_seconds: u64,
    pub mtf_ema_filter: bool,
}

impl Config {
    /// Load configuration from the process environment, falling back to
    /// `original_source/config.py`'s defaults for any key that is unset.
    /// Calls `dotenv::dotenv()` first so a local `.env` file is honoured.
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenv::dotenv();

        let strategy_mode_simple = env_bool("SIMPLE_MODE", true);
        let sizing_mode_str = env_string("SIZING_MODE", "fixed");
        let run_mode_str = env_string("RUN_MODE", "LIVE");

        Ok(Self {
            binance_api_key: env_string("BINANCE_API_KEY", ""),
            binance_api_secret: env_string("BINANCE_API_SECRET", ""),
            admin_user_id: env_string("ADMIN_USER_ID", ""),
            state_path: env_string("STATE_PATH", "state.json"),

            leverage: env_parse("LEVERAGE", 15),
            order_usdt_size: env_parse("ORDER_USDT_SIZE", 20.0),
            risk_usdt_per_trade: env_parse("RISK_USDT_PER_TRADE", 5.0),
            sizing_mode: SizingMode::from_str(&sizing_mode_str).unwrap_or(SizingMode::Fixed),

            max_concurrent_symbols: env_parse("MAX_CONCURRENT_SYMBOLS", 8),
            symbol_refresh_hours: env_parse("SYMBOL_REFRESH_HOURS", 6),
            exclude_symbols: env_list("EXCLUDE_SYMBOLS", "BNBUSDT,BTCUSDT,ETHUSDT,SOLUSDT"),
            preferred_price_max: env_parse("PREFERRED_PRICE_MAX", 100.0),
            low_price_priority_max: env_parse("LOW_PRICE_PRIORITY_MAX", 1.0),

            entry_tf: env_string("ENTRY_TIMEFRAME", "1m"),
            mtf_fast: env_string("MTF_FAST", "5m"),
            mtf_slow1: env_string("MTF_SLOW_1", "15m"),
            mtf_slow2: env_string("MTF_SLOW_2", "1h"),

            rsi_period: env_parse("RSI_PERIOD", 14),
            hab_rsi_low: env_parse("HAB_RSI_LOW", 25.0),
            hab_rsi_high: env_parse("HAB_RSI_HIGH", 80.0),
            bands_length: env_parse("BANDS_LENGTH", 20),
            bands_multiplier: env_parse("BANDS_MULTIPLIER", 1.0),
            retest_tolerance_pct: env_parse("RETEST_TOLERANCE_PCT", 0.003),
            atr_period: env_parse("ATR_PERIOD", 14),
            sl_atr_mult: env_parse("SL_ATR_MULT", 0.4),
            tp1_atr_mult: env_parse("TP1_ATR_MULT", 0.8),
            tp2_atr_mult: env_parse("TP2_ATR_MULT", 1.2),
            smart_close_adj_pct: env_parse("SMART_CLOSE_ADJ_PCT", 0.001),
            simple_mode: strategy_mode_simple,

            trailing_enabled: env_bool("TRAILING_ENABLED", true),
            be_trigger_atr_mult: env_parse("BE_TRIGGER_ATR_MULT", 0.8),
            lock_profit_atr_mult: env_parse("LOCK_PROFIT_ATR_MULT", 0.1),
            trail_atr_mult: env_parse("TRAIL_ATR_MULT", 1.0),

            run_mode: RunMode::from_str(&run_mode_str).unwrap_or(RunMode::Live),
            paused: env_bool("PAUSED", false),

            max_open_positions: env_parse("MAX_OPEN_POSITIONS", 3),
            max_daily_trades: env_parse("MAX_DAILY_TRADES", 50),
            daily_dd_limit_usdt: env_parse("DAILY_DD_LIMIT_USDT", 10.0),
            max_losing_streak: env_parse("MAX_LOSING_STREAK", 3),
            cooldown_bars: env_parse("COOLDOWN_BARS", 3),

            order_retry_max: env_parse("ORDER_RETRY_MAX", 3),
            order_retry_backoff_ms: env_parse("ORDER_RETRY_BACKOFF_MS", 400),
            time_drift_max_ms: env_parse("TIME_DRIFT_MAX_MS", 1500),

            ob_enabled: env_bool("OB_ENABLED", false),
            ob_lookback: env_parse("OB_LOOKBACK", 300),
            ob_impulse_atr: env_parse("OB_IMPULSE_ATR", 1.5),
            ob_retest_tol: env_parse("OB_RETEST_TOL", 0.001),

            maker_offset_bps: env_parse("MAKER_OFFSET_BPS", 5.0),
            maker_wait_seconds: env_parse("MAKER_WAIT_SECONDS", 2),
            mtf_ema_filter: env_bool("MTF_EMA_FILTER", false),
        })
    }

    pub fn strategy_mode(&self) -> StrategyMode {
        if self.simple_mode {
            StrategyMode::Simple
        } else {
            StrategyMode::Advanced
        }
    }

    pub fn strategy_params(&self) -> crate::strategy::StrategyParams {
        crate::strategy::StrategyParams {
            rsi_period: self.rsi_period,
            hab_rsi_low: self.hab_rsi_low,
            hab_rsi_high: self.hab_rsi_high,
            bands_length: self.bands_length,
            bands_multiplier: self.bands_multiplier,
            retest_tolerance_pct: self.retest_tolerance_pct,
            atr_period: self.atr_period,
            sl_atr_mult: self.sl_atr_mult,
            tp1_atr_mult: self.tp1_atr_mult,
            tp2_atr_mult: self.tp2_atr_mult,
            smart_close_adj_pct: self.smart_close_adj_pct,
        }
    }

    pub fn order_block_config(&self) -> crate::strategy::OrderBlockConfig {
        crate::strategy::OrderBlockConfig {
            enabled: self.ob_enabled,
            lookback: self.ob_lookback,
            impulse_atr_mult: self.ob_impulse_atr,
            retest_tol: self.ob_retest_tol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialise the tests that
    // touch them so they cannot interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_reference_config() {
        let _guard = ENV_LOCK.lock().unwrap();
        for (k, _) in std::env::vars() {
            if k.starts_with("LEVERAGE")
                || k.starts_with("SL_ATR_MULT")
                || k.starts_with("COOLDOWN_BARS")
            {
                std::env::remove_var(k);
            }
        }
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.leverage, 15);
        assert!((cfg.sl_atr_mult - 0.4).abs() < 1e-12);
        assert_eq!(cfg.cooldown_bars, 3);
        assert_eq!(cfg.max_open_positions, 3);
        assert_eq!(cfg.max_daily_trades, 50);
    }

    #[test]
    fn env_overrides_take_effect() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("LEVERAGE", "20");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.leverage, 20);
        std::env::remove_var("LEVERAGE");
    }

    #[test]
    fn exclude_symbols_parses_csv() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("EXCLUDE_SYMBOLS", "AAAUSDT, BBBUSDT ,CCCUSDT");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.exclude_symbols, vec!["AAAUSDT", "BBBUSDT", "CCCUSDT"]);
        std::env::remove_var("EXCLUDE_SYMBOLS");
    }
}
