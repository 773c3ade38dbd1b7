// =============================================================================
// Orchestrator — wires bar stream, user stream, symbol refresh and the
// operator command channel onto the shared engine state
// =============================================================================
//
// Grounded on `original_source/async_trader.py`'s four top-level
// `asyncio.create_task` loops (`bars_loop`, `consume_user_events`,
// `symbol_refresh_loop`, `command_loop`), generalised from their dict/global
// state to the typed collaborators the rest of this crate builds:
// `PositionState`, `RiskEngine`, `BarCache`, `ExchangeAdapter`. The single
// `tokio::sync::Mutex<EngineState>` plays the role the reference's GIL-backed
// module-level globals played — one logical serialisation point for every
// mutation of `ACTIVE`/`paused`/the mutable config overrides.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::binance::adapter::ExchangeAdapter;
use crate::binance::user_stream::UserEvent;
use crate::command::{Command, CommandChannel};
use crate::config::Config;
use crate::market_data::{BarCache, CandleKey, ClosedBar};
use crate::position_state::{maybe_manage_stop, on_order_filled, OpenPosition, PositionState};
use crate::risk::RiskEngine;
use crate::state_store::{save_state, PersistedState};
use crate::strategy::{self, Signal};
use crate::types::{Side, StrategyMode};

/// The mutable subset of configuration the `/mode`, `/size` and `/lev`
/// commands adjust at runtime, split out from `Config` because it is the
/// only part of configuration that changes after startup.
pub struct MutableSettings {
    pub strategy_mode: StrategyMode,
    pub order_usdt_size: f64,
    pub leverage: i32,
}

/// Everything the four orchestrator tasks share. One logical mutex — the
/// `active` map — serialises every state transition a bar, a fill, or an
/// operator command can cause, matching the "single serialization point"
/// invariant.
pub struct EngineState {
    pub active: Mutex<HashMap<String, PositionState>>,
    pub paused: AtomicBool,
    pub settings: Mutex<MutableSettings>,
    pub bar_tick: AtomicU64,
    pub symbols: Mutex<Vec<String>>,
    pub config: Config,
    pub adapter: Arc<ExchangeAdapter>,
    pub bar_cache: Arc<BarCache>,
    pub risk: Arc<RiskEngine>,
}

impl EngineState {
    pub fn new(
        config: Config,
        adapter: Arc<ExchangeAdapter>,
        bar_cache: Arc<BarCache>,
        risk: Arc<RiskEngine>,
        initial_active: HashMap<String, PositionState>,
        initial_symbols: Vec<String>,
    ) -> Self {
        let settings = MutableSettings {
            strategy_mode: config.strategy_mode(),
            order_usdt_size: config.order_usdt_size,
            leverage: config.leverage,
        };
        Self {
            active: Mutex::new(initial_active),
            paused: AtomicBool::new(config.paused),
            settings: Mutex::new(settings),
            bar_tick: AtomicU64::new(0),
            symbols: Mutex::new(initial_symbols),
            config,
            adapter,
            bar_cache,
            risk,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    async fn snapshot_for_save(&self) -> PersistedState {
        let active = self.active.lock().await;
        PersistedState { active: active.clone() }
    }

    pub async fn persist(&self) {
        let snapshot = self.snapshot_for_save().await;
        save_state(&snapshot, &self.config.state_path);
    }
}

/// Position sizing: `fixed` uses `order_usdt_size * leverage` as notional;
/// `atr` scales notional so a stop-loss-distance move risks
/// `risk_usdt_per_trade * leverage`, per spec.md §4.6 and
/// `async_trader.py:341,343`.
fn compute_quantity(
    config: &Config,
    order_usdt_size: f64,
    leverage: f64,
    entry: f64,
    sl: f64,
) -> f64 {
    match config.sizing_mode {
        crate::types::SizingMode::Fixed => (order_usdt_size * leverage) / entry.max(1e-9),
        crate::types::SizingMode::Atr => {
            let risk_per_unit = (entry - sl).abs().max(1e-9);
            (config.risk_usdt_per_trade * leverage) / risk_per_unit
        }
    }
}

/// Consumes closed bars from the market-data stream: upserts the bar cache,
/// manages stops on any open position for that symbol, then (when unpaused
/// and risk allows) evaluates the strategy and submits a new entry.
/// Mirrors `bars_loop`.
pub async fn bar_loop(state: Arc<EngineState>, mut rx: mpsc::Receiver<ClosedBar>) {
    while let Some(closed) = rx.recv().await {
        let key = closed.key.clone();
        state.bar_cache.upsert(key.clone(), closed.candle.clone());

        if key.interval != state.config.entry_tf {
            continue;
        }

        let tick = state.bar_tick.fetch_add(1, Ordering::Relaxed) + 1;
        let last_price = closed.candle.close;

        if let Err(e) = manage_existing_position(&state, &key.symbol, last_price).await {
            error!(symbol = %key.symbol, error = %e, "failed to manage stop for open position");
        }

        if state.is_paused() {
            continue;
        }

        if let Err(e) = maybe_enter(&state, &key.symbol, tick).await {
            error!(symbol = %key.symbol, error = %e, "entry evaluation failed");
        }
    }
    warn!("bar channel closed — bar_loop exiting");
}

async fn manage_existing_position(
    state: &Arc<EngineState>,
    symbol: &str,
    last_price: f64,
) -> anyhow::Result<()> {
    let settings = state.settings.lock().await;
    let (be_mult, lock_mult, trail_mult, trailing_enabled) = (
        state.config.be_trigger_atr_mult,
        state.config.lock_profit_atr_mult,
        state.config.trail_atr_mult,
        state.config.trailing_enabled,
    );
    drop(settings);

    let mut active = state.active.lock().await;
    let entry = match active.get_mut(symbol) {
        Some(PositionState::Open(pos)) => pos,
        _ => return Ok(()),
    };

    if !trailing_enabled {
        return Ok(());
    }

    let updates = maybe_manage_stop(entry, last_price, be_mult, lock_mult, trail_mult);
    if updates.is_empty() {
        return Ok(());
    }
    let closing_side = entry.side.closing_side();
    let symbol_owned = entry.symbol.clone();
    drop(active);

    for update in updates {
        if let Err(e) = state
            .adapter
            .place_stop_market(&symbol_owned, closing_side, update.new_sl, true, "SL")
            .await
        {
            warn!(symbol = %symbol_owned, error = %e, "failed to replace stop-loss order");
        }
    }
    Ok(())
}

async fn maybe_enter(state: &Arc<EngineState>, symbol: &str, tick: u64) -> anyhow::Result<()> {
    {
        let active = state.active.lock().await;
        if active.get(symbol).is_some_and(|s| !s.is_absent()) {
            return Ok(());
        }
    }

    let open_count = {
        let active = state.active.lock().await;
        active.values().filter(|s| s.is_open()).count() as u32
    };

    let params = state.config.strategy_params();
    let ob = state.config.order_block_config();
    let entry_key = CandleKey::new(symbol, &state.config.entry_tf);

    let mode = state.settings.lock().await.strategy_mode;
    let signal = match mode {
        StrategyMode::Simple => {
            let candles = state.bar_cache.get(&entry_key, 500);
            strategy::evaluate_simple(&candles, &params, &ob)
        }
        StrategyMode::Advanced => {
            let candles_entry = state.bar_cache.get(&entry_key, 500);
            let candles_fast =
                state.bar_cache.get(&CandleKey::new(symbol, &state.config.mtf_fast), 300);
            let candles_slow1 =
                state.bar_cache.get(&CandleKey::new(symbol, &state.config.mtf_slow1), 300);
            let candles_slow2 =
                state.bar_cache.get(&CandleKey::new(symbol, &state.config.mtf_slow2), 300);
            let raw = strategy::evaluate(
                &candles_entry,
                &candles_fast,
                &candles_slow1,
                &candles_slow2,
                &params,
                &ob,
            );
            if state.config.mtf_ema_filter {
                strategy::apply_mtf_ema_filter(raw, &candles_fast)
            } else {
                raw
            }
        }
    };

    let (side, levels) = match signal {
        Signal::None => return Ok(()),
        Signal::Long(l) => (Side::Buy, l),
        Signal::Short(l) => (Side::Sell, l),
    };

    let (allowed, reason) = state.risk.can_trade(open_count, symbol, side, tick);
    if !allowed {
        info!(symbol, reason = reason.as_deref().unwrap_or(""), "entry blocked by risk gate");
        return Ok(());
    }

    {
        let mut active = state.active.lock().await;
        active.insert(
            symbol.to_string(),
            PositionState::Opening { symbol: symbol.to_string(), side },
        );
    }

    let settings = state.settings.lock().await;
    let order_usdt_size = settings.order_usdt_size;
    let leverage = settings.leverage;
    drop(settings);

    let atr = (levels.tp1 - levels.entry).abs() / state.config.tp1_atr_mult.max(1e-9);

    // Maker attempt ahead of the market leg, per `bars_loop:328-336`: a
    // best-effort post-only probe at `maker_offset_bps` off the last close.
    // The returned order id is intentionally discarded, not cancelled,
    // matching the reference's behaviour — see DESIGN.md Open Question (b).
    let qty_guess = (order_usdt_size * leverage as f64) / levels.entry.max(1e-9);
    if let Err(e) = state
        .adapter
        .submit_maker_probe(
            symbol,
            side,
            levels.entry,
            state.config.maker_offset_bps,
            qty_guess,
            state.config.maker_wait_seconds,
        )
        .await
    {
        warn!(symbol, error = %e, "maker probe failed, continuing with market entry");
    }

    let qty = compute_quantity(&state.config, order_usdt_size, leverage as f64, levels.entry, levels.sl);
    let qty = match state.adapter.format_qty(symbol, qty) {
        Ok(q) => q,
        Err(e) => {
            error!(symbol, error = %e, "failed to quantize entry quantity — reverting to Absent");
            let mut active = state.active.lock().await;
            active.insert(symbol.to_string(), PositionState::Absent);
            return Err(e);
        }
    };
    let notional_ok = state.adapter.min_notional_ok(symbol, levels.entry, qty).unwrap_or(true);
    if qty <= 0.0 || !notional_ok {
        info!(symbol, qty, notional_ok, "entry skipped: qty <= 0 or below min notional");
        let mut active = state.active.lock().await;
        active.insert(symbol.to_string(), PositionState::Absent);
        return Ok(());
    }

    if let Err(e) = state.adapter.set_leverage(symbol, leverage).await {
        warn!(symbol, error = %e, "set_leverage failed ahead of entry");
    }

    let entry_order = state.adapter.place_market_order(symbol, side, qty, false, "ENTRY").await;
    let entry_order = match entry_order {
        Ok(o) => o,
        Err(e) => {
            error!(symbol, error = %e, "entry order failed — reverting to Absent");
            let mut active = state.active.lock().await;
            active.insert(symbol.to_string(), PositionState::Absent);
            return Err(e);
        }
    };
    let _ = entry_order;

    let closing_side = side.closing_side();
    if let Err(e) = state.adapter.place_stop_market(symbol, closing_side, levels.sl, true, "SL").await {
        warn!(symbol, error = %e, "failed to place initial stop-loss");
    }
    let half_qty = qty / 2.0;
    if let Err(e) = state
        .adapter
        .place_take_profit_market(symbol, closing_side, levels.tp1, Some(half_qty), "TP1")
        .await
    {
        warn!(symbol, error = %e, "failed to place TP1");
    }
    if let Err(e) = state
        .adapter
        .place_take_profit_market(symbol, closing_side, levels.tp2, None, "TP2")
        .await
    {
        warn!(symbol, error = %e, "failed to place TP2");
    }

    state.risk.record_entry(symbol, side, tick);

    {
        let mut active = state.active.lock().await;
        active.insert(
            symbol.to_string(),
            PositionState::Open(OpenPosition::new(symbol, side, levels, atr, qty)),
        );
    }
    state.persist().await;

    info!(symbol, %side, entry = levels.entry, sl = levels.sl, tp1 = levels.tp1, tp2 = levels.tp2, "entered position");
    Ok(())
}

/// Consumes decoded user-data events: flips `tp1_hit` on a filled TP1/TP2
/// order, and clears the `ACTIVE` entry once the exchange reports the
/// position flat. Mirrors `consume_user_events`.
pub async fn user_event_loop(state: Arc<EngineState>, mut rx: mpsc::Receiver<UserEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            UserEvent::OrderUpdate { symbol, order_type, realized_pnl, .. } => {
                let mut active = state.active.lock().await;
                if let Some(PositionState::Open(pos)) = active.get_mut(&symbol) {
                    on_order_filled(pos, &order_type);
                }
                drop(active);
                // Realised PnL drives the losing-streak/daily-drawdown gates
                // (spec.md §3); zero for fills that don't close or reduce a
                // position (e.g. the entry MARKET order).
                if realized_pnl != 0.0 {
                    state.risk.record_trade_result(realized_pnl);
                }
                state.persist().await;
            }
            UserEvent::PositionClosed { symbol } => {
                let mut active = state.active.lock().await;
                if active.remove(&symbol).is_some() {
                    info!(symbol = %symbol, "position closed, clearing active entry");
                }
                drop(active);
                state.persist().await;
            }
        }
    }
    warn!("user-event channel closed — user_event_loop exiting");
}

/// Periodically refreshes the top-volume symbol universe and cycles the
/// kline stream supervisor onto it via its explicit `stop()`/`subscribe()`
/// API — replacing the reference's cyclic "tear down and rebuild the whole
/// WSManager" reconnect gesture (see spec.md §9).
pub async fn symbol_refresh_loop(
    state: Arc<EngineState>,
    supervisor: Arc<Mutex<crate::market_data::KlineStreamSupervisor>>,
) {
    let interval = std::time::Duration::from_secs(state.config.symbol_refresh_hours * 3600);
    loop {
        tokio::time::sleep(interval).await;
        match state
            .adapter
            .top_usdt_perp_symbols(
                state.config.max_concurrent_symbols,
                &state.config.exclude_symbols,
                state.config.preferred_price_max,
                state.config.low_price_priority_max,
            )
            .await
        {
            Ok(new_symbols) => {
                if let Err(e) = state.adapter.refresh_filters().await {
                    warn!(error = %e, "failed to refresh exchange filters during symbol refresh");
                }
                let mut symbols = state.symbols.lock().await;
                if *symbols != new_symbols {
                    info!(old = ?*symbols, new = ?new_symbols, "rotating symbol universe");
                    *symbols = new_symbols.clone();
                    let mut intervals = vec![state.config.entry_tf.clone()];
                    if state.settings.lock().await.strategy_mode == StrategyMode::Advanced {
                        intervals.push(state.config.mtf_fast.clone());
                        intervals.push(state.config.mtf_slow1.clone());
                        intervals.push(state.config.mtf_slow2.clone());
                    }
                    let mut sup = supervisor.lock().await;
                    sup.stop();
                    sup.subscribe(&new_symbols, &intervals);
                }
            }
            Err(e) => error!(error = %e, "failed to fetch top USDT perpetual symbols"),
        }
    }
}

/// Polls the operator command channel and applies accepted commands against
/// the shared engine state. Mirrors `command_loop`'s 2-second poll cadence.
pub async fn command_loop(state: Arc<EngineState>, mut channel: Box<dyn CommandChannel>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(2));
    loop {
        interval.tick().await;
        let inbound = channel.poll().await;
        if inbound.is_empty() {
            continue;
        }
        let commands = crate::command::accepted_commands(&state.config.admin_user_id, inbound);
        for cmd in commands {
            apply_command(&state, &mut *channel, cmd).await;
        }
    }
}

async fn apply_command(state: &Arc<EngineState>, channel: &mut dyn CommandChannel, cmd: Command) {
    match cmd {
        Command::Pause => {
            state.paused.store(true, Ordering::Relaxed);
            channel.reply("paused").await;
        }
        Command::Resume => {
            state.paused.store(false, Ordering::Relaxed);
            channel.reply("resumed").await;
        }
        Command::Status => {
            let active = state.active.lock().await;
            let open: Vec<&String> = active.keys().collect();
            channel
                .reply(&format!("paused={} open={:?}", state.is_paused(), open))
                .await;
        }
        Command::Autocoins | Command::Symbols => {
            let symbols = state.symbols.lock().await;
            channel.reply(&format!("symbols: {:?}", *symbols)).await;
        }
        Command::Risk => {
            let risk_state = state.risk.get_state();
            channel
                .reply(&format!(
                    "risk_mode={} daily_pnl={:.2} daily_trades={}",
                    risk_state.risk_mode, risk_state.daily_pnl, risk_state.daily_trades
                ))
                .await;
        }
        Command::Flat => {
            flatten_all(state).await;
            channel.reply("flattened all open positions").await;
        }
        Command::Selftest => {
            channel.reply("ok").await;
        }
        Command::Mode(mode) => {
            state.settings.lock().await.strategy_mode = mode;
            channel.reply(&format!("mode set to {mode}")).await;
        }
        Command::Size(size) => {
            state.settings.lock().await.order_usdt_size = size;
            channel.reply(&format!("order size set to {size}")).await;
        }
        Command::Lev(lev) => {
            state.settings.lock().await.leverage = lev;
            channel.reply(&format!("leverage set to {lev}")).await;
        }
    }
}

/// Issues a reduce-only market order closing every currently open position.
/// Mirrors the `/flat` handler's "close everything now" semantics.
async fn flatten_all(state: &Arc<EngineState>) {
    let symbols_and_sides: Vec<(String, Side, f64)> = {
        let active = state.active.lock().await;
        active
            .values()
            .filter_map(|s| s.as_open())
            .map(|p| (p.symbol.clone(), p.side, p.qty))
            .collect()
    };

    for (symbol, side, qty) in symbols_and_sides {
        let closing_side = side.closing_side();
        if let Err(e) = state.adapter.cancel_open_orders(&symbol).await {
            warn!(symbol, error = %e, "failed to cancel open orders during /flat");
        }
        if let Err(e) = state
            .adapter
            .place_market_order(&symbol, closing_side, qty, true, "FLAT")
            .await
        {
            error!(symbol, error = %e, "failed to submit flattening order");
            continue;
        }
        let mut active = state.active.lock().await;
        active.remove(&symbol);
    }
    state.persist().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_sizing_multiplies_notional_by_leverage_then_divides_by_entry_price() {
        let mut cfg = test_config();
        cfg.sizing_mode = crate::types::SizingMode::Fixed;
        cfg.order_usdt_size = 20.0;
        // notional = 20 * 15 = 300; qty = 300 / 100 = 3.0
        let qty = compute_quantity(&cfg, cfg.order_usdt_size, 15.0, 100.0, 99.0);
        assert!((qty - 3.0).abs() < 1e-9);
    }

    #[test]
    fn atr_sizing_scales_risk_budget_by_leverage() {
        let mut cfg = test_config();
        cfg.sizing_mode = crate::types::SizingMode::Atr;
        cfg.risk_usdt_per_trade = 5.0;
        // stop distance 1.0 -> qty = (5.0 * 15) / 1.0 = 75.0
        let qty = compute_quantity(&cfg, cfg.order_usdt_size, 15.0, 100.0, 99.0);
        assert!((qty - 75.0).abs() < 1e-9);
    }

    fn test_config() -> Config {
        Config {
            binance_api_key: String::new(),
            binance_api_secret: String::new(),
            admin_user_id: String::new(),
            state_path: "state.json".into(),
            leverage: 15,
            order_usdt_size: 20.0,
            risk_usdt_per_trade: 5.0,
            sizing_mode: crate::types::SizingMode::Fixed,
            max_concurrent_symbols: 8,
            symbol_refresh_hours: 6,
            exclude_symbols: vec![],
            preferred_price_max: 100.0,
            low_price_priority_max: 1.0,
            entry_tf: "1m".into(),
            mtf_fast: "5m".into(),
            mtf_slow1: "15m".into(),
            mtf_slow2: "1h".into(),
            rsi_period: 14,
            hab_rsi_low: 25.0,
            hab_rsi_high: 80.0,
            bands_length: 20,
            bands_multiplier: 1.0,
            retest_tolerance_pct: 0.003,
            atr_period: 14,
            sl_atr_mult: 0.4,
            tp1_atr_mult: 0.8,
            tp2_atr_mult: 1.2,
            smart_close_adj_pct: 0.001,
            simple_mode: true,
            trailing_enabled: true,
            be_trigger_atr_mult: 0.8,
            lock_profit_atr_mult: 0.1,
            trail_atr_mult: 1.0,
            run_mode: crate::types::RunMode::Paper,
            paused: false,
            max_open_positions: 3,
            max_daily_trades: 50,
            daily_dd_limit_usdt: 10.0,
            max_losing_streak: 3,
            cooldown_bars: 3,
            order_retry_max: 3,
            order_retry_backoff_ms: 400,
            time_drift_max_ms: 1500,
            ob_enabled: false,
            ob_lookback: 300,
            ob_impulse_atr: 1.5,
            ob_retest_tol: 0.001,
            maker_offset_bps: 5.0,
            maker_wait_seconds: 2,
            mtf_ema_filter: false,
        }
    }
}
