// =============================================================================
// Aurora Futures Engine — Main Entry Point
// =============================================================================
//
// Loads configuration, reconciles persisted state against the exchange,
// then spawns the market-data streams, the user-data stream, and the four
// orchestrator tasks (bar loop, user-event loop, symbol-refresh loop,
// command loop) described in `orchestrator.rs`.
// =============================================================================

mod binance;
mod command;
mod config;
mod indicators;
mod market_data;
mod orchestrator;
mod position_state;
mod risk;
mod state_store;
mod strategy;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::adapter::ExchangeAdapter;
use crate::binance::raw::LiveRawExchange;
use crate::binance::user_stream::{keepalive_loop, run_user_stream};
use crate::command::StdinCommandChannel;
use crate::config::Config;
use crate::market_data::{BarCache, KlineStreamSupervisor};
use crate::orchestrator::EngineState;
use crate::position_state::PositionState;
use crate::risk::RiskEngine;
use crate::state_store::load_state;

const BAR_CHANNEL_CAP: usize = 1024;
const USER_EVENT_CHANNEL_CAP: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora-futures-engine starting");

    let config = Config::from_env()?;
    info!(run_mode = %config.run_mode, strategy_mode = %config.strategy_mode(), "configuration loaded");

    let raw = Arc::new(LiveRawExchange::new(
        config.binance_api_key.clone(),
        config.binance_api_secret.clone(),
    ));
    let adapter = Arc::new(ExchangeAdapter::new(raw));
    adapter.refresh_filters().await?;

    let persisted = load_state(&config.state_path);
    let mut active: HashMap<String, PositionState> = persisted.active;
    reconcile_against_exchange(&adapter, &mut active).await;

    let initial_symbols = adapter
        .top_usdt_perp_symbols(
            config.max_concurrent_symbols,
            &config.exclude_symbols,
            config.preferred_price_max,
            config.low_price_priority_max,
        )
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "initial symbol scan failed — starting with an empty universe");
            Vec::new()
        });
    info!(symbols = ?initial_symbols, "initial symbol universe");

    let bar_cache = Arc::new(BarCache::new());
    let risk = Arc::new(RiskEngine::new(
        config.max_open_positions,
        config.max_daily_trades,
        config.daily_dd_limit_usdt,
        config.max_losing_streak,
        config.cooldown_bars.max(0) as u64,
    ));

    let state = Arc::new(EngineState::new(
        config.clone(),
        adapter.clone(),
        bar_cache.clone(),
        risk,
        active,
        initial_symbols.clone(),
    ));

    let (bar_tx, bar_rx) = mpsc::channel(BAR_CHANNEL_CAP);
    let mut intervals = vec![config.entry_tf.clone()];
    if config.strategy_mode() == crate::types::StrategyMode::Advanced {
        intervals.push(config.mtf_fast.clone());
        intervals.push(config.mtf_slow1.clone());
        intervals.push(config.mtf_slow2.clone());
    }
    let mut supervisor = KlineStreamSupervisor::new(bar_tx);
    supervisor.subscribe(&initial_symbols, &intervals);
    let supervisor = Arc::new(Mutex::new(supervisor));

    let (user_tx, user_rx) = mpsc::channel(USER_EVENT_CHANNEL_CAP);
    {
        let adapter = adapter.clone();
        let user_tx = user_tx.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = run_user_stream(&adapter, user_tx.clone()).await {
                    error!(error = %e, "user-data stream error — reconnecting in 5s");
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });
    }
    {
        let adapter = adapter.clone();
        tokio::spawn(async move {
            loop {
                match adapter.new_listen_key().await {
                    Ok(listen_key) => {
                        if let Err(e) = keepalive_loop(&adapter, &listen_key).await {
                            warn!(error = %e, "listen-key keepalive failed, renewing");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "failed to create listen key for keepalive loop");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }

    tokio::spawn(orchestrator::bar_loop(state.clone(), bar_rx));
    tokio::spawn(orchestrator::user_event_loop(state.clone(), user_rx));
    tokio::spawn(orchestrator::symbol_refresh_loop(state.clone(), supervisor.clone()));
    tokio::spawn(orchestrator::command_loop(
        state.clone(),
        Box::new(StdinCommandChannel::new()),
    ));

    info!("all subsystems running, press ctrl+c to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — saving state and exiting");

    state.persist().await;
    supervisor.lock().await.stop();

    info!("aurora-futures-engine shut down complete");
    Ok(())
}

/// Cross-checks locally persisted active positions against the exchange's
/// reported `positionRisk` at startup, per spec.md §7(d): a position this
/// engine thinks is open but the exchange reports flat is dropped, and vice
/// versa a position the exchange reports but we have no local record of is
/// left alone (this engine manages only positions it opened itself).
async fn reconcile_against_exchange(
    adapter: &ExchangeAdapter,
    active: &mut HashMap<String, PositionState>,
) {
    let positions = match adapter.position_risk(None).await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "startup position reconciliation failed — trusting local state");
            return;
        }
    };

    let mut live_amounts: HashMap<String, f64> = HashMap::new();
    for p in &positions {
        if let (Some(symbol), Some(amt_str)) = (p["symbol"].as_str(), p["positionAmt"].as_str()) {
            if let Ok(amt) = amt_str.parse::<f64>() {
                live_amounts.insert(symbol.to_string(), amt);
            }
        }
    }

    active.retain(|symbol, state| {
        if !state.is_open() {
            return true;
        }
        let amt = live_amounts.get(symbol).copied().unwrap_or(0.0);
        if amt.abs() < 1e-9 {
            info!(symbol, "dropping locally-tracked position absent on exchange at startup");
            false
        } else {
            true
        }
    });
}
