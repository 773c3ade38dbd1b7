// =============================================================================
// User-data stream — listen-key lifecycle and account/order event decoding
// =============================================================================
//
// Mirrors `original_source/user_stream.py`'s `UserStream`: create a listen
// key over REST, subscribe to it on the futures user-data WebSocket, and
// keep the key alive. Unlike the reference (which keeps the raw JSON in a
// queue), events are decoded into `UserEvent` at the stream boundary so
// consumers never touch raw JSON.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::binance::adapter::ExchangeAdapter;

const WS_HOST: &str = "wss://fstream.binance.com";
/// Binance requires a keepalive at least once every 60 minutes; the
/// reference client refreshes every 30 to leave headroom.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30 * 60;

/// A decoded user-data event, the subset `position_state.rs` needs to react
/// to fills and position closes.
#[derive(Debug, Clone)]
pub enum UserEvent {
    /// A symbol's position amount moved to (effectively) zero.
    PositionClosed { symbol: String },
    /// An order reached a terminal state.
    OrderUpdate {
        symbol: String,
        order_type: String,
        status: String,
        side: String,
        /// Realised PnL of this order's fill (Binance's `o.rp`), per
        /// spec.md §3: "`losing_streak`: derived from recent realised-PnL
        /// events". Zero for orders that do not close or reduce a position
        /// (e.g. the entry `MARKET` order).
        realized_pnl: f64,
    },
}

/// Creates a listen key and runs the user-data WebSocket until it
/// disconnects or errors, forwarding decoded events on `tx`. The caller
/// (the orchestrator's user-event task) is responsible for reconnecting.
pub async fn run_user_stream(
    adapter: &ExchangeAdapter,
    tx: mpsc::Sender<UserEvent>,
) -> Result<()> {
    let listen_key = adapter
        .new_listen_key()
        .await
        .context("failed to create listen key")?;

    let url = format!("{WS_HOST}/ws/{listen_key}");
    info!("connecting to user-data stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to user-data WebSocket")?;
    info!("user-data stream connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_user_event(&text) {
                        Ok(Some(evt)) => {
                            if tx.try_send(evt).is_err() {
                                warn!("user-event channel full — dropping event");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "failed to parse user-data event"),
                    }
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "user-data WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("user-data stream ended");
                return Ok(());
            }
        }
    }
}

/// Runs the 30-minute keepalive loop for `listen_key` until it errors,
/// in which case the caller should restart both this loop and the stream.
pub async fn keepalive_loop(adapter: &ExchangeAdapter, listen_key: &str) -> Result<()> {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(KEEPALIVE_INTERVAL_SECS)).await;
        adapter
            .keepalive_listen_key(listen_key)
            .await
            .context("listen key keepalive failed")?;
    }
}

fn parse_user_event(text: &str) -> Result<Option<UserEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse user-data JSON")?;
    let event_type = root["e"].as_str().unwrap_or_default();

    match event_type {
        "ACCOUNT_UPDATE" => {
            let positions = root["a"]["P"].as_array().cloned().unwrap_or_default();
            for p in positions {
                let symbol = match p["s"].as_str() {
                    Some(s) => s.to_string(),
                    None => continue,
                };
                let amt: f64 = p["pa"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                if amt.abs() < 1e-9 {
                    return Ok(Some(UserEvent::PositionClosed { symbol }));
                }
            }
            Ok(None)
        }
        "ORDER_TRADE_UPDATE" => {
            let o = &root["o"];
            let status = o["X"].as_str().unwrap_or_default().to_string();
            if status != "FILLED" {
                return Ok(None);
            }
            let symbol = o["s"].as_str().context("missing order symbol")?.to_string();
            let order_type = o["ot"].as_str().unwrap_or_default().to_string();
            let side = o["S"].as_str().unwrap_or_default().to_string();
            let realized_pnl = o["rp"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| o["rp"].as_f64())
                .unwrap_or(0.0);
            Ok(Some(UserEvent::OrderUpdate {
                symbol,
                order_type,
                status,
                side,
                realized_pnl,
            }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_update_with_flat_position_closes() {
        let json = r#"{
            "e": "ACCOUNT_UPDATE",
            "a": { "P": [ { "s": "BTCUSDT", "pa": "0.000" } ] }
        }"#;
        let evt = parse_user_event(json).unwrap().expect("should decode");
        match evt {
            UserEvent::PositionClosed { symbol } => assert_eq!(symbol, "BTCUSDT"),
            _ => panic!("expected PositionClosed"),
        }
    }

    #[test]
    fn account_update_with_open_position_is_none() {
        let json = r#"{
            "e": "ACCOUNT_UPDATE",
            "a": { "P": [ { "s": "BTCUSDT", "pa": "1.5" } ] }
        }"#;
        assert!(parse_user_event(json).unwrap().is_none());
    }

    #[test]
    fn order_trade_update_filled_take_profit_decodes() {
        let json = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "o": { "s": "ETHUSDT", "ot": "TAKE_PROFIT_MARKET", "X": "FILLED", "S": "SELL", "x": "TRADE", "rp": "3.50" }
        }"#;
        let evt = parse_user_event(json).unwrap().expect("should decode");
        match evt {
            UserEvent::OrderUpdate { symbol, order_type, status, realized_pnl, .. } => {
                assert_eq!(symbol, "ETHUSDT");
                assert_eq!(order_type, "TAKE_PROFIT_MARKET");
                assert_eq!(status, "FILLED");
                assert!((realized_pnl - 3.50).abs() < 1e-9);
            }
            _ => panic!("expected OrderUpdate"),
        }
    }

    #[test]
    fn order_trade_update_without_rp_field_defaults_to_zero_pnl() {
        let json = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "o": { "s": "ETHUSDT", "ot": "MARKET", "X": "FILLED", "S": "BUY", "x": "TRADE" }
        }"#;
        let evt = parse_user_event(json).unwrap().expect("should decode");
        match evt {
            UserEvent::OrderUpdate { realized_pnl, .. } => assert_eq!(realized_pnl, 0.0),
            _ => panic!("expected OrderUpdate"),
        }
    }

    #[test]
    fn order_trade_update_not_filled_is_none() {
        let json = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "o": { "s": "ETHUSDT", "ot": "STOP_MARKET", "X": "NEW", "S": "SELL", "x": "NEW" }
        }"#;
        assert!(parse_user_event(json).unwrap().is_none());
    }
}
