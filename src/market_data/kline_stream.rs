// =============================================================================
// Market-data stream — subscribes to kline channels, emits closed-bar events
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use super::bar_cache::{Candle, CandleKey};

/// A closed bar delivered by the market stream, tagged with its key so the
/// bar-consumer loop can route it into the cache without re-deriving it.
#[derive(Debug, Clone)]
pub struct ClosedBar {
    pub key: CandleKey,
    pub candle: Candle,
}

const WS_HOST: &str = "wss://fstream.binance.com";

/// Connect to the USDT-M futures kline WebSocket for a single `(symbol,
/// interval)` pair and forward every closed bar on `tx`. Returns once the
/// stream disconnects or errors; the caller is responsible for reconnecting.
pub async fn run_kline_stream(
    symbol: &str,
    interval: &str,
    tx: mpsc::Sender<ClosedBar>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{WS_HOST}/ws/{lower}@kline_{interval}");
    info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(symbol = %symbol, interval = %interval, "kline stream connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_message(&text) {
                        Ok(Some(closed)) => {
                            debug!(key = %closed.key, close = closed.candle.close, "closed bar");
                            if tx.try_send(closed).is_err() {
                                warn!(symbol = %symbol, interval = %interval, "bar channel full — dropping oldest by backpressure at consumer");
                            }
                        }
                        Ok(None) => {
                            // In-progress (unclosed) bar — only closed bars are emitted.
                        }
                        Err(e) => warn!(error = %e, "failed to parse kline message"),
                    }
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, interval = %interval, "kline stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a kline message, returning `Some(ClosedBar)` only when `k.x == true`.
fn parse_kline_message(text: &str) -> Result<Option<ClosedBar>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;
    let data = if root.get("data").is_some() { &root["data"] } else { &root };

    let symbol = data["s"].as_str().context("missing field s")?.to_uppercase();
    let k = &data["k"];
    let is_closed = k["x"].as_bool().context("missing field k.x")?;
    if !is_closed {
        return Ok(None);
    }

    let interval = k["i"].as_str().context("missing field k.i")?.to_string();
    let candle = Candle {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        quote_volume: parse_string_f64(&k["q"], "k.q")?,
        trades: k["n"].as_u64().context("missing field k.n")?,
        taker_base: parse_string_f64(&k["V"], "k.V")?,
        taker_quote: parse_string_f64(&k["Q"], "k.Q")?,
    };

    Ok(Some(ClosedBar {
        key: CandleKey { symbol, interval },
        candle,
    }))
}

fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_closed_bar() {
        let json = r#"{
            "e": "kline", "s": "BTCUSDT",
            "k": {
                "t": 1700000000000, "T": 1700000059999, "i": "1m",
                "o": "37000.00", "h": "37050.00", "l": "36990.00", "c": "37020.00",
                "v": "123.456", "q": "4567890.12", "n": 1500,
                "V": "60.123", "Q": "2224455.66", "x": true
            }
        }"#;
        let closed = parse_kline_message(json).unwrap().expect("should be closed");
        assert_eq!(closed.key.symbol, "BTCUSDT");
        assert_eq!(closed.key.interval, "1m");
        assert!((closed.candle.close - 37020.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unclosed_bar_is_none() {
        let json = r#"{
            "e": "kline", "s": "BTCUSDT",
            "k": {
                "t": 1700000000000, "T": 1700000059999, "i": "1m",
                "o": "37000.00", "h": "37050.00", "l": "36990.00", "c": "37020.00",
                "v": "123.456", "q": "4567890.12", "n": 1500,
                "V": "60.123", "Q": "2224455.66", "x": false
            }
        }"#;
        assert!(parse_kline_message(json).unwrap().is_none());
    }
}
