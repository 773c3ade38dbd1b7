// =============================================================================
// Raw Binance USDⓈ-M futures wire client — HMAC-signed REST requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed
// requests include X-MBX-APIKEY as a header and a recvWindow tolerating
// minor clock drift between this process and Binance's servers.
//
// This module is the "trivial adapter" collaborator named in spec.md §1 —
// the engine depends on the `RawExchange` trait, never on `LiveRawExchange`
// directly, so tests can substitute a stub implementation.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::market_data::Candle;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

/// Parameters for a new order. `stop_price` is required for STOP_MARKET and
/// TAKE_PROFIT_MARKET; `quantity` is omitted when `close_position` is set.
#[derive(Debug, Clone, Default)]
pub struct NewOrderParams {
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: Option<String>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub working_type: Option<String>,
    pub new_client_order_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: Option<u64>,
    #[serde(rename = "clientOrderId", default)]
    pub client_order_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Low-level USDⓈ-M futures wire operations. The in-scope exchange adapter
/// (`binance::adapter::ExchangeAdapter`) is the only caller; everything
/// above this trait talks to `ExchangeAdapter`, never to `RawExchange`.
#[async_trait]
pub trait RawExchange: Send + Sync {
    async fn server_time(&self) -> Result<i64>;
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time_ms: Option<i64>,
        end_time_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>>;
    async fn exchange_info(&self) -> Result<serde_json::Value>;
    async fn ticker_24hr(&self) -> Result<Vec<serde_json::Value>>;
    async fn ticker_price(&self, symbol: &str) -> Result<f64>;
    async fn mark_price(&self, symbol: &str) -> Result<f64>;
    async fn change_leverage(&self, symbol: &str, leverage: i32) -> Result<()>;
    async fn new_order(&self, params: NewOrderParams) -> Result<OrderResponse>;
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<u64>,
        orig_client_order_id: Option<&str>,
    ) -> Result<serde_json::Value>;
    async fn cancel_open_orders(&self, symbol: &str) -> Result<serde_json::Value>;
    async fn open_orders(&self, symbol: &str) -> Result<Vec<serde_json::Value>>;
    async fn position_risk(&self, symbol: Option<&str>) -> Result<Vec<serde_json::Value>>;
    async fn income_history(
        &self,
        start_time_ms: Option<i64>,
        end_time_ms: Option<i64>,
        income_type: Option<&str>,
    ) -> Result<Vec<serde_json::Value>>;
    async fn new_listen_key(&self) -> Result<String>;
    async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()>;
}

/// Live implementation talking to `fapi.binance.com`.
#[derive(Clone)]
pub struct LiveRawExchange {
    api_key: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
}

impl LiveRawExchange {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            http,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds. Panics only if the system
    /// clock is set before the epoch, which cannot happen on a real host.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn get_signed(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.http.get(&url)).await
    }

    async fn post_signed(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.http.post(&url)).await
    }

    async fn delete_signed(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.http.delete(&url)).await
    }

    async fn get_public(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let url = if params.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, params)
        };
        self.send(self.http.get(&url)).await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let resp = req.send().await.context("fapi request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse fapi response")?;
        if !status.is_success() {
            anyhow::bail!("fapi request returned {}: {}", status, body);
        }
        Ok(body)
    }
}

impl std::fmt::Debug for LiveRawExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveRawExchange")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

fn parse_candle(arr: &[serde_json::Value]) -> Result<Candle> {
    if arr.len() < 11 {
        anyhow::bail!("kline entry has only {} elements", arr.len());
    }
    Ok(Candle {
        open_time: arr[0].as_i64().context("kline open_time")?,
        open: parse_str_f64(&arr[1])?,
        high: parse_str_f64(&arr[2])?,
        low: parse_str_f64(&arr[3])?,
        close: parse_str_f64(&arr[4])?,
        volume: parse_str_f64(&arr[5])?,
        close_time: arr[6].as_i64().context("kline close_time")?,
        quote_volume: parse_str_f64(&arr[7])?,
        trades: arr[8].as_u64().context("kline num_trades")?,
        taker_base: parse_str_f64(&arr[9])?,
        taker_quote: parse_str_f64(&arr[10])?,
    })
}

#[async_trait]
impl RawExchange for LiveRawExchange {
    #[instrument(skip(self), name = "fapi::server_time")]
    async fn server_time(&self) -> Result<i64> {
        let body = self.get_public("/fapi/v1/time", "").await?;
        body["serverTime"].as_i64().context("missing serverTime")
    }

    #[instrument(skip(self), name = "fapi::klines")]
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time_ms: Option<i64>,
        end_time_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let mut params = format!("symbol={symbol}&interval={interval}&limit={limit}");
        if let Some(s) = start_time_ms {
            params.push_str(&format!("&startTime={s}"));
        }
        if let Some(e) = end_time_ms {
            params.push_str(&format!("&endTime={e}"));
        }
        let body = self.get_public("/fapi/v1/klines", &params).await?;
        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            candles.push(parse_candle(arr)?);
        }
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "fapi::exchange_info")]
    async fn exchange_info(&self) -> Result<serde_json::Value> {
        self.get_public("/fapi/v1/exchangeInfo", "").await
    }

    #[instrument(skip(self), name = "fapi::ticker_24hr")]
    async fn ticker_24hr(&self) -> Result<Vec<serde_json::Value>> {
        let body = self.get_public("/fapi/v1/ticker/24hr", "").await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    #[instrument(skip(self), name = "fapi::ticker_price")]
    async fn ticker_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .get_public("/fapi/v1/ticker/price", &format!("symbol={symbol}"))
            .await?;
        parse_str_f64(&body["price"])
    }

    #[instrument(skip(self), name = "fapi::mark_price")]
    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .get_public("/fapi/v1/premiumIndex", &format!("symbol={symbol}"))
            .await?;
        parse_str_f64(&body["markPrice"])
    }

    #[instrument(skip(self), name = "fapi::change_leverage")]
    async fn change_leverage(&self, symbol: &str, leverage: i32) -> Result<()> {
        self.post_signed(
            "/fapi/v1/leverage",
            &format!("symbol={symbol}&leverage={leverage}"),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, params), name = "fapi::new_order")]
    async fn new_order(&self, params: NewOrderParams) -> Result<OrderResponse> {
        let mut qs = format!(
            "symbol={}&side={}&type={}",
            params.symbol, params.side, params.order_type
        );
        if let Some(q) = params.quantity {
            qs.push_str(&format!("&quantity={q}"));
        }
        if let Some(p) = params.price {
            qs.push_str(&format!("&price={p}"));
        }
        if let Some(sp) = params.stop_price {
            qs.push_str(&format!("&stopPrice={sp}"));
        }
        if let Some(tif) = &params.time_in_force {
            qs.push_str(&format!("&timeInForce={tif}"));
        }
        if params.close_position {
            qs.push_str("&closePosition=true");
        } else if params.reduce_only {
            qs.push_str("&reduceOnly=true");
        }
        if let Some(wt) = &params.working_type {
            qs.push_str(&format!("&workingType={wt}"));
        }
        if let Some(coid) = &params.new_client_order_id {
            qs.push_str(&format!("&newClientOrderId={coid}"));
        }

        let body = self.post_signed("/fapi/v1/order", &qs).await?;
        serde_json::from_value(body).context("failed to parse new_order response")
    }

    #[instrument(skip(self), name = "fapi::cancel_order")]
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<u64>,
        orig_client_order_id: Option<&str>,
    ) -> Result<serde_json::Value> {
        let mut qs = format!("symbol={symbol}");
        if let Some(id) = order_id {
            qs.push_str(&format!("&orderId={id}"));
        }
        if let Some(coid) = orig_client_order_id {
            qs.push_str(&format!("&origClientOrderId={coid}"));
        }
        self.delete_signed("/fapi/v1/order", &qs).await
    }

    #[instrument(skip(self), name = "fapi::cancel_open_orders")]
    async fn cancel_open_orders(&self, symbol: &str) -> Result<serde_json::Value> {
        self.delete_signed("/fapi/v1/allOpenOrders", &format!("symbol={symbol}"))
            .await
    }

    #[instrument(skip(self), name = "fapi::open_orders")]
    async fn open_orders(&self, symbol: &str) -> Result<Vec<serde_json::Value>> {
        let body = self
            .get_signed("/fapi/v1/openOrders", &format!("symbol={symbol}"))
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    #[instrument(skip(self), name = "fapi::position_risk")]
    async fn position_risk(&self, symbol: Option<&str>) -> Result<Vec<serde_json::Value>> {
        let params = symbol.map(|s| format!("symbol={s}")).unwrap_or_default();
        let body = self.get_signed("/fapi/v2/positionRisk", &params).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    #[instrument(skip(self), name = "fapi::income_history")]
    async fn income_history(
        &self,
        start_time_ms: Option<i64>,
        end_time_ms: Option<i64>,
        income_type: Option<&str>,
    ) -> Result<Vec<serde_json::Value>> {
        let mut params = String::new();
        if let Some(s) = start_time_ms {
            params.push_str(&format!("startTime={s}&"));
        }
        if let Some(e) = end_time_ms {
            params.push_str(&format!("endTime={e}&"));
        }
        if let Some(t) = income_type {
            params.push_str(&format!("incomeType={t}&"));
        }
        let params = params.trim_end_matches('&');
        let body = self.get_signed("/fapi/v1/income", params).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    #[instrument(skip(self), name = "fapi::new_listen_key")]
    async fn new_listen_key(&self) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let body = self.send(self.http.post(&url)).await?;
        body["listenKey"]
            .as_str()
            .map(str::to_string)
            .context("missing listenKey")
    }

    #[instrument(skip(self, listen_key), name = "fapi::keepalive_listen_key")]
    async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey?listenKey={}", self.base_url, listen_key);
        self.send(self.http.put(&url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_candle_rejects_short_rows() {
        let arr = vec![serde_json::json!(1)];
        assert!(parse_candle(&arr).is_err());
    }

    #[test]
    fn parse_candle_accepts_binance_shape() {
        let arr: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1700000000000,"100.0","101.0","99.0","100.5","10.0",1700000059999,"1000.0",5,"6.0","600.0","0"]"#,
        )
        .unwrap();
        let candle = parse_candle(&arr).unwrap();
        assert!((candle.close - 100.5).abs() < 1e-9);
        assert_eq!(candle.trades, 5);
    }

    #[test]
    fn signed_query_appends_signature() {
        let client = LiveRawExchange::new("key", "secret");
        let qs = client.signed_query("symbol=BTCUSDT");
        assert!(qs.contains("symbol=BTCUSDT"));
        assert!(qs.contains("timestamp="));
        assert!(qs.contains("signature="));
    }
}
