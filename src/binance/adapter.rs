// =============================================================================
// Exchange adapter — the in-scope collaborator boundary
// =============================================================================
//
// Wraps a `RawExchange` with retry, quantization against cached symbol
// filters, and idempotent client-order-ids. Nothing above this module talks
// to `RawExchange` directly.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{instrument, warn};

use crate::binance::filters::{parse_exchange_info, FilterCache, SymbolFilters};
use crate::binance::raw::{NewOrderParams, OrderResponse, RawExchange};
use crate::binance::retry::{with_retry, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_RETRIES};
use crate::market_data::Candle;
use crate::types::Side;

/// Unix-millisecond-suffixed client-order-id of the form
/// `{symbol}-{tag}-{unix_millis}`, matching the reference implementation's
/// `cid()` helper. Collision-free across restarts in practice: two orders
/// for the same symbol/tag in the same millisecond never happen in this
/// engine's call pattern (each submission is awaited before the next).
pub fn client_order_id(symbol: &str, tag: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis();
    format!("{symbol}-{tag}-{millis}")
}

pub struct ExchangeAdapter {
    raw: Arc<dyn RawExchange>,
    filters: FilterCache,
    max_retries: u32,
    base_delay_ms: u64,
}

impl ExchangeAdapter {
    pub fn new(raw: Arc<dyn RawExchange>) -> Self {
        Self {
            raw,
            filters: FilterCache::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
        }
    }

    async fn retry<T, F, Fut>(&self, label: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        with_retry(label, self.max_retries, self.base_delay_ms, f).await
    }

    /// Refreshes the cached per-symbol tick/step/precision filters from
    /// `exchangeInfo`. Called once at startup and from the periodic symbol
    /// refresh task.
    #[instrument(skip(self))]
    pub async fn refresh_filters(&self) -> Result<()> {
        let info = self.retry("exchange_info", || self.raw.exchange_info()).await?;
        let parsed = parse_exchange_info(&info)?;
        self.filters.replace_all(parsed);
        Ok(())
    }

    fn filters_for(&self, symbol: &str) -> Result<SymbolFilters> {
        self.filters
            .get(symbol)
            .with_context(|| format!("no cached filters for {symbol}, call refresh_filters first"))
    }

    /// Snaps `qty` to `symbol`'s `step_size` and fixes its decimal precision.
    #[instrument(skip(self))]
    pub fn format_qty(&self, symbol: &str, qty: f64) -> Result<f64> {
        Ok(self.filters_for(symbol)?.format_qty(qty))
    }

    /// Snaps `price` to `symbol`'s `tick_size` and fixes its decimal precision.
    #[instrument(skip(self))]
    pub fn format_price(&self, symbol: &str, price: f64) -> Result<f64> {
        Ok(self.filters_for(symbol)?.format_price(price))
    }

    /// `price * qty >= min_notional`, per spec.md §4.3 — true if the symbol's
    /// filters are not (yet) cached, matching `min_notional_ok`'s "true if
    /// unknown" guarantee.
    pub fn min_notional_ok(&self, symbol: &str, price: f64, qty: f64) -> Result<bool> {
        Ok(self.filters_for(symbol)?.min_notional_ok(price, qty))
    }

    /// Top `top_n` USDT perpetuals by 24h quote volume, excluding `exclude`,
    /// biased toward symbols priced at or under `prefer_low_price_max`
    /// before falling back to anything at or under `price_max`.
    #[instrument(skip(self, exclude))]
    pub async fn top_usdt_perp_symbols(
        &self,
        top_n: usize,
        exclude: &[String],
        price_max: f64,
        prefer_low_price_max: f64,
    ) -> Result<Vec<String>> {
        let tickers = self.retry("ticker_24hr", || self.raw.ticker_24hr()).await?;

        let mut filtered: Vec<(String, f64)> = tickers
            .iter()
            .filter_map(|t| {
                let sym = t["symbol"].as_str()?.to_string();
                if !sym.ends_with("USDT") || exclude.iter().any(|e| e == &sym) {
                    return None;
                }
                let qv: f64 = t["quoteVolume"].as_str()?.parse().ok()?;
                Some((sym, qv))
            })
            .collect();
        filtered.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let candidates: Vec<String> = filtered.into_iter().map(|(s, _)| s).collect();
        let probe_n = (top_n * 2).min(candidates.len());

        let mut prices: HashMap<String, f64> = HashMap::new();
        for sym in &candidates[..probe_n] {
            match self.raw.ticker_price(sym).await {
                Ok(p) => {
                    prices.insert(sym.clone(), p);
                }
                Err(e) => warn!(symbol = sym, error = %e, "failed to fetch price during symbol scan"),
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let low: Vec<String> = candidates
            .iter()
            .filter(|s| prices.get(*s).is_some_and(|&p| p <= prefer_low_price_max))
            .cloned()
            .collect();
        let mid: Vec<String> = candidates
            .iter()
            .filter(|s| {
                prices
                    .get(*s)
                    .is_some_and(|&p| p > prefer_low_price_max && p <= price_max)
            })
            .cloned()
            .collect();

        let mut out = low;
        out.extend(mid);
        out.truncate(top_n);
        Ok(out)
    }

    #[instrument(skip(self))]
    pub async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        self.retry("klines", || self.raw.klines(symbol, interval, None, None, limit))
            .await
    }

    /// Pages `startTime`/`endTime` in `limit`-sized batches, sleeping 100ms
    /// between pages, matching the reference `get_klines_range`.
    #[instrument(skip(self))]
    pub async fn klines_range(
        &self,
        symbol: &str,
        interval: &str,
        start_time_ms: i64,
        end_time_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let mut out = Vec::new();
        let mut start = start_time_ms;
        loop {
            let batch = self
                .retry("klines_range", || {
                    self.raw
                        .klines(symbol, interval, Some(start), Some(end_time_ms), limit)
                })
                .await?;
            if batch.is_empty() {
                break;
            }
            let last_close = batch.last().unwrap().close_time;
            out.extend(batch);
            if last_close >= end_time_ms {
                break;
            }
            start = last_close + 1;
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    pub async fn set_leverage(&self, symbol: &str, leverage: i32) -> Result<()> {
        // Best-effort: a rejected leverage change (e.g. already at that
        // value, or a symbol-specific cap) must not abort a trade.
        if let Err(e) = self.raw.change_leverage(symbol, leverage).await {
            warn!(symbol, leverage, error = %e, "set_leverage failed, continuing anyway");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        reduce_only: bool,
        tag: &str,
    ) -> Result<OrderResponse> {
        let filters = self.filters_for(symbol)?;
        let qty = filters.format_qty(quantity);
        let coid = client_order_id(symbol, tag);
        self.retry("place_market_order", || {
            self.raw.new_order(NewOrderParams {
                symbol: symbol.to_string(),
                side: side.to_string(),
                order_type: "MARKET".to_string(),
                quantity: Some(qty),
                reduce_only,
                new_client_order_id: Some(coid.clone()),
                ..Default::default()
            })
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn place_stop_market(
        &self,
        symbol: &str,
        side: Side,
        stop_price: f64,
        close_position: bool,
        tag: &str,
    ) -> Result<OrderResponse> {
        let filters = self.filters_for(symbol)?;
        let sp = filters.format_price(stop_price);
        let coid = client_order_id(symbol, tag);
        self.retry("place_stop_market", || {
            self.raw.new_order(NewOrderParams {
                symbol: symbol.to_string(),
                side: side.to_string(),
                order_type: "STOP_MARKET".to_string(),
                stop_price: Some(sp),
                close_position,
                reduce_only: !close_position,
                time_in_force: Some("GTC".to_string()),
                working_type: Some("CONTRACT_PRICE".to_string()),
                new_client_order_id: Some(coid.clone()),
                ..Default::default()
            })
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn place_take_profit_market(
        &self,
        symbol: &str,
        side: Side,
        stop_price: f64,
        quantity: Option<f64>,
        tag: &str,
    ) -> Result<OrderResponse> {
        let filters = self.filters_for(symbol)?;
        let sp = filters.format_price(stop_price);
        let qty = quantity.map(|q| filters.format_qty(q));
        let coid = client_order_id(symbol, tag);
        self.retry("place_take_profit_market", || {
            self.raw.new_order(NewOrderParams {
                symbol: symbol.to_string(),
                side: side.to_string(),
                order_type: "TAKE_PROFIT_MARKET".to_string(),
                stop_price: Some(sp),
                quantity: qty,
                reduce_only: true,
                time_in_force: Some("GTC".to_string()),
                working_type: Some("CONTRACT_PRICE".to_string()),
                new_client_order_id: Some(coid.clone()),
                ..Default::default()
            })
        })
        .await
    }

    /// Submits a post-only (GTX) limit order ahead of the market leg, then
    /// waits `wait_seconds` before returning — unconditionally, whether or
    /// not the maker order filled.
    ///
    /// This reproduces a latent bug in the system this engine is modeled
    /// on: the returned order id is never inspected or cancelled, so if the
    /// maker leg fills, the following market order (submitted by the
    /// caller) doubles the position; if it doesn't fill, it rests on the
    /// book indefinitely. See `DESIGN.md` Open Question (b).
    ///
    /// TODO: cancel the resting maker order (by the client-order-id this
    /// function returns) before the caller submits its market order.
    #[instrument(skip(self))]
    pub async fn submit_maker_probe(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        maker_offset_bps: f64,
        quantity: f64,
        wait_seconds: u64,
    ) -> Result<String> {
        let filters = self.filters_for(symbol)?;
        let offset = maker_offset_bps / 10_000.0;
        let raw_price = match side {
            Side::Buy => price * (1.0 - offset),
            Side::Sell => price * (1.0 + offset),
        };
        let maker_px = filters.format_price(raw_price);
        let qty = filters.format_qty(quantity);
        let coid = client_order_id(symbol, "MAKER");

        let result = self
            .raw
            .new_order(NewOrderParams {
                symbol: symbol.to_string(),
                side: side.to_string(),
                order_type: "LIMIT".to_string(),
                price: Some(maker_px),
                quantity: Some(qty),
                time_in_force: Some("GTX".to_string()),
                new_client_order_id: Some(coid.clone()),
                ..Default::default()
            })
            .await;

        if let Err(e) = result {
            warn!(symbol, error = %e, "maker probe order failed, proceeding to market leg anyway");
        }

        tokio::time::sleep(std::time::Duration::from_secs(wait_seconds)).await;
        Ok(coid)
    }

    #[instrument(skip(self))]
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<()> {
        self.retry("cancel_order", || {
            self.raw.cancel_order(symbol, Some(order_id), None)
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn cancel_open_orders(&self, symbol: &str) -> Result<()> {
        self.retry("cancel_open_orders", || self.raw.cancel_open_orders(symbol))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn open_orders(&self, symbol: &str) -> Result<Vec<serde_json::Value>> {
        self.retry("open_orders", || self.raw.open_orders(symbol)).await
    }

    #[instrument(skip(self))]
    pub async fn position_risk(&self, symbol: Option<&str>) -> Result<Vec<serde_json::Value>> {
        self.retry("position_risk", || self.raw.position_risk(symbol)).await
    }

    #[instrument(skip(self))]
    pub async fn income_history(
        &self,
        start_time_ms: Option<i64>,
        end_time_ms: Option<i64>,
        income_type: Option<&str>,
    ) -> Result<Vec<serde_json::Value>> {
        self.retry("income_history", || {
            self.raw.income_history(start_time_ms, end_time_ms, income_type)
        })
        .await
    }

    pub async fn new_listen_key(&self) -> Result<String> {
        self.retry("new_listen_key", || self.raw.new_listen_key()).await
    }

    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()> {
        self.retry("keepalive_listen_key", || self.raw.keepalive_listen_key(listen_key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_order_id_has_expected_shape() {
        let id = client_order_id("BTCUSDT", "MKT");
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "BTCUSDT");
        assert_eq!(parts[1], "MKT");
        assert!(parts[2].parse::<u128>().is_ok());
    }
}
