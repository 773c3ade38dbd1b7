// =============================================================================
// Symbol trading filters — tick/step size quantization and min-notional checks
// =============================================================================
//
// Mirrors `_load_symbol_filters` / `format_qty` / `format_price` /
// `min_notional_ok` from the reference client: values are snapped to the
// exchange's tick/step size and formatted to the symbol's declared decimal
// precision before being sent in an order.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
    pub price_precision: u32,
    pub quantity_precision: u32,
    pub min_notional: f64,
}

/// Snap `value` down to the nearest multiple of `step` (never rounds up,
/// so a quantized quantity never exceeds the caller's intended size).
fn quantize_floor(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

impl SymbolFilters {
    pub fn format_price(&self, price: f64) -> f64 {
        let snapped = quantize_floor(price, self.tick_size);
        round_to(snapped, self.price_precision)
    }

    pub fn format_qty(&self, qty: f64) -> f64 {
        let snapped = quantize_floor(qty, self.step_size);
        round_to(snapped, self.quantity_precision)
    }

    pub fn min_notional_ok(&self, price: f64, qty: f64) -> bool {
        price * qty >= self.min_notional
    }
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Parses the `symbols` array of a `/fapi/v1/exchangeInfo` response into a
/// `SymbolFilters` map keyed by symbol.
pub fn parse_exchange_info(body: &serde_json::Value) -> Result<HashMap<String, SymbolFilters>> {
    let mut out = HashMap::new();
    let symbols = body["symbols"]
        .as_array()
        .context("exchangeInfo response missing 'symbols' array")?;

    for sym in symbols {
        let name = match sym["symbol"].as_str() {
            Some(s) => s.to_string(),
            None => continue,
        };
        let price_precision = sym["pricePrecision"].as_u64().unwrap_or(2) as u32;
        let quantity_precision = sym["quantityPrecision"].as_u64().unwrap_or(3) as u32;

        let mut tick_size = 10f64.powi(-(price_precision as i32));
        let mut step_size = 10f64.powi(-(quantity_precision as i32));
        let mut min_notional = 5.0;

        if let Some(filters) = sym["filters"].as_array() {
            for f in filters {
                match f["filterType"].as_str() {
                    Some("PRICE_FILTER") => {
                        if let Some(t) = f["tickSize"].as_str().and_then(|s| s.parse().ok()) {
                            tick_size = t;
                        }
                    }
                    Some("LOT_SIZE") => {
                        if let Some(s) = f["stepSize"].as_str().and_then(|s| s.parse().ok()) {
                            step_size = s;
                        }
                    }
                    Some("MIN_NOTIONAL") => {
                        if let Some(n) = f["notional"].as_str().and_then(|s| s.parse().ok()) {
                            min_notional = n;
                        }
                    }
                    _ => {}
                }
            }
        }

        out.insert(
            name,
            SymbolFilters {
                tick_size,
                step_size,
                price_precision,
                quantity_precision,
                min_notional,
            },
        );
    }

    Ok(out)
}

/// Cache of per-symbol filters, invalidated wholesale on each symbol refresh
/// (see `orchestrator::symbol_refresh_loop`).
#[derive(Default)]
pub struct FilterCache {
    inner: RwLock<HashMap<String, SymbolFilters>>,
}

impl FilterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&self, filters: HashMap<String, SymbolFilters>) {
        *self.inner.write() = filters;
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolFilters> {
        self.inner.read().get(symbol).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            tick_size: 0.1,
            step_size: 0.001,
            price_precision: 1,
            quantity_precision: 3,
            min_notional: 5.0,
        }
    }

    #[test]
    fn format_price_snaps_down_to_tick() {
        let f = filters();
        assert_eq!(f.format_price(100.37), 100.3);
    }

    #[test]
    fn format_qty_snaps_down_to_step() {
        let f = filters();
        assert_eq!(f.format_qty(1.2348), 1.234);
    }

    #[test]
    fn min_notional_rejects_below_floor() {
        let f = filters();
        assert!(!f.min_notional_ok(1.0, 1.0));
        assert!(f.min_notional_ok(100.0, 1.0));
    }

    #[test]
    fn parse_exchange_info_reads_lot_and_price_filters() {
        let body = serde_json::json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "pricePrecision": 1,
                "quantityPrecision": 3,
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001"},
                    {"filterType": "MIN_NOTIONAL", "notional": "5.0"}
                ]
            }]
        });
        let parsed = parse_exchange_info(&body).unwrap();
        let f = parsed.get("BTCUSDT").unwrap();
        assert_eq!(f.tick_size, 0.10);
        assert_eq!(f.step_size, 0.001);
        assert_eq!(f.min_notional, 5.0);
    }

    #[test]
    fn filter_cache_round_trips() {
        let cache = FilterCache::new();
        assert!(cache.get("BTCUSDT").is_none());
        let mut map = HashMap::new();
        map.insert("BTCUSDT".to_string(), filters());
        cache.replace_all(map);
        assert!(cache.get("BTCUSDT").is_some());
    }
}
