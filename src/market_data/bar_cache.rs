// =============================================================================
// Bar cache — in-memory per-(symbol, timeframe) ring of closed bars
// =============================================================================
//
// Exclusively owned by the orchestrator and mutated only from the bar-consumer
// task (see `orchestrator::bar_loop`). The market-data stream never writes
// here directly — it emits closed-bar events on a channel instead, so there is
// exactly one mutator for this structure, matching the ownership rule in the
// data model.
//
// Bound: at most 1200 bars per key; on overflow, trimmed down to the most
// recent 800. Duplicate `open_time` replaces the previous row instead of
// appending (a stream that redelivers the same closed bar must not grow the
// cache).
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub const CACHE_CAP: usize = 1200;
pub const CACHE_TRIM_TO: usize = 800;

/// A single closed OHLCV bar. This is the `Bar` of the data model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades: u64,
    pub taker_base: f64,
    pub taker_quote: f64,
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

/// Thread-safe ring buffer that stores the closed bars per `(symbol, interval)`.
pub struct BarCache {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
}

impl Default for BarCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BarCache {
    pub fn new() -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Upsert a closed bar. Strictly-monotonic `open_time` is expected from the
    /// stream; a duplicate `open_time` (the stream redelivering the same bar)
    /// replaces the previous entry in place instead of appending.
    pub fn upsert(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map.entry(key).or_insert_with(VecDeque::new);

        match ring.back() {
            Some(last) if last.open_time == candle.open_time => {
                ring.pop_back();
                ring.push_back(candle);
            }
            _ => {
                ring.push_back(candle);
            }
        }

        if ring.len() > CACHE_CAP {
            let excess = ring.len() - CACHE_TRIM_TO;
            for _ in 0..excess {
                ring.pop_front();
            }
        }
    }

    /// Return the most recent `count` bars (oldest-first), or all of them if
    /// fewer than `count` are stored.
    pub fn get(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Return the close prices of the most recent `count` bars (oldest-first).
    pub fn closes(&self, key: &CandleKey, count: usize) -> Vec<f64> {
        self.get(key, count).iter().map(|c| c.close).collect()
    }

    pub fn last(&self, key: &CandleKey) -> Option<Candle> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| ring.back().cloned())
    }

    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            quote_volume: 200.0,
            trades: 50,
            taker_base: 60.0,
            taker_quote: 120.0,
        }
    }

    #[test]
    fn bound_1200_trims_to_800() {
        let cache = BarCache::new();
        let key = CandleKey::new("BTCUSDT", "1m");
        for i in 0..1201 {
            cache.upsert(key.clone(), sample(i as i64 * 60_000, 100.0 + i as f64));
        }
        assert_eq!(cache.count(&key), 800);
        // The most recent bar must still be present after the trim.
        let last = cache.last(&key).unwrap();
        assert_eq!(last.open_time, 1200 * 60_000);
    }

    #[test]
    fn never_exceeds_1200_for_any_input_length() {
        let cache = BarCache::new();
        let key = CandleKey::new("ETHUSDT", "1m");
        for i in 0..5000 {
            cache.upsert(key.clone(), sample(i as i64 * 60_000, 100.0));
            assert!(cache.count(&key) <= CACHE_CAP);
        }
        assert_eq!(cache.count(&key), CACHE_TRIM_TO);
    }

    #[test]
    fn duplicate_open_time_replaces() {
        let cache = BarCache::new();
        let key = CandleKey::new("BTCUSDT", "1m");
        cache.upsert(key.clone(), sample(0, 100.0));
        cache.upsert(key.clone(), sample(0, 101.0));
        assert_eq!(cache.count(&key), 1);
        assert_eq!(cache.last(&key).unwrap().close, 101.0);
    }

    #[test]
    fn distinct_keys_are_independent() {
        let cache = BarCache::new();
        let k1 = CandleKey::new("BTCUSDT", "1m");
        let k2 = CandleKey::new("BTCUSDT", "5m");
        cache.upsert(k1.clone(), sample(0, 100.0));
        assert_eq!(cache.count(&k1), 1);
        assert_eq!(cache.count(&k2), 0);
    }
}
