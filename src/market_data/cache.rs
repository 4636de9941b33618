use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::market_data::normaliser::{normalize, variants};
use crate::market_data::series::sanitize;
use crate::market_data::types::{Candle, CandleSeries, InstrumentKey, PayoutInfo, Quote};

/// Candle, quote and payout caches shared between the session loop (writer)
/// and the facade (reader). Every map has its own lock and every method holds
/// it for exactly one read or write.
#[derive(Debug, Default)]
pub struct MarketCaches {
    candles: Mutex<HashMap<InstrumentKey, CandleSeries>>,
    quotes: Mutex<HashMap<InstrumentKey, Quote>>,
    payouts: Mutex<HashMap<InstrumentKey, PayoutInfo>>,
    // raw spellings seen per key; diagnostics only
    aliases: Mutex<HashMap<InstrumentKey, BTreeSet<String>>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheCounts {
    pub candle_series: usize,
    pub quotes: usize,
    pub payouts: usize,
}

impl MarketCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole series for an instrument. Returns the key written,
    /// or `None` when nothing survived sanitising.
    pub fn replace_candles(&self, raw: &str, candles: Vec<Candle>, period_secs: Option<u64>) -> Option<InstrumentKey> {
        let key = self.admit(raw)?;
        let candles = sanitize(candles);
        if candles.is_empty() {
            return None;
        }
        trace!(instrument = %key, bars = candles.len(), "candle cache replace");
        let series = CandleSeries { candles, period_secs, updated_at: Utc::now() };
        self.candles.lock().insert(key.clone(), series);
        Some(key)
    }

    pub fn put_quote(&self, raw: &str, price: f64) -> Option<InstrumentKey> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        let key = self.admit(raw)?;
        let quote = Quote { instrument: key.clone(), price, observed_at: Utc::now() };
        self.quotes.lock().insert(key.clone(), quote);
        Some(key)
    }

    pub fn put_payout(&self, raw: &str, percentage: f64) -> Option<InstrumentKey> {
        if !percentage.is_finite() || !(0.0..=100.0).contains(&percentage) {
            return None;
        }
        let key = self.admit(raw)?;
        let info = PayoutInfo { instrument: key.clone(), percentage, observed_at: Utc::now() };
        self.payouts.lock().insert(key.clone(), info);
        Some(key)
    }

    pub fn candles_for(&self, raw: &str) -> Option<(InstrumentKey, CandleSeries)> {
        let guard = self.candles.lock();
        lookup(&guard, raw).filter(|(_, s)| !s.candles.is_empty())
    }

    pub fn quote_for(&self, raw: &str) -> Option<Quote> {
        let guard = self.quotes.lock();
        lookup(&guard, raw).map(|(_, q)| q)
    }

    pub fn payout_for(&self, raw: &str) -> Option<PayoutInfo> {
        let guard = self.payouts.lock();
        lookup(&guard, raw).map(|(_, p)| p)
    }

    /// Latest quote, falling back to the close of the newest cached bar.
    pub fn latest_price(&self, raw: &str) -> Option<f64> {
        if let Some(q) = self.quote_for(raw) {
            return Some(q.price);
        }
        self.candles_for(raw)
            .and_then(|(_, s)| s.candles.last().map(|c| c.close))
    }

    pub fn candle_count(&self, raw: &str) -> usize {
        self.candles_for(raw).map(|(_, s)| s.candles.len()).unwrap_or(0)
    }

    pub fn candle_keys(&self) -> Vec<InstrumentKey> {
        let mut keys: Vec<_> = self.candles.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn counts(&self) -> CacheCounts {
        CacheCounts {
            candle_series: self.candles.lock().len(),
            quotes: self.quotes.lock().len(),
            payouts: self.payouts.lock().len(),
        }
    }

    /// Raw spellings seen for every key containing `fragment`.
    pub fn search_aliases(&self, fragment: &str) -> Vec<(InstrumentKey, Vec<String>)> {
        let needle = fragment.to_lowercase();
        let guard = self.aliases.lock();
        let mut hits: Vec<_> = guard
            .iter()
            .filter(|(k, spellings)| {
                k.as_str().contains(&needle) || spellings.iter().any(|s| s.to_lowercase().contains(&needle))
            })
            .map(|(k, spellings)| (k.clone(), spellings.iter().cloned().collect()))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        hits
    }

    fn admit(&self, raw: &str) -> Option<InstrumentKey> {
        let key = normalize(raw);
        if key.as_str().is_empty() {
            return None;
        }
        self.aliases
            .lock()
            .entry(key.clone())
            .or_default()
            .insert(raw.to_string());
        Some(key)
    }
}

// Try every variant as an exact key, then case-insensitively against the
// keys actually present.
fn lookup<V: Clone>(map: &HashMap<InstrumentKey, V>, raw: &str) -> Option<(InstrumentKey, V)> {
    if map.is_empty() {
        return None;
    }
    let candidates = variants(raw);
    for v in &candidates {
        if let Some((k, val)) = map.get_key_value(v.as_str()) {
            return Some((k.clone(), val.clone()));
        }
    }
    let lower_index: HashMap<String, &InstrumentKey> =
        map.keys().map(|k| (k.as_str().to_lowercase(), k)).collect();
    for v in &candidates {
        if let Some(k) = lower_index.get(&v.to_lowercase()) {
            if let Some(val) = map.get(*k) {
                return Some(((*k).clone(), val.clone()));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars(n: i64, close: f64) -> Vec<Candle> {
        (0..n).map(|i| Candle::new(i * 60, close, close + 0.01, close - 0.01, close)).collect()
    }

    #[test]
    fn test_lookup_finds_legacy_otc_key() {
        let caches = MarketCaches::new();
        caches.replace_candles("gbpusd_otc", bars(10, 1.27), None);
        let (key, series) = caches.candles_for("GBP/USD (OTC)").unwrap();
        assert_eq!(key.as_str(), "gbpusd_otc");
        assert_eq!(series.candles.len(), 10);
    }

    #[test]
    fn test_plain_request_can_use_otc_series() {
        let caches = MarketCaches::new();
        caches.replace_candles("EUR/USD (OTC)", bars(3, 1.08), Some(60));
        assert!(caches.candles_for("eurusd").is_some());
        assert!(caches.candles_for("usdjpy").is_none());
    }

    #[test]
    fn test_quotes_and_payouts_latest_wins() {
        let caches = MarketCaches::new();
        caches.put_quote("EURUSD", 1.1);
        caches.put_quote("eur/usd", 1.2);
        assert_eq!(caches.quote_for("EUR/USD").unwrap().price, 1.2);

        assert!(caches.put_payout("AUDCAD_otc", 87.0).is_some());
        assert!(caches.put_payout("AUDCAD_otc", 187.0).is_none());
        assert_eq!(caches.payout_for("AUD/CAD (OTC)").unwrap().percentage, 87.0);
    }

    #[test]
    fn test_latest_price_falls_back_to_last_close() {
        let caches = MarketCaches::new();
        caches.replace_candles("USD/JPY", bars(5, 151.2), None);
        assert_eq!(caches.latest_price("usdjpy"), Some(151.2));
        caches.put_quote("usdjpy", 151.3);
        assert_eq!(caches.latest_price("usdjpy"), Some(151.3));
    }

    #[test]
    fn test_rejects_empty_and_invalid_input() {
        let caches = MarketCaches::new();
        assert!(caches.replace_candles("", bars(3, 1.0), None).is_none());
        assert!(caches.replace_candles("eurusd", vec![], None).is_none());
        assert!(caches.put_quote("eurusd", f64::NAN).is_none());
        assert_eq!(caches.counts().candle_series, 0);
    }

    #[test]
    fn test_alias_search_keeps_raw_spellings() {
        let caches = MarketCaches::new();
        caches.put_quote("EUR/USD (OTC)", 1.0);
        caches.put_quote("eurusd_otc", 1.0);
        let hits = caches.search_aliases("eur");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, vec!["EUR/USD (OTC)".to_string(), "eurusd_otc".to_string()]);
    }
}
