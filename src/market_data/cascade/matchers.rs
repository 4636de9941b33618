// Structural matchers applied to what the in-page object scan collects.
// Each candidate is one JSON value; a matcher either recognises its shape
// and yields bars, or passes.

use serde_json::Value;

use crate::market_data::adapters::wire::{parse_candle_row, parse_f64_value, parse_ts_value};
use crate::market_data::series::sanitize;
use crate::market_data::types::Candle;

pub trait CandleMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, candidate: &Value) -> Option<Vec<Candle>>;
}

const TIME_KEYS: [&str; 3] = ["time", "t", "timestamp"];
const OHLC_KEYS: [[&str; 2]; 4] = [["open", "o"], ["high", "h"], ["low", "l"], ["close", "c"]];

fn has_any(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> bool {
    keys.iter().any(|k| obj.contains_key(*k))
}

/// `[{time|t, open|o, high|h, low|l, close|c}, ...]`
pub struct RecordMatcher;

impl CandleMatcher for RecordMatcher {
    fn name(&self) -> &'static str {
        "records"
    }

    fn extract(&self, candidate: &Value) -> Option<Vec<Candle>> {
        let rows = candidate.as_array()?;
        let shaped = rows.iter().all(|r| {
            r.as_object()
                .map(|o| has_any(o, &TIME_KEYS) && OHLC_KEYS.iter().all(|k| has_any(o, k)))
                .unwrap_or(false)
        });
        if !shaped || rows.is_empty() {
            return None;
        }
        rows.iter().map(parse_candle_row).collect()
    }
}

/// `[[t, o, h, l, c, v?], ...]`, all numeric.
pub struct TupleMatcher;

impl CandleMatcher for TupleMatcher {
    fn name(&self) -> &'static str {
        "tuples"
    }

    fn extract(&self, candidate: &Value) -> Option<Vec<Candle>> {
        let rows = candidate.as_array()?;
        let shaped = rows.iter().all(|r| {
            r.as_array()
                .map(|t| (5..=6).contains(&t.len()) && t.iter().all(Value::is_number))
                .unwrap_or(false)
        });
        if !shaped || rows.is_empty() {
            return None;
        }
        rows.iter().map(parse_candle_row).collect()
    }
}

/// `{time: [...], open: [...], high: [...], low: [...], close: [...]}`.
/// A time column is required; bars without timestamps are not usable.
pub struct ParallelArrayMatcher;

impl CandleMatcher for ParallelArrayMatcher {
    fn name(&self) -> &'static str {
        "columns"
    }

    fn extract(&self, candidate: &Value) -> Option<Vec<Candle>> {
        let obj = candidate.as_object()?;
        let column = |keys: &[&str]| keys.iter().find_map(|k| obj.get(*k)?.as_array());
        let times = column(&TIME_KEYS)?;
        let open = column(&OHLC_KEYS[0])?;
        let high = column(&OHLC_KEYS[1])?;
        let low = column(&OHLC_KEYS[2])?;
        let close = column(&OHLC_KEYS[3])?;
        let volume = column(&["volume", "v"]);

        let n = times.len();
        if n == 0 || [open.len(), high.len(), low.len(), close.len()].iter().any(|len| *len != n) {
            return None;
        }
        (0..n)
            .map(|i| {
                Some(Candle {
                    timestamp: parse_ts_value(&times[i])?,
                    open: parse_f64_value(&open[i])?,
                    high: parse_f64_value(&high[i])?,
                    low: parse_f64_value(&low[i])?,
                    close: parse_f64_value(&close[i])?,
                    volume: volume.and_then(|v| v.get(i)).and_then(parse_f64_value).unwrap_or(0.0),
                })
            })
            .collect()
    }
}

pub fn default_matchers() -> Vec<Box<dyn CandleMatcher>> {
    vec![Box::new(RecordMatcher), Box::new(TupleMatcher), Box::new(ParallelArrayMatcher)]
}

/// Longest sanitised match over all candidates; shorter than `min_len` never wins.
pub fn best_match(
    candidates: &[Value],
    matchers: &[Box<dyn CandleMatcher>],
    min_len: usize,
) -> Option<(&'static str, Vec<Candle>)> {
    let mut best: Option<(&'static str, Vec<Candle>)> = None;
    for candidate in candidates {
        let Some((name, bars)) = matchers
            .iter()
            .find_map(|m| m.extract(candidate).map(|bars| (m.name(), sanitize(bars))))
        else {
            continue;
        };
        if bars.len() < min_len {
            continue;
        }
        if best.as_ref().map_or(true, |(_, b)| bars.len() > b.len()) {
            best = Some((name, bars));
        }
    }
    best
}
