//! Pure helpers over candle vectors. Nothing in here touches the browser
//! or the caches.

use std::collections::BTreeMap;

use crate::market_data::types::{Candle, Timeframe};

/// Millisecond timestamps are anything past year 5138 in seconds.
const MS_THRESHOLD: i64 = 100_000_000_000;

pub fn normalize_timestamp(ts: i64) -> i64 {
    if ts.abs() >= MS_THRESHOLD {
        ts / 1000
    } else {
        ts
    }
}

/// Enforce the cache invariants: positive finite prices, high/low covering
/// open/close, strictly increasing timestamps (last write wins on ties).
pub fn sanitize(candles: Vec<Candle>) -> Vec<Candle> {
    let mut by_ts: BTreeMap<i64, Candle> = BTreeMap::new();
    for mut c in candles {
        let prices = [c.open, c.high, c.low, c.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            continue;
        }
        c.high = c.high.max(c.open).max(c.close);
        c.low = c.low.min(c.open).min(c.close);
        if !c.volume.is_finite() || c.volume < 0.0 {
            c.volume = 0.0;
        }
        by_ts.insert(c.timestamp, c);
    }
    by_ts.into_values().collect()
}

/// Aggregate finer bars into `to` buckets. Returns `None` when `to` is not a
/// whole multiple of `from`.
pub fn resample(candles: &[Candle], from_secs: u64, to: Timeframe) -> Option<Vec<Candle>> {
    let to_secs = to.secs();
    if from_secs == 0 || to_secs < from_secs || to_secs % from_secs != 0 {
        return None;
    }
    if to_secs == from_secs {
        return Some(candles.to_vec());
    }

    let mut out: Vec<Candle> = Vec::new();
    for c in candles {
        let bucket = to.align(c.timestamp);
        match out.last_mut() {
            Some(last) if last.timestamp == bucket => {
                last.high = last.high.max(c.high);
                last.low = last.low.min(c.low);
                last.close = c.close;
                last.volume += c.volume;
            }
            _ => out.push(Candle { timestamp: bucket, ..*c }),
        }
    }
    Some(out)
}

/// Keep the most recent `max` bars.
pub fn trim_tail(mut candles: Vec<Candle>, max: usize) -> Vec<Candle> {
    if candles.len() > max {
        candles.drain(..candles.len() - max);
    }
    candles
}

/// Close of the bar whose `[t, t + tf)` interval contains `at`. Only the
/// last 200 bars are searched.
pub fn close_at(candles: &[Candle], at: i64, tf: Timeframe) -> Option<f64> {
    let width = tf.secs() as i64;
    candles
        .iter()
        .rev()
        .take(200)
        .find(|c| c.timestamp <= at && at < c.timestamp + width)
        .map(|c| c.close)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, o: f64, h: f64, l: f64, c: f64) -> Candle {
        Candle::new(ts, o, h, l, c)
    }

    #[test]
    fn test_sanitize_orders_dedups_and_repairs() {
        let raw = vec![
            bar(120, 1.0, 1.1, 0.9, 1.05),
            bar(60, 1.0, 0.95, 1.02, 1.01),
            bar(120, 2.0, 2.1, 1.9, 2.05),
            bar(180, f64::NAN, 1.0, 1.0, 1.0),
            bar(240, 0.0, 1.0, 1.0, 1.0),
        ];
        let clean = sanitize(raw);
        assert_eq!(clean.len(), 2);
        assert_eq!(clean[0].timestamp, 60);
        assert_eq!(clean[1].timestamp, 120);
        assert_eq!(clean[1].open, 2.0);
        assert!(clean.iter().all(Candle::is_consistent));
    }

    #[test]
    fn test_normalize_timestamp_ms() {
        assert_eq!(normalize_timestamp(1_700_000_000_000), 1_700_000_000);
        assert_eq!(normalize_timestamp(1_700_000_000), 1_700_000_000);
    }

    #[test]
    fn test_resample_minutes_to_five() {
        let bars: Vec<Candle> = (0..10)
            .map(|i| bar(i * 60, 1.0 + i as f64, 2.0 + i as f64, 0.5, 1.5 + i as f64))
            .collect();
        let tf = Timeframe::from_minutes(5.0).unwrap();
        let out = resample(&bars, 60, tf).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].timestamp, 0);
        assert_eq!(out[0].open, 1.0);
        assert_eq!(out[0].close, 5.5);
        assert_eq!(out[0].high, 6.0);
        assert_eq!(out[1].timestamp, 300);
        assert!(resample(&bars, 120, Timeframe::from_minutes(3.0).unwrap()).is_none());
        assert!(resample(&bars, 300, Timeframe::from_minutes(1.0).unwrap()).is_none());
    }

    #[test]
    fn test_close_at_expiration() {
        let bars: Vec<Candle> = (0..5).map(|i| bar(i * 60, 1.0, 2.0, 0.5, i as f64 + 1.0)).collect();
        let tf = Timeframe::from_minutes(1.0).unwrap();
        assert_eq!(close_at(&bars, 130, tf), Some(3.0));
        assert_eq!(close_at(&bars, 299, tf), Some(5.0));
        assert_eq!(close_at(&bars, 300, tf), None);
    }

    #[test]
    fn test_trim_tail() {
        let bars: Vec<Candle> = (0..10).map(|i| Candle::flat(i, 1.0)).collect();
        let trimmed = trim_tail(bars, 3);
        assert_eq!(trimmed.iter().map(|c| c.timestamp).collect::<Vec<_>>(), vec![7, 8, 9]);
    }
}
