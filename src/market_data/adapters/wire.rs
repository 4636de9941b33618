// Loose JSON field readers shared by both envelope decoders. Brokers send
// numbers as JSON numbers or as strings, and rename keys between releases.

use serde_json::Value;

use crate::market_data::series::normalize_timestamp;
use crate::market_data::types::Candle;

pub fn parse_f64_value(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Epoch timestamp in seconds; fractional and millisecond inputs accepted.
pub fn parse_ts_value(value: &Value) -> Option<i64> {
    let raw = parse_f64_value(value)?;
    if raw.abs() > i64::MAX as f64 {
        return None;
    }
    Some(normalize_timestamp(raw.trunc() as i64))
}

/// First present key wins.
pub fn field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let map = obj.as_object()?;
    keys.iter().find_map(|k| map.get(*k).filter(|v| !v.is_null()))
}

pub fn str_field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a str> {
    field(obj, keys)?.as_str().map(str::trim).filter(|s| !s.is_empty())
}

pub fn f64_field(obj: &Value, keys: &[&str]) -> Option<f64> {
    field(obj, keys).and_then(parse_f64_value)
}

/// Candle row in object form (`{time|t, open|o, ...}`) or tuple form
/// (`[t, o, h, l, c, v?]`).
pub fn parse_candle_row(row: &Value) -> Option<Candle> {
    match row {
        Value::Object(_) => {
            let ts = field(row, &["time", "t", "timestamp"]).and_then(parse_ts_value)?;
            let open = f64_field(row, &["open", "o"])?;
            let high = f64_field(row, &["high", "h"])?;
            let low = f64_field(row, &["low", "l"])?;
            let close = f64_field(row, &["close", "c"])?;
            let volume = f64_field(row, &["volume", "v"]).unwrap_or(0.0);
            Some(Candle { timestamp: ts, open, high, low, close, volume })
        }
        Value::Array(items) if items.len() >= 5 => {
            let ts = parse_ts_value(&items[0])?;
            let open = parse_f64_value(&items[1])?;
            let high = parse_f64_value(&items[2])?;
            let low = parse_f64_value(&items[3])?;
            let close = parse_f64_value(&items[4])?;
            let volume = items.get(5).and_then(parse_f64_value).unwrap_or(0.0);
            Some(Candle { timestamp: ts, open, high, low, close, volume })
        }
        _ => None,
    }
}

/// Every parseable row; unparseable rows are skipped, not fatal.
pub fn parse_candles(rows: &Value) -> Vec<Candle> {
    rows.as_array()
        .map(|rows| rows.iter().filter_map(parse_candle_row).collect())
        .unwrap_or_default()
}

pub fn parse_period(obj: &Value) -> Option<u64> {
    let secs = f64_field(obj, &["period", "timeframe", "interval"])?;
    (secs >= 1.0 && secs <= u32::MAX as f64).then(|| secs as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_f64_value_accepts_strings() {
        assert_eq!(parse_f64_value(&json!(1.5)), Some(1.5));
        assert_eq!(parse_f64_value(&json!(" 1.08342 ")), Some(1.08342));
        assert_eq!(parse_f64_value(&json!("abc")), None);
        assert_eq!(parse_f64_value(&json!(null)), None);
        assert_eq!(parse_f64_value(&json!("NaN")), None);
    }

    #[test]
    fn test_parse_candle_row_object_and_tuple() {
        let obj = json!({"t": 1_700_000_000_000i64, "o": "1.1", "h": 1.2, "l": 1.0, "c": 1.15});
        let c = parse_candle_row(&obj).unwrap();
        assert_eq!(c.timestamp, 1_700_000_000);
        assert_eq!(c.open, 1.1);
        assert_eq!(c.volume, 0.0);

        let tuple = json!([1_700_000_060, 1.15, 1.25, 1.1, 1.2, 42]);
        let c = parse_candle_row(&tuple).unwrap();
        assert_eq!(c.timestamp, 1_700_000_060);
        assert_eq!(c.volume, 42.0);

        assert!(parse_candle_row(&json!([1, 2, 3])).is_none());
        assert!(parse_candle_row(&json!({"time": 1, "open": 1.0})).is_none());
    }

    #[test]
    fn test_parse_candles_skips_bad_rows() {
        let rows = json!([
            {"time": 60, "open": 1.0, "high": 1.1, "low": 0.9, "close": 1.05},
            "garbage",
            [120, 1.05, 1.2, 1.0, 1.1]
        ]);
        assert_eq!(parse_candles(&rows).len(), 2);
        assert!(parse_candles(&json!({"not": "rows"})).is_empty());
    }

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period(&json!({"period": 60})), Some(60));
        assert_eq!(parse_period(&json!({"period": "300"})), Some(300));
        assert_eq!(parse_period(&json!({"period": 0})), None);
        assert_eq!(parse_period(&json!({})), None);
    }
}
