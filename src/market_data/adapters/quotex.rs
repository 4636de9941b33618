// Quotex frames: optional binary marker byte, a socket.io style numeric
// prefix ("42", "451-"), then `[eventName, payload]`.

use serde_json::Value;

use super::wire::{f64_field, field, parse_candles, parse_f64_value, parse_period, str_field};
use super::{BrokerVariant, DecodedFrame, FrameDecoder, FrameEvent};

pub struct QuotexDecoder;

impl FrameDecoder for QuotexDecoder {
    fn variant(&self) -> BrokerVariant {
        BrokerVariant::Quotex
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        let text = std::str::from_utf8(raw).ok()?;
        let body = strip_envelope_prefix(text)?;
        let value: Value = serde_json::from_str(body).ok()?;
        let arr = value.as_array()?;
        if arr.len() < 2 {
            return None;
        }
        let event = arr[0].as_str()?;
        let payload = &arr[1];

        let updates = match event {
            "ohlc" => decode_ohlc(payload),
            "quotes" => decode_quotes(payload),
            "option-opened" | "asset-updated" => decode_payout(payload).into_iter().collect(),
            _ => return None,
        };
        Some(DecodedFrame { event: event.to_string(), updates })
    }
}

fn strip_envelope_prefix(text: &str) -> Option<&str> {
    let s = text.trim_start_matches(|c: char| c.is_control());
    let s = s.trim_start_matches(|c: char| c.is_ascii_digit());
    let s = s.strip_prefix('-').unwrap_or(s);
    let s = s.trim();
    s.starts_with('[').then_some(s)
}

// payload: [{asset, data: [rows], period?}, ...]; a bare object is tolerated
fn decode_ohlc(payload: &Value) -> Vec<FrameEvent> {
    let entries: Vec<&Value> = match payload {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![payload],
        _ => return Vec::new(),
    };
    entries
        .into_iter()
        .filter_map(|entry| {
            let asset = str_field(entry, &["asset", "symbol"])?;
            let candles = parse_candles(field(entry, &["data", "candles"])?);
            if candles.is_empty() {
                return None;
            }
            Some(FrameEvent::Candles {
                asset: asset.to_string(),
                candles,
                period_secs: parse_period(entry),
            })
        })
        .collect()
}

// payload items: {asset, price} or tick tuples [asset, ts, price, ...]
fn decode_quotes(payload: &Value) -> Vec<FrameEvent> {
    let Some(items) = payload.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let (asset, price) = match item {
                Value::Object(_) => (str_field(item, &["asset", "symbol"])?, f64_field(item, &["price", "rate"])?),
                Value::Array(t) if t.len() >= 3 => (t[0].as_str()?, parse_f64_value(&t[2])?),
                _ => return None,
            };
            (price > 0.0).then(|| FrameEvent::Quote { asset: asset.to_string(), price })
        })
        .collect()
}

fn decode_payout(payload: &Value) -> Option<FrameEvent> {
    let asset = str_field(payload, &["asset", "symbol"])?;
    let percentage = f64_field(payload, &["profitPercent", "payout"])?;
    Some(FrameEvent::Payout { asset: asset.to_string(), percentage })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode(s: &str) -> Option<DecodedFrame> {
        QuotexDecoder.decode(s.as_bytes())
    }

    #[test]
    fn test_ohlc_frame() {
        let frame = r#"42["ohlc",[{"asset":"EURUSD_otc","period":60,"data":[[1700000000,1.1,1.2,1.0,1.15],[1700000060,1.15,1.25,1.1,1.2]]}]]"#;
        let decoded = decode(frame).unwrap();
        assert_eq!(decoded.event, "ohlc");
        match &decoded.updates[..] {
            [FrameEvent::Candles { asset, candles, period_secs }] => {
                assert_eq!(asset, "EURUSD_otc");
                assert_eq!(candles.len(), 2);
                assert_eq!(*period_secs, Some(60));
            }
            other => panic!("unexpected updates {other:?}"),
        }
    }

    #[test]
    fn test_quotes_object_and_tuple_forms() {
        let decoded = decode(r#"42["quotes",[{"asset":"GBPUSD","price":"1.2701"},["USDJPY_otc",1700000000,151.2,1]]]"#).unwrap();
        assert_eq!(
            decoded.updates,
            vec![
                FrameEvent::Quote { asset: "GBPUSD".into(), price: 1.2701 },
                FrameEvent::Quote { asset: "USDJPY_otc".into(), price: 151.2 },
            ]
        );
    }

    #[test]
    fn test_binary_marker_and_ack_prefix() {
        let mut bytes = vec![0x04u8];
        bytes.extend_from_slice(br#"451-["asset-updated",{"asset":"AUDCAD_otc","profitPercent":87}]"#);
        let decoded = QuotexDecoder.decode(&bytes).unwrap();
        assert_eq!(decoded.updates, vec![FrameEvent::Payout { asset: "AUDCAD_otc".into(), percentage: 87.0 }]);

        let decoded = decode(r#"42["option-opened",{"asset":"EURUSD","payout":"82"}]"#).unwrap();
        assert_eq!(decoded.updates, vec![FrameEvent::Payout { asset: "EURUSD".into(), percentage: 82.0 }]);
    }

    #[test]
    fn test_unknown_and_malformed_frames_are_rejected() {
        assert!(decode("2").is_none());
        assert!(decode("40").is_none());
        assert!(decode(r#"42["s_authorization",{}]"#).is_none());
        assert!(decode(r#"{"name":"quotes","msg":[]}"#).is_none());
        assert!(decode("42[\"ohlc\"").is_none());
        assert!(QuotexDecoder.decode(&[0xff, 0xfe, 0x00]).is_none());
        // known event, unusable payload
        assert_eq!(decode(r#"42["quotes",{"asset":"X"}]"#).unwrap().updates, vec![]);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = QuotexDecoder.decode(&bytes);
        }

        #[test]
        fn prop_decode_is_deterministic(asset in "[A-Z]{6}(_otc)?", price in 0.0001f64..10000.0) {
            let frame = format!(r#"42["quotes",[{{"asset":"{asset}","price":{price}}}]]"#);
            let a = QuotexDecoder.decode(frame.as_bytes());
            let b = QuotexDecoder.decode(frame.as_bytes());
            prop_assert!(a.is_some());
            prop_assert_eq!(a, b);
        }
    }
}
