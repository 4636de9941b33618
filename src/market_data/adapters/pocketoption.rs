// PocketOption frames: a JSON object `{name, msg}`.

use serde_json::Value;

use super::wire::{f64_field, field, parse_candles, parse_period, str_field};
use super::{BrokerVariant, DecodedFrame, FrameDecoder, FrameEvent};

pub struct PocketOptionDecoder;

impl FrameDecoder for PocketOptionDecoder {
    fn variant(&self) -> BrokerVariant {
        BrokerVariant::PocketOption
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        let text = std::str::from_utf8(raw).ok()?;
        let body = text.trim_start_matches(|c: char| c.is_control()).trim();
        if !body.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(body).ok()?;
        let event = value.get("name")?.as_str()?;
        let msg = unwrap_msg(value.get("msg")?);

        let updates = match event {
            "candles-generated" => decode_candles(&msg).into_iter().collect(),
            "quotes" => decode_quotes(&msg),
            "change-asset" => decode_payout(&msg).into_iter().collect(),
            _ => return None,
        };
        Some(DecodedFrame { event: event.to_string(), updates })
    }
}

// msg occasionally arrives double-encoded as a JSON string
fn unwrap_msg(msg: &Value) -> Value {
    match msg {
        Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Null),
        other => other.clone(),
    }
}

fn decode_candles(msg: &Value) -> Option<FrameEvent> {
    let asset = str_field(msg, &["asset", "symbol"])?;
    let candles = parse_candles(field(msg, &["candles", "data"])?);
    if candles.is_empty() {
        return None;
    }
    Some(FrameEvent::Candles {
        asset: asset.to_string(),
        candles,
        period_secs: parse_period(msg),
    })
}

fn decode_quotes(msg: &Value) -> Vec<FrameEvent> {
    let Some(items) = msg.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let asset = str_field(item, &["asset", "symbol"])?;
            let price = f64_field(item, &["rate", "price"])?;
            (price > 0.0).then(|| FrameEvent::Quote { asset: asset.to_string(), price })
        })
        .collect()
}

fn decode_payout(msg: &Value) -> Option<FrameEvent> {
    let asset = str_field(msg, &["name", "asset"])?;
    let percentage = f64_field(msg, &["payout", "profit"])?;
    Some(FrameEvent::Payout { asset: asset.to_string(), percentage })
}
