// Broker-specific frame decoders + the event type they produce

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::market_data::types::Candle;

pub mod pocketoption;
pub mod quotex;
pub mod wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerVariant {
    Quotex,
    PocketOption,
}

impl BrokerVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerVariant::Quotex => "quotex",
            BrokerVariant::PocketOption => "pocketoption",
        }
    }
}

impl fmt::Display for BrokerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerVariant {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "quotex" | "qx" => Ok(BrokerVariant::Quotex),
            "pocketoption" | "po" => Ok(BrokerVariant::PocketOption),
            other => Err(FeedError::Config(format!("unknown broker {other:?}"))),
        }
    }
}

/// One cache update carried by a frame. Asset names are raw; the
/// interceptor normalises them on the way into the caches.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Candles {
        asset: String,
        candles: Vec<Candle>,
        period_secs: Option<u64>,
    },
    Quote {
        asset: String,
        price: f64,
    },
    Payout {
        asset: String,
        percentage: f64,
    },
}

/// A frame whose envelope parsed and whose event name the decoder knows.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub event: String,
    pub updates: Vec<FrameEvent>,
}

pub trait FrameDecoder: Send + Sync {
    fn variant(&self) -> BrokerVariant;

    /// `None` for anything that is not a known event in this broker's
    /// envelope. Must never panic.
    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame>;
}

pub fn decoder_for(variant: BrokerVariant) -> Box<dyn FrameDecoder> {
    match variant {
        BrokerVariant::Quotex => Box::new(quotex::QuotexDecoder),
        BrokerVariant::PocketOption => Box::new(pocketoption::PocketOptionDecoder),
    }
}
