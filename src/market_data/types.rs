use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};

// One OHLCV bar, timestamp is the start of the bar in epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self { timestamp, open, high, low, close, volume: 0.0 }
    }

    /// Flat bar built from a single observed price.
    pub fn flat(timestamp: i64, price: f64) -> Self {
        Self::new(timestamp, price, price, price, price)
    }

    /// `low <= min(open, close) <= max(open, close) <= high`, all finite and positive.
    pub fn is_consistent(&self) -> bool {
        let values = [self.open, self.high, self.low, self.close];
        if values.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return false;
        }
        self.low <= self.open.min(self.close) && self.high >= self.open.max(self.close)
    }
}

/// Canonical instrument identifier produced by the normaliser.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey(String);

impl InstrumentKey {
    pub(crate) fn from_canonical(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_otc(&self) -> bool {
        self.0.ends_with(crate::market_data::normaliser::OTC_SUFFIX)
    }

    /// Key without the OTC suffix.
    pub fn base(&self) -> &str {
        self.0
            .strip_suffix(crate::market_data::normaliser::OTC_SUFFIX)
            .unwrap_or(&self.0)
    }
}

impl Borrow<str> for InstrumentKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub instrument: InstrumentKey,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutInfo {
    pub instrument: InstrumentKey,
    pub percentage: f64,
    pub observed_at: DateTime<Utc>,
}

// Cached candles for one instrument
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleSeries {
    pub candles: Vec<Candle>,
    /// Bar period in seconds when the source announced one.
    pub period_secs: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl ConnectionState {
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        }
    }

    pub(crate) fn gauge_value(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Degraded => 3.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bar width. Constructed from minutes because that is how consumers think
/// about it; stored in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeframe {
    secs: u64,
}

impl Timeframe {
    /// Widest accepted bar: one year.
    pub const MAX_SECS: u64 = 366 * 86_400;

    pub fn from_minutes(minutes: f64) -> FeedResult<Self> {
        if !minutes.is_finite() || minutes <= 0.0 {
            return Err(FeedError::InvalidTimeframe(minutes));
        }
        let secs = (minutes * 60.0).round();
        if !(1.0..=Self::MAX_SECS as f64).contains(&secs) {
            return Err(FeedError::InvalidTimeframe(minutes));
        }
        Ok(Self { secs: secs as u64 })
    }

    pub fn from_secs(secs: u64) -> FeedResult<Self> {
        if secs == 0 || secs > Self::MAX_SECS {
            return Err(FeedError::InvalidTimeframe(secs as f64 / 60.0));
        }
        Ok(Self { secs })
    }

    pub fn secs(self) -> u64 {
        self.secs
    }

    pub fn minutes(self) -> f64 {
        self.secs as f64 / 60.0
    }

    /// Start of the bar containing `ts`.
    pub fn align(self, ts: i64) -> i64 {
        let width = i64::try_from(self.secs).unwrap_or(i64::MAX);
        ts.div_euclid(width) * width
    }
}

/// Where an acquired series came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleSource {
    ProtocolCache,
    SecondaryFeed,
    ChartSwitch,
    ChartEngine,
    PageGlobals,
    ObjectScan,
    ExternalApi,
    SyntheticAnchored,
    Synthetic,
}

impl CandleSource {
    pub fn is_synthetic(self) -> bool {
        matches!(self, CandleSource::Synthetic | CandleSource::SyntheticAnchored)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CandleSource::ProtocolCache => "protocol_cache",
            CandleSource::SecondaryFeed => "secondary_feed",
            CandleSource::ChartSwitch => "chart_switch",
            CandleSource::ChartEngine => "chart_engine",
            CandleSource::PageGlobals => "page_globals",
            CandleSource::ObjectScan => "object_scan",
            CandleSource::ExternalApi => "external_api",
            CandleSource::SyntheticAnchored => "synthetic_anchored",
            CandleSource::Synthetic => "synthetic",
        }
    }
}

impl fmt::Display for CandleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one trip through the acquisition cascade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Acquisition {
    pub instrument: InstrumentKey,
    pub candles: Vec<Candle>,
    pub source: CandleSource,
}

impl Acquisition {
    pub fn is_synthetic(&self) -> bool {
        self.source.is_synthetic()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.candles.last().map(|c| c.close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_rejects_non_positive() {
        assert!(Timeframe::from_minutes(0.0).is_err());
        assert!(Timeframe::from_minutes(-5.0).is_err());
        assert!(Timeframe::from_minutes(f64::NAN).is_err());
        assert!(Timeframe::from_minutes(0.001).is_err());
        assert_eq!(Timeframe::from_minutes(0.25).unwrap().secs(), 15);
        assert_eq!(Timeframe::from_minutes(5.0).unwrap().secs(), 300);
        assert!(Timeframe::from_minutes(1e300).is_err());
        assert!(Timeframe::from_secs(u64::MAX).is_err());
        assert!(Timeframe::from_secs(0).is_err());
        assert!(Timeframe::from_secs(Timeframe::MAX_SECS).is_ok());
    }

    #[test]
    fn test_timeframe_align() {
        let tf = Timeframe::from_minutes(1.0).unwrap();
        assert_eq!(tf.align(125), 120);
        assert_eq!(tf.align(120), 120);
        assert_eq!(tf.align(-1), -60);
        let widest = Timeframe::from_secs(Timeframe::MAX_SECS).unwrap();
        assert_eq!(widest.align(-1), -(Timeframe::MAX_SECS as i64));
    }

    #[test]
    fn test_candle_consistency() {
        assert!(Candle::new(0, 1.0, 1.2, 0.9, 1.1).is_consistent());
        assert!(!Candle::new(0, 1.0, 1.05, 0.9, 1.1).is_consistent());
        assert!(!Candle::new(0, 1.0, 1.2, 1.05, 1.1).is_consistent());
        assert!(!Candle::new(0, f64::NAN, 1.2, 0.9, 1.1).is_consistent());
        assert!(Candle::flat(10, 1.5).is_consistent());
    }
}
