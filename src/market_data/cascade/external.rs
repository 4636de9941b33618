// Public FX intraday REST source. Only pairs that split into two ISO
// currency codes are attempted.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::ExternalConfig;
use crate::market_data::adapters::wire::parse_f64_value;
use crate::market_data::series::{resample, sanitize, trim_tail};
use crate::market_data::types::{Candle, InstrumentKey, Timeframe};

const SUPPORTED_INTERVALS: [u64; 5] = [1, 5, 15, 30, 60];
const MAX_ROWS: usize = 150;

#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("instrument {0} is not a currency pair")]
    NotAPair(String),
    #[error("provider returned no series: {0}")]
    Empty(String),
}

#[async_trait]
pub trait HistoricalSource: Send + Sync {
    async fn fetch(&self, instrument: &InstrumentKey, tf: Timeframe) -> Result<Vec<Candle>, ExternalError>;
}

#[derive(Clone)]
pub struct AlphaVantage {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AlphaVantage {
    pub fn new(cfg: &ExternalConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
        }
    }
}

#[async_trait]
impl HistoricalSource for AlphaVantage {
    async fn fetch(&self, instrument: &InstrumentKey, tf: Timeframe) -> Result<Vec<Candle>, ExternalError> {
        let (from, to) = split_pair(instrument).ok_or_else(|| ExternalError::NotAPair(instrument.to_string()))?;
        let minutes = interval_for(tf);
        let interval = format!("{minutes}min");
        debug!(%instrument, %interval, "fx intraday request");

        let body: Value = self
            .client
            .get(&self.base_url)
            .query(&[
                ("function", "FX_INTRADAY"),
                ("from_symbol", from.as_str()),
                ("to_symbol", to.as_str()),
                ("interval", interval.as_str()),
                ("apikey", self.api_key.as_str()),
                ("outputsize", "compact"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let bars = parse_fx_intraday(&body, minutes).ok_or_else(|| {
            let note = body
                .get("Note")
                .or_else(|| body.get("Information"))
                .or_else(|| body.get("Error Message"))
                .and_then(Value::as_str)
                .unwrap_or("missing time series");
            ExternalError::Empty(note.to_string())
        })?;
        Ok(resample(&bars, minutes * 60, tf).unwrap_or(bars))
    }
}

/// `eurusd` / `eurusd_otc` -> ("EUR", "USD").
pub fn split_pair(instrument: &InstrumentKey) -> Option<(String, String)> {
    let base = instrument.base();
    if base.len() != 6 || !base.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let upper = base.to_ascii_uppercase();
    Some((upper[..3].to_string(), upper[3..].to_string()))
}

/// Native interval when the provider has one, else 1min for resampling.
pub fn interval_for(tf: Timeframe) -> u64 {
    let secs = tf.secs();
    SUPPORTED_INTERVALS
        .iter()
        .copied()
        .find(|m| m * 60 == secs)
        .unwrap_or(1)
}

/// Oldest-first bars from a `Time Series FX (<n>min)` body, newest 150 kept.
pub fn parse_fx_intraday(body: &Value, minutes: u64) -> Option<Vec<Candle>> {
    let series = body.get(format!("Time Series FX ({minutes}min)"))?.as_object()?;
    let bars: Vec<Candle> = series
        .iter()
        .filter_map(|(stamp, row)| {
            let ts = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").ok()?.and_utc().timestamp();
            let px = |k: &str| row.get(k).and_then(parse_f64_value);
            Some(Candle::new(ts, px("1. open")?, px("2. high")?, px("3. low")?, px("4. close")?))
        })
        .collect();
    let bars = trim_tail(sanitize(bars), MAX_ROWS);
    (!bars.is_empty()).then_some(bars)
}
