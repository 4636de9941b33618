// Passive frame tap: decode what the broker page receives and fold it into
// the caches. Runs on the driver's reader task, so it never blocks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use crate::browser::FrameHandler;
use crate::market_data::adapters::{decoder_for, BrokerVariant, FrameDecoder, FrameEvent};
use crate::market_data::cache::MarketCaches;

#[derive(Debug, Clone, Default, Serialize)]
pub struct InterceptorStats {
    pub frames_total: u64,
    pub frames_decoded: u64,
    pub frames_discarded: u64,
    pub events: BTreeMap<String, u64>,
    pub last_frame_at: Option<DateTime<Utc>>,
}

pub struct FrameInterceptor {
    feed: &'static str,
    decoder: Box<dyn FrameDecoder>,
    caches: Arc<MarketCaches>,
    frames_total: AtomicU64,
    frames_decoded: AtomicU64,
    frames_discarded: AtomicU64,
    events: Mutex<BTreeMap<String, u64>>,
    last_frame_at: Mutex<Option<DateTime<Utc>>>,
}

impl FrameInterceptor {
    pub fn new(variant: BrokerVariant, caches: Arc<MarketCaches>) -> Self {
        Self {
            feed: "primary",
            decoder: decoder_for(variant),
            caches,
            frames_total: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_discarded: AtomicU64::new(0),
            events: Mutex::new(BTreeMap::new()),
            last_frame_at: Mutex::new(None),
        }
    }

    /// Label carried by this tap's metrics, so parallel feeds don't merge.
    pub fn with_feed(mut self, feed: &'static str) -> Self {
        self.feed = feed;
        self
    }

    pub fn feed(&self) -> &'static str {
        self.feed
    }

    pub fn variant(&self) -> BrokerVariant {
        self.decoder.variant()
    }

    pub fn caches(&self) -> &Arc<MarketCaches> {
        &self.caches
    }

    /// Closure to hand to `BrowserPage::subscribe_frames`.
    pub fn handler(self: &Arc<Self>) -> FrameHandler {
        let this = Arc::clone(self);
        Arc::new(move |raw: &[u8]| {
            this.handle_frame(raw);
        })
    }

    /// Decode one frame and apply it. Returns the number of cache writes.
    pub fn handle_frame(&self, raw: &[u8]) -> usize {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        *self.last_frame_at.lock() = Some(Utc::now());
        metrics::counter!("brokerfeed_frames_total", "feed" => self.feed).increment(1);

        let Some(frame) = self.decoder.decode(raw) else {
            self.frames_discarded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("brokerfeed_frames_discarded_total", "feed" => self.feed).increment(1);
            trace!(len = raw.len(), "frame discarded");
            return 0;
        };

        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
        *self.events.lock().entry(frame.event.clone()).or_insert(0) += 1;
        metrics::counter!("brokerfeed_events_total", "feed" => self.feed, "event" => frame.event.clone()).increment(1);

        let mut writes = 0;
        for update in frame.updates {
            if self.apply(update) {
                writes += 1;
            }
        }
        trace!(event = %frame.event, writes, "frame applied");
        writes
    }

    fn apply(&self, update: FrameEvent) -> bool {
        match update {
            FrameEvent::Candles { asset, candles, period_secs } => {
                let bars = candles.len();
                let key = self.caches.replace_candles(&asset, candles, period_secs);
                if let Some(key) = &key {
                    debug!(instrument = %key, bars, period = ?period_secs, "candles from stream");
                }
                key.is_some()
            }
            FrameEvent::Quote { asset, price } => self.caches.put_quote(&asset, price).is_some(),
            FrameEvent::Payout { asset, percentage } => self.caches.put_payout(&asset, percentage).is_some(),
        }
    }

    pub fn stats(&self) -> InterceptorStats {
        InterceptorStats {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            events: self.events.lock().clone(),
            last_frame_at: *self.last_frame_at.lock(),
        }
    }
}
