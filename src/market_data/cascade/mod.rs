// Ordered acquisition strategies. Each step is time-boxed on its own and a
// step that errors, times out or comes back short simply hands over to the
// next one. The last step cannot fail.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::browser::{with_timeout, BrowserPage};
use crate::config::{CascadeConfig, FeedConfig};
use crate::market_data::cache::MarketCaches;
use crate::market_data::navigator::{wait_for_candles, ChartControl};
use crate::market_data::normaliser::{base_symbol, normalize};
use crate::market_data::page::{
    chart_engine_script, dom_text_script, mine_price, object_scan_script, page_globals_script, DomText,
    ScanLimits,
};
use crate::market_data::secondary::PageHookFeed;
use crate::market_data::series::{resample, trim_tail};
use crate::market_data::types::{Acquisition, Candle, CandleSource, InstrumentKey, Timeframe};
use crate::session::PageSlot;

pub mod external;
pub mod matchers;
pub mod synthetic;

use external::{AlphaVantage, HistoricalSource};
use matchers::{best_match, default_matchers, CandleMatcher};
use synthetic::SyntheticGenerator;

type Found = (InstrumentKey, Vec<Candle>);

/// Cached bars for `raw` at timeframe `tf`. Finer bars with a known period
/// are resampled when the period divides `tf`.
pub fn cached_candles(caches: &MarketCaches, raw: &str, tf: Timeframe, cfg: &CascadeConfig) -> Option<Found> {
    let (key, series) = caches.candles_for(raw)?;
    let candles = match series.period_secs {
        Some(p) if p < tf.secs() => resample(&series.candles, p, tf).unwrap_or(series.candles),
        _ => series.candles,
    };
    let candles = trim_tail(candles, cfg.max_bars);
    (candles.len() >= cfg.min_bars.max(1)).then_some((key, candles))
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

pub struct AcquisitionCascade {
    cfg: CascadeConfig,
    caches: Arc<MarketCaches>,
    slot: PageSlot,
    secondary: Arc<PageHookFeed>,
    chart: Arc<dyn ChartControl>,
    external: Option<Arc<dyn HistoricalSource>>,
    matchers: Vec<Box<dyn CandleMatcher>>,
    synthetic: Mutex<SyntheticGenerator<StdRng>>,
}

impl AcquisitionCascade {
    pub fn new(
        cfg: &FeedConfig,
        caches: Arc<MarketCaches>,
        slot: PageSlot,
        secondary: Arc<PageHookFeed>,
        chart: Arc<dyn ChartControl>,
    ) -> Self {
        let external = cfg
            .external
            .enabled
            .then(|| Arc::new(AlphaVantage::new(&cfg.external)) as Arc<dyn HistoricalSource>);
        Self {
            cfg: cfg.cascade.clone(),
            caches,
            slot,
            secondary,
            chart,
            external,
            matchers: default_matchers(),
            synthetic: Mutex::new(SyntheticGenerator::from_entropy(cfg.synthetic.clone())),
        }
    }

    pub fn with_external(mut self, source: Option<Arc<dyn HistoricalSource>>) -> Self {
        self.external = source;
        self
    }

    pub fn with_synthetic(mut self, generator: SyntheticGenerator<StdRng>) -> Self {
        self.synthetic = Mutex::new(generator);
        self
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.cfg
    }

    #[instrument(skip(self, tf), fields(tf_secs = tf.secs()))]
    pub async fn acquire(&self, instrument: &str, tf: Timeframe) -> Acquisition {
        if let Some((key, bars)) = cached_candles(&self.caches, instrument, tf, &self.cfg) {
            return self.finish(key, bars, CandleSource::ProtocolCache);
        }

        if let Some((key, bars)) = self.from_secondary(instrument, tf).await {
            return self.finish(key, bars, CandleSource::SecondaryFeed);
        }

        if self.slot.page().is_some() {
            let switched = self.timed("chart switch", self.cfg.switch_budget_ms, self.via_switch(instrument, tf));
            if let Some((key, bars)) = switched.await {
                return self.finish(key, bars, CandleSource::ChartSwitch);
            }
        }

        let anchor = self.page_price(instrument).await;
        // page data below belongs to whatever the chart shows
        let on_chart = self.shows(instrument).await;
        if !on_chart {
            debug!("chart shows another instrument, skipping page data steps");
        }

        if let Some(page) = self.slot.page().filter(|_| on_chart) {
            if let Some(found) = self.from_page(page.as_ref(), instrument).await {
                return found;
            }
        }

        if let Some(found) = self.from_external(instrument, tf).await {
            return self.write_back(found, CandleSource::ExternalApi);
        }

        self.synthesize(normalize(instrument), tf, anchor)
    }

    /// Chart engine, page globals, then the object scan.
    async fn from_page(&self, page: &dyn BrowserPage, instrument: &str) -> Option<Acquisition> {
        let engine = self
            .eval(page, "chart engine", &chart_engine_script(self.cfg.max_bars), self.cfg.chart_engine_budget_ms)
            .await;
        if let Some(found) = self.matched(instrument, engine.as_slice(), self.cfg.min_bars) {
            return Some(self.write_back(found, CandleSource::ChartEngine));
        }

        let script = page_globals_script(instrument, self.cfg.max_bars);
        let globals = self.eval(page, "page globals", &script, self.cfg.globals_budget_ms).await;
        if let Some(found) = self.matched(instrument, globals.as_slice(), self.cfg.min_bars) {
            return Some(self.write_back(found, CandleSource::PageGlobals));
        }

        let limits = ScanLimits {
            min_length: self.cfg.scan_min_length,
            max_depth: self.cfg.scan_max_depth,
            max_nodes: self.cfg.scan_max_nodes,
            max_bars: self.cfg.max_bars,
        };
        let scanned = self
            .eval(page, "object scan", &object_scan_script(limits), self.cfg.scan_budget_ms)
            .await;
        let candidates = match scanned {
            Some(Value::Array(c)) => c,
            _ => Vec::new(),
        };
        let min = self.cfg.scan_min_length.max(self.cfg.min_bars);
        let found = self.matched(instrument, &candidates, min)?;
        Some(self.write_back(found, CandleSource::ObjectScan))
    }

    async fn shows(&self, instrument: &str) -> bool {
        let shown = self.chart.current_instrument().await;
        shown.as_deref().map(base_symbol) == Some(base_symbol(instrument))
    }

    async fn timed<T, F>(&self, step: &'static str, budget_ms: u64, fut: F) -> Option<T>
    where
        F: Future<Output = Option<T>>,
    {
        match tokio::time::timeout(ms(budget_ms), fut).await {
            Ok(v) => v,
            Err(_) => {
                debug!(step, budget_ms, "step over budget");
                None
            }
        }
    }

    async fn eval(&self, page: &dyn BrowserPage, step: &'static str, script: &str, budget_ms: u64) -> Option<Value> {
        match with_timeout(ms(budget_ms), step, page.evaluate(script)).await {
            Ok(Value::Null) => None,
            Ok(v) => Some(v),
            Err(e) => {
                debug!(step, error = %e, "step failed");
                None
            }
        }
    }

    async fn from_secondary(&self, instrument: &str, tf: Timeframe) -> Option<Found> {
        if let Some(page) = self.slot.page() {
            self.secondary.drain(page.as_ref(), ms(self.cfg.secondary_budget_ms)).await;
        }
        cached_candles(self.secondary.caches(), instrument, tf, &self.cfg)
    }

    async fn via_switch(&self, instrument: &str, tf: Timeframe) -> Option<Found> {
        if self.shows(instrument).await {
            debug!(instrument, "already displayed, no switch");
            return None;
        }
        if !self.chart.switch_to(instrument).await {
            return None;
        }
        wait_for_candles(&self.caches, instrument, ms(self.cfg.switch_data_wait_ms), self.cfg.poll_interval()).await;
        cached_candles(&self.caches, instrument, tf, &self.cfg)
    }

    /// Price mined from the page text. Cached as a quote only when the page
    /// shows `instrument`.
    pub async fn page_price(&self, instrument: &str) -> Option<f64> {
        let page = self.slot.page()?;
        let raw = self.eval(page.as_ref(), "dom text", &dom_text_script(), self.cfg.dom_budget_ms).await?;
        let dom: DomText = serde_json::from_value(raw).ok()?;
        let price = mine_price(&dom)?;
        let on_chart = self.shows(instrument).await;
        if on_chart {
            self.caches.put_quote(instrument, price);
        }
        debug!(price, on_chart, "price mined from page text");
        Some(price)
    }

    async fn from_external(&self, instrument: &str, tf: Timeframe) -> Option<Found> {
        let source = self.external.as_ref()?;
        // finest external bar is one minute
        if tf.secs() < 60 {
            debug!(tf_secs = tf.secs(), "sub-minute timeframe, external step skipped");
            return None;
        }
        let key = normalize(instrument);
        let fetched = self
            .timed("external", self.cfg.external_budget_ms, async {
                source
                    .fetch(&key, tf)
                    .await
                    .map_err(|e| debug!(error = %e, "external source failed"))
                    .ok()
            })
            .await?;
        (fetched.len() >= self.cfg.min_bars.max(1)).then_some((key, fetched))
    }

    fn matched(&self, instrument: &str, candidates: &[Value], min_len: usize) -> Option<Found> {
        let (matcher, bars) = best_match(candidates, &self.matchers, min_len.max(1))?;
        debug!(matcher, bars = bars.len(), "candle-shaped data found");
        Some((normalize(instrument), bars))
    }

    fn write_back(&self, (key, bars): Found, source: CandleSource) -> Acquisition {
        let bars = trim_tail(bars, self.cfg.max_bars);
        let key = self.caches.replace_candles(key.as_str(), bars.clone(), None).unwrap_or(key);
        self.finish(key, bars, source)
    }

    fn synthesize(&self, key: InstrumentKey, tf: Timeframe, anchor: Option<f64>) -> Acquisition {
        let now = Utc::now().timestamp();
        let (bars, source) = {
            let mut generator = self.synthetic.lock();
            match anchor {
                Some(price) => (generator.anchored(price, tf, now), CandleSource::SyntheticAnchored),
                None => (generator.baseline(&key, tf, now), CandleSource::Synthetic),
            }
        };
        self.finish(key, bars, source)
    }

    fn finish(&self, instrument: InstrumentKey, candles: Vec<Candle>, source: CandleSource) -> Acquisition {
        let candles = trim_tail(candles, self.cfg.max_bars);
        metrics::counter!("brokerfeed_acquisitions_total", "source" => source.as_str()).increment(1);
        if source.is_synthetic() {
            warn!(%instrument, %source, bars = candles.len(), "SYNTHETIC candles served, no real data available");
        } else {
            info!(%instrument, %source, bars = candles.len(), "candles acquired");
        }
        Acquisition { instrument, candles, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::scripted::{ScriptedDriver, ScriptedPage};
    use crate::browser::BrowserDriver;
    use crate::market_data::adapters::BrokerVariant;
    use crate::market_data::page::marker;
    use async_trait::async_trait;
    use external::ExternalError;
    use rand::SeedableRng;
    use serde_json::json;

    struct StubChart {
        shown: Option<String>,
        feed_on_switch: Option<Arc<MarketCaches>>,
    }

    #[async_trait]
    impl ChartControl for StubChart {
        async fn current_instrument(&self) -> Option<String> {
            self.shown.clone()
        }

        async fn switch_to(&self, instrument: &str) -> bool {
            match &self.feed_on_switch {
                Some(caches) => {
                    caches.replace_candles(instrument, bars(30, 60, 1.5), Some(60));
                    true
                }
                None => false,
            }
        }
    }

    struct StubSource(Vec<Candle>);

    #[async_trait]
    impl HistoricalSource for StubSource {
        async fn fetch(&self, _: &InstrumentKey, _: Timeframe) -> Result<Vec<Candle>, ExternalError> {
            Ok(self.0.clone())
        }
    }

    fn bars(n: i64, step: i64, close: f64) -> Vec<Candle> {
        (0..n).map(|i| Candle::new(1_700_000_000 + i * step, close, close * 1.001, close * 0.999, close)).collect()
    }

    fn minutes(m: f64) -> Timeframe {
        Timeframe::from_minutes(m).unwrap()
    }

    struct Rig {
        caches: Arc<MarketCaches>,
        page: Option<Arc<ScriptedPage>>,
        cascade: AcquisitionCascade,
    }

    async fn rig<F>(with_page: bool, chart: F) -> Rig
    where
        F: FnOnce(Arc<MarketCaches>) -> StubChart,
    {
        let caches = Arc::new(MarketCaches::new());
        let slot = PageSlot::new();
        let mut page = None;
        if with_page {
            let driver = ScriptedDriver::new();
            let p = driver.add_page(ScriptedPage::new("t1", "https://qxbroker.com/en/trade", "Quotex"));
            slot.attach(driver.connect("http://localhost:9222").await.unwrap(), p.clone());
            page = Some(p);
        }
        let mut cfg = FeedConfig::default();
        cfg.external.enabled = false;
        let cascade = AcquisitionCascade::new(
            &cfg,
            caches.clone(),
            slot,
            Arc::new(PageHookFeed::new(BrokerVariant::Quotex)),
            Arc::new(chart(caches.clone())),
        )
        .with_synthetic(SyntheticGenerator::new(cfg.synthetic.clone(), StdRng::seed_from_u64(3)));
        Rig { caches, page, cascade }
    }

    fn no_chart(_: Arc<MarketCaches>) -> StubChart {
        StubChart { shown: None, feed_on_switch: None }
    }

    fn showing(name: &'static str) -> impl FnOnce(Arc<MarketCaches>) -> StubChart {
        move |_| StubChart { shown: Some(name.to_string()), feed_on_switch: None }
    }

    #[tokio::test]
    async fn test_legacy_otc_cache_key_is_found() {
        let r = rig(false, no_chart).await;
        r.caches.replace_candles("gbpusd_otc", bars(40, 60, 1.27), Some(60));
        let got = r.cascade.acquire("GBP/USD (OTC)", minutes(1.0)).await;
        assert_eq!(got.source, CandleSource::ProtocolCache);
        assert_eq!(got.instrument.as_str(), "gbpusd_otc");
        assert_eq!(got.candles.len(), 40);
    }

    #[tokio::test]
    async fn test_finer_cached_bars_are_resampled() {
        let r = rig(false, no_chart).await;
        // 1_700_000_000 is 20s into a minute, so align to a 5-minute boundary first
        let start = 1_700_000_100;
        let one_min: Vec<Candle> = (0..10).map(|i| Candle::flat(start + i * 60, 1.0 + i as f64 * 0.01)).collect();
        r.caches.replace_candles("EURUSD", one_min, Some(60));
        let got = r.cascade.acquire("EUR/USD", minutes(5.0)).await;
        assert_eq!(got.source, CandleSource::ProtocolCache);
        assert_eq!(got.candles.len(), 2);
        assert_eq!(got.candles[0].timestamp % 300, 0);
    }

    #[tokio::test]
    async fn test_total_failure_is_synthetic_and_uncached() {
        let r = rig(false, no_chart).await;
        let got = r.cascade.acquire("USD/BRL (OTC)", minutes(1.0)).await;
        assert_eq!(got.source, CandleSource::Synthetic);
        assert!(got.is_synthetic());
        assert!(!got.candles.is_empty());
        assert_eq!(r.caches.counts().candle_series, 0);
    }

    #[tokio::test]
    async fn test_dom_price_anchors_synthetic_series() {
        let r = rig(true, showing("USD/JPY")).await;
        let page = r.page.as_ref().unwrap();
        page.respond(marker::DOM_TEXT, json!({"texts": ["1.23456"], "body": "Balance 100.00"}));

        let got = r.cascade.acquire("USD/JPY", minutes(1.0)).await;
        assert_eq!(got.source, CandleSource::SyntheticAnchored);
        assert_eq!(got.last_close(), Some(1.23456));
        assert_eq!(r.caches.quote_for("usdjpy").unwrap().price, 1.23456);
        assert_eq!(r.caches.candle_count("usdjpy"), 0);
    }

    #[tokio::test]
    async fn test_chart_switch_then_cache() {
        let r = rig(true, |caches| StubChart { shown: Some("EUR/USD".into()), feed_on_switch: Some(caches) }).await;
        let got = r.cascade.acquire("NZD/CAD (OTC)", minutes(1.0)).await;
        assert_eq!(got.source, CandleSource::ChartSwitch);
        assert_eq!(got.instrument.as_str(), "nzdcad_otc");
        assert_eq!(got.candles.len(), 30);
    }

    #[tokio::test]
    async fn test_displayed_instrument_is_not_switched() {
        let r = rig(true, |caches| StubChart { shown: Some("NZD/CAD (OTC)".into()), feed_on_switch: Some(caches) }).await;
        let got = r.cascade.acquire("nzdcad_otc", minutes(1.0)).await;
        assert_eq!(got.source, CandleSource::Synthetic);
    }

    #[tokio::test]
    async fn test_chart_engine_bars_are_written_back() {
        let r = rig(true, showing("AUD/USD")).await;
        let engine: Vec<Value> = (0..20)
            .map(|i| json!({"time": (1_700_000_040i64 + i * 60) * 1000, "open": 0.65, "high": 0.66, "low": 0.64, "close": 0.655}))
            .collect();
        r.page.as_ref().unwrap().respond(marker::CHART_ENGINE, Value::Array(engine));

        let got = r.cascade.acquire("AUD/USD", minutes(1.0)).await;
        assert_eq!(got.source, CandleSource::ChartEngine);
        assert_eq!(got.candles[0].timestamp, 1_700_000_040);
        assert_eq!(r.caches.candle_count("audusd"), 20);
    }

    #[tokio::test]
    async fn test_page_bars_of_another_instrument_are_ignored() {
        let r = rig(true, showing("EUR/USD")).await;
        let engine: Vec<Value> = (0..20)
            .map(|i| json!({"time": 1_700_000_040i64 + i * 60, "open": 1.08, "high": 1.09, "low": 1.07, "close": 1.085}))
            .collect();
        let page = r.page.as_ref().unwrap();
        page.respond(marker::CHART_ENGINE, Value::Array(engine.clone()));
        page.respond(marker::OBJECT_SCAN, json!([Value::Array(engine)]));

        let got = r.cascade.acquire("AUD/USD", minutes(1.0)).await;
        assert!(got.is_synthetic());
        assert_ne!(got.last_close(), Some(1.085));
        assert_eq!(r.caches.candle_count("audusd"), 0);

        let again = r.cascade.acquire("AUD/USD", minutes(1.0)).await;
        assert_ne!(again.source, CandleSource::ProtocolCache);
        assert_eq!(page.evaluated_count(marker::CHART_ENGINE), 0);
        assert_eq!(page.evaluated_count(marker::OBJECT_SCAN), 0);
    }

    #[tokio::test]
    async fn test_object_scan_takes_longest_and_rejects_short() {
        let r = rig(true, showing("GBP/JPY")).await;
        let tuples = |n: i64| Value::Array((0..n).map(|i| json!([1_700_000_040 + i * 60, 190.1, 190.2, 190.0, 190.15])).collect());
        r.page.as_ref().unwrap().respond(marker::OBJECT_SCAN, json!([tuples(20), tuples(70), tuples(60)]));

        let got = r.cascade.acquire("GBP/JPY", minutes(1.0)).await;
        assert_eq!(got.source, CandleSource::ObjectScan);
        assert_eq!(got.candles.len(), 70);
    }

    #[tokio::test]
    async fn test_external_source_before_synthetic() {
        let r = rig(false, no_chart).await;
        let cascade = r.cascade.with_external(Some(Arc::new(StubSource(bars(12, 60, 1.09)))));
        let got = cascade.acquire("EUR/USD", minutes(1.0)).await;
        assert_eq!(got.source, CandleSource::ExternalApi);
        assert_eq!(r.caches.candle_count("eurusd"), 12);
    }

    #[tokio::test]
    async fn test_sub_minute_request_skips_external_source() {
        let r = rig(false, no_chart).await;
        let cascade = r.cascade.with_external(Some(Arc::new(StubSource(bars(12, 60, 1.09)))));
        let got = cascade.acquire("EUR/USD", minutes(0.25)).await;
        assert_eq!(got.source, CandleSource::Synthetic);
        assert_eq!(r.caches.candle_count("eurusd"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_page_stays_within_budget() {
        let r = rig(true, showing("EUR/USD")).await;
        r.page.as_ref().unwrap().set_hung(true);
        let started = tokio::time::Instant::now();
        let got = r.cascade.acquire("EUR/USD", minutes(1.0)).await;
        assert!(got.is_synthetic());
        assert!(started.elapsed() <= r.cascade.config().total_budget());
    }
}
