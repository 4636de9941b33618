// Consumer-facing API. Reads the caches directly when they already hold an
// answer; everything that needs the page is marshalled onto the session loop
// and awaited under a deadline. Misuse is the only error a caller sees.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, instrument, warn};

use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::market_data::cache::{CacheCounts, MarketCaches};
use crate::market_data::cascade::cached_candles;
use crate::market_data::cascade::synthetic::SyntheticGenerator;
use crate::market_data::discovery::DiscoveryOutcome;
use crate::market_data::interceptor::{FrameInterceptor, InterceptorStats};
use crate::market_data::normaliser::normalize;
use crate::market_data::router::SessionRequest;
use crate::market_data::series::close_at;
use crate::market_data::types::{Acquisition, Candle, CandleSource, ConnectionState, InstrumentKey, Timeframe};

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub state: ConnectionState,
    pub interceptor: InterceptorStats,
    pub primary_caches: CacheCounts,
    pub secondary_caches: CacheCounts,
    pub cached_instruments: Vec<String>,
    pub queue_free: usize,
}

#[derive(Clone)]
pub struct MarketDataFacade {
    tx: mpsc::Sender<SessionRequest>,
    caches: Arc<MarketCaches>,
    interceptor: Arc<FrameInterceptor>,
    secondary: Arc<MarketCaches>,
    state: watch::Receiver<ConnectionState>,
    cfg: Arc<FeedConfig>,
    synthetic: Arc<Mutex<SyntheticGenerator<StdRng>>>,
}

fn checked(instrument: &str) -> FeedResult<InstrumentKey> {
    let key = normalize(instrument);
    if key.as_str().is_empty() {
        return Err(FeedError::InvalidInstrument(instrument.to_string()));
    }
    Ok(key)
}

impl MarketDataFacade {
    pub(crate) fn new(
        tx: mpsc::Sender<SessionRequest>,
        interceptor: Arc<FrameInterceptor>,
        secondary: Arc<MarketCaches>,
        state: watch::Receiver<ConnectionState>,
        cfg: FeedConfig,
    ) -> Self {
        Self {
            tx,
            caches: Arc::clone(interceptor.caches()),
            interceptor,
            secondary,
            state,
            synthetic: Arc::new(Mutex::new(SyntheticGenerator::from_entropy(cfg.synthetic.clone()))),
            cfg: Arc::new(cfg),
        }
    }

    pub fn caches(&self) -> &Arc<MarketCaches> {
        &self.caches
    }

    pub fn config(&self) -> &FeedConfig {
        &self.cfg
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Ask the loop to reconnect when the session is not live. Never waits.
    fn nudge(&self) {
        let state = self.connection_state();
        if state.is_live() || state == ConnectionState::Connecting {
            return;
        }
        if self.tx.try_send(SessionRequest::Reconnect { reply: None }).is_ok() {
            debug!(%state, "reconnect requested");
        }
    }

    /// Send one request and wait for its reply. `None` when the loop is gone,
    /// its queue stays full, or the answer comes later than `deadline`.
    async fn ask<T>(&self, deadline: Duration, make: impl FnOnce(oneshot::Sender<T>) -> SessionRequest) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        let request = make(reply);
        let kind = request.kind();
        let answered = tokio::time::timeout(deadline, async {
            self.tx.send(request).await.ok()?;
            rx.await.ok()
        })
        .await;
        match answered {
            Ok(Some(v)) => Some(v),
            Ok(None) => {
                warn!(kind, "session loop unavailable, degrading locally");
                None
            }
            Err(_) => {
                warn!(kind, ?deadline, "session loop missed its deadline, degrading locally");
                None
            }
        }
    }

    fn margin(&self) -> Duration {
        self.cfg.facade.deadline_margin()
    }

    /// Quote cache, then the newest cached bar, then the price shown on the
    /// page. `None` when none of them has one.
    #[instrument(skip(self))]
    pub async fn get_current_price(&self, instrument: &str) -> FeedResult<Option<f64>> {
        checked(instrument)?;
        if let Some(price) = self.caches.latest_price(instrument) {
            return Ok(Some(price));
        }
        self.nudge();
        let deadline = Duration::from_millis(self.cfg.cascade.dom_budget_ms) * 2 + self.margin();
        let instrument = instrument.to_string();
        Ok(self
            .ask(deadline, |reply| SessionRequest::CurrentPrice { instrument, reply })
            .await
            .flatten())
    }

    /// Never empty. Use [`acquire`](Self::acquire) to see where the bars came from.
    pub async fn get_candles(&self, instrument: &str, timeframe_minutes: f64) -> FeedResult<Vec<Candle>> {
        Ok(self.acquire(instrument, timeframe_minutes).await?.candles)
    }

    #[instrument(skip(self))]
    pub async fn acquire(&self, instrument: &str, timeframe_minutes: f64) -> FeedResult<Acquisition> {
        let key = checked(instrument)?;
        let tf = Timeframe::from_minutes(timeframe_minutes)?;
        if let Some((key, candles)) = cached_candles(&self.caches, instrument, tf, &self.cfg.cascade) {
            metrics::counter!("brokerfeed_acquisitions_total", "source" => CandleSource::ProtocolCache.as_str())
                .increment(1);
            debug!(instrument = %key, bars = candles.len(), "served from cache");
            return Ok(Acquisition { instrument: key, candles, source: CandleSource::ProtocolCache });
        }

        self.nudge();
        let deadline = self.cfg.cascade.total_budget() + self.margin();
        let raw = instrument.to_string();
        let answered = self
            .ask(deadline, |reply| SessionRequest::Acquire { instrument: raw, tf, reply })
            .await;
        Ok(match answered {
            Some(acq) if !acq.candles.is_empty() => acq,
            _ => self.local_synthetic(key, tf),
        })
    }

    fn local_synthetic(&self, key: InstrumentKey, tf: Timeframe) -> Acquisition {
        let now = Utc::now().timestamp();
        let anchor = self.caches.latest_price(key.as_str());
        let (candles, source) = {
            let mut generator = self.synthetic.lock();
            match anchor {
                Some(price) => (generator.anchored(price, tf, now), CandleSource::SyntheticAnchored),
                None => (generator.baseline(&key, tf, now), CandleSource::Synthetic),
            }
        };
        metrics::counter!("brokerfeed_acquisitions_total", "source" => source.as_str()).increment(1);
        warn!(instrument = %key, %source, bars = candles.len(), "SYNTHETIC candles served by facade, session loop unavailable");
        Acquisition { instrument: key, candles, source }
    }

    /// Payout percentage; the configured fallback when nobody knows.
    #[instrument(skip(self))]
    pub async fn get_payout(&self, instrument: &str) -> FeedResult<f64> {
        checked(instrument)?;
        if let Some(info) = self.caches.payout_for(instrument) {
            return Ok(info.percentage);
        }
        self.nudge();
        let deadline = self.cfg.connect.call_timeout() * 2 + self.margin();
        let raw = instrument.to_string();
        let payout = self
            .ask(deadline, |reply| SessionRequest::Payout { instrument: raw, reply })
            .await
            .flatten();
        Ok(payout.unwrap_or_else(|| {
            debug!(fallback = self.cfg.facade.fallback_payout, "payout unknown, using fallback");
            self.cfg.facade.fallback_payout
        }))
    }

    #[instrument(skip(self))]
    pub async fn switch_instrument(&self, instrument: &str) -> FeedResult<bool> {
        checked(instrument)?;
        self.nudge();
        let deadline = self.cfg.discovery.switch_budget() + self.margin();
        let raw = instrument.to_string();
        Ok(self
            .ask(deadline, |reply| SessionRequest::Switch { instrument: raw, reply })
            .await
            .unwrap_or(false))
    }

    pub async fn get_current_instrument(&self) -> Option<String> {
        let deadline = self.cfg.connect.call_timeout() + self.margin();
        self.ask(deadline, |reply| SessionRequest::CurrentInstrument { reply })
            .await
            .flatten()
    }

    /// Close of the cached bar whose interval contains `at` (unix seconds).
    pub fn get_close_at(&self, instrument: &str, at: i64, timeframe_minutes: f64) -> FeedResult<Option<f64>> {
        checked(instrument)?;
        let tf = Timeframe::from_minutes(timeframe_minutes)?;
        Ok(cached_candles(&self.caches, instrument, tf, &self.cfg.cascade)
            .and_then(|(_, candles)| close_at(&candles, at, tf)))
    }

    /// PNG of the broker tab.
    pub async fn screenshot(&self) -> Option<Vec<u8>> {
        let deadline = self.cfg.connect.call_timeout() + self.margin();
        self.ask(deadline, |reply| SessionRequest::Screenshot { reply })
            .await
            .flatten()
    }

    pub async fn discover_assets(&self) -> DiscoveryOutcome {
        self.nudge();
        let d = &self.cfg.discovery;
        let per_candidate = self.cfg.connect.call_timeout() * 2
            + d.switch_budget()
            + Duration::from_millis(d.switched_data_wait_ms.max(d.current_data_wait_ms));
        let deadline = per_candidate * (d.candidates.len() as u32 + 1) + self.margin();
        self.ask(deadline, |reply| SessionRequest::Discover { reply })
            .await
            .unwrap_or(DiscoveryOutcome::NoneQualified)
    }

    /// `true` when a new connect loop was started.
    pub async fn reconnect(&self) -> bool {
        self.ask(self.margin(), |reply| SessionRequest::Reconnect { reply: Some(reply) })
            .await
            .unwrap_or(false)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            state: self.connection_state(),
            interceptor: self.interceptor.stats(),
            primary_caches: self.caches.counts(),
            secondary_caches: self.secondary.counts(),
            cached_instruments: self.caches.candle_keys().iter().map(|k| k.as_str().to_string()).collect(),
            queue_free: self.tx.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::adapters::BrokerVariant;

    struct Detached {
        facade: MarketDataFacade,
        rx: mpsc::Receiver<SessionRequest>,
        _state: watch::Sender<ConnectionState>,
    }

    fn detached(state: ConnectionState) -> Detached {
        let mut cfg = FeedConfig::default();
        cfg.facade.deadline_margin_ms = 200;
        cfg.cascade.max_bars = 500;
        let caches = Arc::new(MarketCaches::new());
        let interceptor = Arc::new(FrameInterceptor::new(BrokerVariant::Quotex, caches));
        let (tx, rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(state);
        let facade = MarketDataFacade::new(tx, interceptor, Arc::new(MarketCaches::new()), state_rx, cfg);
        Detached { facade, rx, _state: state_tx }
    }

    #[tokio::test]
    async fn test_misuse_is_rejected() {
        let d = detached(ConnectionState::Connected);
        assert!(matches!(d.facade.get_candles("  ", 1.0).await, Err(FeedError::InvalidInstrument(_))));
        assert!(matches!(d.facade.get_candles("EUR/USD", 0.0).await, Err(FeedError::InvalidTimeframe(_))));
        assert!(matches!(d.facade.get_candles("EUR/USD", f64::NAN).await, Err(FeedError::InvalidTimeframe(_))));
        assert!(d.facade.get_payout("").await.is_err());
        assert!(d.facade.get_close_at("EUR/USD", 0, -1.0).is_err());
    }

    #[tokio::test]
    async fn test_cache_fast_path_skips_loop() {
        let mut d = detached(ConnectionState::Connected);
        let bars: Vec<_> = (0..5).map(|i| Candle::new(600 + i * 60, 1.1, 1.2, 1.0, 1.15)).collect();
        d.facade.caches().replace_candles("gbpusd_otc", bars, Some(60));
        d.facade.caches().put_payout("GBP/USD (OTC)", 91.0);

        let acq = d.facade.acquire("GBP/USD (OTC)", 1.0).await.unwrap();
        assert_eq!(acq.source, CandleSource::ProtocolCache);
        assert_eq!(acq.candles.len(), 5);
        assert_eq!(d.facade.get_payout("gbpusd_otc").await.unwrap(), 91.0);
        assert_eq!(d.facade.get_current_price("GBPUSD-OTC").await.unwrap(), Some(1.15));
        assert_eq!(d.facade.get_close_at("GBP/USD (OTC)", 725, 1.0).unwrap(), Some(1.15));
        assert!(d.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_loop_degrades_locally() {
        let Detached { facade, rx, _state } = detached(ConnectionState::Degraded);
        drop(rx);

        let acq = facade.acquire("USD/JPY", 5.0).await.unwrap();
        assert_eq!(acq.source, CandleSource::Synthetic);
        assert!(!acq.candles.is_empty());
        assert!(acq.candles.windows(2).all(|w| w[1].timestamp - w[0].timestamp == 300));
        assert!(facade.caches().candles_for("usdjpy").is_none());

        assert_eq!(facade.get_current_price("USD/JPY").await.unwrap(), None);
        assert_eq!(facade.get_payout("USD/JPY").await.unwrap(), 85.0);
        assert!(!facade.switch_instrument("USD/JPY").await.unwrap());
        assert_eq!(facade.get_current_instrument().await, None);
        assert_eq!(facade.discover_assets().await, DiscoveryOutcome::NoneQualified);
        assert!(!facade.reconnect().await);
    }

    #[tokio::test]
    async fn test_local_synthetic_anchors_on_cached_quote() {
        let Detached { facade, rx, _state } = detached(ConnectionState::Disconnected);
        drop(rx);
        facade.caches().put_quote("USD/JPY", 1.23456);
        let acq = facade.acquire("USD/JPY", 1.0).await.unwrap();
        assert_eq!(acq.source, CandleSource::SyntheticAnchored);
        assert_eq!(acq.last_close(), Some(1.23456));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_loop_misses_deadline() {
        let Detached { facade, mut rx, _state } = detached(ConnectionState::Connected);
        // keep requests queued but never answer them
        let held = tokio::spawn(async move {
            let mut kept = Vec::new();
            while let Some(req) = rx.recv().await {
                kept.push(req);
            }
            kept.len()
        });
        assert!(!facade.switch_instrument("EUR/USD").await.unwrap());
        assert_eq!(facade.get_payout("EUR/USD").await.unwrap(), 85.0);
        drop(facade);
        assert_eq!(held.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_not_live_state_requests_reconnect() {
        let Detached { facade, mut rx, _state } = detached(ConnectionState::Degraded);
        let answer = tokio::spawn(async move {
            let mut kinds = Vec::new();
            while let Some(req) = rx.recv().await {
                kinds.push(req.kind());
                if let SessionRequest::Payout { reply, .. } = req {
                    let _ = reply.send(Some(77.0));
                }
            }
            kinds
        });
        assert_eq!(facade.get_payout("EUR/USD").await.unwrap(), 77.0);
        drop(facade);
        assert_eq!(answer.await.unwrap(), vec!["reconnect", "payout"]);
    }

    #[test]
    fn test_diagnostics_reports_state_and_counts() {
        let d = detached(ConnectionState::Connecting);
        d.facade.caches().put_quote("EUR/USD", 1.08);
        let diag = d.facade.diagnostics();
        assert_eq!(diag.state, ConnectionState::Connecting);
        assert_eq!(diag.primary_caches.quotes, 1);
        assert_eq!(diag.queue_free, 8);
        assert_eq!(diag.interceptor.frames_total, 0);
    }
}
