// Session lifecycle: attach to the running browser, pick the broker tab,
// wire the frame taps into it, and keep probing it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::browser::{with_timeout, BrowserDriver, BrowserPage, BrowserSession, DriverError};
use crate::config::FeedConfig;
use crate::market_data::interceptor::FrameInterceptor;
use crate::market_data::page::PROBE;
use crate::market_data::profile::BrokerProfile;
use crate::market_data::secondary::PageHookFeed;
use crate::market_data::types::ConnectionState;
use crate::session::health::HealthMonitor;
use crate::session::PageSlot;

/// Clears the connect flag however the connect loop ends.
struct ConnectGuard(Arc<AtomicBool>);

impl ConnectGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SessionController {
    cfg: FeedConfig,
    profile: &'static BrokerProfile,
    driver: Arc<dyn BrowserDriver>,
    slot: PageSlot,
    interceptor: Arc<FrameInterceptor>,
    hook: Arc<PageHookFeed>,
    state: watch::Sender<ConnectionState>,
    connecting: Arc<AtomicBool>,
    health: Mutex<HealthMonitor>,
    // pages that already carry our frame handler
    tapped: Mutex<HashSet<String>>,
}

impl SessionController {
    pub fn new(
        cfg: FeedConfig,
        driver: Arc<dyn BrowserDriver>,
        slot: PageSlot,
        interceptor: Arc<FrameInterceptor>,
        hook: Arc<PageHookFeed>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            profile: BrokerProfile::for_variant(cfg.broker),
            health: Mutex::new(HealthMonitor::new(cfg.health.failure_threshold)),
            cfg,
            driver,
            slot,
            interceptor,
            hook,
            state,
            connecting: Arc::new(AtomicBool::new(false)),
            tapped: Mutex::new(HashSet::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub fn health_failures(&self) -> u32 {
        self.health.lock().failures()
    }

    fn publish(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        metrics::gauge!("brokerfeed_connection_state").set(next.gauge_value());
        if prev != next {
            info!(from = %prev, to = %next, "connection state");
        }
    }

    /// Connect loop. Returns `false` without doing anything when another
    /// connect loop is already running.
    pub async fn connect(&self) -> bool {
        let Some(_guard) = ConnectGuard::acquire(&self.connecting) else {
            debug!("connect already in progress");
            return false;
        };
        self.connect_locked().await
    }

    /// Start a connect loop on the current `LocalSet` unless one is running.
    pub fn spawn_reconnect(self: &Arc<Self>) -> bool {
        let Some(guard) = ConnectGuard::acquire(&self.connecting) else {
            return false;
        };
        let this = Arc::clone(self);
        tokio::task::spawn_local(async move {
            let _guard = guard;
            this.connect_locked().await;
        });
        true
    }

    #[instrument(skip(self), fields(endpoint = %self.cfg.endpoint, broker = %self.cfg.broker))]
    async fn connect_locked(&self) -> bool {
        self.publish(ConnectionState::Connecting);
        let attempts = self.cfg.connect.attempts.max(1);
        for attempt in 1..=attempts {
            match with_timeout(self.cfg.connect.attempt_timeout(), "connect", self.try_attach()).await {
                Ok(page_id) => {
                    info!(attempt, page = %page_id, "attached to broker tab");
                    self.health.lock().record_success();
                    self.publish(ConnectionState::Connected);
                    return true;
                }
                Err(e) => warn!(attempt, attempts, error = %e, "connect attempt failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.cfg.connect.retry_delay()).await;
            }
        }
        warn!(attempts, "giving up on the browser, serving from non-live sources");
        self.health.lock().mark_degraded();
        self.publish(ConnectionState::Degraded);
        false
    }

    async fn try_attach(&self) -> Result<String, DriverError> {
        let session = self.driver.connect(&self.cfg.endpoint).await?;
        // page handles from a fresh session carry no handlers yet
        self.tapped.lock().clear();
        let pages = session.pages().await?;
        let page = self.select_tab(&pages, None).await.ok_or(DriverError::Closed)?;
        self.attach(session, page.clone()).await;
        Ok(page.id().to_string())
    }

    // Broker tab by URL/title, else the first open tab.
    async fn select_tab(&self, pages: &[Arc<dyn BrowserPage>], exclude: Option<&str>) -> Option<Arc<dyn BrowserPage>> {
        let limit = self.cfg.connect.call_timeout();
        let open: Vec<&Arc<dyn BrowserPage>> = pages
            .iter()
            .filter(|p| !p.is_closed() && Some(p.id()) != exclude)
            .collect();
        for page in &open {
            let url = with_timeout(limit, "url", page.url()).await.unwrap_or_default();
            let title = with_timeout(limit, "title", page.title()).await.unwrap_or_default();
            if self.profile.matches_tab(&url, &title) {
                return Some(Arc::clone(*page));
            }
        }
        let first = open.first().map(|p| Arc::clone(*p));
        if let Some(p) = &first {
            warn!(page = p.id(), "no tab matches the broker, using the first one");
        }
        first
    }

    async fn attach(&self, session: Arc<dyn BrowserSession>, page: Arc<dyn BrowserPage>) {
        let limit = self.cfg.connect.call_timeout();
        let fresh = self.tapped.lock().insert(page.id().to_string());
        if fresh {
            if let Err(e) = with_timeout(limit, "subscribe", page.subscribe_frames(self.interceptor.handler())).await {
                warn!(page = page.id(), error = %e, "frame tap not installed");
                self.tapped.lock().remove(page.id());
            }
        }
        self.hook.install(page.as_ref(), limit).await;
        if let Err(e) = with_timeout(limit, "bring to front", page.bring_to_front()).await {
            debug!(error = %e, "bring to front failed");
        }
        self.slot.attach(session, page);
    }

    async fn probe(&self) -> bool {
        let Some(page) = self.slot.page() else {
            return false;
        };
        match with_timeout(self.cfg.health.probe_timeout(), "probe", page.evaluate(PROBE)).await {
            Ok(_) => true,
            Err(e) => {
                debug!(page = page.id(), error = %e, "probe failed");
                false
            }
        }
    }

    // Move to another live tab of the same browser.
    async fn reattach(&self) -> bool {
        let Some(session) = self.slot.session() else {
            return false;
        };
        let dead = self.slot.raw_page().map(|p| p.id().to_string());
        let pages = match with_timeout(self.cfg.connect.call_timeout(), "list pages", session.pages()).await {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "tab listing failed");
                return false;
            }
        };
        let Some(page) = self.select_tab(&pages, dead.as_deref()).await else {
            return false;
        };
        info!(page = page.id(), "reattaching to another tab");
        self.attach(session, page).await;
        self.probe().await
    }

    /// One health-loop tick. Returns the state published.
    pub async fn health_tick(&self) -> ConnectionState {
        if self.is_connecting() {
            return self.state();
        }
        let healthy = self.probe().await || self.reattach().await;
        let next = {
            let mut monitor = self.health.lock();
            if healthy {
                monitor.record_success()
            } else {
                monitor.record_failure()
            }
        };
        if !healthy {
            metrics::counter!("brokerfeed_health_failures_total").increment(1);
            if next == ConnectionState::Degraded {
                warn!(failures = self.health_failures(), "page unhealthy, session degraded");
            }
        }
        self.publish(next);
        next
    }

    /// Runs for the life of the session loop.
    pub async fn run_health_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.health.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.health_tick().await;
        }
    }

    pub async fn screenshot(&self) -> Option<Vec<u8>> {
        let page = self.slot.page()?;
        with_timeout(self.cfg.connect.call_timeout(), "screenshot", page.screenshot())
            .await
            .map_err(|e| debug!(error = %e, "screenshot failed"))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::scripted::{ScriptedDriver, ScriptedPage};
    use crate::market_data::adapters::BrokerVariant;
    use crate::market_data::cache::MarketCaches;
    use crate::market_data::page::marker;
    use serde_json::json;

    fn controller(driver: Arc<ScriptedDriver>) -> (Arc<SessionController>, PageSlot, Arc<MarketCaches>) {
        let mut cfg = FeedConfig::default();
        cfg.connect.attempts = 3;
        let caches = Arc::new(MarketCaches::new());
        let slot = PageSlot::new();
        let ctl = SessionController::new(
            cfg,
            driver,
            slot.clone(),
            Arc::new(FrameInterceptor::new(BrokerVariant::Quotex, caches.clone())),
            Arc::new(PageHookFeed::new(BrokerVariant::Quotex)),
        );
        (Arc::new(ctl), slot, caches)
    }

    fn live_page(id: &str, url: &str, title: &str) -> ScriptedPage {
        let p = ScriptedPage::new(id, url, title);
        p.respond(marker::PROBE, json!("complete"));
        p
    }

    #[tokio::test(start_paused = true)]
    async fn test_attaches_to_broker_tab_and_taps_frames() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.add_page(live_page("blank", "about:blank", "New Tab"));
        let broker = driver.add_page(live_page("qx", "https://qxbroker.com/en/trade", "Quotex"));
        let (ctl, slot, caches) = controller(driver.clone());

        assert!(ctl.connect().await);
        assert_eq!(ctl.state(), ConnectionState::Connected);
        assert_eq!(slot.page().unwrap().id(), "qx");
        assert!(broker.actions().contains(&"front".to_string()));
        assert_eq!(broker.evaluated_count(marker::HOOK_INSTALL), 1);

        broker.push_frame(br#"42["quotes",[{"asset":"EURUSD","price":1.0871}]]"#);
        assert_eq!(caches.latest_price("EUR/USD"), Some(1.0871));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_browser_degrades_after_attempts() {
        let driver = Arc::new(ScriptedDriver::unreachable());
        let (ctl, _, _) = controller(driver.clone());
        assert!(!ctl.connect().await);
        assert_eq!(driver.connect_attempts(), 3);
        assert_eq!(ctl.state(), ConnectionState::Degraded);
        // still degraded on the next failed tick
        assert_eq!(ctl.health_tick().await, ConnectionState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_threshold_and_recovery() {
        let driver = Arc::new(ScriptedDriver::new());
        let page = driver.add_page(live_page("qx", "https://qxbroker.com", "Quotex"));
        let (ctl, _, _) = controller(driver);
        assert!(ctl.connect().await);

        page.set_hung(true);
        assert_eq!(ctl.health_tick().await, ConnectionState::Disconnected);
        assert_eq!(ctl.health_tick().await, ConnectionState::Disconnected);
        assert_eq!(ctl.health_tick().await, ConnectionState::Degraded);

        page.set_hung(false);
        assert_eq!(ctl.health_tick().await, ConnectionState::Connected);
        assert_eq!(ctl.health_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_tab_reattaches_without_counting_failure() {
        let driver = Arc::new(ScriptedDriver::new());
        let first = driver.add_page(live_page("a", "https://qxbroker.com/trade", "Quotex"));
        let second = driver.add_page(live_page("b", "https://qxbroker.com/demo", "Quotex"));
        let (ctl, slot, caches) = controller(driver);
        assert!(ctl.connect().await);
        assert_eq!(slot.page().unwrap().id(), "a");

        first.set_closed(true);
        assert_eq!(ctl.health_tick().await, ConnectionState::Connected);
        assert_eq!(slot.page().unwrap().id(), "b");
        assert_eq!(second.subscriber_count(), 1);
        second.push_frame(br#"42["quotes",[{"asset":"GBPUSD","price":1.27}]]"#);
        assert_eq!(caches.latest_price("gbpusd"), Some(1.27));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_are_collapsed() {
        let driver = Arc::new(ScriptedDriver::unreachable());
        let (ctl, _, _) = controller(driver.clone());
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                assert!(ctl.spawn_reconnect());
                assert!(!ctl.spawn_reconnect());
                assert!(!ctl.connect().await);
                while ctl.is_connecting() {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            })
            .await;
        assert_eq!(driver.connect_attempts(), 3);
        assert!(!ctl.is_connecting());
    }
}
