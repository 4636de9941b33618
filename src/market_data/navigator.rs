// Driving the broker UI: read which instrument the chart shows, read its
// payout, and switch the chart to another instrument.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::browser::{with_timeout, BrowserPage, DriverError};
use crate::config::DiscoveryConfig;
use crate::market_data::cache::MarketCaches;
use crate::market_data::normaliser::{base_symbol, strip_otc_text};
use crate::market_data::page::{current_asset_script, dom_payout_script, pick_result_script};
use crate::market_data::profile::{is_broker_tab, BrokerProfile};
use crate::session::PageSlot;

#[async_trait]
pub trait ChartControl: Send + Sync {
    /// Name the chart currently displays, as the page spells it.
    async fn current_instrument(&self) -> Option<String>;

    /// Switch and verify. `false` covers every failure.
    async fn switch_to(&self, instrument: &str) -> bool;
}

#[async_trait]
pub trait PayoutOracle: Send + Sync {
    async fn payout(&self, instrument: &str) -> Option<f64>;
}

pub struct PageNavigator {
    slot: PageSlot,
    profile: &'static BrokerProfile,
    caches: Arc<MarketCaches>,
    cfg: DiscoveryConfig,
    call_timeout: Duration,
}

impl PageNavigator {
    pub fn new(
        slot: PageSlot,
        profile: &'static BrokerProfile,
        caches: Arc<MarketCaches>,
        cfg: DiscoveryConfig,
        call_timeout: Duration,
    ) -> Self {
        Self { slot, profile, caches, cfg, call_timeout }
    }

    async fn eval(&self, page: &dyn BrowserPage, what: &'static str, script: &str) -> Option<Value> {
        match with_timeout(self.call_timeout, what, page.evaluate(script)).await {
            Ok(Value::Null) => None,
            Ok(v) => Some(v),
            Err(e) => {
                debug!(what, error = %e, "page evaluate failed");
                None
            }
        }
    }

    async fn read_instrument(&self, page: &dyn BrowserPage) -> Option<String> {
        self.eval(page, "current asset", &current_asset_script(self.profile))
            .await
            .and_then(|v| v.as_str().map(str::trim).filter(|s| !s.is_empty()).map(String::from))
    }

    /// Payout widget value, which belongs to whatever the chart shows.
    pub async fn dom_payout(&self) -> Option<f64> {
        let page = self.slot.page()?;
        self.eval(page.as_ref(), "dom payout", &dom_payout_script(self.profile))
            .await
            .and_then(|v| v.as_f64())
            .filter(|p| (0.0..=100.0).contains(p))
    }

    // First selector in the list that the page accepts.
    async fn click_any(&self, page: &dyn BrowserPage, selectors: &[&str]) -> Option<String> {
        for sel in selectors {
            match with_timeout(self.call_timeout, "click", page.click(sel)).await {
                Ok(()) => return Some(sel.to_string()),
                Err(DriverError::ElementNotFound(_)) => continue,
                Err(e) => {
                    debug!(selector = %sel, error = %e, "click failed");
                    continue;
                }
            }
        }
        None
    }

    async fn fill_any(&self, page: &dyn BrowserPage, selectors: &[&str], text: &str) -> bool {
        for sel in selectors {
            if with_timeout(self.call_timeout, "fill", page.fill(sel, text)).await.is_ok() {
                return true;
            }
        }
        false
    }

    async fn verify(&self, page: &dyn BrowserPage, target: &str) -> bool {
        let want = base_symbol(target);
        for attempt in 1..=self.cfg.verify_attempts.max(1) {
            match self.read_instrument(page).await {
                Some(shown) if base_symbol(&shown) == want => return true,
                shown => debug!(attempt, ?shown, target, "switch not visible yet"),
            }
            if attempt < self.cfg.verify_attempts {
                tokio::time::sleep(Duration::from_millis(self.cfg.verify_wait_ms)).await;
            }
        }
        false
    }

    /// Close every other tab that belongs to a broker. Returns how many went.
    pub async fn close_other_broker_tabs(&self) -> usize {
        let (Some(session), Some(keep)) = (self.slot.session(), self.slot.page()) else {
            return 0;
        };
        let pages = match with_timeout(self.call_timeout, "list pages", session.pages()).await {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "tab listing failed");
                return 0;
            }
        };
        let mut closed = 0;
        for page in pages.iter().filter(|p| p.id() != keep.id() && !p.is_closed()) {
            let url = with_timeout(self.call_timeout, "url", page.url()).await.unwrap_or_default();
            let title = with_timeout(self.call_timeout, "title", page.title()).await.unwrap_or_default();
            if !is_broker_tab(&url, &title) {
                continue;
            }
            match with_timeout(self.call_timeout, "close tab", page.close()).await {
                Ok(()) => closed += 1,
                Err(e) => debug!(page = page.id(), error = %e, "tab close failed"),
            }
        }
        if closed > 0 {
            info!(closed, "closed redundant broker tabs");
        }
        closed
    }
}

#[async_trait]
impl ChartControl for PageNavigator {
    async fn current_instrument(&self) -> Option<String> {
        let page = self.slot.page()?;
        self.read_instrument(page.as_ref()).await
    }

    #[instrument(skip(self), fields(broker = %self.profile.variant))]
    async fn switch_to(&self, instrument: &str) -> bool {
        let Some(page) = self.slot.page() else {
            debug!("no page to switch");
            return false;
        };
        let page = page.as_ref();
        let pause = Duration::from_millis(self.cfg.action_pause_ms);
        let search_text = strip_otc_text(instrument);

        let Some(picker) = self.click_any(page, self.profile.picker_buttons).await else {
            warn!("asset picker not found");
            return false;
        };
        debug!(%picker, "asset picker opened");
        tokio::time::sleep(pause).await;

        if !self.fill_any(page, self.profile.search_inputs, &search_text).await {
            warn!("asset search box not found");
            return false;
        }
        tokio::time::sleep(pause).await;

        let picked = self
            .eval(page, "pick result", &pick_result_script(self.profile, &search_text))
            .await;
        let Some(picked) = picked.as_ref().and_then(Value::as_str) else {
            warn!(search = %search_text, "no matching entry in asset list");
            return false;
        };
        debug!(%picked, "asset entry clicked");

        tokio::time::sleep(Duration::from_millis(self.cfg.settle_ms)).await;
        if !self.verify(page, instrument).await {
            warn!("chart did not switch");
            return false;
        }
        info!("chart switched");
        self.close_other_broker_tabs().await;
        true
    }
}

#[async_trait]
impl PayoutOracle for PageNavigator {
    /// Cache first; the DOM widget only counts when the chart shows the
    /// requested instrument.
    async fn payout(&self, instrument: &str) -> Option<f64> {
        if let Some(p) = self.caches.payout_for(instrument) {
            return Some(p.percentage);
        }
        let shown = self.current_instrument().await?;
        if base_symbol(&shown) != base_symbol(instrument) {
            debug!(instrument, %shown, "payout not cached and not on the chart");
            return None;
        }
        let pct = self.dom_payout().await?;
        self.caches.put_payout(&shown, pct);
        Some(pct)
    }
}

/// Poll until the caches hold bars for `instrument` or `limit` passes.
pub async fn wait_for_candles(caches: &MarketCaches, instrument: &str, limit: Duration, poll: Duration) -> bool {
    let waited = tokio::time::timeout(limit, async {
        loop {
            if caches.candle_count(instrument) > 0 {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    })
    .await;
    waited.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::scripted::{ScriptedDriver, ScriptedPage};
    use crate::browser::BrowserDriver;
    use crate::market_data::adapters::BrokerVariant;
    use crate::market_data::page::marker;
    use crate::market_data::types::Candle;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Fixture {
        page: Arc<ScriptedPage>,
        other: Arc<ScriptedPage>,
        news: Arc<ScriptedPage>,
        nav: PageNavigator,
        caches: Arc<MarketCaches>,
    }

    async fn fixture() -> Fixture {
        let driver = ScriptedDriver::new();
        let page = driver.add_page(ScriptedPage::new("main", "https://qxbroker.com/en/trade", "Quotex"));
        let other = driver.add_page(ScriptedPage::new("dup", "https://qxbroker.com/en/demo", "Quotex"));
        let news = driver.add_page(ScriptedPage::new("news", "https://news.example.com", "News"));
        let session = driver.connect("http://localhost:9222").await.unwrap();
        let slot = PageSlot::new();
        slot.attach(session, page.clone());
        let caches = Arc::new(MarketCaches::new());
        let nav = PageNavigator::new(
            slot,
            BrokerProfile::for_variant(BrokerVariant::Quotex),
            caches.clone(),
            DiscoveryConfig::default(),
            Duration::from_secs(1),
        );
        Fixture { page, other, news, nav, caches }
    }

    // chart shows `shown` until the result entry is clicked
    fn script_chart(page: &ScriptedPage, shown: &str, after_pick: Option<&str>) {
        let current = Arc::new(Mutex::new(shown.to_string()));
        let read = current.clone();
        page.respond_with(marker::CURRENT_ASSET, move |_| Ok(json!(read.lock().clone())));
        let next = after_pick.map(String::from);
        page.respond_with(marker::PICK_RESULT, move |_| match &next {
            Some(n) => {
                *current.lock() = n.clone();
                Ok(json!(n))
            }
            None => Ok(Value::Null),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_verifies_and_closes_duplicate_tabs() {
        let f = fixture().await;
        script_chart(&f.page, "EUR/USD", Some("USD/BRL (OTC)"));

        assert!(f.nav.switch_to("USD/BRL (OTC)").await);
        let actions = f.page.actions();
        assert_eq!(actions[0], "click:button[class*=\"asset-select\"]");
        assert_eq!(actions[1], "fill:input[class*=\"search-input\"]=USD/BRL");
        assert!(f.other.is_closed());
        assert!(!f.news.is_closed());
        assert!(!f.page.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_fails_when_chart_keeps_old_symbol() {
        let f = fixture().await;
        script_chart(&f.page, "EUR/USD", None);
        f.page.respond(marker::PICK_RESULT, json!("USD/BRL"));

        assert!(!f.nav.switch_to("USD/BRL (OTC)").await);
        assert_eq!(f.page.evaluated_count(marker::CURRENT_ASSET), 3);
        assert!(!f.other.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_needs_a_picker() {
        let f = fixture().await;
        for sel in BrokerProfile::for_variant(BrokerVariant::Quotex).picker_buttons {
            f.page.missing_selector(sel);
        }
        assert!(!f.nav.switch_to("GBP/USD").await);
        assert_eq!(f.page.evaluated_count(marker::PICK_RESULT), 0);
    }

    #[tokio::test]
    async fn test_payout_prefers_cache_then_matching_dom() {
        let f = fixture().await;
        f.caches.put_payout("NZD/CAD (OTC)", 91.0);
        f.page.respond(marker::CURRENT_ASSET, json!("EUR/USD"));
        f.page.respond(marker::DOM_PAYOUT, json!(82.0));

        assert_eq!(f.nav.payout("nzdcad_otc").await, Some(91.0));
        assert_eq!(f.nav.payout("eurusd").await, Some(82.0));
        assert_eq!(f.caches.payout_for("EUR/USD").unwrap().percentage, 82.0);
        // widget belongs to EUR/USD, not to the requested pair
        assert_eq!(f.nav.payout("GBP/USD").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_candles_times_out_or_sees_data() {
        let caches = MarketCaches::new();
        let poll = Duration::from_millis(100);
        assert!(!wait_for_candles(&caches, "eurusd", Duration::from_secs(1), poll).await);
        caches.replace_candles("EURUSD", vec![Candle::flat(60, 1.1)], None);
        assert!(wait_for_candles(&caches, "EUR/USD", Duration::from_secs(1), poll).await);
    }
}
