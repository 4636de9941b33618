// Pick an instrument worth trading: keep the displayed one if its payout
// clears the threshold, otherwise walk the candidate list and switch to the
// first one that does.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::DiscoveryConfig;
use crate::market_data::cache::MarketCaches;
use crate::market_data::navigator::{wait_for_candles, ChartControl, PayoutOracle};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DiscoveryOutcome {
    KeptCurrent { instrument: String, payout: f64 },
    Switched { instrument: String, payout: f64 },
    NoneQualified,
}

pub struct AssetDiscovery<P, C> {
    payouts: Arc<P>,
    chart: Arc<C>,
    caches: Arc<MarketCaches>,
    cfg: DiscoveryConfig,
    poll: Duration,
}

impl<P: PayoutOracle, C: ChartControl> AssetDiscovery<P, C> {
    pub fn new(payouts: Arc<P>, chart: Arc<C>, caches: Arc<MarketCaches>, cfg: DiscoveryConfig, poll: Duration) -> Self {
        Self { payouts, chart, caches, cfg, poll }
    }

    async fn qualifying_payout(&self, instrument: &str) -> Option<f64> {
        let payout = self.payouts.payout(instrument).await;
        debug!(instrument, ?payout, threshold = self.cfg.payout_threshold, "payout checked");
        payout.filter(|p| *p >= self.cfg.payout_threshold)
    }

    #[instrument(skip(self), fields(threshold = self.cfg.payout_threshold))]
    pub async fn run(&self) -> DiscoveryOutcome {
        if let Some(current) = self.chart.current_instrument().await {
            if let Some(payout) = self.qualifying_payout(&current).await {
                let wait = Duration::from_millis(self.cfg.current_data_wait_ms);
                let fed = wait_for_candles(&self.caches, &current, wait, self.poll).await;
                info!(instrument = %current, payout, fed, "keeping displayed instrument");
                return DiscoveryOutcome::KeptCurrent { instrument: current, payout };
            }
        }

        for candidate in &self.cfg.candidates {
            let Some(payout) = self.qualifying_payout(candidate).await else {
                debug!(instrument = %candidate, "payout unknown or below threshold, skipped");
                continue;
            };
            if !self.chart.switch_to(candidate).await {
                warn!(instrument = %candidate, "switch failed, trying next candidate");
                continue;
            }
            let wait = Duration::from_millis(self.cfg.switched_data_wait_ms);
            let fed = wait_for_candles(&self.caches, candidate, wait, self.poll).await;
            info!(instrument = %candidate, payout, fed, "switched to candidate");
            return DiscoveryOutcome::Switched { instrument: candidate.clone(), payout };
        }

        warn!(candidates = self.cfg.candidates.len(), "no instrument meets the payout threshold, staying degraded");
        DiscoveryOutcome::NoneQualified
    }
}
