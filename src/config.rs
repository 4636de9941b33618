use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};
use crate::market_data::adapters::BrokerVariant;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    #[serde(default = "default_broker")]
    pub broker: BrokerVariant,
    /// DevTools HTTP endpoint of the already running browser.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub cascade: CascadeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub external: ExternalConfig,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
    #[serde(default)]
    pub facade: FacadeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectConfig {
    #[serde(default = "default_connect_attempts")]
    pub attempts: u32,
    #[serde(default = "default_3s")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_3s")]
    pub retry_delay_ms: u64,
    /// Upper bound for a single devtools round trip.
    #[serde(default = "default_10s")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_10s")]
    pub interval_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_3s")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CascadeConfig {
    /// A step yielding fewer bars than this falls through to the next one.
    #[serde(default = "default_min_bars")]
    pub min_bars: usize,
    #[serde(default = "default_max_bars")]
    pub max_bars: usize,
    #[serde(default = "default_scan_min_length")]
    pub scan_min_length: usize,
    #[serde(default = "default_scan_max_depth")]
    pub scan_max_depth: u32,
    #[serde(default = "default_scan_max_nodes")]
    pub scan_max_nodes: u32,
    #[serde(default = "default_cache_budget_ms")]
    pub cache_budget_ms: u64,
    #[serde(default = "default_2s")]
    pub secondary_budget_ms: u64,
    #[serde(default = "default_switch_budget_ms")]
    pub switch_budget_ms: u64,
    /// Wait for fresh frames after an in-cascade chart switch.
    #[serde(default = "default_5s")]
    pub switch_data_wait_ms: u64,
    #[serde(default = "default_5s")]
    pub dom_budget_ms: u64,
    #[serde(default = "default_5s")]
    pub chart_engine_budget_ms: u64,
    #[serde(default = "default_5s")]
    pub globals_budget_ms: u64,
    #[serde(default = "default_10s")]
    pub scan_budget_ms: u64,
    #[serde(default = "default_10s")]
    pub external_budget_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub run_at_startup: bool,
    #[serde(default = "default_payout_threshold")]
    pub payout_threshold: f64,
    /// Priority order; the first qualifying candidate wins.
    #[serde(default = "default_candidates")]
    pub candidates: Vec<String>,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_2s")]
    pub verify_wait_ms: u64,
    /// Pause between UI actions while switching.
    #[serde(default = "default_action_pause_ms")]
    pub action_pause_ms: u64,
    #[serde(default = "default_10s")]
    pub current_data_wait_ms: u64,
    #[serde(default = "default_15s")]
    pub switched_data_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExternalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_external_url")]
    pub base_url: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyntheticConfig {
    #[serde(default = "default_synthetic_bars")]
    pub bars: usize,
    #[serde(default = "default_anchored_bars")]
    pub anchored_bars: usize,
    #[serde(default = "default_eur_baseline")]
    pub eur_baseline: f64,
    #[serde(default = "default_other_baseline")]
    pub other_baseline: f64,
    /// Per-bar drift choices, as a fraction of price.
    #[serde(default = "default_trend_choices")]
    pub trend_choices: Vec<f64>,
    #[serde(default = "default_anchored_trend_choices")]
    pub anchored_trend_choices: Vec<f64>,
    #[serde(default = "default_multiplier_min")]
    pub volatility_multiplier_min: f64,
    #[serde(default = "default_multiplier_max")]
    pub volatility_multiplier_max: f64,
    /// Relative per-bar volatility range for anchored series.
    #[serde(default = "default_anchored_volatility_min")]
    pub anchored_volatility_min: f64,
    #[serde(default = "default_anchored_volatility_max")]
    pub anchored_volatility_max: f64,
    /// Relative jitter of open vs previous close, body and wick (fully synthetic).
    #[serde(default = "default_open_jitter")]
    pub open_jitter: f64,
    #[serde(default = "default_body_jitter")]
    pub body_jitter: f64,
    #[serde(default = "default_wick_jitter")]
    pub wick_jitter: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FacadeConfig {
    /// Added on top of the summed cascade budgets.
    #[serde(default = "default_5s")]
    pub deadline_margin_ms: u64,
    #[serde(default = "default_fallback_payout")]
    pub fallback_payout: f64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_broker() -> BrokerVariant {
    BrokerVariant::Quotex
}

fn default_endpoint() -> String {
    "http://localhost:9222".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_2s() -> u64 {
    2_000
}

fn default_3s() -> u64 {
    3_000
}

fn default_5s() -> u64 {
    5_000
}

fn default_10s() -> u64 {
    10_000
}

fn default_15s() -> u64 {
    15_000
}

fn default_connect_attempts() -> u32 {
    15
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_min_bars() -> usize {
    1
}

fn default_max_bars() -> usize {
    150
}

fn default_scan_min_length() -> usize {
    50
}

fn default_scan_max_depth() -> u32 {
    6
}

fn default_scan_max_nodes() -> u32 {
    20_000
}

fn default_cache_budget_ms() -> u64 {
    500
}

fn default_switch_budget_ms() -> u64 {
    25_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_payout_threshold() -> f64 {
    80.0
}

fn default_candidates() -> Vec<String> {
    [
        "USD/BDT (OTC)",
        "USD/BRL (OTC)",
        "NZD/CAD (OTC)",
        "USD/PHP (OTC)",
        "USD/IDR (OTC)",
        "EUR/USD",
        "GBP/USD",
        "USD/JPY",
        "AUD/USD",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_settle_ms() -> u64 {
    8_000
}

fn default_verify_attempts() -> u32 {
    3
}

fn default_action_pause_ms() -> u64 {
    500
}

fn default_external_url() -> String {
    "https://www.alphavantage.co/query".to_string()
}

fn default_api_key() -> String {
    "demo".to_string()
}

fn default_synthetic_bars() -> usize {
    100
}

fn default_anchored_bars() -> usize {
    50
}

fn default_eur_baseline() -> f64 {
    1.10
}

fn default_other_baseline() -> f64 {
    1.25
}

fn default_trend_choices() -> Vec<f64> {
    vec![0.0001, -0.0001, 0.0]
}

fn default_anchored_trend_choices() -> Vec<f64> {
    vec![-0.001, -0.0005, 0.0, 0.0005, 0.001]
}

fn default_multiplier_min() -> f64 {
    1.5
}

fn default_multiplier_max() -> f64 {
    3.0
}

fn default_anchored_volatility_min() -> f64 {
    0.001
}

fn default_anchored_volatility_max() -> f64 {
    0.002
}

fn default_open_jitter() -> f64 {
    0.0005
}

fn default_body_jitter() -> f64 {
    0.00025
}

fn default_wick_jitter() -> f64 {
    0.00015
}

fn default_fallback_payout() -> f64 {
    85.0
}

fn default_queue_depth() -> usize {
    64
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            endpoint: default_endpoint(),
            log_level: default_log_level(),
            connect: ConnectConfig::default(),
            health: HealthConfig::default(),
            cascade: CascadeConfig::default(),
            discovery: DiscoveryConfig::default(),
            external: ExternalConfig::default(),
            synthetic: SyntheticConfig::default(),
            facade: FacadeConfig::default(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: default_connect_attempts(),
            attempt_timeout_ms: default_3s(),
            retry_delay_ms: default_3s(),
            call_timeout_ms: default_10s(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_10s(),
            failure_threshold: default_failure_threshold(),
            probe_timeout_ms: default_3s(),
        }
    }
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            min_bars: default_min_bars(),
            max_bars: default_max_bars(),
            scan_min_length: default_scan_min_length(),
            scan_max_depth: default_scan_max_depth(),
            scan_max_nodes: default_scan_max_nodes(),
            cache_budget_ms: default_cache_budget_ms(),
            secondary_budget_ms: default_2s(),
            switch_budget_ms: default_switch_budget_ms(),
            switch_data_wait_ms: default_5s(),
            dom_budget_ms: default_5s(),
            chart_engine_budget_ms: default_5s(),
            globals_budget_ms: default_5s(),
            scan_budget_ms: default_10s(),
            external_budget_ms: default_10s(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            run_at_startup: true,
            payout_threshold: default_payout_threshold(),
            candidates: default_candidates(),
            settle_ms: default_settle_ms(),
            verify_attempts: default_verify_attempts(),
            verify_wait_ms: default_2s(),
            action_pause_ms: default_action_pause_ms(),
            current_data_wait_ms: default_10s(),
            switched_data_wait_ms: default_15s(),
        }
    }
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_external_url(),
            api_key: default_api_key(),
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            bars: default_synthetic_bars(),
            anchored_bars: default_anchored_bars(),
            eur_baseline: default_eur_baseline(),
            other_baseline: default_other_baseline(),
            trend_choices: default_trend_choices(),
            anchored_trend_choices: default_anchored_trend_choices(),
            volatility_multiplier_min: default_multiplier_min(),
            volatility_multiplier_max: default_multiplier_max(),
            anchored_volatility_min: default_anchored_volatility_min(),
            anchored_volatility_max: default_anchored_volatility_max(),
            open_jitter: default_open_jitter(),
            body_jitter: default_body_jitter(),
            wick_jitter: default_wick_jitter(),
        }
    }
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            deadline_margin_ms: default_5s(),
            fallback_payout: default_fallback_payout(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

impl ConnectConfig {
    pub fn attempt_timeout(&self) -> Duration {
        ms(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        ms(self.retry_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        ms(self.call_timeout_ms)
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        ms(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        ms(self.probe_timeout_ms)
    }
}

impl CascadeConfig {
    /// Worst case for one trip through every step.
    pub fn total_budget(&self) -> Duration {
        ms(self.cache_budget_ms
            + self.secondary_budget_ms
            + self.switch_budget_ms
            + self.dom_budget_ms
            + self.chart_engine_budget_ms
            + self.globals_budget_ms
            + self.scan_budget_ms
            + self.external_budget_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        ms(self.poll_interval_ms.max(10))
    }
}

impl DiscoveryConfig {
    /// Worst case for one verified switch.
    pub fn switch_budget(&self) -> Duration {
        let pauses = self.action_pause_ms * 4;
        let verify = (self.verify_wait_ms + 1_000) * u64::from(self.verify_attempts);
        ms(pauses + self.settle_ms + verify + 10_000)
    }
}

impl FacadeConfig {
    pub fn deadline_margin(&self) -> Duration {
        ms(self.deadline_margin_ms)
    }
}

impl FeedConfig {
    /// Defaults, then `path` (if it exists), then `BROKERFEED__SECTION__KEY`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> FeedResult<Self> {
        let mut builder = Config::builder();
        match path {
            Some(p) => builder = builder.add_source(File::from(p.to_path_buf()).required(true)),
            None => builder = builder.add_source(File::with_name("brokerfeed").required(false)),
        }
        builder = builder.add_source(
            Environment::with_prefix("BROKERFEED")
                .separator("__")
                .ignore_empty(true),
        );
        let cfg: FeedConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> FeedResult<()> {
        let bad = |msg: &str| Err(FeedError::Config(msg.to_string()));
        if self.connect.attempts == 0 {
            return bad("connect.attempts must be at least 1");
        }
        if self.health.failure_threshold == 0 {
            return bad("health.failure_threshold must be at least 1");
        }
        if self.health.interval_ms == 0 {
            return bad("health.interval_ms must be positive");
        }
        if self.cascade.max_bars == 0 || self.cascade.min_bars > self.cascade.max_bars {
            return bad("cascade.min_bars must not exceed cascade.max_bars (> 0)");
        }
        if !(0.0..=100.0).contains(&self.discovery.payout_threshold) {
            return bad("discovery.payout_threshold must be within 0..=100");
        }
        if !(0.0..=100.0).contains(&self.facade.fallback_payout) {
            return bad("facade.fallback_payout must be within 0..=100");
        }
        let s = &self.synthetic;
        if s.bars == 0 || s.anchored_bars == 0 {
            return bad("synthetic bar counts must be positive");
        }
        if !(s.eur_baseline > 0.0 && s.other_baseline > 0.0) {
            return bad("synthetic baselines must be positive");
        }
        if !(s.volatility_multiplier_min > 0.0 && s.volatility_multiplier_min <= s.volatility_multiplier_max) {
            return bad("synthetic volatility multiplier range is inverted or non-positive");
        }
        if !(s.anchored_volatility_min >= 0.0 && s.anchored_volatility_min <= s.anchored_volatility_max) {
            return bad("synthetic anchored volatility range is inverted or negative");
        }
        if s.anchored_volatility_max >= 0.5 {
            return bad("synthetic.anchored_volatility_max must stay below 0.5");
        }
        let worst = (s.open_jitter + s.body_jitter + s.wick_jitter) * s.volatility_multiplier_max;
        // negated so NaN fails too
        let jitter_ok = s.open_jitter >= 0.0 && s.body_jitter >= 0.0 && s.wick_jitter >= 0.0 && worst < 0.5;
        if !jitter_ok {
            return bad("synthetic jitters must be non-negative and small enough to keep prices positive");
        }
        let drift_ok = |v: &[f64]| !v.is_empty() && v.iter().all(|t| t.is_finite() && t.abs() < 0.1);
        if !drift_ok(&s.trend_choices) || !drift_ok(&s.anchored_trend_choices) {
            return bad("synthetic trend choices must be non-empty and below 10% per bar");
        }
        Ok(())
    }
}
