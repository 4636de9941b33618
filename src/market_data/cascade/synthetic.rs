// Last-resort bar generation. Output is plausible, never real; callers tag
// it with a synthetic source and keep it out of the caches.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::SyntheticConfig;
use crate::market_data::types::{Candle, InstrumentKey, Timeframe};

pub struct SyntheticGenerator<R: Rng> {
    cfg: SyntheticConfig,
    rng: R,
}

impl SyntheticGenerator<StdRng> {
    pub fn from_entropy(cfg: SyntheticConfig) -> Self {
        Self::new(cfg, StdRng::from_entropy())
    }
}

impl<R: Rng> SyntheticGenerator<R> {
    pub fn new(cfg: SyntheticConfig, rng: R) -> Self {
        Self { cfg, rng }
    }

    /// Series whose last close is exactly `anchor`. Built backwards from the
    /// anchor so each open is the previous close.
    pub fn anchored(&mut self, anchor: f64, tf: Timeframe, now: i64) -> Vec<Candle> {
        let n = self.cfg.anchored_bars.max(1);
        let trend = pick(&mut self.rng, &self.cfg.anchored_trend_choices);
        let vol = self
            .rng
            .gen_range(self.cfg.anchored_volatility_min..=self.cfg.anchored_volatility_max);

        let mut closes = vec![anchor; n];
        for i in (1..n).rev() {
            let step = 1.0 + trend + self.rng.gen_range(-vol..=vol);
            closes[i - 1] = closes[i] / step;
        }

        let first_open = closes[0] * (1.0 + self.rng.gen_range(-vol..=vol));
        let stamps = timestamps(n, tf, now);
        let mut bars = Vec::with_capacity(n);
        for i in 0..n {
            let open = if i == 0 { first_open } else { closes[i - 1] };
            let close = closes[i];
            let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..=vol));
            let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..=vol));
            bars.push(Candle::new(stamps[i], open, high, low, close));
        }
        bars
    }

    /// Random walk from a fixed baseline chosen by instrument name.
    pub fn baseline(&mut self, instrument: &InstrumentKey, tf: Timeframe, now: i64) -> Vec<Candle> {
        let n = self.cfg.bars.max(1);
        let mut price = if instrument.as_str().contains("eur") {
            self.cfg.eur_baseline
        } else {
            self.cfg.other_baseline
        };
        let trend = pick(&mut self.rng, &self.cfg.trend_choices);
        let mult = self
            .rng
            .gen_range(self.cfg.volatility_multiplier_min..=self.cfg.volatility_multiplier_max);
        let (oj, bj, wj) = (
            self.cfg.open_jitter * mult,
            self.cfg.body_jitter * mult,
            self.cfg.wick_jitter * mult,
        );

        let stamps = timestamps(n, tf, now);
        let mut bars = Vec::with_capacity(n);
        for ts in stamps {
            let open = price * (1.0 + self.rng.gen_range(-oj..=oj));
            let close = open * (1.0 + trend + self.rng.gen_range(-bj..=bj));
            let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..=wj));
            let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..=wj));
            bars.push(Candle::new(ts, open, high, low, close));
            price = close;
        }
        bars
    }
}

fn pick<R: Rng>(rng: &mut R, choices: &[f64]) -> f64 {
    choices.choose(rng).copied().unwrap_or(0.0)
}

// n uniformly spaced bar starts ending at the bar containing `now`
fn timestamps(n: usize, tf: Timeframe, now: i64) -> Vec<i64> {
    let width = tf.secs() as i64;
    let last = tf.align(now);
    (0..n).map(|i| last - (n - 1 - i) as i64 * width).collect()
}
