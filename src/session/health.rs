use crate::market_data::types::ConnectionState;

/// Consecutive-failure bookkeeping for the health loop. Pure; the controller
/// does the probing and publishes what this returns.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    threshold: u32,
    failures: u32,
}

impl HealthMonitor {
    pub fn new(threshold: u32) -> Self {
        Self { threshold: threshold.max(1), failures: 0 }
    }

    pub fn record_success(&mut self) -> ConnectionState {
        self.failures = 0;
        ConnectionState::Connected
    }

    pub fn record_failure(&mut self) -> ConnectionState {
        self.failures = self.failures.saturating_add(1);
        if self.is_degraded() {
            ConnectionState::Degraded
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Jump straight to the threshold, e.g. after every connect attempt failed.
    pub fn mark_degraded(&mut self) {
        self.failures = self.failures.max(self.threshold);
    }

    pub fn is_degraded(&self) -> bool {
        self.failures >= self.threshold
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_then_reset() {
        let mut m = HealthMonitor::new(3);
        assert_eq!(m.record_failure(), ConnectionState::Disconnected);
        assert_eq!(m.record_failure(), ConnectionState::Disconnected);
        assert_eq!(m.record_failure(), ConnectionState::Degraded);
        assert_eq!(m.record_failure(), ConnectionState::Degraded);
        assert_eq!(m.failures(), 4);

        assert_eq!(m.record_success(), ConnectionState::Connected);
        assert_eq!(m.failures(), 0);
        assert_eq!(m.record_failure(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_mark_degraded_sticks_until_success() {
        let mut m = HealthMonitor::new(3);
        m.mark_degraded();
        assert!(m.is_degraded());
        assert_eq!(m.record_failure(), ConnectionState::Degraded);
        assert_eq!(m.record_success(), ConnectionState::Connected);
    }
}
