//! Simulated network conditions
//!
//! Used to reproduce slow links on a local machine: every outgoing command
//! waits for the configured latency plus its transmission time at the
//! configured bandwidth.

use std::time::Duration;

/// Per-connection delay model
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkSimulator {
    latency: Option<Duration>,
    bytes_per_second: Option<f64>,
}

impl NetworkSimulator {
    /// Create a simulator. A non-positive bandwidth disables the cap.
    pub fn new(latency: Option<Duration>, bandwidth_mbps: Option<f64>) -> Self {
        Self {
            latency,
            bytes_per_second: bandwidth_mbps
                .filter(|mbps| *mbps > 0.0)
                .map(|mbps| mbps * 1_000_000.0 / 8.0),
        }
    }

    /// Whether any delay is applied
    pub fn is_active(&self) -> bool {
        self.latency.is_some() || self.bytes_per_second.is_some()
    }

    /// Delay before sending `bytes`
    pub fn delay_for(&self, bytes: usize) -> Duration {
        let transmission = self
            .bytes_per_second
            .map(|rate| Duration::from_secs_f64(bytes as f64 / rate))
            .unwrap_or_default();
        self.latency.unwrap_or_default() + transmission
    }

    /// Sleep for the delay of `bytes`
    pub fn wait(&self, bytes: usize) {
        if self.is_active() {
            std::thread::sleep(self.delay_for(bytes));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_by_default() {
        let sim = NetworkSimulator::default();
        assert!(!sim.is_active());
        assert_eq!(sim.delay_for(1_000_000), Duration::ZERO);
    }

    #[test]
    fn test_bandwidth_delay() {
        // 8 Mbit/s = 1 MB/s
        let sim = NetworkSimulator::new(None, Some(8.0));
        assert_eq!(sim.delay_for(500_000), Duration::from_millis(500));
    }

    #[test]
    fn test_latency_plus_bandwidth() {
        let sim = NetworkSimulator::new(Some(Duration::from_millis(20)), Some(8.0));
        assert_eq!(sim.delay_for(1_000), Duration::from_millis(21));
    }

    #[test]
    fn test_non_positive_bandwidth_ignored() {
        let sim = NetworkSimulator::new(None, Some(0.0));
        assert!(!sim.is_active());
    }
}
