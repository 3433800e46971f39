//! Profiler configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Run the sampler thread
    pub sampling: bool,
    /// Microseconds between samples
    pub sample_interval_us: u64,
    /// Count every interpreted opcode
    pub histogram: bool,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            sampling: true,
            sample_interval_us: 1_000,
            histogram: false,
        }
    }
}

impl ProfilerConfig {
    pub fn with_sampling(mut self, sampling: bool) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval_us = interval.as_micros().max(1) as u64;
        self
    }

    pub fn with_histogram(mut self, histogram: bool) -> Self {
        self.histogram = histogram;
        self
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_micros(self.sample_interval_us.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ProfilerConfig = serde_json::from_str(r#"{"histogram": true}"#).unwrap();
        assert!(config.histogram);
        assert!(config.sampling);
        assert_eq!(config.sample_interval(), Duration::from_millis(1));
    }
}
