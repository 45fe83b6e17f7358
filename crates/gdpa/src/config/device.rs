use std::{thread, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-multiprocessor resources the kernel budgets against.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Copy, Clone)]
#[serde(default)]
pub struct DeviceLimits {
    pub multiprocessor_count: usize,
    pub shared_memory_bytes: usize,
    pub tensor_memory_columns: usize,
    pub tensor_memory_lanes: usize,
    /// How long a barrier wait may stall before the launch is declared hung.
    pub watchdog_timeout_ms: u64,
}

impl DeviceLimits {
    pub fn blackwell() -> Self {
        Self {
            multiprocessor_count: 148,
            shared_memory_bytes: 232448,
            tensor_memory_columns: 512,
            tensor_memory_lanes: 128,
            watchdog_timeout_ms: 30_000,
        }
    }

    pub fn with_multiprocessor_count(
        mut self,
        multiprocessor_count: usize,
    ) -> Self {
        self.multiprocessor_count = multiprocessor_count;
        self
    }

    pub fn with_watchdog_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.watchdog_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Limits with no more persistent units than the host has hardware
    /// threads; every unit costs several partition and engine threads.
    pub fn capped_to_host(self) -> Self {
        let host = thread::available_parallelism().map_or(1, |count| count.get());
        self.capped_to(host)
    }

    pub fn capped_to(
        self,
        units: usize,
    ) -> Self {
        let capped = self.multiprocessor_count.min(units.max(1));
        if capped < self.multiprocessor_count {
            log::debug!(
                "Simulating {capped} of {} multiprocessors",
                self.multiprocessor_count
            );
        }
        self.with_multiprocessor_count(capped)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiprocessor_count == 0 {
            return Err(ConfigError::NoMultiprocessors);
        }
        Ok(())
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::blackwell()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::from_str;

    use super::*;

    #[test]
    fn test_partial_device_limits() {
        let config_str = r#"
            {
                "multiprocessor_count": 8,
                "watchdog_timeout_ms": 500
            }
        "#;

        let ground_truth = DeviceLimits {
            multiprocessor_count: 8,
            watchdog_timeout_ms: 500,
            ..DeviceLimits::blackwell()
        };

        let deserialized: DeviceLimits = from_str(config_str).unwrap();
        assert_eq!(deserialized, ground_truth);
        assert_eq!(deserialized.watchdog_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_multiprocessors_rejected() {
        let limits = DeviceLimits::blackwell().with_multiprocessor_count(0);
        assert_eq!(limits.validate(), Err(ConfigError::NoMultiprocessors));
    }

    #[test]
    fn test_units_capped_to_host() {
        let host = thread::available_parallelism().map_or(1, |count| count.get());
        let capped = DeviceLimits::blackwell().capped_to_host();
        assert_eq!(capped.multiprocessor_count, host.min(148));
        assert_eq!(capped.shared_memory_bytes, 232448);

        let limits = DeviceLimits::blackwell();
        assert_eq!(limits.capped_to(6).multiprocessor_count, 6);
        assert_eq!(limits.capped_to(0).multiprocessor_count, 1);
        let small = limits.with_multiprocessor_count(2);
        assert_eq!(small.capped_to(6), small);
    }
}
