//! Local load sampling.

use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tokio::sync::Mutex;

use crate::error::{ControllerError, ControllerResult};

/// A single point-in-time utilization reading, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

impl LoadSample {
    /// Whether either metric is at or above `threshold` percent.
    pub fn is_overloaded(&self, threshold: f64) -> bool {
        self.cpu_percent >= threshold || self.mem_percent >= threshold
    }
}

/// Source of load samples.
#[async_trait]
pub trait LoadSampler: Send + Sync {
    async fn sample(&self) -> ControllerResult<LoadSample>;
}

/// Samples the host through `sysinfo`.
///
/// CPU usage is the delta between two refreshes `window` apart, so each
/// call takes at least that long.
pub struct SystemLoadSampler {
    system: Mutex<System>,
    window: Duration,
}

impl SystemLoadSampler {
    pub fn new(window: Duration) -> Self {
        Self {
            system: Mutex::new(System::new()),
            window: window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }
}

#[async_trait]
impl LoadSampler for SystemLoadSampler {
    async fn sample(&self) -> ControllerResult<LoadSample> {
        let mut system = self.system.lock().await;

        system.refresh_cpu_usage();
        tokio::time::sleep(self.window).await;
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(ControllerError::Sampling(
                "total memory reported as zero".to_string(),
            ));
        }

        Ok(LoadSample {
            cpu_percent: f64::from(system.global_cpu_usage()),
            mem_percent: system.used_memory() as f64 / total as f64 * 100.0,
        })
    }
}
