//! Configuration structures.
//!
//! Configuration is loaded from a JSON file (see [`Config::load`]) with every
//! section optional; anything left out falls back to its `Default`.
//! Durations use humantime strings (`"30s"`, `"5m"`).

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::errors::{Error, Result};
use crate::events::EventBusConfig;
use crate::kernel::approval::ApprovalConfig;
use crate::kernel::circuit_breaker::CircuitBreakerConfig;
use crate::kernel::monitor::MonitorConfig;
use crate::kernel::scheduler::SchedulerConfig;
use crate::kernel::types::Budget;
use crate::router::RouterConfig;

/// Global kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Event bus replay and channel sizing.
    #[serde(default)]
    pub events: EventBusConfig,

    /// Scheduler concurrency and default timeout.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Default per-context budget.
    #[serde(default)]
    pub budget: Budget,

    /// Global breaker thresholds.
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,

    /// Approval gate policy.
    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Resource monitor ceilings.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Router estimation and ranking.
    #[serde(default)]
    pub router: RouterConfig,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Config {
    /// Parse a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations the kernel cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(Error::validation("scheduler.max_concurrent must be > 0"));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return Err(Error::validation("breaker thresholds must be > 0"));
        }
        if self.events.replay_capacity > self.events.channel_capacity {
            return Err(Error::validation(
                "events.replay_capacity must not exceed events.channel_capacity",
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(Error::validation("events.channel_capacity must be > 0"));
        }
        if self.monitor.max_active_agents == 0 {
            return Err(Error::validation("monitor.max_active_agents must be > 0"));
        }
        if self.router.chars_per_token == 0 {
            return Err(Error::validation("router.chars_per_token must be > 0"));
        }
        Ok(())
    }
}
