pub mod breaker;
pub mod safe_mode;
pub mod watchdog;

use std::sync::Arc;

pub use breaker::{BreakerStatus, CircuitBreaker};
pub use safe_mode::{SafeMode, SafeModeTrigger};
pub use watchdog::{ResourceSample, Watchdog, WatchdogThresholds};

use crate::config::WardenCfg;

/// Independently instantiated breakers owned by one runtime instance.
#[derive(Debug, Clone)]
pub struct SafetyBreakers {
    pub memory: Arc<CircuitBreaker>,
    pub log_ingest: Arc<CircuitBreaker>,
    pub text_generation: Arc<CircuitBreaker>,
    pub tool_execution: Arc<CircuitBreaker>,
}

impl SafetyBreakers {
    pub fn from_cfg(cfg: &WardenCfg) -> Self {
        Self {
            memory: Arc::new(CircuitBreaker::from_settings("memory", cfg.memory_breaker)),
            log_ingest: Arc::new(CircuitBreaker::from_settings("log_ingest", cfg.log_ingest_breaker)),
            text_generation: Arc::new(CircuitBreaker::from_settings(
                "text_generation",
                cfg.text_generation_breaker,
            )),
            tool_execution: Arc::new(CircuitBreaker::from_settings("tool_execution", cfg.tool_breaker)),
        }
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        [&self.memory, &self.log_ingest, &self.text_generation, &self.tool_execution]
            .iter()
            .map(|b| b.status())
            .collect()
    }

    /// Names of currently open breakers, with their last failure reason.
    pub fn tripped(&self) -> Vec<String> {
        self.statuses()
            .into_iter()
            .filter(|s| s.tripped)
            .map(|s| match s.reason {
                Some(r) => format!("{}: {r}", s.name),
                None => s.name,
            })
            .collect()
    }
}
