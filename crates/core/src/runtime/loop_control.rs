use std::time::Duration;

use crate::config::WardenCfg;

/// Adaptive tick cadence: normal, slower in safe mode, slowest while the
/// watchdog override is set. The override always wins the max.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    normal: Duration,
    safe: Duration,
    watchdog: Duration,
    override_active: bool,
}

impl Cadence {
    pub fn from_cfg(cfg: &WardenCfg) -> Self {
        Self {
            normal: Duration::from_millis(cfg.tick_ms_normal),
            safe: Duration::from_millis(cfg.tick_ms_safe),
            watchdog: Duration::from_millis(cfg.tick_ms_watchdog),
            override_active: false,
        }
    }

    pub fn interval(&self, safe_mode: bool) -> Duration {
        let base = if safe_mode { self.safe.max(self.normal) } else { self.normal };
        if self.override_active {
            base.max(self.watchdog)
        } else {
            base
        }
    }

    pub fn set_override(&mut self) {
        self.override_active = true;
    }

    pub fn clear_override(&mut self) {
        self.override_active = false;
    }

    pub fn is_overridden(&self) -> bool {
        self.override_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_slows_with_degradation() {
        let mut c = Cadence::from_cfg(&WardenCfg::default());
        assert_eq!(c.interval(false), Duration::from_millis(500));
        assert_eq!(c.interval(true), Duration::from_millis(1000));
        c.set_override();
        assert!(c.is_overridden());
        assert_eq!(c.interval(false), Duration::from_millis(1500));
        assert_eq!(c.interval(true), Duration::from_millis(1500));
        c.clear_override();
        assert_eq!(c.interval(true), Duration::from_millis(1000));
    }
}
