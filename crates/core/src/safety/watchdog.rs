use std::time::Duration;

use crate::config::WardenCfg;

/// Limits above which the watchdog forces safe mode.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogThresholds {
    pub cpu_load_per_core: f64,
    pub rss_mb: f64,
    pub loop_lag: Duration,
    pub queue_depth: usize,
}

impl WatchdogThresholds {
    pub fn from_cfg(cfg: &WardenCfg) -> Self {
        Self {
            cpu_load_per_core: cfg.watchdog_cpu_load_per_core,
            rss_mb: cfg.watchdog_rss_mb,
            loop_lag: Duration::from_millis(cfg.watchdog_loop_lag_ms),
            queue_depth: cfg.watchdog_queue_depth,
        }
    }
}

/// One end-of-tick resource reading. OS metrics are `None` where unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub cpu_load_per_core: Option<f64>,
    pub rss_mb: Option<f64>,
    /// Time between tick starts minus the expected interval.
    pub loop_lag: Duration,
    pub queue_depth: usize,
}

impl ResourceSample {
    /// Sample OS metrics and combine with the loop's own lag and backlog.
    pub fn collect(loop_lag: Duration, queue_depth: usize) -> Self {
        Self {
            cpu_load_per_core: load_per_core(),
            rss_mb: peak_rss_mb(),
            loop_lag,
            queue_depth,
        }
    }
}

/// Human-readable reason if any metric exceeds its threshold.
pub fn evaluate(sample: &ResourceSample, limits: &WatchdogThresholds) -> Option<String> {
    let mut reasons = Vec::new();
    if let Some(load) = sample.cpu_load_per_core
        && load > limits.cpu_load_per_core
    {
        reasons.push(format!("cpu_load={load:.2}"));
    }
    if let Some(rss) = sample.rss_mb
        && rss > limits.rss_mb
    {
        reasons.push(format!("rss_mb={rss:.0}"));
    }
    if sample.loop_lag > limits.loop_lag {
        reasons.push(format!("loop_lag={:.3}s", sample.loop_lag.as_secs_f64()));
    }
    if sample.queue_depth > limits.queue_depth {
        reasons.push(format!("stimuli_backlog={}", sample.queue_depth));
    }
    if reasons.is_empty() {
        None
    } else {
        Some(reasons.join(";"))
    }
}

/// Periodic health sampler. Remembers the last note it produced.
#[derive(Debug)]
pub struct Watchdog {
    limits: WatchdogThresholds,
    last_note: Option<String>,
}

impl Watchdog {
    pub fn new(limits: WatchdogThresholds) -> Self {
        Self { limits, last_note: None }
    }

    /// Sample and evaluate. `Some(reason)` means the loop must degrade.
    pub fn check(&mut self, loop_lag: Duration, queue_depth: usize) -> Option<String> {
        let sample = ResourceSample::collect(loop_lag, queue_depth);
        let verdict = evaluate(&sample, &self.limits);
        if let Some(note) = &verdict {
            tracing::warn!(
                note = %note,
                cpu_load = ?sample.cpu_load_per_core,
                rss_mb = ?sample.rss_mb,
                "watchdog threshold exceeded"
            );
            self.last_note = Some(note.clone());
        }
        verdict
    }

    pub fn last_note(&self) -> Option<&str> {
        self.last_note.as_deref()
    }
}

#[cfg(unix)]
fn load_per_core() -> Option<f64> {
    let mut loads = [0f64; 3];
    // SAFETY: the buffer holds 3 doubles and we request at most 3.
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if n < 1 {
        return None;
    }
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    Some(loads[0] / cores as f64)
}

#[cfg(not(unix))]
fn load_per_core() -> Option<f64> {
    None
}

#[cfg(unix)]
fn peak_rss_mb() -> Option<f64> {
    // SAFETY: rusage is plain data; getrusage fills it on success.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let raw = usage.ru_maxrss as f64;
    // Linux reports KiB, macOS reports bytes.
    if cfg!(target_os = "macos") {
        Some(raw / (1024.0 * 1024.0))
    } else {
        Some(raw / 1024.0)
    }
}

#[cfg(not(unix))]
fn peak_rss_mb() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> WatchdogThresholds {
        WatchdogThresholds {
            cpu_load_per_core: 1.25,
            rss_mb: 1024.0,
            loop_lag: Duration::from_millis(250),
            queue_depth: 120,
        }
    }

    #[test]
    fn healthy_sample_passes() {
        let sample = ResourceSample {
            cpu_load_per_core: Some(0.3),
            rss_mb: Some(120.0),
            loop_lag: Duration::from_millis(10),
            queue_depth: 3,
        };
        assert!(evaluate(&sample, &limits()).is_none());
    }

    #[test]
    fn multiple_reasons_are_joined() {
        let sample = ResourceSample {
            cpu_load_per_core: Some(2.0),
            rss_mb: None,
            loop_lag: Duration::from_millis(400),
            queue_depth: 121,
        };
        let reason = evaluate(&sample, &limits()).unwrap();
        assert_eq!(reason, "cpu_load=2.00;loop_lag=0.400s;stimuli_backlog=121");
    }

    #[test]
    fn missing_os_metrics_are_ignored() {
        let sample = ResourceSample::default();
        assert!(evaluate(&sample, &limits()).is_none());
    }

    #[test]
    fn check_records_note() {
        let mut wd = Watchdog::new(WatchdogThresholds { queue_depth: 0, ..limits() });
        let note = wd.check(Duration::ZERO, 5).unwrap();
        assert!(note.contains("stimuli_backlog=5"));
        assert_eq!(wd.last_note(), Some(note.as_str()));
    }
}
