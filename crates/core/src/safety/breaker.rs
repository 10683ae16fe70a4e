use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::BreakerSettings;

/// Sliding-window failure gate.
///
/// Trips once `threshold` failures land inside `window`; stays open until
/// `cooldown` has fully elapsed from the tripping point, then forgets the
/// failure history. Interior mutability lets one breaker be shared behind `Arc`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: usize,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<BreakerState>,
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: VecDeque<DateTime<Utc>>,
    tripped_until: Option<DateTime<Utc>>,
    reason: Option<String>,
}

/// Point-in-time view for status snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub tripped: bool,
    pub recent_failures: usize,
    pub reason: Option<String>,
    pub tripped_until: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: usize, window_secs: u64, cooldown_secs: u64) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            window: Duration::seconds(window_secs as i64),
            cooldown: Duration::seconds(cooldown_secs as i64),
            inner: Mutex::new(BreakerState::default()),
        }
    }

    pub fn from_settings(name: impl Into<String>, s: BreakerSettings) -> Self {
        Self::new(name, s.threshold, s.window_secs, s.cooldown_secs)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Utc::now())
    }

    pub fn allow_at(&self, now: DateTime<Utc>) -> bool {
        let mut st = self.lock();
        self.prune(&mut st, now);
        st.tripped_until.is_none()
    }

    pub fn record_failure(&self, reason: impl Into<String>) {
        self.record_failure_at(Utc::now(), reason);
    }

    pub fn record_failure_at(&self, now: DateTime<Utc>, reason: impl Into<String>) {
        let reason = reason.into();
        let mut st = self.lock();
        st.failures.push_back(now);
        st.reason = Some(reason.clone());
        self.prune(&mut st, now);
        if st.tripped_until.is_none() && st.failures.len() >= self.threshold {
            let until = now + self.cooldown;
            st.tripped_until = Some(until);
            tracing::warn!(
                breaker = %self.name,
                failures = st.failures.len(),
                %until,
                reason = %reason,
                "circuit breaker tripped"
            );
        }
    }

    pub fn record_success(&self) {
        self.record_success_at(Utc::now());
    }

    pub fn record_success_at(&self, now: DateTime<Utc>) {
        let mut st = self.lock();
        self.prune(&mut st, now);
        if st.failures.is_empty() {
            st.reason = None;
        }
    }

    pub fn is_tripped(&self) -> bool {
        !self.allow()
    }

    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    pub fn status(&self) -> BreakerStatus {
        let now = Utc::now();
        let mut st = self.lock();
        self.prune(&mut st, now);
        BreakerStatus {
            name: self.name.clone(),
            tripped: st.tripped_until.is_some(),
            recent_failures: st.failures.len(),
            reason: st.reason.clone(),
            tripped_until: st.tripped_until,
        }
    }

    fn prune(&self, st: &mut BreakerState, now: DateTime<Utc>) {
        let horizon = now - self.window;
        while st.failures.front().is_some_and(|t| *t < horizon) {
            st.failures.pop_front();
        }
        if let Some(until) = st.tripped_until
            && now > until
        {
            st.tripped_until = None;
            st.failures.clear();
            st.reason = None;
            tracing::info!(breaker = %self.name, "circuit breaker recovered");
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
