use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
const BURST_WINDOW: Duration = Duration::from_secs(5);

/// Per-key action limiter: a per-minute cap plus a short burst cap.
#[derive(Debug)]
pub struct ActionRateLimiter {
    max_per_minute: usize,
    burst: usize,
    history: HashMap<String, VecDeque<Instant>>,
}

impl ActionRateLimiter {
    pub fn new(max_per_minute: usize, burst: usize) -> Self {
        Self { max_per_minute, burst, history: HashMap::new() }
    }

    pub fn allow(&mut self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub fn allow_at(&mut self, key: &str, now: Instant) -> bool {
        let times = self.history.entry(key.to_owned()).or_default();
        while times.front().is_some_and(|t| now.saturating_duration_since(*t) >= WINDOW) {
            times.pop_front();
        }
        if times.len() >= self.max_per_minute {
            return false;
        }
        let in_burst = times
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < BURST_WINDOW)
            .count();
        if in_burst >= self.burst {
            return false;
        }
        times.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_minute_cap() {
        let mut rl = ActionRateLimiter::new(3, 2);
        let t0 = Instant::now();
        assert!(rl.allow_at("c1", t0));
        assert!(rl.allow_at("c1", t0));
        assert!(!rl.allow_at("c1", t0 + Duration::from_secs(1)));
        assert!(rl.allow_at("other", t0));
        assert!(rl.allow_at("c1", t0 + Duration::from_secs(6)));
        assert!(!rl.allow_at("c1", t0 + Duration::from_secs(20)));
        assert!(rl.allow_at("c1", t0 + Duration::from_secs(61)));
    }
}
