use chrono::{DateTime, Utc};
use serde::Serialize;

/// What pushed the loop into safe mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeModeTrigger {
    /// Configured start-up state.
    Default,
    Manual,
    TickTimeout,
    TickFault,
    ReflectionFault,
    InterpretTimeout,
    ActionQueueFull,
    StimulusBacklog,
    Watchdog,
    MemoryDisabled,
    LogIngest,
}

impl SafeModeTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Manual => "manual",
            Self::TickTimeout => "tick_timeout",
            Self::TickFault => "tick_fault",
            Self::ReflectionFault => "reflection_fault",
            Self::InterpretTimeout => "interpret_timeout",
            Self::ActionQueueFull => "action_queue_full",
            Self::StimulusBacklog => "stimulus_queue_backlog",
            Self::Watchdog => "watchdog",
            Self::MemoryDisabled => "memory_disabled",
            Self::LogIngest => "log_ingest",
        }
    }
}

/// Global degraded mode.
///
/// Entry: any automatic trigger. Exit: explicit operator command only.
#[derive(Debug, Default)]
pub struct SafeMode {
    active: bool,
    entered_at: Option<DateTime<Utc>>,
    trigger: Option<SafeModeTrigger>,
    reason: Option<String>,
}

impl SafeMode {
    pub fn new(active: bool) -> Self {
        let mut sm = Self::default();
        if active {
            sm.enter(SafeModeTrigger::Default, "configured start-up state");
        }
        sm
    }

    /// Enter (or stay in) safe mode. Returns true if this call activated it.
    /// The first entry time is kept; the latest trigger and reason win.
    pub fn enter(&mut self, trigger: SafeModeTrigger, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let newly = !self.active;
        self.active = true;
        if newly {
            self.entered_at = Some(Utc::now());
            tracing::warn!(trigger = trigger.as_str(), reason = %reason, "entering safe mode");
        }
        self.trigger = Some(trigger);
        self.reason = Some(reason);
        newly
    }

    /// Leave safe mode. Returns true if it was active.
    pub fn exit(&mut self) -> bool {
        if !self.active {
            return false;
        }
        tracing::info!(
            since = ?self.entered_at,
            trigger = self.trigger.map(SafeModeTrigger::as_str),
            "leaving safe mode"
        );
        *self = Self::default();
        true
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn trigger(&self) -> Option<SafeModeTrigger> {
        self.trigger
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn entered_at(&self) -> Option<DateTime<Utc>> {
        self.entered_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_active_unless_configured() {
        assert!(!SafeMode::new(false).is_active());
        let sm = SafeMode::new(true);
        assert!(sm.is_active());
        assert_eq!(sm.trigger(), Some(SafeModeTrigger::Default));
    }

    #[test]
    fn repeated_entry_keeps_first_timestamp() {
        let mut sm = SafeMode::new(false);
        assert!(sm.enter(SafeModeTrigger::TickTimeout, "slow"));
        let first = sm.entered_at();
        assert!(!sm.enter(SafeModeTrigger::Watchdog, "rss_mb=2000"));
        assert_eq!(sm.entered_at(), first);
        assert_eq!(sm.trigger(), Some(SafeModeTrigger::Watchdog));
        assert_eq!(sm.reason(), Some("rss_mb=2000"));
    }

    #[test]
    fn exit_clears_everything() {
        let mut sm = SafeMode::new(true);
        assert!(sm.exit());
        assert!(!sm.is_active());
        assert!(sm.reason().is_none());
        assert!(!sm.exit());
    }
}
