use crate::safety::SafeModeTrigger;

/// Operator commands, drained at the start of every tick.
///
/// `ExitSafeMode` is the only way out of safe mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    ExitSafeMode,
    EnterSafeMode { trigger: SafeModeTrigger, reason: String },
    EndSession { user: String, guild: String, channel: String },
}

impl ControlCommand {
    /// Operator-requested safe mode.
    pub fn enter_manual(reason: impl Into<String>) -> Self {
        Self::EnterSafeMode { trigger: SafeModeTrigger::Manual, reason: reason.into() }
    }
}
