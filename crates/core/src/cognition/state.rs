use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

use crate::safety::{SafeMode, SafeModeTrigger};
use crate::types::StimulusKind;

/// Base decay per elapsed second.
const DECAY_RATE: f32 = 0.05;
const SOCIAL_GAIN: f32 = 0.05;
const FOCUS_GAIN: f32 = 0.02;
const RISK_GAIN: f32 = 0.08;
const NARRATIVE_GAIN: f32 = 0.03;

/// Shared per-tick allowance of text-generation calls.
///
/// Cloned into every strategy context; spending is lock-free.
#[derive(Debug, Clone, Default)]
pub struct LlmBudget {
    remaining: Arc<AtomicU32>,
}

impl LlmBudget {
    pub fn new(calls: u32) -> Self {
        Self { remaining: Arc::new(AtomicU32::new(calls)) }
    }

    pub fn reset(&self, calls: u32) {
        self.remaining.store(calls, Ordering::Release);
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Take one call if any remain.
    pub fn try_spend(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Read-only copy of the scalar state handed to strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub social_energy: f32,
    pub risk_pressure: f32,
    pub narrative_load: f32,
    pub focus: f32,
    pub safe_mode: bool,
}

/// Decaying scalars plus the safe-mode flag and the per-tick call budget.
#[derive(Debug)]
pub struct InternalState {
    pub social_energy: f32,
    pub risk_pressure: f32,
    pub narrative_load: f32,
    pub focus: f32,
    pub safe_mode: SafeMode,
    pub llm_budget: LlmBudget,
    llm_calls_per_tick: u32,
}

impl InternalState {
    pub fn new(start_in_safe_mode: bool, llm_calls_per_tick: u32) -> Self {
        Self {
            social_energy: 0.6,
            risk_pressure: 0.3,
            narrative_load: 0.4,
            focus: 0.5,
            safe_mode: SafeMode::new(start_in_safe_mode),
            llm_budget: LlmBudget::new(llm_calls_per_tick),
            llm_calls_per_tick,
        }
    }

    /// Decay scalars by elapsed seconds. Risk decays at half rate, narrative at a third.
    pub fn decay(&mut self, dt_secs: f32) {
        let rate = DECAY_RATE * dt_secs.max(0.0);
        self.social_energy = (self.social_energy - rate).max(0.0);
        self.risk_pressure = (self.risk_pressure - rate / 2.0).max(0.0);
        self.narrative_load = (self.narrative_load - rate / 3.0).max(0.0);
    }

    pub fn update_on_stimulus(&mut self, kind: &StimulusKind, salience: f32) {
        let s = salience.clamp(0.0, 1.0);
        match kind {
            StimulusKind::Message => {
                self.social_energy = (self.social_energy + SOCIAL_GAIN * s).min(1.0);
                self.focus = (self.focus + FOCUS_GAIN * s).min(1.0);
            }
            StimulusKind::Silence => {
                self.social_energy = (self.social_energy - SOCIAL_GAIN * s).max(0.0);
                self.focus = (self.focus - FOCUS_GAIN * s).max(0.0);
            }
            k if k.is_moderation() => {
                self.risk_pressure = (self.risk_pressure + RISK_GAIN * s).min(1.0);
            }
            _ => {
                self.narrative_load = (self.narrative_load + NARRATIVE_GAIN * s).min(1.0);
            }
        }
    }

    pub fn reset_llm_budget(&self) {
        self.llm_budget.reset(self.llm_calls_per_tick);
    }

    pub fn try_spend_llm_call(&self) -> bool {
        self.llm_budget.try_spend()
    }

    pub fn enter_safe_mode(&mut self, trigger: SafeModeTrigger, reason: impl Into<String>) -> bool {
        self.safe_mode.enter(trigger, reason)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            social_energy: self.social_energy,
            risk_pressure: self.risk_pressure,
            narrative_load: self.narrative_load,
            focus: self.focus,
            safe_mode: self.safe_mode.is_active(),
        }
    }
}
