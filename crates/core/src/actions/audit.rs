use std::collections::VecDeque;

use serde_json::Value;

use crate::types::{ActionResult, Decision, Stimulus, StimulusKind, StrategyOutput};

/// Tracing target for the decision audit trail.
pub const AUDIT_TARGET: &str = "warden::audit";

/// Bounded ring of action results plus the decision audit log.
#[derive(Debug)]
pub struct ActionAuditor {
    capacity: usize,
    records: VecDeque<ActionResult>,
}

impl ActionAuditor {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), records: VecDeque::new() }
    }

    pub fn record(&mut self, result: ActionResult) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(result);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Up to `limit` most recent failures, oldest first.
    pub fn recent_failures(&self, limit: usize) -> Vec<&ActionResult> {
        let mut failures: Vec<_> = self.records.iter().rev().filter(|r| !r.success).take(limit).collect();
        failures.reverse();
        failures
    }

    /// Emit one audit event for a decision. Silence ticks are not audited.
    pub fn log_decision(&self, stimulus: &Stimulus, outputs: &[StrategyOutput], decision: &Decision, result: &ActionResult) {
        if stimulus.kind == StimulusKind::Silence {
            return;
        }
        let payload = serde_json::json!({
            "stimulus": {
                "id": stimulus.id,
                "type": stimulus.kind.as_str(),
                "routing": stimulus.routing.as_str(),
                "salience": stimulus.salience,
                "context": stimulus.context_snapshot(),
            },
            "interpretations": outputs.iter().map(StrategyOutput::summary).collect::<Vec<Value>>(),
            "decision": {
                "action": decision.intent.action_type.as_str(),
                "strategy": decision.strategy,
                "confidence": decision.confidence,
                "risk": decision.risk,
                "rationale": decision.rationale,
                "memory_bias": decision.memory_bias,
            },
            "result": result,
        });
        tracing::info!(target: AUDIT_TARGET, audit = %payload, "decision");
    }
}
