use std::sync::Arc;

use crate::identity::IdentityTraits;
use crate::memory::MemoryStore;
use crate::types::{ActionIntent, Decision, StrategyOutput};

/// Weight of (assertiveness − caution) in score modulation.
pub const ASSERTIVENESS_WEIGHT: f32 = 0.2;
/// Weight of curiosity in score modulation.
pub const CURIOSITY_WEIGHT: f32 = 0.1;
/// Risk ceiling before memory bias adjustment.
pub const RISK_CEILING: f32 = 0.7;
/// How strongly memory bias moves the risk ceiling.
pub const RISK_BIAS_WEIGHT: f32 = 0.2;
/// Confidence at or above which the risk override does not apply.
pub const CONFIDENCE_FLOOR: f32 = 0.7;

/// Picks one action per stimulus from strategy outputs.
#[derive(Debug, Clone)]
pub struct Governor {
    memory: Arc<MemoryStore>,
}

impl Governor {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }

    pub async fn deliberate(
        &self,
        server_id: &str,
        outputs: &[StrategyOutput],
        directed: bool,
        traits: &IdentityTraits,
    ) -> Decision {
        if !directed {
            return arbitrate(outputs, false, 0.0, traits);
        }
        let bias = self.memory.memory_bias(server_id).await;
        arbitrate(outputs, true, bias, traits)
    }
}

pub fn modulation(traits: &IdentityTraits, memory_bias: f32) -> f32 {
    1.0 + ASSERTIVENESS_WEIGHT * (traits.assertiveness - traits.caution)
        + CURIOSITY_WEIGHT * traits.curiosity
        + memory_bias
}

/// Score candidates and apply the risk override. Pure; no I/O.
pub fn arbitrate(
    outputs: &[StrategyOutput],
    directed: bool,
    memory_bias: f32,
    traits: &IdentityTraits,
) -> Decision {
    if !directed {
        return observe(0.35, 0.05, "Ambient stimulus without active session or mention.", None, memory_bias);
    }

    let m = modulation(traits, memory_bias);
    let mut best: Option<(&StrategyOutput, &ActionIntent)> = None;
    let mut best_score = -1.0_f32;
    for out in outputs {
        let Some(intent) = out.recommended.as_ref() else {
            continue;
        };
        let score = out.confidence * (1.0 - out.risk) * m;
        tracing::debug!(strategy = %out.name, score, "candidate scored");
        if score > best_score {
            best_score = score;
            best = Some((out, intent));
        }
    }

    let Some((winner, intent)) = best else {
        return observe(0.3, 0.1, "No strong recommendation", None, memory_bias);
    };

    if winner.risk > RISK_CEILING - RISK_BIAS_WEIGHT * memory_bias && winner.confidence < CONFIDENCE_FLOOR {
        tracing::info!(
            strategy = %winner.name,
            risk = winner.risk,
            confidence = winner.confidence,
            "risk override, observing instead"
        );
        return observe(0.4, 0.05, "Risk exceeded confidence", Some(winner.name.clone()), memory_bias);
    }

    Decision {
        intent: intent.clone(),
        confidence: winner.confidence,
        risk: winner.risk,
        rationale: winner.justification.clone(),
        strategy: Some(winner.name.clone()),
        memory_bias,
    }
}

fn observe(confidence: f32, risk: f32, rationale: &str, strategy: Option<String>, memory_bias: f32) -> Decision {
    Decision {
        intent: ActionIntent::observe(),
        confidence,
        risk,
        rationale: rationale.to_owned(),
        strategy,
        memory_bias,
    }
}
