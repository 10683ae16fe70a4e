use async_trait::async_trait;

use crate::cognition::strategy::{Strategy, StrategyContext};
use crate::types::{ActionIntent, StimulusKind, StrategyOutput};

const NAME: &str = "strategic";
const RISK_PRESSURE_LIMIT: f32 = 0.6;

/// Sets a cautious posture during quiet periods under risk pressure.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategicStrategy;

#[async_trait]
impl Strategy for StrategicStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn interpret(&self, ctx: &StrategyContext) -> StrategyOutput {
        if ctx.stimulus.kind != StimulusKind::Silence {
            return StrategyOutput::abstain(NAME, "no strategic signal");
        }
        if ctx.state.risk_pressure <= RISK_PRESSURE_LIMIT {
            return StrategyOutput::abstain(NAME, "quiet period, risk pressure normal");
        }
        let confidence = 0.4 + ctx.identity.curiosity * 0.3;
        let risk = 0.3 + ctx.identity.caution * 0.2;
        StrategyOutput::recommend(NAME, ActionIntent::observe(), confidence, risk, "hold back while risk pressure is high")
    }
}
