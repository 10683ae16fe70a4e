use async_trait::async_trait;

use super::reply_to;
use crate::cognition::strategy::{Strategy, StrategyContext};
use crate::types::{StimulusKind, StrategyOutput};

const NAME: &str = "narrative";
const RECAP_TRIGGERS: [&str; 3] = ["recap", "summary", "catch me up"];
const RECAP_TOPICS: usize = 5;

/// Answers recap requests from the server's shared topics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NarrativeStrategy;

#[async_trait]
impl Strategy for NarrativeStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn interpret(&self, ctx: &StrategyContext) -> StrategyOutput {
        let stim = &ctx.stimulus;
        if stim.kind != StimulusKind::Message || !ctx.is_directed() {
            return StrategyOutput::abstain(NAME, "no narrative request");
        }
        let lower = stim.content().to_lowercase();
        if !RECAP_TRIGGERS.iter().any(|t| lower.contains(t)) {
            return StrategyOutput::abstain(NAME, "no recap requested");
        }
        let topics = ctx.memory.fetch_shared_context(stim.server_id(), RECAP_TOPICS).await;
        if topics.is_empty() {
            return StrategyOutput::recommend(
                NAME,
                reply_to(stim, "Nothing notable to recap yet."),
                0.5,
                0.05,
                "recap requested, no shared context",
            );
        }
        let list = topics.iter().map(|t| t.topic.as_str()).collect::<Vec<_>>().join(", ");
        let confidence = 0.65 + 0.1 * (1.0 - ctx.state.narrative_load);
        StrategyOutput::recommend(
            NAME,
            reply_to(stim, format!("Recent topics: {list}.")),
            confidence,
            0.1,
            "recap from shared context",
        )
    }
}
