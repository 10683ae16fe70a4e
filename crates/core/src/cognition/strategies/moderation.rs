use async_trait::async_trait;

use crate::cognition::strategy::{Strategy, StrategyContext};
use crate::types::{ActionIntent, ActionType, StimulusKind, StrategyOutput};

const NAME: &str = "moderation";
const FLAGGED_TERMS: [&str; 6] = ["idiot", "stupid", "kill yourself", "kys", "shut up", "hate you"];

/// Keyword risk screen. Recommends deferring flagged messages to a human;
/// in dry-run it only observes and notes what it would have done.
#[derive(Debug, Clone, Copy)]
pub struct ModerationStrategy {
    dry_run: bool,
}

impl ModerationStrategy {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

pub fn flagged_terms(content: &str) -> Vec<&'static str> {
    let lower = content.to_lowercase();
    FLAGGED_TERMS.iter().copied().filter(|t| lower.contains(t)).collect()
}

#[async_trait]
impl Strategy for ModerationStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn interpret(&self, ctx: &StrategyContext) -> StrategyOutput {
        let stim = &ctx.stimulus;
        if stim.kind == StimulusKind::ModerationEvent {
            return StrategyOutput::recommend(NAME, ActionIntent::observe(), 0.5, 0.1, "moderation event noted");
        }
        if !stim.kind.is_conversational() {
            return StrategyOutput::abstain(NAME, "nothing to screen");
        }
        let hits = flagged_terms(stim.content());
        if hits.is_empty() {
            return StrategyOutput::abstain(NAME, "no flagged terms");
        }
        let content_risk = (0.6 + 0.1 * hits.len() as f32 + 0.1 * ctx.state.risk_pressure).min(0.95);
        let confidence = (0.55 + 0.15 * hits.len() as f32).min(0.9);

        if self.dry_run {
            let intent = ActionIntent::observe()
                .with_metadata("would_action", ActionType::Defer.as_str())
                .with_metadata("flagged", hits.clone());
            return StrategyOutput::recommend(NAME, intent, confidence, 0.1, "flagged content (dry run)");
        }
        let intent = ActionIntent::new(ActionType::Defer, stim.channel_id().map(str::to_owned))
            .with_payload("message_id", stim.ctx_str("message_id").unwrap_or_default())
            .with_payload("author_id", stim.author_id().unwrap_or_default())
            .with_payload("content_risk", content_risk)
            .with_payload("flagged", hits);
        StrategyOutput::recommend(NAME, intent, confidence, 0.2, "flagged content, defer to moderators")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_case_insensitively() {
        assert_eq!(flagged_terms("You IDIOT, shut up"), vec!["idiot", "shut up"]);
        assert!(flagged_terms("lovely weather").is_empty());
    }
}
