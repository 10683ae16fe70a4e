use std::sync::Arc;

use async_trait::async_trait;

use super::reply_to;
use crate::cognition::strategy::{Strategy, StrategyContext, TextGenerator};
use crate::types::{StimulusKind, StrategyOutput};

const NAME: &str = "social";
const SAFE_MODE_ACK: &str = "I'm in safe mode right now, so I can only acknowledge messages.";

/// Acknowledges directed conversation, optionally through a text generator.
pub struct SocialStrategy {
    generator: Option<Arc<dyn TextGenerator>>,
}

impl SocialStrategy {
    pub fn new(generator: Option<Arc<dyn TextGenerator>>) -> Self {
        Self { generator }
    }

    async fn generated(&self, ctx: &StrategyContext, hints: &serde_json::Value) -> Option<String> {
        let generator = self.generator.as_ref()?;
        let breaker = &ctx.breakers.text_generation;
        if !breaker.allow() {
            tracing::debug!("text generation breaker open");
            return None;
        }
        if !ctx.llm_budget.try_spend() {
            tracing::debug!("text generation budget spent for this tick");
            return None;
        }
        match generator.generate(&ctx.stimulus, hints).await {
            Ok(text) if !text.trim().is_empty() => {
                breaker.record_success();
                Some(text)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "text generation failed");
                breaker.record_failure(e.to_string());
                None
            }
        }
    }
}

#[async_trait]
impl Strategy for SocialStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn interpret(&self, ctx: &StrategyContext) -> StrategyOutput {
        let stim = &ctx.stimulus;
        if !ctx.is_directed() || !matches!(stim.kind, StimulusKind::Message | StimulusKind::Attachment) {
            return StrategyOutput::abstain(NAME, "not a directed conversation");
        }
        if ctx.state.safe_mode {
            return StrategyOutput::recommend(NAME, reply_to(stim, SAFE_MODE_ACK), 0.6, 0.05, "safe mode acknowledgement");
        }

        let server = stim.server_id();
        let author = stim.author_id().unwrap_or_default();
        let profile = ctx.memory.get_user_profile(server, author).await;
        let facts = ctx.memory.get_important(server, author).await;
        let name = facts
            .iter()
            .find(|f| f.key == "preferred_name")
            .map(|f| f.value.clone());
        let hints = serde_json::json!({
            "profile": profile,
            "preferred_name": name,
            "concise": profile.brevity_bias > 0.6 || facts.iter().any(|f| f.key == "communication"),
        });

        if let Some(text) = self.generated(ctx, &hints).await {
            return StrategyOutput::recommend(NAME, reply_to(stim, text), 0.7, 0.15, "generated reply");
        }
        let text = match name {
            Some(n) => format!("Got it, {n}."),
            None => "Got it.".to_owned(),
        };
        let confidence = 0.55 + 0.1 * ctx.state.social_energy;
        StrategyOutput::recommend(NAME, reply_to(stim, text), confidence, 0.1, "acknowledge directed message")
    }
}
