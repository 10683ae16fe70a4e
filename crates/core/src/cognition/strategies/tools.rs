use std::sync::Arc;

use async_trait::async_trait;

use crate::cognition::strategy::{IntentResolver, Strategy, StrategyContext};
use crate::types::{ActionIntent, ActionType, StrategyOutput};

const NAME: &str = "tools";

/// Administrative requests, resolved by an injected parser and gated by role.
pub struct ToolStrategy {
    resolver: Arc<dyn IntentResolver>,
    enabled: bool,
    admins: Vec<String>,
}

impl ToolStrategy {
    pub fn new(resolver: Arc<dyn IntentResolver>, enabled: bool, admins: Vec<String>) -> Self {
        Self { resolver, enabled, admins }
    }
}

#[async_trait]
impl Strategy for ToolStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn interpret(&self, ctx: &StrategyContext) -> StrategyOutput {
        if !self.enabled || ctx.state.safe_mode || !ctx.is_directed() {
            return StrategyOutput::abstain(NAME, "tools unavailable");
        }
        let Some(author) = ctx.stimulus.author_id() else {
            return StrategyOutput::abstain(NAME, "no author");
        };
        if !self.admins.iter().any(|a| a == author) {
            return StrategyOutput::abstain(NAME, "author not authorised");
        }
        if !ctx.breakers.tool_execution.allow() {
            return StrategyOutput::abstain(NAME, "tool breaker open");
        }
        let Some(intent) = self.resolver.resolve(&ctx.stimulus) else {
            return StrategyOutput::abstain(NAME, "no tool intent");
        };
        let action = ActionIntent::new(ActionType::ToolCall, ctx.stimulus.channel_id().map(str::to_owned))
            .with_payload("tool", intent.name.clone())
            .with_payload("args", intent.args)
            .with_payload("requested_by", author)
            .with_metadata("reversible", intent.reversible);
        StrategyOutput::recommend(NAME, action, 0.8, 0.3, format!("admin tool request: {}", intent.name))
    }
}
