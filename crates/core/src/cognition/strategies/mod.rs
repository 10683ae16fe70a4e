//! Built-in strategies. Content judgment here is keyword-level; deployments
//! plug their own [`TextGenerator`] and [`IntentResolver`].

pub mod moderation;
pub mod narrative;
pub mod social;
pub mod strategic;
pub mod tools;

use std::sync::Arc;

pub use moderation::ModerationStrategy;
pub use narrative::NarrativeStrategy;
pub use social::SocialStrategy;
pub use strategic::StrategicStrategy;
pub use tools::ToolStrategy;

use super::strategy::{IntentResolver, Strategy, TextGenerator};
use crate::config::WardenCfg;
use crate::types::{ActionIntent, ActionType, Stimulus};

/// The fixed, ordered strategy set the runtime fans out to.
pub fn default_set(
    cfg: &WardenCfg,
    generator: Option<Arc<dyn TextGenerator>>,
    resolver: Arc<dyn IntentResolver>,
) -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(SocialStrategy::new(generator)),
        Arc::new(NarrativeStrategy),
        Arc::new(ModerationStrategy::new(cfg.automod_dry_run)),
        Arc::new(StrategicStrategy),
        Arc::new(ToolStrategy::new(resolver, cfg.tools_enabled, cfg.admin_user_ids.clone())),
    ]
}

/// Reply in the stimulus channel, addressed to its author.
pub(crate) fn reply_to(stimulus: &Stimulus, content: impl Into<String>) -> ActionIntent {
    let mut intent = ActionIntent::new(ActionType::Reply, stimulus.channel_id().map(str::to_owned))
        .with_payload("content", content.into())
        .with_payload("stimulus_id", stimulus.id.to_string());
    if let Some(author) = stimulus.author_id() {
        intent = intent.with_payload("reply_to", author);
    }
    intent
}
