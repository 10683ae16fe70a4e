use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::{LlmBudget, StateSnapshot};
use crate::identity::IdentityTraits;
use crate::memory::MemoryStore;
use crate::safety::SafetyBreakers;
use crate::types::{Stimulus, StrategyOutput};

/// Everything a strategy may look at for one stimulus.
///
/// Shared behind an `Arc` so every fan-out task reads the same snapshot.
pub struct StrategyContext {
    pub stimulus: Stimulus,
    pub state: StateSnapshot,
    pub identity: IdentityTraits,
    pub memory: Arc<MemoryStore>,
    pub llm_budget: LlmBudget,
    pub breakers: SafetyBreakers,
}

impl StrategyContext {
    pub fn is_directed(&self) -> bool {
        self.stimulus.routing == crate::types::Routing::Directed
            || self.stimulus.mentions_bot()
    }
}

/// A pluggable interpretation unit. Implementations are held in a fixed,
/// ordered list and all run for every interpreted stimulus.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn interpret(&self, ctx: &StrategyContext) -> StrategyOutput;
}

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("collaborator failed: {0}")]
    Failed(String),
}

/// Text-generation client. Prompt construction is the implementor's concern.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, stimulus: &Stimulus, hints: &Value) -> Result<String, CollaboratorError>;
}

/// A structured administrative request recovered from free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolIntent {
    pub name: String,
    pub args: Value,
    #[serde(default)]
    pub reversible: bool,
}

/// Turns a stimulus into a structured intent, or nothing.
pub trait IntentResolver: Send + Sync {
    fn resolve(&self, stimulus: &Stimulus) -> Option<ToolIntent>;
}

/// Resolver that never finds an intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIntentResolver;

impl IntentResolver for NoIntentResolver {
    fn resolve(&self, _stimulus: &Stimulus) -> Option<ToolIntent> {
        None
    }
}
