pub mod governor;
pub mod interpreter;
pub mod reflection;
pub mod state;
pub mod strategies;
pub mod strategy;

pub use governor::Governor;
pub use interpreter::{FanIn, InterpreterPool};
pub use reflection::{Reflection, Reflector};
pub use state::{InternalState, LlmBudget, StateSnapshot};
pub use strategy::{
    CollaboratorError, IntentResolver, NoIntentResolver, Strategy, StrategyContext, TextGenerator,
    ToolIntent,
};

/// Faults that abandon the current tick. The loop contains them and enters safe mode.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("tick exceeded its {0}ms budget")]
    Timeout(u64),
    #[error("interpretation failed: {0}")]
    Interpret(String),
    #[error("reflection failed: {0}")]
    Reflection(String),
}
