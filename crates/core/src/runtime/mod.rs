mod control;
mod loop_control;
mod scheduler;
mod shutdown;

pub use control::ControlCommand;
pub use loop_control::Cadence;
pub use scheduler::{Runtime, RuntimeHandles};
pub use shutdown::ShutdownGuard;
pub use crate::cognition::TickError;
pub use crate::types::RuntimeStatus;
