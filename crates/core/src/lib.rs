//! Warden core: a deadline-bound cognition loop that turns stimuli into a
//! bounded, safety-governed stream of actions.

pub mod actions;
pub mod cognition;
pub mod config;
pub mod health;
pub mod identity;
pub mod io;
pub mod memory;
pub mod runtime;
pub mod safety;
pub mod thalamus;
pub mod types;

pub use config::WardenCfg;
pub use runtime::{ControlCommand, Runtime, RuntimeHandles};
