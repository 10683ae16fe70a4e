use tokio::sync::mpsc;

use crate::types::ActionIntent;

/// Runtime side of the bounded action queue.
pub type ActionSender = mpsc::Sender<ActionIntent>;
/// Executor side: dequeue and carry out actions. The runtime never waits on it.
pub type ActionReceiver = mpsc::Receiver<ActionIntent>;

/// Create an action channel with the given bound.
pub fn channel(buffer: usize) -> (ActionSender, ActionReceiver) {
    mpsc::channel(buffer.max(1))
}
