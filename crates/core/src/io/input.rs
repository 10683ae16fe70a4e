use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::types::{Stimulus, StimulusKind};

/// Receiver side, owned by the runtime.
pub type StimulusReceiver = mpsc::Receiver<Stimulus>;

/// Producer handle for the bounded stimulus queue.
///
/// Never blocks: a full queue drops the stimulus and bumps a shared overflow
/// counter the runtime treats as a safety signal.
#[derive(Debug, Clone)]
pub struct StimulusSender {
    tx: mpsc::Sender<Stimulus>,
    overflow: Arc<AtomicU64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("stimulus queue full")]
    Full,
    #[error("runtime stopped")]
    Closed,
}

impl StimulusSender {
    pub fn try_submit(&self, stimulus: Stimulus) -> Result<(), SubmitError> {
        match self.tx.try_send(stimulus) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind = %dropped.kind, "stimulus queue full, dropped");
                Err(SubmitError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    /// Submit a chat message as a stimulus.
    pub fn submit_message(
        &self,
        guild: &str,
        channel: &str,
        author: &str,
        content: impl Into<String>,
    ) -> Result<(), SubmitError> {
        self.try_submit(Stimulus::message("adapter", guild, channel, author, content))
    }

    pub fn submit_system(&self, kind: StimulusKind, salience: f32) -> Result<(), SubmitError> {
        self.try_submit(Stimulus::new(kind, "system", salience))
    }

    /// Stimuli dropped on a full queue since start.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Queued but not yet perceived.
    pub fn backlog(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Create a stimulus channel with the given bound.
pub fn channel(buffer: usize) -> (StimulusSender, StimulusReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (StimulusSender { tx, overflow: Arc::new(AtomicU64::new(0)) }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_message_carries_context() {
        let (tx, mut rx) = channel(4);
        tx.submit_message("g1", "c1", "u1", "hello").unwrap();
        let s = rx.recv().await.unwrap();
        assert_eq!(s.kind, StimulusKind::Message);
        assert_eq!(s.content(), "hello");
        assert_eq!(s.channel_id(), Some("c1"));
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let (tx, _rx) = channel(2);
        tx.submit_system(StimulusKind::MemberJoin, 0.3).unwrap();
        tx.submit_system(StimulusKind::MemberJoin, 0.3).unwrap();
        assert_eq!(tx.backlog(), 2);
        assert_eq!(tx.submit_system(StimulusKind::MemberJoin, 0.3), Err(SubmitError::Full));
        assert_eq!(tx.overflow_count(), 1);
    }
}
