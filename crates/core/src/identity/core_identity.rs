use std::sync::Arc;

use super::traits::{IdentityStore, IdentityTraits};
use crate::memory::WriteOutcome;

/// Owns the live identity traits and writes them through the store after each change.
pub struct IdentityCore {
    traits: IdentityTraits,
    learning_rate: f32,
    store: Arc<dyn IdentityStore>,
}

impl std::fmt::Debug for IdentityCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCore")
            .field("traits", &self.traits)
            .field("learning_rate", &self.learning_rate)
            .finish_non_exhaustive()
    }
}

impl IdentityCore {
    /// Load persisted traits, falling back to defaults.
    pub async fn load(store: Arc<dyn IdentityStore>, learning_rate: f32) -> Self {
        let traits = match store.load_traits().await {
            Some(t) => {
                tracing::info!(?t, "identity traits loaded");
                t
            }
            None => IdentityTraits::default(),
        };
        Self { traits, learning_rate, store }
    }

    pub fn traits(&self) -> IdentityTraits {
        self.traits
    }

    /// Nudge traits by a signed outcome signal and persist.
    ///
    /// Positive signals raise assertiveness and curiosity (playfulness at half
    /// rate) and lower caution (patience at half rate). Negative signals invert.
    pub async fn adjust_from_outcome(&mut self, signal: f32) -> WriteOutcome {
        self.traits = adjusted(self.traits, self.learning_rate, signal);
        let outcome = self.store.persist_traits(&self.traits).await;
        if !outcome.is_committed() {
            tracing::debug!(outcome = outcome.as_str(), "identity traits not persisted");
        }
        outcome
    }
}

pub fn adjusted(mut t: IdentityTraits, lr: f32, signal: f32) -> IdentityTraits {
    let step = lr * signal;
    t.assertiveness += step;
    t.curiosity += step;
    t.playfulness += 0.5 * step;
    t.caution -= step;
    t.patience -= 0.5 * step;
    t.clamp();
    t
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct RecordingStore {
        saved: Mutex<Vec<IdentityTraits>>,
    }

    #[async_trait]
    impl IdentityStore for RecordingStore {
        async fn load_traits(&self) -> Option<IdentityTraits> {
            None
        }

        async fn persist_traits(&self, traits: &IdentityTraits) -> WriteOutcome {
            self.saved.lock().unwrap().push(*traits);
            WriteOutcome::Committed
        }
    }

    #[test]
    fn positive_signal_shifts_towards_assertive() {
        let t = adjusted(IdentityTraits::default(), 0.1, 1.0);
        assert!((t.assertiveness - 0.6).abs() < 1e-6);
        assert!((t.curiosity - 0.6).abs() < 1e-6);
        assert!((t.playfulness - 0.55).abs() < 1e-6);
        assert!((t.caution - 0.4).abs() < 1e-6);
        assert!((t.patience - 0.45).abs() < 1e-6);
    }

    #[test]
    fn adjustments_stay_bounded() {
        let mut t = IdentityTraits::default();
        for _ in 0..100 {
            t = adjusted(t, 0.5, -1.0);
        }
        assert_eq!(t.caution, 1.0);
        assert_eq!(t.assertiveness, 0.0);
    }

    #[tokio::test]
    async fn adjust_persists_through_store() {
        let store = Arc::new(RecordingStore::default());
        let mut core = IdentityCore::load(store.clone(), 0.02).await;
        assert_eq!(core.traits(), IdentityTraits::default());
        let out = core.adjust_from_outcome(0.5).await;
        assert!(out.is_committed());
        assert_eq!(store.saved.lock().unwrap().len(), 1);
        assert!(core.traits().assertiveness > 0.5);
    }
}
