use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::memory::WriteOutcome;

/// Slow-moving personality scalars, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityTraits {
    pub assertiveness: f32,
    pub playfulness: f32,
    pub caution: f32,
    pub curiosity: f32,
    pub patience: f32,
}

impl Default for IdentityTraits {
    fn default() -> Self {
        Self {
            assertiveness: 0.5,
            playfulness: 0.5,
            caution: 0.5,
            curiosity: 0.5,
            patience: 0.5,
        }
    }
}

impl IdentityTraits {
    pub const NAMES: [&'static str; 5] = ["assertiveness", "playfulness", "caution", "curiosity", "patience"];

    /// Build from persisted `(name, value)` rows. Unknown names are ignored;
    /// missing ones keep their default.
    pub fn from_pairs(rows: impl IntoIterator<Item = (String, f32)>) -> Self {
        let mut t = Self::default();
        for (name, value) in rows {
            let value = value.clamp(0.0, 1.0);
            match name.as_str() {
                "assertiveness" => t.assertiveness = value,
                "playfulness" => t.playfulness = value,
                "caution" => t.caution = value,
                "curiosity" => t.curiosity = value,
                "patience" => t.patience = value,
                other => tracing::debug!(trait_name = other, "ignoring unknown identity trait"),
            }
        }
        t
    }

    pub fn pairs(&self) -> Vec<(&'static str, f32)> {
        vec![
            ("assertiveness", self.assertiveness),
            ("playfulness", self.playfulness),
            ("caution", self.caution),
            ("curiosity", self.curiosity),
            ("patience", self.patience),
        ]
    }

    pub fn clamp(&mut self) {
        self.assertiveness = self.assertiveness.clamp(0.0, 1.0);
        self.playfulness = self.playfulness.clamp(0.0, 1.0);
        self.caution = self.caution.clamp(0.0, 1.0);
        self.curiosity = self.curiosity.clamp(0.0, 1.0);
        self.patience = self.patience.clamp(0.0, 1.0);
    }
}

/// Where identity traits live between restarts.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn load_traits(&self) -> Option<IdentityTraits>;
    async fn persist_traits(&self, traits: &IdentityTraits) -> WriteOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_pairs_fills_known_and_clamps() {
        let t = IdentityTraits::from_pairs(vec![
            ("caution".to_string(), 0.9),
            ("curiosity".to_string(), 1.7),
            ("mood".to_string(), 0.1),
        ]);
        assert_eq!(t.caution, 0.9);
        assert_eq!(t.curiosity, 1.0);
        assert_eq!(t.patience, 0.5);
    }

    #[test]
    fn pairs_cover_every_trait() {
        let names: Vec<_> = IdentityTraits::default().pairs().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, IdentityTraits::NAMES);
    }
}
