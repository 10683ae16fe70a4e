use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum topics extracted from one message.
pub const MAX_TOPICS: usize = 5;
/// Minimum alphabetic run length counted as a topic.
const MIN_TOPIC_LEN: usize = 4;
/// Carry-over factor applied to an existing shared-topic weight.
pub const SHARED_WEIGHT_DECAY: f32 = 0.9;

pub fn clamp01(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

/// Lowercased, order-preserving unique alphabetic tokens of at least four letters.
pub fn extract_topics(text: &str) -> Vec<String> {
    let mut topics: Vec<String> = Vec::new();
    for word in text.split(|c: char| !c.is_ascii_alphabetic()) {
        if word.len() < MIN_TOPIC_LEN {
            continue;
        }
        let word = word.to_ascii_lowercase();
        if !topics.contains(&word) {
            topics.push(word);
            if topics.len() == MAX_TOPICS {
                break;
            }
        }
    }
    topics
}

/// Per-(server, user) interaction traits, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub verbosity: f32,
    pub humor_tolerance: f32,
    pub tone_balance: f32,
    pub success_rate: f32,
    pub warmth: f32,
    pub formality: f32,
    pub brevity_bias: f32,
    pub precision: f32,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            verbosity: 0.5,
            humor_tolerance: 0.5,
            tone_balance: 0.5,
            success_rate: 0.5,
            warmth: 0.5,
            formality: 0.5,
            brevity_bias: 0.5,
            precision: 0.5,
        }
    }
}

/// Signed increments for a [`UserProfile`]; zero fields leave the trait untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfileDelta {
    pub verbosity: f32,
    pub humor_tolerance: f32,
    pub tone_balance: f32,
    pub success_rate: f32,
    pub warmth: f32,
    pub formality: f32,
    pub brevity_bias: f32,
    pub precision: f32,
}

impl UserProfile {
    pub fn apply(&mut self, d: &ProfileDelta) {
        self.verbosity = clamp01(self.verbosity + d.verbosity);
        self.humor_tolerance = clamp01(self.humor_tolerance + d.humor_tolerance);
        self.tone_balance = clamp01(self.tone_balance + d.tone_balance);
        self.success_rate = clamp01(self.success_rate + d.success_rate);
        self.warmth = clamp01(self.warmth + d.warmth);
        self.formality = clamp01(self.formality + d.formality);
        self.brevity_bias = clamp01(self.brevity_bias + d.brevity_bias);
        self.precision = clamp01(self.precision + d.precision);
    }
}

/// Per-(server, sorted user pair) traits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Relationship {
    pub affinity: f32,
    pub trust: f32,
    pub topic_overlap: f32,
}

impl Default for Relationship {
    fn default() -> Self {
        Self { affinity: 0.5, trust: 0.5, topic_overlap: 0.5 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RelationshipDelta {
    pub affinity: f32,
    pub trust: f32,
    pub topic_overlap: f32,
}

impl Relationship {
    pub fn apply(&mut self, d: &RelationshipDelta) {
        self.affinity = clamp01(self.affinity + d.affinity);
        self.trust = clamp01(self.trust + d.trust);
        self.topic_overlap = clamp01(self.topic_overlap + d.topic_overlap);
    }
}

/// Sorted pair so (a, b) and (b, a) share one row.
pub fn pair_key<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

/// A topic recently discussed on a server, with who took part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedTopic {
    pub server_id: String,
    pub topic: String,
    pub weight: f32,
    pub participants: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl SharedTopic {
    /// Fold a new mention into an existing topic (or start one).
    pub fn merge(existing: Option<Self>, server_id: &str, topic: &str, weight: f32, participants: &[String], now: DateTime<Utc>) -> Self {
        let (old_weight, mut people) = match existing {
            Some(t) => (t.weight, t.participants),
            None => (0.0, Vec::new()),
        };
        for p in participants {
            if !people.contains(p) {
                people.push(p.clone());
            }
        }
        Self {
            server_id: server_id.to_owned(),
            topic: topic.to_owned(),
            weight: clamp01(old_weight * SHARED_WEIGHT_DECAY + weight),
            participants: people,
            updated_at: now,
        }
    }
}

/// A durable user fact (preferred name, boundaries, likes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportantFact {
    pub key: String,
    pub value: String,
    pub weight: f32,
    pub updated_at: DateTime<Utc>,
}

/// Lightweight server event delta (scalars only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub server_id: String,
    pub event_type: String,
    pub delta: serde_json::Value,
    pub ts: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_unique_lowercase_and_capped() {
        let t = extract_topics("Rust rust RUST is fun; tokio, serde, sqlx and flate compression crates");
        assert_eq!(t, vec!["rust", "tokio", "serde", "sqlx", "flate"]);
        assert!(extract_topics("a bb ccc").is_empty());
    }

    #[test]
    fn profile_deltas_are_clamped() {
        let mut p = UserProfile::default();
        p.apply(&ProfileDelta { warmth: 0.7, precision: -0.9, ..Default::default() });
        assert_eq!(p.warmth, 1.0);
        assert_eq!(p.precision, 0.0);
        assert_eq!(p.verbosity, 0.5);
    }

    #[test]
    fn pair_key_is_order_independent() {
        assert_eq!(pair_key("b", "a"), ("a", "b"));
        assert_eq!(pair_key("a", "b"), ("a", "b"));
    }

    #[test]
    fn shared_topic_merge_decays_and_unions() {
        let now = Utc::now();
        let first = SharedTopic::merge(None, "g", "rust", 0.5, &["u1".into()], now);
        assert_eq!(first.weight, 0.5);
        let second = SharedTopic::merge(Some(first), "g", "rust", 0.2, &["u1".into(), "u2".into()], now);
        assert!((second.weight - 0.65).abs() < 1e-6);
        assert_eq!(second.participants, vec!["u1".to_string(), "u2".to_string()]);
    }
}
