use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::TickError;
use crate::identity::IdentityCore;
use crate::memory::profiles::{clamp01, extract_topics};
use crate::memory::{CausalRecord, MemoryStore, ProfileDelta, RelationshipDelta, WriteOutcome};
use crate::thalamus::{EndReason, SessionEnd};
use crate::types::{ActionResult, Decision, Routing, Stimulus, StimulusKind, StrategyOutput};

/// Outcome score for a failed action.
const FAILURE_OUTCOME: f32 = -0.5;
/// Identity weight of a finished session's outcome.
const SESSION_IDENTITY_WEIGHT: f32 = 0.4;
const TIMEOUT_PENALTY: f32 = 0.1;

/// One finished decision, ready to be learned from.
#[derive(Debug, Clone, Copy)]
pub struct Reflection<'a> {
    pub stimulus: &'a Stimulus,
    pub outputs: &'a [StrategyOutput],
    pub decision: &'a Decision,
    pub result: &'a ActionResult,
    pub safe_mode: bool,
}

/// Feeds outcomes back into memory, identity and social profiles.
#[derive(Debug, Clone)]
pub struct Reflector {
    memory: Arc<MemoryStore>,
    self_id: String,
    session_ttl: chrono::Duration,
}

impl Reflector {
    pub fn new(memory: Arc<MemoryStore>, self_id: impl Into<String>, session_ttl: std::time::Duration) -> Self {
        Self {
            memory,
            self_id: self_id.into(),
            session_ttl: chrono::Duration::from_std(session_ttl).unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }

    /// Returns the causal-record write outcome, or `None` when nothing was learned.
    pub async fn reflect(&self, identity: &mut IdentityCore, r: Reflection<'_>) -> Result<Option<WriteOutcome>, TickError> {
        let stimulus = r.stimulus;
        if r.safe_mode && !self.memory.writes_allowed() {
            return Ok(None);
        }
        if stimulus.routing == Routing::Ambient && stimulus.kind.is_conversational() {
            return Ok(None);
        }
        if stimulus.kind == StimulusKind::Silence {
            return Ok(None);
        }

        let delta = r.decision.confidence_delta();
        let outcome = if r.result.success { 1.0 } else { FAILURE_OUTCOME };

        let server = stimulus.server_id();
        let topics = extract_topics(stimulus.content());
        let mut context = stimulus.context_snapshot();
        if !topics.is_empty() {
            context.insert("topics".into(), topics.clone().into());
        }
        let interpretations = serde_json::to_value(r.outputs.iter().map(StrategyOutput::summary).collect::<Vec<_>>())
            .map_err(|e| TickError::Reflection(e.to_string()))?;
        let record = CausalRecord {
            id: Uuid::new_v4(),
            server_id: server.to_owned(),
            stimulus_type: stimulus.kind.as_str().to_owned(),
            context: Value::Object(context),
            interpretations,
            decision: serde_json::json!({
                "rationale": r.decision.rationale,
                "strategy": r.decision.strategy,
                "confidence": r.decision.confidence,
                "risk": r.decision.risk,
                "memory_bias": r.decision.memory_bias,
            }),
            action: r.decision.intent.snapshot(),
            outcome: serde_json::json!({
                "success": r.result.success,
                "detail": r.result.detail,
                "failure": r.result.failure.map(|f| f.as_str()),
            }),
            confidence_delta: delta,
            ts: Utc::now(),
        };
        // the causal record goes first so derived writes cannot starve it of write slots
        let written = self.memory.record(&record).await;
        identity.adjust_from_outcome(outcome * delta).await;

        match &stimulus.kind {
            StimulusKind::ServerSnapshot => {
                self.memory.record_server_snapshot(server, &server_summary(stimulus)).await;
            }
            StimulusKind::ServerEvent => {
                let event_type = stimulus.ctx_str("event_type").unwrap_or("unknown");
                self.memory
                    .record_server_event(server, event_type, scalar_delta(stimulus.context.get("data")))
                    .await;
            }
            _ => {}
        }

        if stimulus.kind == StimulusKind::Message
            && let Some(author) = stimulus.author_id()
        {
            self.reflect_social(stimulus, author, &topics, outcome).await;
        }
        Ok(Some(written))
    }

    async fn reflect_social(&self, stimulus: &Stimulus, author: &str, topics: &[String], outcome: f32) {
        let server = stimulus.server_id();
        let content = stimulus.content();
        let mentioned = stimulus.mentioned_users();

        self.memory
            .adjust_user_profile(server, author, &profile_delta(content, outcome))
            .await;

        let mut participants = vec![author.to_owned()];
        participants.extend(mentioned.iter().filter(|m| m.as_str() != author).cloned());
        self.memory
            .record_shared_context(server, topics, &participants, stimulus.salience)
            .await;

        for other in mentioned.iter().filter(|m| m.as_str() != author) {
            let delta = RelationshipDelta {
                topic_overlap: 0.04 * topics.len() as f32,
                affinity: 0.02 * outcome,
                ..Default::default()
            };
            self.memory.update_relationship(server, author, other, &delta).await;
        }
        if stimulus.routing == Routing::Directed {
            let delta = RelationshipDelta { trust: 0.03 * outcome, affinity: 0.02, ..Default::default() };
            self.memory.update_relationship(server, author, &self.self_id, &delta).await;
        }

        for fact in capture_important(content) {
            self.memory
                .save_important(server, author, fact.key, &fact.value, fact.weight)
                .await;
        }
    }

    /// Learn from a conversation that just ended.
    pub async fn reflect_session_end(&self, identity: &mut IdentityCore, end: &SessionEnd) -> Option<WriteOutcome> {
        if !self.memory.writes_allowed() {
            return None;
        }
        let s = &end.session;
        let ttl_ms = self.session_ttl.num_milliseconds().max(1) as f32;
        let engagement = clamp01(s.duration().num_milliseconds() as f32 / ttl_ms);
        let mut outcome = engagement;
        if end.reason == EndReason::Timeout {
            outcome -= TIMEOUT_PENALTY;
        }
        tracing::debug!(user = %s.user_id, reason = end.reason.as_str(), engagement, "reflecting session end");

        let written = self.memory.record_session_summary(end, engagement, outcome).await;
        identity.adjust_from_outcome(outcome * SESSION_IDENTITY_WEIGHT).await;
        let profile = ProfileDelta { success_rate: outcome * 0.1, verbosity: engagement * 0.05, ..Default::default() };
        self.memory.adjust_user_profile(&s.guild_id, &s.user_id, &profile).await;
        let rel = RelationshipDelta { trust: engagement * 0.08, affinity: engagement * 0.06, ..Default::default() };
        self.memory
            .update_relationship(&s.guild_id, &s.user_id, &self.self_id, &rel)
            .await;
        Some(written)
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Small per-message nudges to the author's interaction profile.
pub fn profile_delta(content: &str, outcome: f32) -> ProfileDelta {
    let lower = content.to_lowercase();
    let len = content.chars().count();
    ProfileDelta {
        verbosity: clamp01(len as f32 / 400.0) * 0.1 - 0.02,
        humor_tolerance: if contains_any(&lower, &["lol", "lmao", "haha", "😂"]) { 0.05 } else { -0.01 },
        tone_balance: if content.contains('?') { 0.03 } else { -0.01 },
        success_rate: outcome * 0.05,
        warmth: if contains_any(&lower, &["thanks", "appreciate", "please"]) { 0.04 } else { -0.01 },
        formality: if contains_any(&lower, &["please", "thank you", "regards"]) { 0.03 } else { -0.01 },
        precision: if contains_any(content, &[":", "-", "->"]) { 0.04 } else { -0.005 },
        brevity_bias: if len > 180 { -0.03 } else { 0.02 },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFact {
    pub key: &'static str,
    pub value: String,
    pub weight: f32,
}

const NAME_MARKERS: [&str; 5] = [
    "you can call me ",
    "i prefer being called ",
    "i prefer to be called ",
    "my name is ",
    "call me ",
];
const PRONOUN_MARKERS: [&str; 1] = ["my pronouns are "];
const DISLIKE_MARKERS: [&str; 3] = ["i don't like ", "i do not like ", "i dislike "];
const LIKE_MARKERS: [&str; 2] = ["i like ", "i love "];

/// Durable facts a user states about themselves.
pub fn capture_important(content: &str) -> Vec<CapturedFact> {
    // ASCII lowering keeps byte offsets aligned with `content`.
    let lower = content.to_ascii_lowercase();
    let mut facts = Vec::new();

    if let Some(name) = phrase_after(content, &lower, &NAME_MARKERS, 64) {
        facts.push(CapturedFact { key: "preferred_name", value: name, weight: 0.8 });
    }
    if let Some(p) = phrase_after(content, &lower, &PRONOUN_MARKERS, 32) {
        facts.push(CapturedFact { key: "pronouns", value: p, weight: 0.8 });
    }
    let dislike = phrase_after(content, &lower, &DISLIKE_MARKERS, 120);
    if let Some(d) = &dislike {
        facts.push(CapturedFact { key: "dislikes", value: d.clone(), weight: 0.6 });
    } else if let Some(l) = phrase_after(content, &lower, &LIKE_MARKERS, 120) {
        facts.push(CapturedFact { key: "likes", value: l, weight: 0.6 });
    }
    if contains_any(&lower, &["don't ping me", "do not ping me"]) {
        facts.push(CapturedFact { key: "boundaries", value: "no pings".into(), weight: 0.9 });
    }
    if contains_any(&lower, &["keep it short", "short replies"]) {
        facts.push(CapturedFact { key: "communication", value: "prefers concise".into(), weight: 0.7 });
    }
    facts
}

fn phrase_after(content: &str, lower: &str, markers: &[&str], max_chars: usize) -> Option<String> {
    let start = markers
        .iter()
        .find_map(|m| lower.find(m).map(|at| at + m.len()))?;
    let rest = content.get(start..)?;
    let end = rest.find(['.', ',', '!', '?', '\n']).unwrap_or(rest.len());
    let phrase: String = rest[..end].trim().chars().take(max_chars).collect();
    let phrase = phrase.trim().to_owned();
    (!phrase.is_empty()).then_some(phrase)
}

/// Lossy server summary: counts only.
fn server_summary(stimulus: &Stimulus) -> Value {
    let count = |key: &str| match stimulus.context.get(key) {
        Some(Value::Array(items)) => items.len() as u64,
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    };
    serde_json::json!({
        "roles": count("roles"),
        "channels": count("channels"),
        "member_count": count("member_count"),
        "timestamp": stimulus.timestamp.timestamp_millis(),
    })
}

/// Keep only scalar fields of an event payload.
fn scalar_delta(data: Option<&Value>) -> Value {
    let mut out = Map::new();
    if let Some(Value::Object(fields)) = data {
        for (k, v) in fields {
            if matches!(v, Value::Bool(_) | Value::Number(_) | Value::String(_)) {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_name_and_boundary() {
        let facts = capture_important("Hi! You can call me Sam, and please don't ping me at night.");
        assert_eq!(facts[0], CapturedFact { key: "preferred_name", value: "Sam".into(), weight: 0.8 });
        assert!(facts.iter().any(|f| f.key == "boundaries" && f.value == "no pings"));
    }

    #[test]
    fn dislike_wins_over_like() {
        let facts = capture_important("I don't like spoilers");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].key, "dislikes");
        assert_eq!(facts[0].value, "spoilers");
        let facts = capture_important("i love rust. keep it short");
        assert_eq!(facts[0].value, "rust");
        assert_eq!(facts[1].value, "prefers concise");
    }

    #[test]
    fn nothing_captured_from_plain_chat() {
        assert!(capture_important("what time is the meeting?").is_empty());
    }

    #[test]
    fn profile_delta_reads_tone() {
        let d = profile_delta("thanks, lol - what's next?", 1.0);
        assert_eq!(d.humor_tolerance, 0.05);
        assert_eq!(d.tone_balance, 0.03);
        assert_eq!(d.warmth, 0.04);
        assert_eq!(d.precision, 0.04);
        assert_eq!(d.brevity_bias, 0.02);
        assert!((d.success_rate - 0.05).abs() < 1e-6);
    }

    #[test]
    fn scalar_delta_drops_nested_values() {
        let v = serde_json::json!({"kind": "role_added", "n": 2, "raw": {"x": 1}, "list": [1]});
        let d = scalar_delta(Some(&v));
        assert_eq!(d, serde_json::json!({"kind": "role_added", "n": 2}));
    }
}
