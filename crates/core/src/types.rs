use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Free-form key/value annotations carried by stimuli and actions.
pub type ContextMap = Map<String, Value>;

/// Server id used when a stimulus carries none.
pub const GLOBAL_SERVER: &str = "global";

// ── Stimuli ─────────────────────────────────────────────────────

/// Kind of event perceived by the loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StimulusKind {
    Message,
    Attachment,
    MemberJoin,
    MemberLeave,
    Silence,
    ModerationEvent,
    ServerSnapshot,
    ServerEvent,
    SelfHealth,
    Other(String),
}

impl StimulusKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::Attachment => "attachment",
            Self::MemberJoin => "member_join",
            Self::MemberLeave => "member_leave",
            Self::Silence => "silence",
            Self::ModerationEvent => "moderation_event",
            Self::ServerSnapshot => "server_snapshot",
            Self::ServerEvent => "server_event",
            Self::SelfHealth => "self_health",
            Self::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "message" => Self::Message,
            "attachment" => Self::Attachment,
            "member_join" => Self::MemberJoin,
            "member_leave" => Self::MemberLeave,
            "silence" => Self::Silence,
            "moderation_event" => Self::ModerationEvent,
            "server_snapshot" => Self::ServerSnapshot,
            "server_event" => Self::ServerEvent,
            "self_health" => Self::SelfHealth,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Chat traffic that can open or continue a conversation session.
    pub fn is_conversational(&self) -> bool {
        matches!(self, Self::Message | Self::Attachment)
    }

    /// Internally generated or membership events that bypass session routing.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::Silence | Self::MemberJoin | Self::MemberLeave)
    }

    pub fn is_moderation(&self) -> bool {
        match self {
            Self::ModerationEvent => true,
            Self::Other(s) => s.starts_with("moderation"),
            _ => false,
        }
    }
}

impl From<String> for StimulusKind {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<StimulusKind> for String {
    fn from(kind: StimulusKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl std::fmt::Display for StimulusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a stimulus was addressed to the system, passive chatter, or internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    Directed,
    Ambient,
    System,
}

impl Routing {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Directed => "directed",
            Self::Ambient => "ambient",
            Self::System => "system",
        }
    }
}

/// An incoming event. Only `routing` and `context` are annotated after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stimulus {
    pub id: Uuid,
    pub kind: StimulusKind,
    pub source: String,
    pub context: ContextMap,
    pub salience: f32,
    pub routing: Routing,
    pub timestamp: DateTime<Utc>,
}

impl Stimulus {
    pub fn new(kind: StimulusKind, source: impl Into<String>, salience: f32) -> Self {
        let routing = if kind.is_conversational() {
            Routing::Ambient
        } else {
            Routing::System
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            source: source.into(),
            context: ContextMap::new(),
            salience: salience.clamp(0.0, 1.0),
            routing,
            timestamp: Utc::now(),
        }
    }

    /// A chat message from `author` in `guild`/`channel`.
    pub fn message(
        source: impl Into<String>,
        guild: impl Into<String>,
        channel: impl Into<String>,
        author: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let guild = guild.into();
        Self::new(StimulusKind::Message, source, 0.5)
            .with("server_id", guild.clone())
            .with("guild_id", guild)
            .with("channel_id", channel.into())
            .with("author_id", author.into())
            .with("content", content.into())
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_owned(), value.into());
        self
    }

    pub fn ctx_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    pub fn server_id(&self) -> &str {
        self.ctx_str("server_id")
            .or_else(|| self.ctx_str("guild_id"))
            .unwrap_or(GLOBAL_SERVER)
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.ctx_str("channel_id")
    }

    pub fn author_id(&self) -> Option<&str> {
        self.ctx_str("author_id")
    }

    pub fn content(&self) -> &str {
        self.ctx_str("content").unwrap_or_default()
    }

    pub fn mentions_bot(&self) -> bool {
        self.context
            .get("mentions_bot")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn mentioned_users(&self) -> Vec<String> {
        match self.context.get("mentioned_user_ids") {
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Context stripped of raw content and echoes, safe to persist or audit.
    pub fn context_snapshot(&self) -> ContextMap {
        let mut snapshot = ContextMap::new();
        for (key, value) in &self.context {
            match (key.as_str(), value) {
                ("content" | "memory_echoes", _) => {}
                ("attachments", Value::Array(items)) => {
                    snapshot.insert("attachment_count".into(), items.len().into());
                }
                ("mentioned_user_ids" | "channel_mentions" | "role_mentions", Value::Array(items)) => {
                    snapshot.insert(format!("{key}_count"), items.len().into());
                }
                _ => {
                    snapshot.insert(key.clone(), value.clone());
                }
            }
        }
        let content = self.content();
        if !content.is_empty() {
            snapshot.insert("content_len".into(), content.chars().count().into());
            snapshot.insert("has_question".into(), content.contains('?').into());
        }
        snapshot
    }
}

// ── Actions ─────────────────────────────────────────────────────

/// Closed set of actions the external executor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SendMessage,
    Reply,
    React,
    Defer,
    Schedule,
    Observe,
    ToolCall,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::Reply => "reply",
            Self::React => "react",
            Self::Defer => "defer",
            Self::Schedule => "schedule",
            Self::Observe => "observe",
            Self::ToolCall => "tool_call",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "send_message" => Some(Self::SendMessage),
            "reply" => Some(Self::Reply),
            "react" => Some(Self::React),
            "defer" => Some(Self::Defer),
            "schedule" => Some(Self::Schedule),
            "observe" => Some(Self::Observe),
            "tool_call" => Some(Self::ToolCall),
            _ => None,
        }
    }

    /// Actions still permitted while safe mode is active.
    pub fn allowed_in_safe_mode(self) -> bool {
        matches!(self, Self::Reply | Self::SendMessage | Self::Observe)
    }
}

/// A single action chosen for the external executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionIntent {
    pub id: Uuid,
    pub action_type: ActionType,
    pub target_id: Option<String>,
    pub payload: ContextMap,
    pub metadata: ContextMap,
    pub created_at: DateTime<Utc>,
}

impl ActionIntent {
    pub fn new(action_type: ActionType, target_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type,
            target_id,
            payload: ContextMap::new(),
            metadata: ContextMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn observe() -> Self {
        Self::new(ActionType::Observe, None)
    }

    pub fn with_payload(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    /// Serializable view without metadata (audit context can be large).
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "type": self.action_type.as_str(),
            "target_id": self.target_id,
            "payload": self.payload,
            "created_at": self.created_at,
        })
    }
}

/// Finite vocabulary of reasons an action did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionFailure {
    QueueFull,
    SafeModeBlocked,
    Rejected,
}

impl ActionFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::SafeModeBlocked => "safe_mode_blocked",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub intent_id: Uuid,
    pub action_type: ActionType,
    pub target_id: Option<String>,
    pub success: bool,
    pub detail: String,
    pub failure: Option<ActionFailure>,
    pub executed_at: DateTime<Utc>,
}

impl ActionResult {
    pub fn ok(intent: &ActionIntent, detail: impl Into<String>) -> Self {
        Self {
            intent_id: intent.id,
            action_type: intent.action_type,
            target_id: intent.target_id.clone(),
            success: true,
            detail: detail.into(),
            failure: None,
            executed_at: Utc::now(),
        }
    }

    pub fn failed(intent: &ActionIntent, failure: ActionFailure, detail: impl Into<String>) -> Self {
        Self {
            intent_id: intent.id,
            action_type: intent.action_type,
            target_id: intent.target_id.clone(),
            success: false,
            detail: detail.into(),
            failure: Some(failure),
            executed_at: Utc::now(),
        }
    }
}

// ── Interpretation and decision ─────────────────────────────────

/// What one strategy thinks should happen for a stimulus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOutput {
    pub name: String,
    pub recommended: Option<ActionIntent>,
    pub confidence: f32,
    pub risk: f32,
    pub justification: String,
}

impl StrategyOutput {
    /// Output with no recommendation.
    pub fn abstain(name: impl Into<String>, justification: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            recommended: None,
            confidence: 0.0,
            risk: 0.0,
            justification: justification.into(),
        }
    }

    pub fn recommend(
        name: impl Into<String>,
        intent: ActionIntent,
        confidence: f32,
        risk: f32,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            recommended: Some(intent),
            confidence: confidence.clamp(0.0, 1.0),
            risk: risk.clamp(0.0, 1.0),
            justification: justification.into(),
        }
    }

    pub fn summary(&self) -> Value {
        serde_json::json!({
            "strategy": self.name,
            "action": self.recommended.as_ref().map(|a| a.action_type.as_str()),
            "confidence": self.confidence,
            "risk": self.risk,
            "justification": self.justification,
        })
    }
}

/// Governor verdict for one stimulus.
#[derive(Debug, Clone)]
pub struct Decision {
    pub intent: ActionIntent,
    pub confidence: f32,
    pub risk: f32,
    pub rationale: String,
    pub strategy: Option<String>,
    pub memory_bias: f32,
}

impl Decision {
    pub fn confidence_delta(&self) -> f32 {
        self.confidence - self.risk
    }
}

// ── Observability ───────────────────────────────────────────────

/// Per-tick snapshot of runtime health, broadcast via watch channel.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub tick_count: u64,
    pub safe_mode: bool,
    pub safe_mode_reason: Option<String>,
    pub tick_interval_ms: u64,
    pub uptime_secs: u64,
    pub last_overrun: Option<String>,
    pub watchdog_note: Option<String>,
    pub tripped_breakers: Vec<String>,
    pub memory_writes_allowed: bool,
    pub memory_disabled: Option<String>,
    pub hot_mb: f64,
    pub warm_mb: f64,
    pub last_rotation: Option<DateTime<Utc>>,
    pub stimulus_backlog: usize,
    pub action_backlog: usize,
    pub active_sessions: usize,
}

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self {
            tick_count: 0,
            safe_mode: false,
            safe_mode_reason: None,
            tick_interval_ms: 0,
            uptime_secs: 0,
            last_overrun: None,
            watchdog_note: None,
            tripped_breakers: Vec::new(),
            memory_writes_allowed: true,
            memory_disabled: None,
            hot_mb: 0.0,
            warm_mb: 0.0,
            last_rotation: None,
            stimulus_backlog: 0,
            action_backlog: 0,
            active_sessions: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stimulus_kind_roundtrip_and_other() {
        assert_eq!(StimulusKind::parse("member_join"), StimulusKind::MemberJoin);
        assert_eq!(StimulusKind::parse("moderation_flag").as_str(), "moderation_flag");
        assert!(StimulusKind::parse("moderation_flag").is_moderation());
        let json = serde_json::to_string(&StimulusKind::SelfHealth).unwrap();
        assert_eq!(json, "\"self_health\"");
    }

    #[test]
    fn message_defaults_to_ambient() {
        let s = Stimulus::message("chat", "g1", "c1", "u1", "hello");
        assert_eq!(s.routing, Routing::Ambient);
        assert_eq!(s.server_id(), "g1");
        assert_eq!(s.author_id(), Some("u1"));
        let sys = Stimulus::new(StimulusKind::Silence, "core", 0.2);
        assert_eq!(sys.routing, Routing::System);
        assert_eq!(sys.server_id(), GLOBAL_SERVER);
    }

    #[test]
    fn snapshot_drops_raw_content() {
        let s = Stimulus::message("chat", "g1", "c1", "u1", "what time is it?")
            .with("mentioned_user_ids", serde_json::json!(["u2", "u3"]))
            .with("memory_echoes", serde_json::json!([{"x": 1}]));
        let snap = s.context_snapshot();
        assert!(!snap.contains_key("content"));
        assert!(!snap.contains_key("memory_echoes"));
        assert_eq!(snap["mentioned_user_ids_count"], 2);
        assert_eq!(snap["content_len"], 16);
        assert_eq!(snap["has_question"], true);
    }

    #[test]
    fn mentioned_users_accept_numbers() {
        let s = Stimulus::message("chat", "g", "c", "u", "hi").with("mentioned_user_ids", serde_json::json!([42, "u9"]));
        assert_eq!(s.mentioned_users(), vec!["42".to_string(), "u9".to_string()]);
    }

    #[test]
    fn safe_mode_action_allowlist() {
        assert!(ActionType::Reply.allowed_in_safe_mode());
        assert!(ActionType::Observe.allowed_in_safe_mode());
        assert!(!ActionType::ToolCall.allowed_in_safe_mode());
        assert!(!ActionType::Schedule.allowed_in_safe_mode());
        assert_eq!(ActionType::parse("tool_call"), Some(ActionType::ToolCall));
        assert_eq!(ActionType::parse("explode"), None);
    }
}
