use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::profiles::{ImportantFact, Relationship, ServerEvent, SharedTopic, UserProfile};
use crate::config::TableLimits;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("archive io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl MemoryError {
    /// Transient lock contention; not counted against the breaker.
    pub fn is_locked(&self) -> bool {
        match self {
            Self::Db(e) => e.to_string().contains("locked"),
            _ => false,
        }
    }
}

/// Persisted tables, each with a hard row cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Memory,
    UserProfiles,
    Relationships,
    SharedContext,
    UserImportant,
    ServerProfiles,
    ServerEvents,
    IdentityTraits,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Self::Memory,
        Self::UserProfiles,
        Self::Relationships,
        Self::SharedContext,
        Self::UserImportant,
        Self::ServerProfiles,
        Self::ServerEvents,
        Self::IdentityTraits,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::UserProfiles => "user_profiles",
            Self::Relationships => "relationships",
            Self::SharedContext => "shared_context",
            Self::UserImportant => "user_important",
            Self::ServerProfiles => "server_profiles",
            Self::ServerEvents => "server_events",
            Self::IdentityTraits => "identity_traits",
        }
    }

    /// Column used to find the oldest rows.
    pub fn ts_column(self) -> &'static str {
        match self {
            Self::Memory | Self::ServerEvents => "ts",
            _ => "updated_at",
        }
    }

    pub fn limit(self, limits: &TableLimits) -> u64 {
        match self {
            Self::Memory => limits.memory,
            Self::UserProfiles => limits.user_profiles,
            Self::Relationships => limits.relationships,
            Self::SharedContext => limits.shared_context,
            Self::UserImportant => limits.user_important,
            Self::ServerProfiles => limits.server_profiles,
            Self::ServerEvents => limits.server_events,
            Self::IdentityTraits => limits.identity_traits,
        }
    }
}

/// One causal decision record: what was perceived, considered, chosen and what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalRecord {
    pub id: Uuid,
    pub server_id: String,
    pub stimulus_type: String,
    pub context: Value,
    pub interpretations: Value,
    pub decision: Value,
    pub action: Value,
    pub outcome: Value,
    pub confidence_delta: f32,
    pub ts: DateTime<Utc>,
}

impl CausalRecord {
    /// Lossy archive form: type, chosen action, success flag. Never raw content.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "server_id": self.server_id,
            "type": self.stimulus_type,
            "decision": self.action.get("type").cloned().unwrap_or(Value::Null),
            "outcome": self.outcome.get("success").cloned().unwrap_or(Value::Null),
            "confidence_delta": self.confidence_delta,
            "ts": self.ts.timestamp_millis(),
        })
    }
}

/// Storage port behind [`super::MemoryStore`]. The store owns gating and policy;
/// a backend only persists and queries.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    // causal records
    async fn insert_record(&self, record: &CausalRecord) -> Result<(), MemoryError>;
    /// Keep the newest `keep` rows for the server and drop rows older than `cutoff`.
    async fn prune_records(&self, server_id: &str, keep: usize, cutoff: DateTime<Utc>) -> Result<u64, MemoryError>;
    async fn recent_records(&self, server_id: &str, limit: usize) -> Result<Vec<CausalRecord>, MemoryError>;
    async fn recent_records_of_type(&self, server_id: &str, stimulus_type: &str, limit: usize) -> Result<Vec<CausalRecord>, MemoryError>;
    /// Oldest rows across all servers, oldest first.
    async fn oldest_records(&self, limit: u64) -> Result<Vec<CausalRecord>, MemoryError>;
    async fn delete_records(&self, ids: &[Uuid]) -> Result<u64, MemoryError>;

    // table housekeeping
    async fn count_rows(&self, table: Table) -> Result<u64, MemoryError>;
    async fn delete_oldest(&self, table: Table, count: u64) -> Result<u64, MemoryError>;
    async fn storage_bytes(&self) -> Result<u64, MemoryError>;
    async fn reclaim(&self, pages: u32) -> Result<(), MemoryError>;

    // derived state
    async fn load_profile(&self, server_id: &str, user_id: &str) -> Result<Option<UserProfile>, MemoryError>;
    async fn save_profile(&self, server_id: &str, user_id: &str, profile: &UserProfile) -> Result<(), MemoryError>;
    async fn load_relationship(&self, server_id: &str, pair: (&str, &str)) -> Result<Option<Relationship>, MemoryError>;
    async fn save_relationship(&self, server_id: &str, pair: (&str, &str), rel: &Relationship) -> Result<(), MemoryError>;
    async fn load_shared_topic(&self, server_id: &str, topic: &str) -> Result<Option<SharedTopic>, MemoryError>;
    async fn save_shared_topic(&self, topic: &SharedTopic) -> Result<(), MemoryError>;
    async fn top_shared_topics(&self, server_id: &str, limit: usize) -> Result<Vec<SharedTopic>, MemoryError>;
    async fn save_important(&self, server_id: &str, user_id: &str, fact: &ImportantFact) -> Result<(), MemoryError>;
    async fn load_important(&self, server_id: &str, user_id: &str) -> Result<Vec<ImportantFact>, MemoryError>;
    async fn save_server_profile(&self, server_id: &str, summary: &Value, now: DateTime<Utc>) -> Result<(), MemoryError>;
    async fn load_server_profile(&self, server_id: &str) -> Result<Option<Value>, MemoryError>;
    async fn insert_server_event(&self, event: &ServerEvent) -> Result<(), MemoryError>;
    async fn recent_server_events(&self, server_id: &str, limit: usize) -> Result<Vec<ServerEvent>, MemoryError>;

    // identity
    async fn load_identity(&self) -> Result<Vec<(String, f32)>, MemoryError>;
    async fn save_identity(&self, traits: &[(&str, f32)], now: DateTime<Utc>) -> Result<(), MemoryError>;
}
