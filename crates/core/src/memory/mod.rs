pub mod archive;
pub mod backend;
pub mod maintenance;
pub mod profiles;
pub mod sqlite;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub use archive::WarmArchive;
pub use backend::{CausalRecord, MemoryBackend, MemoryError, Table};
pub use maintenance::MaintenanceReport;
pub use profiles::{
    ImportantFact, ProfileDelta, Relationship, RelationshipDelta, ServerEvent, SharedTopic,
    UserProfile,
};
pub use sqlite::SqliteBackend;

use crate::config::{TableLimits, WardenCfg};
use crate::identity::{IdentityStore, IdentityTraits};
use crate::safety::{BreakerStatus, CircuitBreaker};
use crate::thalamus::SessionEnd;
use crate::types::Stimulus;

/// Records considered when echoing past decisions back into perception.
pub const ECHO_LIMIT: usize = 3;
/// Records averaged into the governor's memory bias.
pub const MEMORY_BIAS_WINDOW: usize = 6;
const ECHO_SALIENCE_SCALE: f32 = 0.7;
const ECHO_MIN_AGE_HOURS: f64 = 0.1;

/// Result of a gated write. Transient refusals are values, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Committed,
    Disabled,
    WritesSuspended,
    RateLimited,
    BreakerOpen,
    TableAtCapacity,
    Failed,
}

impl WriteOutcome {
    pub fn is_committed(self) -> bool {
        self == Self::Committed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Disabled => "disabled",
            Self::WritesSuspended => "writes_suspended",
            Self::RateLimited => "rate_limited",
            Self::BreakerOpen => "breaker_open",
            Self::TableAtCapacity => "table_at_capacity",
            Self::Failed => "failed",
        }
    }
}

/// Rolling one-second admission window. A slot is reserved on admission,
/// so no one-second window ever holds more than `max_per_second` writes.
#[derive(Debug)]
pub struct WriteRateLimiter {
    max_per_second: usize,
    admitted: VecDeque<Instant>,
}

impl WriteRateLimiter {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new(max_per_second: usize) -> Self {
        Self { max_per_second: max_per_second.max(1), admitted: VecDeque::new() }
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        while self
            .admitted
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= Self::WINDOW)
        {
            self.admitted.pop_front();
        }
        if self.admitted.len() >= self.max_per_second {
            return false;
        }
        self.admitted.push_back(now);
        true
    }
}

/// Store policy knobs, separate from the backend.
#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub retention_limit: usize,
    pub retention_window: chrono::Duration,
    pub hot_row_cap: u64,
    pub rotation_chunk: u64,
    pub max_bytes: u64,
    pub max_writes_per_second: usize,
    pub table_limits: TableLimits,
}

impl MemorySettings {
    pub fn from_cfg(cfg: &WardenCfg) -> Self {
        Self {
            retention_limit: cfg.retention_limit.max(1),
            retention_window: chrono::Duration::days(cfg.retention_days.max(0)),
            hot_row_cap: cfg.hot_row_cap,
            rotation_chunk: cfg.hot_rotation_chunk.max(1),
            max_bytes: cfg.memory_max_mb.saturating_mul(1024 * 1024),
            max_writes_per_second: cfg.max_writes_per_second,
            table_limits: cfg.table_limits,
        }
    }
}

/// A past decision surfaced as context for a new stimulus.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEcho {
    pub record_id: Uuid,
    pub stimulus_type: String,
    pub context: Value,
    pub decision: Value,
    pub age_hours: f64,
    pub salience: f32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StorageSize {
    pub hot_bytes: u64,
    pub warm_bytes: u64,
}

/// Tiered, size-bounded causal memory.
///
/// Writes pass rate limiter, breaker and row cap in that order. Reads never
/// fail: they fall back to empty/default values and log.
pub struct MemoryStore {
    backend: Arc<dyn MemoryBackend>,
    archive: WarmArchive,
    breaker: Arc<CircuitBreaker>,
    limiter: Mutex<WriteRateLimiter>,
    settings: MemorySettings,
    writes_enabled: AtomicBool,
    disabled: Mutex<Option<String>>,
    last_rotation: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("archive", &self.archive)
            .field("settings", &self.settings)
            .field("writes_enabled", &self.writes_allowed())
            .field("disabled", &self.disabled_reason())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        archive: WarmArchive,
        breaker: Arc<CircuitBreaker>,
        settings: MemorySettings,
    ) -> Self {
        Self {
            backend,
            archive,
            breaker,
            limiter: Mutex::new(WriteRateLimiter::new(settings.max_writes_per_second)),
            settings,
            writes_enabled: AtomicBool::new(true),
            disabled: Mutex::new(None),
            last_rotation: Mutex::new(None),
        }
    }

    /// Open the sqlite store and warm archive at the configured paths.
    pub async fn open(cfg: &WardenCfg, breaker: Arc<CircuitBreaker>) -> Result<Self, MemoryError> {
        let backend = SqliteBackend::open(&cfg.memory_path).await?;
        Ok(Self::new(
            Arc::new(backend),
            WarmArchive::new(&cfg.archive_path),
            breaker,
            MemorySettings::from_cfg(cfg),
        ))
    }

    // ── state ───────────────────────────────────────────────────

    pub fn writes_allowed(&self) -> bool {
        self.writes_enabled.load(Ordering::Acquire)
    }

    pub fn suspend_writes(&self) {
        if self.writes_enabled.swap(false, Ordering::AcqRel) {
            tracing::warn!("memory writes suspended");
        }
    }

    pub fn resume_writes(&self) {
        if !self.writes_enabled.swap(true, Ordering::AcqRel) {
            tracing::info!("memory writes resumed");
        }
    }

    pub fn disabled_reason(&self) -> Option<String> {
        lock(&self.disabled).clone()
    }

    pub fn is_disabled(&self) -> bool {
        lock(&self.disabled).is_some()
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }

    pub fn last_rotation(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_rotation)
    }

    pub fn archive(&self) -> &WarmArchive {
        &self.archive
    }

    pub async fn size_info(&self) -> StorageSize {
        StorageSize {
            hot_bytes: self.backend.storage_bytes().await.unwrap_or(0),
            warm_bytes: self.archive.size_bytes(),
        }
    }

    // ── write gate ──────────────────────────────────────────────

    async fn admit(&self, table: Table) -> Result<(), WriteOutcome> {
        if let Some(reason) = self.disabled_reason() {
            tracing::debug!(table = table.name(), reason = %reason, "memory disabled, write refused");
            return Err(WriteOutcome::Disabled);
        }
        if !self.writes_allowed() {
            return Err(WriteOutcome::WritesSuspended);
        }
        if !lock(&self.limiter).try_acquire_at(Instant::now()) {
            tracing::debug!(table = table.name(), "memory write rate exceeded, write skipped");
            return Err(WriteOutcome::RateLimited);
        }
        if !self.breaker.allow() {
            tracing::debug!(table = table.name(), "memory breaker open, write skipped");
            return Err(WriteOutcome::BreakerOpen);
        }
        let limit = table.limit(&self.settings.table_limits);
        match self.backend.count_rows(table).await {
            Ok(rows) if rows >= limit => {
                tracing::warn!(table = table.name(), rows, limit, "table at capacity, write skipped");
                Err(WriteOutcome::TableAtCapacity)
            }
            Ok(_) => Ok(()),
            Err(e) => Err(self.settle(table, Err(e))),
        }
    }

    fn settle(&self, table: Table, result: Result<(), MemoryError>) -> WriteOutcome {
        match result {
            Ok(()) => {
                self.breaker.record_success();
                WriteOutcome::Committed
            }
            Err(e) if e.is_locked() => {
                tracing::warn!(table = table.name(), error = %e, "memory write hit lock contention");
                WriteOutcome::Failed
            }
            Err(e) => {
                tracing::warn!(table = table.name(), error = %e, "memory write failed");
                self.breaker.record_failure(e.to_string());
                WriteOutcome::Failed
            }
        }
    }

    fn readable(&self) -> bool {
        !self.is_disabled()
    }

    fn read_or<T>(&self, what: &str, result: Result<T, MemoryError>, default: T) -> T {
        match result {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, read = what, "memory read failed, using default");
                default
            }
        }
    }

    // ── causal records ──────────────────────────────────────────

    /// Append a record, then keep only the newest `retention_limit` rows for the
    /// server and drop rows older than the retention window.
    pub async fn record(&self, record: &CausalRecord) -> WriteOutcome {
        if let Err(outcome) = self.admit(Table::Memory).await {
            return outcome;
        }
        let cutoff = Utc::now() - self.settings.retention_window;
        let result: Result<(), MemoryError> = async {
            self.backend.insert_record(record).await?;
            self.backend
                .prune_records(&record.server_id, self.settings.retention_limit, cutoff)
                .await?;
            Ok(())
        }
        .await;
        self.settle(Table::Memory, result)
    }

    pub async fn fetch_recent(&self, server_id: &str, limit: usize) -> Vec<CausalRecord> {
        if !self.readable() {
            return Vec::new();
        }
        let res = self.backend.recent_records(server_id, limit).await;
        self.read_or("fetch_recent", res, Vec::new())
    }

    /// Mean confidence delta over the server's most recent decisions.
    pub async fn memory_bias(&self, server_id: &str) -> f32 {
        let recent = self.fetch_recent(server_id, MEMORY_BIAS_WINDOW).await;
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().map(|r| r.confidence_delta).sum::<f32>() / recent.len() as f32
    }

    /// Recent same-type records with age-decayed salience.
    pub async fn echoes(&self, stimulus: &Stimulus) -> Vec<MemoryEcho> {
        if !self.readable() {
            return Vec::new();
        }
        let res = self
            .backend
            .recent_records_of_type(stimulus.server_id(), stimulus.kind.as_str(), ECHO_LIMIT)
            .await;
        let records = self.read_or("echoes", res, Vec::new());
        let now = Utc::now();
        records
            .into_iter()
            .map(|r| {
                let age_secs = (now - r.ts).num_milliseconds().max(0) as f64 / 1000.0;
                let age_hours = (age_secs / 3600.0).max(ECHO_MIN_AGE_HOURS);
                MemoryEcho {
                    record_id: r.id,
                    stimulus_type: r.stimulus_type,
                    context: r.context,
                    decision: r.decision,
                    age_hours,
                    salience: echo_salience(stimulus.salience, age_hours),
                }
            })
            .collect()
    }

    // ── profiles and relationships ──────────────────────────────

    pub async fn get_user_profile(&self, server_id: &str, user_id: &str) -> UserProfile {
        if !self.readable() {
            return UserProfile::default();
        }
        let res = self.backend.load_profile(server_id, user_id).await;
        self.read_or("user_profile", res, None).unwrap_or_default()
    }

    pub async fn adjust_user_profile(&self, server_id: &str, user_id: &str, delta: &ProfileDelta) -> WriteOutcome {
        if let Err(outcome) = self.admit(Table::UserProfiles).await {
            return outcome;
        }
        let result: Result<(), MemoryError> = async {
            let mut profile = self
                .backend
                .load_profile(server_id, user_id)
                .await?
                .unwrap_or_default();
            profile.apply(delta);
            self.backend.save_profile(server_id, user_id, &profile).await
        }
        .await;
        self.settle(Table::UserProfiles, result)
    }

    pub async fn get_relationship(&self, server_id: &str, a: &str, b: &str) -> Relationship {
        if a == b || !self.readable() {
            return Relationship::default();
        }
        let res = self.backend.load_relationship(server_id, profiles::pair_key(a, b)).await;
        self.read_or("relationship", res, None).unwrap_or_default()
    }

    pub async fn update_relationship(&self, server_id: &str, a: &str, b: &str, delta: &RelationshipDelta) -> WriteOutcome {
        if a == b {
            return WriteOutcome::Committed;
        }
        if let Err(outcome) = self.admit(Table::Relationships).await {
            return outcome;
        }
        let pair = profiles::pair_key(a, b);
        let result: Result<(), MemoryError> = async {
            let mut rel = self
                .backend
                .load_relationship(server_id, pair)
                .await?
                .unwrap_or_default();
            rel.apply(delta);
            self.backend.save_relationship(server_id, pair, &rel).await
        }
        .await;
        self.settle(Table::Relationships, result)
    }

    // ── shared context and durable facts ────────────────────────

    pub async fn record_shared_context(&self, server_id: &str, topics: &[String], participants: &[String], weight: f32) -> WriteOutcome {
        if topics.is_empty() {
            return WriteOutcome::Committed;
        }
        if let Err(outcome) = self.admit(Table::SharedContext).await {
            return outcome;
        }
        let now = Utc::now();
        let result: Result<(), MemoryError> = async {
            for topic in topics.iter().take(profiles::MAX_TOPICS) {
                let existing = self.backend.load_shared_topic(server_id, topic).await?;
                let merged = SharedTopic::merge(existing, server_id, topic, weight, participants, now);
                self.backend.save_shared_topic(&merged).await?;
            }
            Ok(())
        }
        .await;
        self.settle(Table::SharedContext, result)
    }

    pub async fn fetch_shared_context(&self, server_id: &str, limit: usize) -> Vec<SharedTopic> {
        if !self.readable() {
            return Vec::new();
        }
        let res = self.backend.top_shared_topics(server_id, limit).await;
        self.read_or("shared_context", res, Vec::new())
    }

    pub async fn save_important(&self, server_id: &str, user_id: &str, key: &str, value: &str, weight: f32) -> WriteOutcome {
        if let Err(outcome) = self.admit(Table::UserImportant).await {
            return outcome;
        }
        let fact = ImportantFact {
            key: key.to_owned(),
            value: value.to_owned(),
            weight: profiles::clamp01(weight),
            updated_at: Utc::now(),
        };
        let result = self.backend.save_important(server_id, user_id, &fact).await;
        self.settle(Table::UserImportant, result)
    }

    pub async fn get_important(&self, server_id: &str, user_id: &str) -> Vec<ImportantFact> {
        if !self.readable() {
            return Vec::new();
        }
        let res = self.backend.load_important(server_id, user_id).await;
        self.read_or("important", res, Vec::new())
    }

    // ── server intelligence ─────────────────────────────────────

    pub async fn record_server_snapshot(&self, server_id: &str, summary: &Value) -> WriteOutcome {
        if let Err(outcome) = self.admit(Table::ServerProfiles).await {
            return outcome;
        }
        let result = self.backend.save_server_profile(server_id, summary, Utc::now()).await;
        self.settle(Table::ServerProfiles, result)
    }

    pub async fn get_server_profile(&self, server_id: &str) -> Option<Value> {
        if !self.readable() {
            return None;
        }
        let res = self.backend.load_server_profile(server_id).await;
        self.read_or("server_profile", res, None)
    }

    pub async fn record_server_event(&self, server_id: &str, event_type: &str, delta: Value) -> WriteOutcome {
        if let Err(outcome) = self.admit(Table::ServerEvents).await {
            return outcome;
        }
        let event = ServerEvent {
            server_id: server_id.to_owned(),
            event_type: event_type.to_owned(),
            delta,
            ts: Utc::now(),
        };
        let result = self.backend.insert_server_event(&event).await;
        self.settle(Table::ServerEvents, result)
    }

    pub async fn recent_server_events(&self, server_id: &str, limit: usize) -> Vec<ServerEvent> {
        if !self.readable() {
            return Vec::new();
        }
        let res = self.backend.recent_server_events(server_id, limit).await;
        self.read_or("server_events", res, Vec::new())
    }

    /// Append a `session_end` causal record summarising a finished conversation.
    pub async fn record_session_summary(&self, end: &SessionEnd, engagement: f32, outcome_score: f32) -> WriteOutcome {
        let s = &end.session;
        let record = CausalRecord {
            id: Uuid::new_v4(),
            server_id: s.guild_id.clone(),
            stimulus_type: "session_end".into(),
            context: serde_json::json!({
                "user_id": s.user_id,
                "channel_id": s.channel_id,
                "guild_id": s.guild_id,
                "duration_secs": s.duration().num_milliseconds() as f64 / 1000.0,
                "messages": s.message_count,
                "reason": end.reason.as_str(),
            }),
            interpretations: Value::Object(Default::default()),
            decision: serde_json::json!({ "rationale": format!("session_end:{}", end.reason.as_str()) }),
            action: serde_json::json!({ "type": "observe" }),
            outcome: serde_json::json!({ "success": outcome_score >= 0.0, "engagement": engagement }),
            confidence_delta: outcome_score,
            ts: Utc::now(),
        };
        self.record(&record).await
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn load_traits(&self) -> Option<IdentityTraits> {
        if !self.readable() {
            return None;
        }
        let res = self.backend.load_identity().await;
        let rows = self.read_or("identity", res, Vec::new());
        if rows.is_empty() {
            return None;
        }
        Some(IdentityTraits::from_pairs(rows))
    }

    async fn persist_traits(&self, traits: &IdentityTraits) -> WriteOutcome {
        if let Err(outcome) = self.admit(Table::IdentityTraits).await {
            return outcome;
        }
        let result = self.backend.save_identity(&traits.pairs(), Utc::now()).await;
        self.settle(Table::IdentityTraits, result)
    }
}

/// `min(1, salience * 0.7 * 1/(1 + age_hours/24))`
pub fn echo_salience(stimulus_salience: f32, age_hours: f64) -> f32 {
    let decay = 1.0 / (1.0 + age_hours / 24.0);
    (stimulus_salience * ECHO_SALIENCE_SCALE * decay as f32).min(1.0)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_holds_rolling_window() {
        let mut rl = WriteRateLimiter::new(2);
        let t0 = Instant::now();
        assert!(rl.try_acquire_at(t0));
        assert!(rl.try_acquire_at(t0 + Duration::from_millis(100)));
        assert!(!rl.try_acquire_at(t0 + Duration::from_millis(900)));
        assert!(rl.try_acquire_at(t0 + Duration::from_millis(1000)));
        assert!(!rl.try_acquire_at(t0 + Duration::from_millis(1050)));
        assert!(rl.try_acquire_at(t0 + Duration::from_millis(1100)));
    }

    #[test]
    fn echo_decay_curve() {
        assert!((echo_salience(1.0, 0.0) - 0.7).abs() < 1e-6);
        assert!((echo_salience(1.0, 24.0) - 0.35).abs() < 1e-6);
        assert!(echo_salience(0.5, 48.0) < echo_salience(0.5, 1.0));
    }

    #[test]
    fn outcomes_name_themselves() {
        assert!(WriteOutcome::Committed.is_committed());
        assert!(!WriteOutcome::RateLimited.is_committed());
        assert_eq!(WriteOutcome::TableAtCapacity.as_str(), "table_at_capacity");
    }
}
