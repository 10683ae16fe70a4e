use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite};
use uuid::Uuid;

use super::backend::{CausalRecord, MemoryBackend, MemoryError, Table};
use super::profiles::{ImportantFact, Relationship, ServerEvent, SharedTopic, UserProfile};

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_CONNECTIONS: u32 = 4;

/// sqlx-backed relational store: WAL journal, incremental auto-vacuum.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    wal_path: PathBuf,
}

impl SqliteBackend {
    /// Open (creating if missing) the database file and apply migrations.
    pub async fn open(path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .auto_vacuum(SqliteAutoVacuum::Incremental)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(opts)
            .await?;
        sqlx::migrate!("../../migrations").run(&pool).await?;
        tracing::info!(path = %path.display(), "memory store opened");
        let mut wal = path.as_os_str().to_owned();
        wal.push("-wal");
        Ok(Self { pool, wal_path: PathBuf::from(wal) })
    }
}

fn ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    server_id: String,
    stimulus_type: String,
    context: Json<Value>,
    interpretations: Json<Value>,
    decision: Json<Value>,
    action: Json<Value>,
    outcome: Json<Value>,
    confidence_delta: f64,
    ts: i64,
}

impl From<RecordRow> for CausalRecord {
    fn from(r: RecordRow) -> Self {
        Self {
            id: r.id,
            server_id: r.server_id,
            stimulus_type: r.stimulus_type,
            context: r.context.0,
            interpretations: r.interpretations.0,
            decision: r.decision.0,
            action: r.action.0,
            outcome: r.outcome.0,
            confidence_delta: r.confidence_delta as f32,
            ts: from_ms(r.ts),
        }
    }
}

const RECORD_COLUMNS: &str = "id, server_id, stimulus_type, context, interpretations, decision, action, outcome, confidence_delta, ts";

#[derive(sqlx::FromRow)]
struct SharedRow {
    server_id: String,
    topic: String,
    weight: f64,
    participants: Json<Vec<String>>,
    updated_at: i64,
}

impl From<SharedRow> for SharedTopic {
    fn from(r: SharedRow) -> Self {
        Self {
            server_id: r.server_id,
            topic: r.topic,
            weight: r.weight as f32,
            participants: r.participants.0,
            updated_at: from_ms(r.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ImportantRow {
    key: String,
    value: String,
    weight: f64,
    updated_at: i64,
}

impl From<ImportantRow> for ImportantFact {
    fn from(r: ImportantRow) -> Self {
        Self {
            key: r.key,
            value: r.value,
            weight: r.weight as f32,
            updated_at: from_ms(r.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    server_id: String,
    event_type: String,
    delta: Json<Value>,
    ts: i64,
}

impl From<EventRow> for ServerEvent {
    fn from(r: EventRow) -> Self {
        Self {
            server_id: r.server_id,
            event_type: r.event_type,
            delta: r.delta.0,
            ts: from_ms(r.ts),
        }
    }
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    async fn insert_record(&self, record: &CausalRecord) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO memory (id, server_id, stimulus_type, context, interpretations, decision, action, outcome, confidence_delta, ts) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(&record.server_id)
        .bind(&record.stimulus_type)
        .bind(Json(&record.context))
        .bind(Json(&record.interpretations))
        .bind(Json(&record.decision))
        .bind(Json(&record.action))
        .bind(Json(&record.outcome))
        .bind(record.confidence_delta as f64)
        .bind(ms(record.ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_records(&self, server_id: &str, keep: usize, cutoff: DateTime<Utc>) -> Result<u64, MemoryError> {
        let over = sqlx::query(
            "DELETE FROM memory WHERE server_id = ? AND id NOT IN \
             (SELECT id FROM memory WHERE server_id = ? ORDER BY ts DESC LIMIT ?)",
        )
        .bind(server_id)
        .bind(server_id)
        .bind(keep as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        let stale = sqlx::query("DELETE FROM memory WHERE server_id = ? AND ts < ?")
            .bind(server_id)
            .bind(ms(cutoff))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(over + stale)
    }

    async fn recent_records(&self, server_id: &str, limit: usize) -> Result<Vec<CausalRecord>, MemoryError> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM memory WHERE server_id = ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(server_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn recent_records_of_type(&self, server_id: &str, stimulus_type: &str, limit: usize) -> Result<Vec<CausalRecord>, MemoryError> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM memory WHERE server_id = ? AND stimulus_type = ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(server_id)
        .bind(stimulus_type)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn oldest_records(&self, limit: u64) -> Result<Vec<CausalRecord>, MemoryError> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM memory ORDER BY ts ASC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_records(&self, ids: &[Uuid]) -> Result<u64, MemoryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM memory WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        sep.push_unseparated(")");
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn count_rows(&self, table: Table) -> Result<u64, MemoryError> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.name()))
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn delete_oldest(&self, table: Table, count: u64) -> Result<u64, MemoryError> {
        if count == 0 {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {t} WHERE rowid IN (SELECT rowid FROM {t} ORDER BY {ts} ASC LIMIT ?)",
            t = table.name(),
            ts = table.ts_column(),
        );
        Ok(sqlx::query(&sql)
            .bind(count as i64)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn storage_bytes(&self) -> Result<u64, MemoryError> {
        let bytes: i64 = sqlx::query_scalar(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?;
        // frames not yet checkpointed live only in the -wal file
        let wal = match tokio::fs::metadata(&self.wal_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(bytes.max(0) as u64 + wal)
    }

    async fn reclaim(&self, pages: u32) -> Result<(), MemoryError> {
        sqlx::query(&format!("PRAGMA incremental_vacuum({pages})"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_profile(&self, server_id: &str, user_id: &str) -> Result<Option<UserProfile>, MemoryError> {
        let row: Option<Json<UserProfile>> = sqlx::query_scalar(
            "SELECT traits FROM user_profiles WHERE server_id = ? AND user_id = ?",
        )
        .bind(server_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|j| j.0))
    }

    async fn save_profile(&self, server_id: &str, user_id: &str, profile: &UserProfile) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO user_profiles (server_id, user_id, traits, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (server_id, user_id) DO UPDATE SET traits = excluded.traits, updated_at = excluded.updated_at",
        )
        .bind(server_id)
        .bind(user_id)
        .bind(Json(profile))
        .bind(ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_relationship(&self, server_id: &str, pair: (&str, &str)) -> Result<Option<Relationship>, MemoryError> {
        let row: Option<Json<Relationship>> = sqlx::query_scalar(
            "SELECT traits FROM relationships WHERE server_id = ? AND user_a = ? AND user_b = ?",
        )
        .bind(server_id)
        .bind(pair.0)
        .bind(pair.1)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|j| j.0))
    }

    async fn save_relationship(&self, server_id: &str, pair: (&str, &str), rel: &Relationship) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO relationships (server_id, user_a, user_b, traits, updated_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (server_id, user_a, user_b) DO UPDATE SET traits = excluded.traits, updated_at = excluded.updated_at",
        )
        .bind(server_id)
        .bind(pair.0)
        .bind(pair.1)
        .bind(Json(rel))
        .bind(ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_shared_topic(&self, server_id: &str, topic: &str) -> Result<Option<SharedTopic>, MemoryError> {
        let row = sqlx::query_as::<_, SharedRow>(
            "SELECT server_id, topic, weight, participants, updated_at FROM shared_context \
             WHERE server_id = ? AND topic = ?",
        )
        .bind(server_id)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn save_shared_topic(&self, t: &SharedTopic) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO shared_context (server_id, topic, weight, participants, updated_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (server_id, topic) DO UPDATE SET weight = excluded.weight, \
             participants = excluded.participants, updated_at = excluded.updated_at",
        )
        .bind(&t.server_id)
        .bind(&t.topic)
        .bind(t.weight as f64)
        .bind(Json(&t.participants))
        .bind(ms(t.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn top_shared_topics(&self, server_id: &str, limit: usize) -> Result<Vec<SharedTopic>, MemoryError> {
        let rows = sqlx::query_as::<_, SharedRow>(
            "SELECT server_id, topic, weight, participants, updated_at FROM shared_context \
             WHERE server_id = ? ORDER BY weight DESC, updated_at DESC LIMIT ?",
        )
        .bind(server_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_important(&self, server_id: &str, user_id: &str, fact: &ImportantFact) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO user_important (server_id, user_id, key, value, weight, updated_at) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (server_id, user_id, key) DO UPDATE SET value = excluded.value, \
             weight = excluded.weight, updated_at = excluded.updated_at",
        )
        .bind(server_id)
        .bind(user_id)
        .bind(&fact.key)
        .bind(&fact.value)
        .bind(fact.weight as f64)
        .bind(ms(fact.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_important(&self, server_id: &str, user_id: &str) -> Result<Vec<ImportantFact>, MemoryError> {
        let rows = sqlx::query_as::<_, ImportantRow>(
            "SELECT key, value, weight, updated_at FROM user_important \
             WHERE server_id = ? AND user_id = ? ORDER BY weight DESC, updated_at DESC",
        )
        .bind(server_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_server_profile(&self, server_id: &str, summary: &Value, now: DateTime<Utc>) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO server_profiles (server_id, summary, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT (server_id) DO UPDATE SET summary = excluded.summary, updated_at = excluded.updated_at",
        )
        .bind(server_id)
        .bind(Json(summary))
        .bind(ms(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_server_profile(&self, server_id: &str) -> Result<Option<Value>, MemoryError> {
        let row: Option<Json<Value>> =
            sqlx::query_scalar("SELECT summary FROM server_profiles WHERE server_id = ?")
                .bind(server_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|j| j.0))
    }

    async fn insert_server_event(&self, event: &ServerEvent) -> Result<(), MemoryError> {
        sqlx::query("INSERT INTO server_events (server_id, event_type, delta, ts) VALUES (?, ?, ?, ?)")
            .bind(&event.server_id)
            .bind(&event.event_type)
            .bind(Json(&event.delta))
            .bind(ms(event.ts))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_server_events(&self, server_id: &str, limit: usize) -> Result<Vec<ServerEvent>, MemoryError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT server_id, event_type, delta, ts FROM server_events \
             WHERE server_id = ? ORDER BY ts DESC, id DESC LIMIT ?",
        )
        .bind(server_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn load_identity(&self) -> Result<Vec<(String, f32)>, MemoryError> {
        let rows: Vec<(String, f64)> = sqlx::query_as("SELECT name, value FROM identity_traits")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(n, v)| (n, v as f32)).collect())
    }

    async fn save_identity(&self, traits: &[(&str, f32)], now: DateTime<Utc>) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await?;
        for (name, value) in traits {
            sqlx::query(
                "INSERT INTO identity_traits (name, value, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT (name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(*name)
            .bind(*value as f64)
            .bind(ms(now))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::profiles::pair_key;

    fn record(server: &str, kind: &str, ts_ms: i64) -> CausalRecord {
        CausalRecord {
            id: Uuid::new_v4(),
            server_id: server.into(),
            stimulus_type: kind.into(),
            context: serde_json::json!({}),
            interpretations: serde_json::json!({}),
            decision: serde_json::json!({"rationale": "test"}),
            action: serde_json::json!({"type": "observe"}),
            outcome: serde_json::json!({"success": true}),
            confidence_delta: 0.2,
            ts: from_ms(ts_ms),
        }
    }

    async fn open() -> (tempfile::TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("mem.sqlite3")).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn records_are_returned_newest_first() {
        let (_dir, b) = open().await;
        let base = Utc::now().timestamp_millis();
        for i in 0..3 {
            b.insert_record(&record("g", "message", base + i)).await.unwrap();
        }
        let recent = b.recent_records("g", 10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent[0].ts > recent[2].ts);
        assert_eq!(b.count_rows(Table::Memory).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn prune_keeps_newest_and_drops_stale() {
        let (_dir, b) = open().await;
        let base = Utc::now().timestamp_millis();
        b.insert_record(&record("g", "message", base - 10_000_000)).await.unwrap();
        for i in 0..4 {
            b.insert_record(&record("g", "message", base + i)).await.unwrap();
        }
        b.insert_record(&record("other", "message", base)).await.unwrap();
        let removed = b
            .prune_records("g", 3, from_ms(base - 1000))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(b.recent_records("g", 10).await.unwrap().len(), 3);
        assert_eq!(b.recent_records("other", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oldest_and_delete_oldest() {
        let (_dir, b) = open().await;
        let base = Utc::now().timestamp_millis();
        for i in 0..5 {
            b.insert_record(&record("g", "message", base + i)).await.unwrap();
        }
        let oldest = b.oldest_records(2).await.unwrap();
        assert_eq!(oldest[0].ts, from_ms(base));
        let ids: Vec<Uuid> = oldest.iter().map(|r| r.id).collect();
        assert_eq!(b.delete_records(&ids).await.unwrap(), 2);
        assert_eq!(b.delete_oldest(Table::Memory, 1).await.unwrap(), 1);
        let left = b.oldest_records(10).await.unwrap();
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].ts, from_ms(base + 3));
    }

    #[tokio::test]
    async fn profile_relationship_and_identity_upserts() {
        let (_dir, b) = open().await;
        assert!(b.load_profile("g", "u").await.unwrap().is_none());
        let mut p = UserProfile::default();
        p.warmth = 0.9;
        b.save_profile("g", "u", &p).await.unwrap();
        p.warmth = 0.7;
        b.save_profile("g", "u", &p).await.unwrap();
        assert_eq!(b.load_profile("g", "u").await.unwrap().unwrap().warmth, 0.7);
        assert_eq!(b.count_rows(Table::UserProfiles).await.unwrap(), 1);

        let rel = Relationship { trust: 0.8, ..Default::default() };
        b.save_relationship("g", pair_key("z", "a"), &rel).await.unwrap();
        let loaded = b.load_relationship("g", pair_key("a", "z")).await.unwrap().unwrap();
        assert_eq!(loaded.trust, 0.8);

        b.save_identity(&[("caution", 0.6), ("curiosity", 0.4)], Utc::now()).await.unwrap();
        b.save_identity(&[("caution", 0.55)], Utc::now()).await.unwrap();
        let mut traits = b.load_identity().await.unwrap();
        traits.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(traits.len(), 2);
        assert!((traits[0].1 - 0.55).abs() < 1e-6);
    }

    #[tokio::test]
    async fn storage_and_reclaim() {
        let (_dir, b) = open().await;
        assert!(b.storage_bytes().await.unwrap() > 0);
        b.reclaim(200).await.unwrap();
    }

    #[tokio::test]
    async fn storage_counts_uncheckpointed_wal() {
        let (_dir, b) = open().await;
        let base = Utc::now().timestamp_millis();
        for i in 0..20 {
            b.insert_record(&record("g", "message", base + i)).await.unwrap();
        }
        let pages: i64 = sqlx::query_scalar("SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()")
            .fetch_one(&b.pool)
            .await
            .unwrap();
        let wal = std::fs::metadata(&b.wal_path).map(|m| m.len()).unwrap_or(0);
        assert!(wal > 0);
        assert_eq!(b.storage_bytes().await.unwrap(), pages as u64 + wal);
    }
}
