//! Storage lifecycle against a real sqlite file and warm archive:
//! write gating, hot-to-warm rotation, size ceiling, profile derivation.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;
use warden_core::WardenCfg;
use warden_core::config::TableLimits;
use warden_core::memory::{CausalRecord, MemoryStore, ProfileDelta, RelationshipDelta, WriteOutcome};
use warden_core::safety::CircuitBreaker;

fn cfg_in(dir: &TempDir) -> WardenCfg {
    WardenCfg {
        memory_path: dir.path().join("warden.sqlite3"),
        archive_path: dir.path().join("warm.jsonl.gz"),
        max_writes_per_second: 1000,
        ..WardenCfg::default()
    }
}

async fn open(cfg: &WardenCfg) -> MemoryStore {
    let breaker = Arc::new(CircuitBreaker::from_settings("memory", cfg.memory_breaker));
    MemoryStore::open(cfg, breaker).await.unwrap()
}

fn record(server: &str, kind: &str, age_secs: i64) -> CausalRecord {
    CausalRecord {
        id: uuid::Uuid::new_v4(),
        server_id: server.into(),
        stimulus_type: kind.into(),
        context: json!({"content": "private text", "content_len": 12}),
        interpretations: json!([]),
        decision: json!({"type": "reply"}),
        action: json!({"type": "reply"}),
        outcome: json!({"success": true}),
        confidence_delta: 0.1,
        ts: Utc::now() - Duration::seconds(age_secs),
    }
}

#[tokio::test]
async fn rotation_moves_oldest_rows_to_warm_archive() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg { hot_row_cap: 3, hot_rotation_chunk: 2, ..cfg_in(&dir) };
    let store = open(&cfg).await;

    for age in (0..6).rev() {
        assert!(store.record(&record("g1", "message", age * 10)).await.is_committed());
    }

    let report = store.maintain().await;
    assert_eq!(report.rotated, 3);
    assert!(report.disabled.is_none());
    assert!(store.last_rotation().is_some());

    let hot = store.fetch_recent("g1", 10).await;
    assert_eq!(hot.len(), 3);
    assert!(hot.len() <= cfg.retention_limit);
    // newest rows stay hot
    assert!(hot.iter().all(|r| Utc::now() - r.ts < Duration::seconds(25)));

    assert!(cfg.archive_path.exists());
    let lines = store.archive().read_all().await.unwrap();
    let summaries: Vec<&Value> = lines.iter().filter(|l| l.get("summary").is_none()).collect();
    assert_eq!(summaries.len(), 3);
    assert!(summaries.iter().all(|l| l.get("context").is_none()));
    let aggregate_total: u64 = lines
        .iter()
        .filter(|l| l["summary"] == true)
        .map(|l| l["count"].as_u64().unwrap())
        .sum();
    assert_eq!(aggregate_total, 3);
}

#[tokio::test]
async fn retention_limit_prunes_per_server() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg { retention_limit: 2, ..cfg_in(&dir) };
    let store = open(&cfg).await;

    for age in (0..4).rev() {
        store.record(&record("g1", "message", age)).await;
    }
    store.record(&record("g2", "message", 0)).await;

    assert_eq!(store.fetch_recent("g1", 10).await.len(), 2);
    assert_eq!(store.fetch_recent("g2", 10).await.len(), 1);
}

#[tokio::test]
async fn write_rate_is_capped_per_second() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg { max_writes_per_second: 2, ..cfg_in(&dir) };
    let store = open(&cfg).await;

    let mut outcomes = Vec::new();
    for age in 0..3 {
        outcomes.push(store.record(&record("g1", "message", age)).await);
    }
    assert_eq!(outcomes, vec![WriteOutcome::Committed, WriteOutcome::Committed, WriteOutcome::RateLimited]);
    assert_eq!(store.fetch_recent("g1", 10).await.len(), 2);
}

#[tokio::test]
async fn size_ceiling_disables_reads_and_writes() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg { memory_max_mb: 0, ..cfg_in(&dir) };
    let store = open(&cfg).await;
    store.record(&record("g1", "message", 0)).await;

    let report = store.maintain().await;
    assert!(report.disabled.is_some());
    assert!(store.is_disabled());
    assert_eq!(store.record(&record("g1", "message", 0)).await, WriteOutcome::Disabled);
    assert!(store.fetch_recent("g1", 10).await.is_empty());
    assert_eq!(store.memory_bias("g1").await, 0.0);
}

#[tokio::test]
async fn suspended_writes_are_refused_until_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&cfg_in(&dir)).await;

    store.suspend_writes();
    assert_eq!(store.record(&record("g1", "message", 0)).await, WriteOutcome::WritesSuspended);
    store.resume_writes();
    assert!(store.record(&record("g1", "message", 0)).await.is_committed());
}

#[tokio::test]
async fn profiles_and_relationships_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&cfg_in(&dir)).await;

    let delta = ProfileDelta { warmth: 0.1, formality: -0.2, ..Default::default() };
    store.adjust_user_profile("g1", "alice", &delta).await;
    store.adjust_user_profile("g1", "alice", &delta).await;
    let profile = store.get_user_profile("g1", "alice").await;
    assert!((profile.warmth - 0.7).abs() < 1e-5);
    assert!((profile.formality - 0.1).abs() < 1e-5);
    assert!((profile.verbosity - 0.5).abs() < 1e-5);

    let rel = RelationshipDelta { affinity: 0.3, ..Default::default() };
    store.update_relationship("g1", "bob", "alice", &rel).await;
    let forward = store.get_relationship("g1", "alice", "bob").await;
    assert!((forward.affinity - 0.8).abs() < 1e-5);

    // self-relationships are never stored
    assert!(store.update_relationship("g1", "alice", "alice", &rel).await.is_committed());
    assert_eq!(store.get_relationship("g1", "alice", "alice").await.affinity, 0.5);
}

#[tokio::test]
async fn server_profile_events_and_facts_are_kept_per_server() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&cfg_in(&dir)).await;

    assert!(store.get_server_profile("g1").await.is_none());
    store.record_server_snapshot("g1", &json!({"roles": 3, "channels": 7})).await;
    store.record_server_snapshot("g1", &json!({"roles": 4, "channels": 7})).await;
    assert_eq!(store.get_server_profile("g1").await.unwrap()["roles"], 4);

    store.record_server_event("g1", "role_added", json!({"n": 1})).await;
    store.record_server_event("g2", "member_left", json!({})).await;
    let events = store.recent_server_events("g1", 10).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "role_added");

    store.save_important("g1", "alice", "preferred_name", "Al", 0.8).await;
    store.save_important("g1", "alice", "preferred_name", "Ally", 0.8).await;
    let facts = store.get_important("g1", "alice").await;
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].value, "Ally");
    assert!(store.get_important("g2", "alice").await.is_empty());

    assert!(!store.breaker_status().tripped);
}

#[tokio::test]
async fn full_table_refuses_further_writes() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg {
        table_limits: TableLimits { memory: 2, ..TableLimits::default() },
        ..cfg_in(&dir)
    };
    let store = open(&cfg).await;

    assert!(store.record(&record("g1", "message", 2)).await.is_committed());
    assert!(store.record(&record("g1", "message", 1)).await.is_committed());
    assert_eq!(store.record(&record("g1", "message", 0)).await, WriteOutcome::TableAtCapacity);
    assert_eq!(store.fetch_recent("g1", 10).await.len(), 2);
}

#[tokio::test]
async fn open_breaker_short_circuits_record() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_in(&dir);
    let breaker = Arc::new(CircuitBreaker::new("memory", 1, 60, 60));
    let store = MemoryStore::open(&cfg, Arc::clone(&breaker)).await.unwrap();

    breaker.record_failure("disk I/O error");
    assert_eq!(store.record(&record("g1", "message", 0)).await, WriteOutcome::BreakerOpen);
    assert!(store.breaker_status().tripped);
    assert!(store.fetch_recent("g1", 10).await.is_empty());
}
