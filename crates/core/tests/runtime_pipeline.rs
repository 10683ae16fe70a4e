//! End-to-end ticks of the cognition loop against a temp sqlite store:
//! stimulus in, routing, strategy fan-out, governor, action out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use warden_core::cognition::{NoIntentResolver, Strategy, StrategyContext, strategies};
use warden_core::identity::{IdentityCore, IdentityStore};
use warden_core::memory::MemoryStore;
use warden_core::safety::CircuitBreaker;
use warden_core::thalamus::{EndReason, SessionRouter};
use warden_core::types::{ActionIntent, ActionType, Routing, Stimulus, StrategyOutput};
use warden_core::{ControlCommand, Runtime, RuntimeHandles, WardenCfg};

const TICK: Duration = Duration::from_millis(500);

fn test_cfg(dir: &TempDir) -> WardenCfg {
    WardenCfg {
        memory_path: dir.path().join("warden.sqlite3"),
        archive_path: dir.path().join("warm.jsonl.gz"),
        max_writes_per_second: 1000,
        tick_budget_ms: 5_000,
        // keep the watchdog quiet on loaded test machines
        watchdog_cpu_load_per_core: 1_000.0,
        watchdog_rss_mb: 1_000_000.0,
        watchdog_loop_lag_ms: 60_000,
        watchdog_queue_depth: 10_000,
        ..WardenCfg::default()
    }
}

async fn boot_with_memory(
    cfg: WardenCfg,
    custom: Option<Vec<Arc<dyn Strategy>>>,
) -> (Runtime, RuntimeHandles, Arc<MemoryStore>) {
    let breaker = Arc::new(CircuitBreaker::from_settings("memory", cfg.memory_breaker));
    let memory = Arc::new(MemoryStore::open(&cfg, breaker).await.unwrap());
    let identity = IdentityCore::load(Arc::clone(&memory) as Arc<dyn IdentityStore>, cfg.identity_learning_rate).await;
    let strategies = custom.unwrap_or_else(|| strategies::default_set(&cfg, None, Arc::new(NoIntentResolver)));
    let (runtime, handles) = Runtime::new(cfg, Arc::clone(&memory), identity, strategies);
    (runtime, handles, memory)
}

async fn boot(cfg: WardenCfg, custom: Option<Vec<Arc<dyn Strategy>>>) -> (Runtime, RuntimeHandles) {
    let (runtime, handles, _) = boot_with_memory(cfg, custom).await;
    (runtime, handles)
}

fn content(intent: &ActionIntent) -> &str {
    intent.payload.get("content").and_then(|v| v.as_str()).unwrap_or_default()
}

#[tokio::test]
async fn directed_message_in_safe_mode_gets_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runtime, mut handles) = boot(test_cfg(&dir), None).await;
    assert!(runtime.is_safe_mode());

    handles.stimuli.submit_message("g1", "c1", "alice", "warden, are you there?").unwrap();
    runtime.run_tick(TICK).await;

    let action = handles.actions.try_recv().unwrap();
    assert_eq!(action.action_type, ActionType::Reply);
    assert_eq!(action.target_id.as_deref(), Some("c1"));
    assert!(content(&action).contains("safe mode"));
    assert_eq!(action.metadata["audit_context"]["routing"], "directed");

    let status = handles.status.borrow().clone();
    assert_eq!(status.tick_count, 1);
    assert_eq!(status.active_sessions, 1);
    assert!(status.safe_mode);
}

#[tokio::test]
async fn ambient_chatter_is_observed_without_interpretation() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runtime, mut handles) = boot(test_cfg(&dir), None).await;

    handles.stimuli.submit_message("g1", "c1", "bob", "lunch anyone?").unwrap();
    runtime.run_tick(TICK).await;

    let action = handles.actions.try_recv().unwrap();
    assert_eq!(action.action_type, ActionType::Observe);
    assert_eq!(action.metadata["audit_context"]["routing"], "ambient");
    assert_eq!(handles.status.borrow().active_sessions, 0);
}

#[tokio::test]
async fn safe_mode_blocks_non_read_only_actions() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg { automod_dry_run: false, ..test_cfg(&dir) };
    let (mut runtime, mut handles) = boot(cfg, None).await;

    handles.stimuli.submit_message("g1", "c1", "mallory", "warden shut up you idiot").unwrap();
    runtime.run_tick(TICK).await;

    let action = handles.actions.try_recv().unwrap();
    assert_eq!(action.action_type, ActionType::Observe);
    assert_eq!(action.metadata["reason"], "safe_mode_block");
    assert_eq!(action.metadata["blocked_action"], "defer");
}

#[tokio::test]
async fn operator_exit_restores_normal_replies() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runtime, mut handles) = boot(test_cfg(&dir), None).await;

    handles.control.send(ControlCommand::ExitSafeMode).await.unwrap();
    handles.stimuli.submit_message("g1", "c1", "alice", "hey warden").unwrap();
    runtime.run_tick(TICK).await;

    assert!(!runtime.is_safe_mode());
    let action = handles.actions.try_recv().unwrap();
    assert_eq!(action.action_type, ActionType::Reply);
    assert!(!content(&action).contains("safe mode"));

    handles.control.send(ControlCommand::enter_manual("maintenance window")).await.unwrap();
    runtime.run_tick(TICK).await;
    assert!(runtime.is_safe_mode());
    assert_eq!(handles.status.borrow().safe_mode_reason.as_deref(), Some("maintenance window"));
}

#[tokio::test]
async fn second_speaker_supersedes_the_channel_session() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runtime, mut handles) = boot(test_cfg(&dir), None).await;

    handles.stimuli.submit_message("g1", "c1", "alice", "warden hello").unwrap();
    handles.stimuli.submit_message("g1", "c1", "bob", "warden hi").unwrap();
    runtime.run_tick(TICK).await;

    assert_eq!(handles.status.borrow().active_sessions, 1);
    assert_eq!(handles.actions.try_recv().unwrap().action_type, ActionType::Reply);
    assert_eq!(handles.actions.try_recv().unwrap().action_type, ActionType::Reply);

    handles
        .control
        .send(ControlCommand::EndSession { user: "bob".into(), guild: "g1".into(), channel: "c1".into() })
        .await
        .unwrap();
    runtime.run_tick(TICK).await;
    assert_eq!(handles.status.borrow().active_sessions, 0);
}

#[test]
fn router_reports_exactly_one_superseded_end() {
    let mut router = SessionRouter::new(Duration::from_secs(300), "warden");
    let mut first = Stimulus::message("chat", "g1", "c1", "alice", "warden hello");
    let mut second = Stimulus::message("chat", "g1", "c1", "bob", "warden hi");

    let out = router.route(&mut first);
    assert_eq!(out.routing, Routing::Directed);
    assert!(out.ended.is_empty());

    let out = router.route(&mut second);
    assert_eq!(out.ended.len(), 1);
    assert_eq!(out.ended[0].reason, EndReason::Superseded);
    assert_eq!(out.ended[0].session.user_id, "alice");
    assert_eq!(router.active_for_channel("g1", "c1").unwrap().user_id, "bob");
}

struct Reminder;

#[async_trait]
impl Strategy for Reminder {
    fn name(&self) -> &'static str {
        "reminder"
    }

    async fn interpret(&self, ctx: &StrategyContext) -> StrategyOutput {
        let intent = ActionIntent::new(ActionType::Schedule, ctx.stimulus.channel_id().map(str::to_owned))
            .with_payload("delay_ms", 20)
            .with_payload("action", json!({"type": "send_message", "payload": {"content": "tea time"}}));
        StrategyOutput::recommend("reminder", intent, 0.9, 0.1, "reminder requested")
    }
}

#[tokio::test]
async fn scheduled_action_is_enqueued_after_its_delay() {
    let dir = tempfile::tempdir().unwrap();
    let custom: Vec<Arc<dyn Strategy>> = vec![Arc::new(Reminder)];
    let (mut runtime, mut handles) = boot(test_cfg(&dir), Some(custom)).await;

    handles.control.send(ControlCommand::ExitSafeMode).await.unwrap();
    handles.stimuli.submit_message("g1", "c1", "alice", "warden remind me").unwrap();
    runtime.run_tick(TICK).await;

    let action = tokio::time::timeout(Duration::from_secs(2), handles.actions.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(action.action_type, ActionType::SendMessage);
    assert_eq!(action.target_id.as_deref(), Some("c1"));
    assert_eq!(content(&action), "tea time");
    assert!(action.metadata.contains_key("scheduled_by"));
}

#[tokio::test]
async fn full_action_queue_forces_safe_mode() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg { action_queue_limit: 1, ..test_cfg(&dir) };
    let (mut runtime, handles) = boot(cfg, None).await;

    handles.control.send(ControlCommand::ExitSafeMode).await.unwrap();
    handles.stimuli.submit_message("g1", "c1", "alice", "warden one").unwrap();
    handles.stimuli.submit_message("g1", "c1", "alice", "warden two").unwrap();
    runtime.run_tick(TICK).await;

    assert!(runtime.is_safe_mode());
    let status = handles.status.borrow().clone();
    assert_eq!(status.last_overrun.as_deref(), Some("action_queue_full"));
    assert!(!status.memory_writes_allowed);
}

#[tokio::test]
async fn causal_record_takes_the_only_write_slot() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg { max_writes_per_second: 1, ..test_cfg(&dir) };
    let (mut runtime, handles, memory) = boot_with_memory(cfg, None).await;

    handles.stimuli.submit_message("g1", "c1", "alice", "warden, thanks for the help").unwrap();
    runtime.run_tick(TICK).await;

    let records = memory.fetch_recent("g1", 10).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].stimulus_type, "message");
}

struct Stalled;

#[async_trait]
impl Strategy for Stalled {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn interpret(&self, _ctx: &StrategyContext) -> StrategyOutput {
        tokio::time::sleep(Duration::from_secs(30)).await;
        StrategyOutput::abstain("stalled", "woke too late")
    }
}

#[tokio::test]
async fn stalled_strategy_is_cancelled_at_the_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg { tick_budget_ms: 200, ..test_cfg(&dir) };
    let custom: Vec<Arc<dyn Strategy>> = vec![Arc::new(Stalled)];
    let (mut runtime, handles) = boot(cfg, Some(custom)).await;

    handles.control.send(ControlCommand::ExitSafeMode).await.unwrap();
    handles.stimuli.submit_message("g1", "c1", "alice", "warden ping").unwrap();
    tokio::time::timeout(Duration::from_secs(5), runtime.run_tick(TICK)).await.unwrap();

    assert!(runtime.is_safe_mode());
    let status = handles.status.borrow().clone();
    assert_eq!(status.last_overrun.as_deref(), Some("interpret_timeout"));
    assert!(!status.memory_writes_allowed);
}

#[tokio::test]
async fn exhausted_tick_budget_forces_safe_mode() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg { tick_budget_ms: 0, ..test_cfg(&dir) };
    let (mut runtime, handles) = boot(cfg, None).await;

    handles.control.send(ControlCommand::ExitSafeMode).await.unwrap();
    handles.stimuli.submit_message("g1", "c1", "alice", "warden hello").unwrap();
    runtime.run_tick(TICK).await;

    assert!(runtime.is_safe_mode());
    let status = handles.status.borrow().clone();
    assert!(status.last_overrun.is_some());
    assert!(!status.memory_writes_allowed);
}

#[tokio::test]
async fn watchdog_lag_forces_safe_mode_and_slows_the_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = WardenCfg { watchdog_loop_lag_ms: 1, ..test_cfg(&dir) };
    let watchdog_ms = cfg.tick_ms_watchdog;
    let (mut runtime, handles) = boot(cfg, None).await;

    handles.control.send(ControlCommand::ExitSafeMode).await.unwrap();
    runtime.run_tick(TICK).await;
    assert!(!runtime.is_safe_mode());

    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.run_tick(Duration::ZERO).await;

    assert!(runtime.is_safe_mode());
    let status = handles.status.borrow().clone();
    assert!(status.watchdog_note.unwrap().contains("loop_lag="));
    assert_eq!(status.tick_interval_ms, watchdog_ms);
    assert!(!status.memory_writes_allowed);
}

#[tokio::test]
async fn state_decays_over_the_full_gap_between_ticks() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runtime, _handles) = boot(test_cfg(&dir), None).await;

    runtime.run_tick(TICK).await;
    let before = runtime.state().risk_pressure;

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    runtime.run_tick(TICK).await;

    // risk decays at 0.025 per second
    let decayed = before - runtime.state().risk_pressure;
    assert!(decayed > 0.06, "decayed only {decayed}");
    assert!(decayed < 0.09, "decayed {decayed}");
}
