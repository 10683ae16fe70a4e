use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::control::ControlCommand;
use super::loop_control::Cadence;
use super::shutdown::ShutdownGuard;
use crate::actions::ActionAuditor;
use crate::cognition::{
    Governor, InternalState, InterpreterPool, Reflection, Reflector, StateSnapshot, Strategy,
    StrategyContext, TickError,
};
use crate::config::WardenCfg;
use crate::health::{self, LogScanner, ScanSettings};
use crate::identity::IdentityCore;
use crate::io::input::{self, StimulusReceiver, StimulusSender};
use crate::io::output::{self, ActionReceiver, ActionSender};
use crate::memory::{self, MemoryStore, StorageSize};
use crate::safety::{SafeModeTrigger, SafetyBreakers, Watchdog, WatchdogThresholds};
use crate::thalamus::{RouteOutcome, SessionEnd, SessionRouter};
use crate::types::{
    ActionFailure, ActionIntent, ActionResult, ActionType, Decision, Routing, RuntimeStatus,
    Stimulus, StimulusKind, StrategyOutput,
};

/// Slack on top of the tick budget before the whole tick is abandoned.
const TICK_GRACE: Duration = Duration::from_millis(50);
const CONTROL_QUEUE: usize = 32;
/// Storage size is sampled for the status snapshot every N ticks.
const SIZE_SAMPLE_TICKS: u64 = 20;
const SAFE_MODE_RATIONALE: &str = "Safe Mode limits actions to read-only replies";

/// Handles returned to whoever embeds the runtime.
#[derive(Debug)]
pub struct RuntimeHandles {
    /// Producer side of the bounded stimulus queue.
    pub stimuli: StimulusSender,
    /// Executor side of the bounded action queue.
    pub actions: ActionReceiver,
    pub control: mpsc::Sender<ControlCommand>,
    pub status: watch::Receiver<RuntimeStatus>,
    pub shutdown: CancellationToken,
}

/// The cognition loop: perceive, route, interpret, decide, act, reflect.
pub struct Runtime {
    cfg: Arc<WardenCfg>,
    shutdown: ShutdownGuard,
    stimulus_rx: StimulusReceiver,
    stimulus_tx: StimulusSender,
    action_tx: ActionSender,
    control_rx: mpsc::Receiver<ControlCommand>,
    control_tx: mpsc::Sender<ControlCommand>,
    status_tx: watch::Sender<RuntimeStatus>,
    memory: Arc<MemoryStore>,
    identity: IdentityCore,
    router: SessionRouter,
    pool: InterpreterPool,
    governor: Governor,
    reflector: Reflector,
    auditor: ActionAuditor,
    breakers: SafetyBreakers,
    watchdog: Watchdog,
    cadence: Cadence,
    state: InternalState,
    tick_count: u64,
    started_at: Instant,
    last_tick_at: Instant,
    last_stimulus_at: Instant,
    last_location: Option<(String, String)>,
    last_overrun: Option<String>,
    seen_overflow: u64,
    storage: StorageSize,
}

impl Runtime {
    pub fn new(
        cfg: WardenCfg,
        memory: Arc<MemoryStore>,
        identity: IdentityCore,
        strategies: Vec<Arc<dyn Strategy>>,
    ) -> (Self, RuntimeHandles) {
        let cfg = Arc::new(cfg);
        let shutdown = ShutdownGuard::new();
        let (stimulus_tx, stimulus_rx) = input::channel(cfg.stimulus_queue_limit);
        let (action_tx, action_rx) = output::channel(cfg.action_queue_limit);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (status_tx, status_rx) = watch::channel(RuntimeStatus::default());

        let mut breakers = SafetyBreakers::from_cfg(&cfg);
        breakers.memory = memory.breaker();

        let now = Instant::now();
        let runtime = Self {
            shutdown: shutdown.clone(),
            stimulus_rx,
            stimulus_tx: stimulus_tx.clone(),
            action_tx,
            control_rx,
            control_tx: control_tx.clone(),
            status_tx,
            identity,
            router: SessionRouter::new(Duration::from_secs(cfg.session_ttl_secs), &cfg.address_name),
            pool: InterpreterPool::new(strategies, cfg.interpret_workers),
            governor: Governor::new(Arc::clone(&memory)),
            reflector: Reflector::new(
                Arc::clone(&memory),
                cfg.self_id.clone(),
                Duration::from_secs(cfg.session_ttl_secs),
            ),
            auditor: ActionAuditor::new(cfg.audit_capacity),
            breakers,
            watchdog: Watchdog::new(WatchdogThresholds::from_cfg(&cfg)),
            cadence: Cadence::from_cfg(&cfg),
            state: InternalState::new(cfg.start_in_safe_mode, cfg.max_llm_calls_per_tick),
            memory,
            tick_count: 0,
            started_at: now,
            last_tick_at: now,
            last_stimulus_at: now,
            last_location: None,
            last_overrun: None,
            seen_overflow: 0,
            storage: StorageSize::default(),
            cfg,
        };
        let handles = RuntimeHandles {
            stimuli: stimulus_tx,
            actions: action_rx,
            control: control_tx,
            status: status_rx,
            shutdown: shutdown.token(),
        };
        (runtime, handles)
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    pub fn is_safe_mode(&self) -> bool {
        self.state.safe_mode.is_active()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn state(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    /// Spawn background tasks and drive ticks until the shutdown token fires.
    pub async fn run(&mut self) {
        self.shutdown.spawn_signal_listener();
        let token = self.shutdown.token();

        let mut background = vec![memory::maintenance::spawn(
            Arc::clone(&self.memory),
            self.cfg.maintenance_interval_secs,
            self.control_tx.clone(),
            token.clone(),
        )];
        if let Some(settings) = ScanSettings::from_cfg(&self.cfg) {
            let scanner = LogScanner::new(settings, Arc::clone(&self.breakers.log_ingest));
            background.push(health::log_scan::spawn(
                scanner,
                self.stimulus_tx.clone(),
                self.control_tx.clone(),
                token.clone(),
            ));
        }

        tracing::info!(
            safe_mode = self.is_safe_mode(),
            strategies = ?self.pool.names(),
            "warden runtime started"
        );

        self.last_tick_at = Instant::now();
        loop {
            let interval = self.cadence.interval(self.is_safe_mode());
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(tick_count = self.tick_count, "shutdown signal received, exiting tick loop");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.run_tick(interval).await;
                }
            }
        }

        let grace = Duration::from_secs(self.cfg.shutdown_timeout_secs);
        self.shutdown.drain(grace).await;
        for handle in background {
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("background task did not stop within grace period");
            }
        }
        tracing::info!("warden runtime stopped");
    }

    /// One contained tick: the pipeline under its budget, then the watchdog.
    /// Faults and timeouts force safe mode; they never end the loop.
    ///
    /// Loop lag is the time since the previous tick started minus the expected
    /// interval, so a slow tick and a late wake-up both count.
    pub async fn run_tick(&mut self, expected_interval: Duration) {
        let tick_start = Instant::now();
        let gap = tick_start.saturating_duration_since(self.last_tick_at);
        let loop_lag = gap.saturating_sub(expected_interval);
        // the first gap is measured from construction, not from a previous tick
        let elapsed = if self.tick_count == 0 { gap.min(expected_interval) } else { gap };
        self.last_tick_at = tick_start;
        self.tick_count += 1;

        let budget = Duration::from_millis(self.cfg.tick_budget_ms);
        let deadline = tick_start + budget;
        let span = tracing::info_span!("tick", n = self.tick_count, safe_mode = self.is_safe_mode());
        let outcome = tokio::time::timeout(budget + TICK_GRACE, self.tick(deadline, elapsed))
            .instrument(span)
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "tick fault contained");
                self.enter_safe_mode(SafeModeTrigger::TickFault, e.to_string());
            }
            Err(_) => {
                let e = TickError::Timeout(self.cfg.tick_budget_ms);
                tracing::warn!(error = %e, "tick abandoned");
                self.enter_safe_mode(SafeModeTrigger::TickTimeout, e.to_string());
            }
        }

        self.check_watchdog(loop_lag);
        if self.tick_count % SIZE_SAMPLE_TICKS == 1 {
            self.storage = self.memory.size_info().await;
        }
        self.publish_status();
    }

    async fn tick(&mut self, deadline: Instant, elapsed: Duration) -> Result<(), TickError> {
        self.drain_control().await;

        self.state.decay(elapsed.as_secs_f32());
        self.state.reset_llm_budget();

        let overflow = self.stimulus_tx.overflow_count();
        if overflow > self.seen_overflow {
            self.seen_overflow = overflow;
            self.record_overrun("stimulus_queue_overflow", SafeModeTrigger::StimulusBacklog);
        }
        self.publish_status();

        for end in self.router.expire_stale() {
            self.reflect_session_end(&end).await;
        }

        if Instant::now() >= deadline {
            self.record_overrun("tick_deadline_before_perceive", SafeModeTrigger::TickTimeout);
            return Ok(());
        }

        let mut batch = self.perceive();
        if batch.is_empty() {
            if self.stimulus_tx.backlog() > 0 {
                self.record_overrun("stimulus_queue_backlog", SafeModeTrigger::StimulusBacklog);
            } else if let Some(silence) = self.silence() {
                batch.push(silence);
            }
        }

        for stimulus in batch {
            if Instant::now() >= deadline {
                self.record_overrun("tick_deadline", SafeModeTrigger::TickTimeout);
                break;
            }
            self.process(stimulus, deadline).await?;
        }
        Ok(())
    }

    fn perceive(&mut self) -> Vec<Stimulus> {
        let mut batch = Vec::new();
        while batch.len() < self.cfg.max_stimuli_per_tick {
            match self.stimulus_rx.try_recv() {
                Ok(s) => batch.push(s),
                Err(_) => break,
            }
        }
        if !batch.is_empty() {
            self.last_stimulus_at = Instant::now();
        }
        batch
    }

    /// A synthetic quiet-period stimulus once nothing has arrived for the silence gap.
    fn silence(&mut self) -> Option<Stimulus> {
        let idle = self.last_stimulus_at.elapsed();
        if idle < Duration::from_millis(self.cfg.silence_gap_ms) {
            return None;
        }
        self.last_stimulus_at = Instant::now();
        let salience = (idle.as_secs_f32() / 60.0).clamp(0.1, 0.7);
        let mut s = Stimulus::new(StimulusKind::Silence, "runtime", salience)
            .with("idle_secs", idle.as_secs());
        if let Some((server, channel)) = &self.last_location {
            s = s.with("server_id", server.clone()).with("channel_id", channel.clone());
        }
        Some(s)
    }

    async fn process(&mut self, mut stimulus: Stimulus, deadline: Instant) -> Result<(), TickError> {
        if let Some(channel) = stimulus.channel_id() {
            self.last_location = Some((stimulus.server_id().to_owned(), channel.to_owned()));
        }
        self.state.update_on_stimulus(&stimulus.kind, stimulus.salience);

        let routed = if stimulus.kind.is_system() {
            stimulus.routing = Routing::System;
            RouteOutcome { routing: Routing::System, session: None, ended: Vec::new() }
        } else {
            self.router.route(&mut stimulus)
        };
        for end in &routed.ended {
            self.reflect_session_end(end).await;
        }
        let session_active = routed.session.is_some();
        stimulus.context.insert("session_active".into(), session_active.into());
        if let Some(session) = &routed.session {
            stimulus.context.insert("session_start".into(), session.session_start.timestamp_millis().into());
            stimulus.context.insert("session_expires_at".into(), session.expires_at.timestamp_millis().into());
        }
        tracing::debug!(kind = %stimulus.kind, routing = stimulus.routing.as_str(), "stimulus routed");

        if stimulus.routing == Routing::Directed {
            let echoes = self.memory.echoes(&stimulus).await;
            if !echoes.is_empty() {
                let value = serde_json::to_value(&echoes).map_err(|e| TickError::Interpret(e.to_string()))?;
                stimulus.context.insert("memory_echoes".into(), value);
            }
        }

        let outputs = if stimulus.routing == Routing::Ambient && stimulus.kind.is_conversational() {
            Vec::new()
        } else {
            self.interpret(&stimulus, deadline).await
        };

        let directed = stimulus.routing == Routing::Directed || stimulus.mentions_bot() || session_active;
        let traits = self.identity.traits();
        let mut decision = self
            .governor
            .deliberate(stimulus.server_id(), &outputs, directed, &traits)
            .await;
        if stimulus.kind != StimulusKind::Silence {
            let audit_context = serde_json::json!({
                "stimulus_id": stimulus.id,
                "stimulus_type": stimulus.kind.as_str(),
                "routing": stimulus.routing.as_str(),
                "session_active": session_active,
                "strategy": decision.strategy,
                "confidence": decision.confidence,
                "risk": decision.risk,
            });
            decision.intent.metadata.insert("audit_context".into(), audit_context);
        }
        if self.is_safe_mode() && !decision.intent.action_type.allowed_in_safe_mode() {
            tracing::info!(blocked = decision.intent.action_type.as_str(), "safe mode blocked action");
            decision = safe_mode_block(decision);
        }

        let result = self.act(&decision.intent);
        self.auditor.log_decision(&stimulus, &outputs, &decision, &result);
        self.auditor.record(result.clone());

        let reflection = Reflection {
            stimulus: &stimulus,
            outputs: &outputs,
            decision: &decision,
            result: &result,
            safe_mode: self.state.safe_mode.is_active(),
        };
        if let Err(e) = self.reflector.reflect(&mut self.identity, reflection).await {
            tracing::warn!(error = %e, "reflection failed");
            self.enter_safe_mode(SafeModeTrigger::ReflectionFault, e.to_string());
        }
        Ok(())
    }

    async fn interpret(&mut self, stimulus: &Stimulus, deadline: Instant) -> Vec<StrategyOutput> {
        if self.pool.is_empty() {
            return Vec::new();
        }
        let ctx = Arc::new(StrategyContext {
            stimulus: stimulus.clone(),
            state: self.state.snapshot(),
            identity: self.identity.traits(),
            memory: Arc::clone(&self.memory),
            llm_budget: self.state.llm_budget.clone(),
            breakers: self.breakers.clone(),
        });
        let fan_in = self.pool.interpret(ctx, deadline).await;
        if fan_in.timed_out {
            self.record_overrun("interpret_timeout", SafeModeTrigger::InterpretTimeout);
        }
        fan_in.outputs
    }

    /// Hand an intent to the executor without waiting. Schedules are held here.
    fn act(&mut self, intent: &ActionIntent) -> ActionResult {
        if intent.action_type == ActionType::Schedule {
            return self.schedule(intent);
        }
        match self.action_tx.try_send(intent.clone()) {
            Ok(()) => ActionResult::ok(intent, "Queued for executor"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(action = intent.action_type.as_str(), "action queue full, dropped");
                self.record_overrun("action_queue_full", SafeModeTrigger::ActionQueueFull);
                ActionResult::failed(intent, ActionFailure::QueueFull, "Action queue saturated")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                ActionResult::failed(intent, ActionFailure::Rejected, "Action executor gone")
            }
        }
    }

    /// Spawn a tracked follow-up that enqueues the nested action after `delay_ms`.
    fn schedule(&mut self, intent: &ActionIntent) -> ActionResult {
        let Some((delay, nested)) = parse_schedule(intent) else {
            return ActionResult::failed(intent, ActionFailure::Rejected, "Invalid schedule payload");
        };
        if self.is_safe_mode() && !nested.action_type.allowed_in_safe_mode() {
            return ActionResult::failed(intent, ActionFailure::SafeModeBlocked, "Scheduled action blocked by safe mode");
        }
        let tx = self.action_tx.clone();
        let token = self.shutdown.token();
        let kind = nested.action_type.as_str();
        self.shutdown.tracker().spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(action = kind, "scheduled action cancelled by shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    if tx.try_send(nested).is_err() {
                        tracing::warn!(action = kind, "action queue full, scheduled action dropped");
                    }
                }
            }
        });
        ActionResult::ok(intent, format!("Scheduled {kind} in {}ms", delay.as_millis()))
    }

    async fn reflect_session_end(&mut self, end: &SessionEnd) {
        tracing::debug!(user = %end.session.user_id, reason = end.reason.as_str(), "session ended");
        self.reflector.reflect_session_end(&mut self.identity, end).await;
    }

    async fn drain_control(&mut self) {
        while let Ok(cmd) = self.control_rx.try_recv() {
            match cmd {
                ControlCommand::ExitSafeMode => {
                    if self.state.safe_mode.exit() {
                        self.memory.resume_writes();
                        self.cadence.clear_override();
                        tracing::info!("safe mode exited by operator");
                    }
                }
                ControlCommand::EnterSafeMode { trigger, reason } => {
                    if trigger == SafeModeTrigger::MemoryDisabled {
                        self.memory.suspend_writes();
                    }
                    self.enter_safe_mode(trigger, reason);
                }
                ControlCommand::EndSession { user, guild, channel } => {
                    if let Some(end) = self.router.end_session(&user, &guild, &channel) {
                        self.reflect_session_end(&end).await;
                    }
                }
            }
        }
    }

    fn enter_safe_mode(&mut self, trigger: SafeModeTrigger, reason: impl Into<String>) {
        if !self.state.enter_safe_mode(trigger, reason) {
            tracing::debug!(trigger = trigger.as_str(), "safe mode already active, trigger updated");
        }
    }

    /// Overruns degrade immediately: safe mode on, memory writes off.
    fn record_overrun(&mut self, reason: &str, trigger: SafeModeTrigger) {
        tracing::warn!(reason, "tick overrun");
        self.last_overrun = Some(reason.to_owned());
        self.memory.suspend_writes();
        self.enter_safe_mode(trigger, reason);
    }

    fn check_watchdog(&mut self, loop_lag: Duration) {
        match self.watchdog.check(loop_lag, self.stimulus_tx.backlog()) {
            Some(reason) => {
                tracing::warn!(reason = %reason, "watchdog throttling");
                self.memory.suspend_writes();
                self.cadence.set_override();
                self.enter_safe_mode(SafeModeTrigger::Watchdog, reason);
            }
            None => self.cadence.clear_override(),
        }
    }

    fn publish_status(&self) {
        let safe = self.is_safe_mode();
        let mb = |b: u64| b as f64 / (1024.0 * 1024.0);
        let status = RuntimeStatus {
            tick_count: self.tick_count,
            safe_mode: safe,
            safe_mode_reason: self.state.safe_mode.reason().map(str::to_owned),
            tick_interval_ms: self.cadence.interval(safe).as_millis() as u64,
            uptime_secs: self.started_at.elapsed().as_secs(),
            last_overrun: self.last_overrun.clone(),
            watchdog_note: self.watchdog.last_note().map(str::to_owned),
            tripped_breakers: self.breakers.tripped(),
            memory_writes_allowed: self.memory.writes_allowed(),
            memory_disabled: self.memory.disabled_reason(),
            hot_mb: mb(self.storage.hot_bytes),
            warm_mb: mb(self.storage.warm_bytes),
            last_rotation: self.memory.last_rotation(),
            stimulus_backlog: self.stimulus_tx.backlog(),
            action_backlog: self.action_tx.max_capacity() - self.action_tx.capacity(),
            active_sessions: self.router.active_count(),
        };
        // send only fails when every receiver is gone
        let _ = self.status_tx.send(status);
    }
}

fn safe_mode_block(decision: Decision) -> Decision {
    let blocked = decision.intent.action_type.as_str();
    Decision {
        intent: ActionIntent::observe()
            .with_metadata("reason", "safe_mode_block")
            .with_metadata("blocked_action", blocked),
        confidence: 0.3,
        risk: 0.05,
        rationale: SAFE_MODE_RATIONALE.to_owned(),
        strategy: decision.strategy,
        memory_bias: decision.memory_bias,
    }
}

/// `{"delay_ms": n, "action": {"type": .., "target_id": .., "payload": {..}}}`
fn parse_schedule(intent: &ActionIntent) -> Option<(Duration, ActionIntent)> {
    let delay = intent.payload.get("delay_ms")?.as_u64()?;
    let nested = intent.payload.get("action")?.as_object()?;
    let action_type = ActionType::parse(nested.get("type")?.as_str()?)?;
    if action_type == ActionType::Schedule {
        return None;
    }
    let target = nested
        .get("target_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| intent.target_id.clone());
    let mut out = ActionIntent::new(action_type, target).with_metadata("scheduled_by", intent.id.to_string());
    if let Some(Value::Object(payload)) = nested.get("payload") {
        out.payload = payload.clone();
    }
    Some((Duration::from_millis(delay), out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_payload_parses_nested_action() {
        let intent = ActionIntent::new(ActionType::Schedule, Some("c1".into()))
            .with_payload("delay_ms", 250)
            .with_payload(
                "action",
                serde_json::json!({"type": "send_message", "payload": {"content": "reminder"}}),
            );
        let (delay, nested) = parse_schedule(&intent).unwrap();
        assert_eq!(delay, Duration::from_millis(250));
        assert_eq!(nested.action_type, ActionType::SendMessage);
        assert_eq!(nested.target_id.as_deref(), Some("c1"));
        assert_eq!(nested.payload["content"], "reminder");
    }

    #[test]
    fn nested_schedules_are_rejected() {
        let intent = ActionIntent::new(ActionType::Schedule, None)
            .with_payload("delay_ms", 10)
            .with_payload("action", serde_json::json!({"type": "schedule"}));
        assert!(parse_schedule(&intent).is_none());
    }

    #[test]
    fn safe_mode_block_keeps_provenance() {
        let d = Decision {
            intent: ActionIntent::new(ActionType::ToolCall, None),
            confidence: 0.9,
            risk: 0.2,
            rationale: "admin".into(),
            strategy: Some("tools".into()),
            memory_bias: 0.1,
        };
        let blocked = safe_mode_block(d);
        assert_eq!(blocked.intent.action_type, ActionType::Observe);
        assert_eq!(blocked.intent.metadata["reason"], "safe_mode_block");
        assert_eq!(blocked.intent.metadata["blocked_action"], "tool_call");
        assert_eq!(blocked.rationale, SAFE_MODE_RATIONALE);
    }
}
