use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Environment variable prefix for overrides, e.g. `WARDEN_TICK_MS_NORMAL=250`.
pub const ENV_PREFIX: &str = "WARDEN_";

/// Failure-gate parameters for one circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub threshold: usize,
    pub window_secs: u64,
    pub cooldown_secs: u64,
}

impl BreakerSettings {
    pub const fn new(threshold: usize, window_secs: u64, cooldown_secs: u64) -> Self {
        Self { threshold, window_secs, cooldown_secs }
    }
}

/// Hard row caps per persisted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLimits {
    pub memory: u64,
    pub user_profiles: u64,
    pub relationships: u64,
    pub shared_context: u64,
    pub user_important: u64,
    pub server_profiles: u64,
    pub server_events: u64,
    pub identity_traits: u64,
}

impl Default for TableLimits {
    fn default() -> Self {
        Self {
            memory: 4000,
            user_profiles: 2000,
            relationships: 4000,
            shared_context: 2000,
            user_important: 2000,
            server_profiles: 500,
            server_events: 2000,
            identity_traits: 20,
        }
    }
}

/// All warden runtime parameters.
/// Defaults are overridden by `WARDEN_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenCfg {
    // tick cadence (ms)
    pub tick_ms_normal: u64,
    pub tick_ms_safe: u64,
    pub tick_ms_watchdog: u64,
    pub tick_budget_ms: u64,
    pub start_in_safe_mode: bool,

    // per-tick caps
    pub max_stimuli_per_tick: usize,
    pub interpret_workers: usize,
    pub max_llm_calls_per_tick: u32,
    pub silence_gap_ms: u64,

    // queues
    pub stimulus_queue_limit: usize,
    pub action_queue_limit: usize,

    // memory store
    pub memory_path: PathBuf,
    pub archive_path: PathBuf,
    pub retention_limit: usize,
    pub retention_days: i64,
    pub hot_row_cap: u64,
    pub hot_rotation_chunk: u64,
    pub memory_max_mb: u64,
    pub max_writes_per_second: usize,
    pub maintenance_interval_secs: u64,
    pub table_limits: TableLimits,

    // identity and sessions
    pub identity_learning_rate: f32,
    pub session_ttl_secs: u64,
    pub address_name: String,
    pub self_id: String,

    // watchdog
    pub watchdog_cpu_load_per_core: f64,
    pub watchdog_rss_mb: f64,
    pub watchdog_loop_lag_ms: u64,
    pub watchdog_queue_depth: usize,

    // log ingestion
    pub log_ingest_enabled: bool,
    pub log_ingest_path: Option<PathBuf>,
    pub log_scan_interval_secs: u64,
    pub log_ingest_max_lines: usize,
    pub log_ingest_max_bytes: u64,
    pub log_ingest_timeout_ms: u64,

    // action side
    pub max_actions_per_minute: usize,
    pub action_burst: usize,
    pub journal_max_per_user: usize,
    pub audit_capacity: usize,
    pub automod_dry_run: bool,
    pub tools_enabled: bool,
    pub admin_user_ids: Vec<String>,

    // breakers
    pub memory_breaker: BreakerSettings,
    pub log_ingest_breaker: BreakerSettings,
    pub text_generation_breaker: BreakerSettings,
    pub tool_breaker: BreakerSettings,

    // shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for WardenCfg {
    fn default() -> Self {
        Self {
            tick_ms_normal: 500,
            tick_ms_safe: 1000,
            tick_ms_watchdog: 1500,
            tick_budget_ms: 100,
            start_in_safe_mode: true,
            max_stimuli_per_tick: 4,
            interpret_workers: 6,
            max_llm_calls_per_tick: 1,
            silence_gap_ms: 12_000,
            stimulus_queue_limit: 200,
            action_queue_limit: 50,
            memory_path: PathBuf::from("data/warden.sqlite3"),
            archive_path: PathBuf::from("data/warden-warm.jsonl.gz"),
            retention_limit: 2000,
            retention_days: 3,
            hot_row_cap: 2000,
            hot_rotation_chunk: 400,
            memory_max_mb: 600,
            max_writes_per_second: 4,
            maintenance_interval_secs: 45,
            table_limits: TableLimits::default(),
            identity_learning_rate: 0.02,
            session_ttl_secs: 300,
            address_name: "warden".into(),
            self_id: "warden".into(),
            watchdog_cpu_load_per_core: 1.25,
            watchdog_rss_mb: 1024.0,
            watchdog_loop_lag_ms: 250,
            watchdog_queue_depth: 120,
            log_ingest_enabled: false,
            log_ingest_path: None,
            log_scan_interval_secs: 120,
            log_ingest_max_lines: 120,
            log_ingest_max_bytes: 64 * 1024,
            log_ingest_timeout_ms: 250,
            max_actions_per_minute: 20,
            action_burst: 5,
            journal_max_per_user: 25,
            audit_capacity: 2000,
            automod_dry_run: true,
            tools_enabled: false,
            admin_user_ids: Vec::new(),
            memory_breaker: BreakerSettings::new(5, 60, 180),
            log_ingest_breaker: BreakerSettings::new(3, 300, 900),
            text_generation_breaker: BreakerSettings::new(3, 90, 300),
            tool_breaker: BreakerSettings::new(3, 120, 300),
            shutdown_timeout_secs: 15,
        }
    }
}

impl WardenCfg {
    /// Defaults overlaid with every `WARDEN_*` variable in the process environment.
    pub fn from_env() -> Self {
        let map: HashMap<String, String> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix(ENV_PREFIX)
                    .map(|key| (key.to_ascii_lowercase(), v))
            })
            .collect();
        Self::from_map(&map)
    }

    /// Build from lowercase field-name keys. Unknown keys are ignored,
    /// unparsable values keep their default.
    pub fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        let t = d.table_limits;
        Self {
            tick_ms_normal: get_or(m, "tick_ms_normal", d.tick_ms_normal),
            tick_ms_safe: get_or(m, "tick_ms_safe", d.tick_ms_safe),
            tick_ms_watchdog: get_or(m, "tick_ms_watchdog", d.tick_ms_watchdog),
            tick_budget_ms: get_or(m, "tick_budget_ms", d.tick_budget_ms),
            start_in_safe_mode: get_or(m, "start_in_safe_mode", d.start_in_safe_mode),
            max_stimuli_per_tick: get_or(m, "max_stimuli_per_tick", d.max_stimuli_per_tick),
            interpret_workers: get_or(m, "interpret_workers", d.interpret_workers),
            max_llm_calls_per_tick: get_or(m, "max_llm_calls_per_tick", d.max_llm_calls_per_tick),
            silence_gap_ms: get_or(m, "silence_gap_ms", d.silence_gap_ms),
            stimulus_queue_limit: get_or(m, "stimulus_queue_limit", d.stimulus_queue_limit),
            action_queue_limit: get_or(m, "action_queue_limit", d.action_queue_limit),
            memory_path: get_or(m, "memory_path", d.memory_path),
            archive_path: get_or(m, "archive_path", d.archive_path),
            retention_limit: get_or(m, "retention_limit", d.retention_limit),
            retention_days: get_or(m, "retention_days", d.retention_days),
            hot_row_cap: get_or(m, "hot_row_cap", d.hot_row_cap),
            hot_rotation_chunk: get_or(m, "hot_rotation_chunk", d.hot_rotation_chunk),
            memory_max_mb: get_or(m, "memory_max_mb", d.memory_max_mb),
            max_writes_per_second: get_or(m, "max_writes_per_second", d.max_writes_per_second),
            maintenance_interval_secs: get_or(m, "maintenance_interval_secs", d.maintenance_interval_secs),
            table_limits: TableLimits {
                memory: get_or(m, "table_limit_memory", t.memory),
                user_profiles: get_or(m, "table_limit_user_profiles", t.user_profiles),
                relationships: get_or(m, "table_limit_relationships", t.relationships),
                shared_context: get_or(m, "table_limit_shared_context", t.shared_context),
                user_important: get_or(m, "table_limit_user_important", t.user_important),
                server_profiles: get_or(m, "table_limit_server_profiles", t.server_profiles),
                server_events: get_or(m, "table_limit_server_events", t.server_events),
                identity_traits: get_or(m, "table_limit_identity_traits", t.identity_traits),
            },
            identity_learning_rate: get_or(m, "identity_learning_rate", d.identity_learning_rate),
            session_ttl_secs: get_or(m, "session_ttl_secs", d.session_ttl_secs),
            address_name: get_or(m, "address_name", d.address_name),
            self_id: get_or(m, "self_id", d.self_id),
            watchdog_cpu_load_per_core: get_or(m, "watchdog_cpu_load_per_core", d.watchdog_cpu_load_per_core),
            watchdog_rss_mb: get_or(m, "watchdog_rss_mb", d.watchdog_rss_mb),
            watchdog_loop_lag_ms: get_or(m, "watchdog_loop_lag_ms", d.watchdog_loop_lag_ms),
            watchdog_queue_depth: get_or(m, "watchdog_queue_depth", d.watchdog_queue_depth),
            log_ingest_enabled: get_or(m, "log_ingest_enabled", d.log_ingest_enabled),
            log_ingest_path: m
                .get("log_ingest_path")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .or(d.log_ingest_path),
            log_scan_interval_secs: get_or(m, "log_scan_interval_secs", d.log_scan_interval_secs),
            log_ingest_max_lines: get_or(m, "log_ingest_max_lines", d.log_ingest_max_lines),
            log_ingest_max_bytes: get_or(m, "log_ingest_max_bytes", d.log_ingest_max_bytes),
            log_ingest_timeout_ms: get_or(m, "log_ingest_timeout_ms", d.log_ingest_timeout_ms),
            max_actions_per_minute: get_or(m, "max_actions_per_minute", d.max_actions_per_minute),
            action_burst: get_or(m, "action_burst", d.action_burst),
            journal_max_per_user: get_or(m, "journal_max_per_user", d.journal_max_per_user),
            audit_capacity: get_or(m, "audit_capacity", d.audit_capacity),
            automod_dry_run: get_or(m, "automod_dry_run", d.automod_dry_run),
            tools_enabled: get_or(m, "tools_enabled", d.tools_enabled),
            admin_user_ids: m
                .get("admin_user_ids")
                .map(|v| split_list(v))
                .unwrap_or(d.admin_user_ids),
            memory_breaker: breaker_or(m, "memory_breaker", d.memory_breaker),
            log_ingest_breaker: breaker_or(m, "log_ingest_breaker", d.log_ingest_breaker),
            text_generation_breaker: breaker_or(m, "text_generation_breaker", d.text_generation_breaker),
            tool_breaker: breaker_or(m, "tool_breaker", d.tool_breaker),
            shutdown_timeout_secs: get_or(m, "shutdown_timeout_secs", d.shutdown_timeout_secs),
        }
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_user_ids.iter().any(|id| id == user_id)
    }
}

fn get_or<T: std::str::FromStr>(m: &HashMap<String, String>, key: &str, default: T) -> T {
    m.get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn breaker_or(m: &HashMap<String, String>, prefix: &str, d: BreakerSettings) -> BreakerSettings {
    BreakerSettings {
        threshold: get_or(m, &format!("{prefix}_threshold"), d.threshold),
        window_secs: get_or(m, &format!("{prefix}_window_secs"), d.window_secs),
        cooldown_secs: get_or(m, &format!("{prefix}_cooldown_secs"), d.cooldown_secs),
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = WardenCfg::default();
        assert_eq!(cfg.tick_ms_normal, 500);
        assert_eq!(cfg.tick_budget_ms, 100);
        assert_eq!(cfg.hot_row_cap, 2000);
        assert_eq!(cfg.max_writes_per_second, 4);
        assert_eq!(cfg.memory_breaker, BreakerSettings::new(5, 60, 180));
        assert!(cfg.start_in_safe_mode);
    }

    #[test]
    fn from_map_overrides_and_falls_back() {
        let mut m = HashMap::new();
        m.insert("tick_ms_normal".to_string(), "250".to_string());
        m.insert("hot_row_cap".to_string(), "not_a_number".to_string());
        m.insert("table_limit_memory".to_string(), "10".to_string());
        m.insert("memory_breaker_threshold".to_string(), "2".to_string());
        m.insert("admin_user_ids".to_string(), "u1, u2,,".to_string());
        let cfg = WardenCfg::from_map(&m);
        assert_eq!(cfg.tick_ms_normal, 250);
        assert_eq!(cfg.hot_row_cap, 2000);
        assert_eq!(cfg.table_limits.memory, 10);
        assert_eq!(cfg.memory_breaker.threshold, 2);
        assert_eq!(cfg.memory_breaker.window_secs, 60);
        assert!(cfg.is_admin("u2"));
        assert!(!cfg.is_admin(""));
    }

    #[test]
    fn empty_log_path_is_none() {
        let mut m = HashMap::new();
        m.insert("log_ingest_path".to_string(), "  ".to_string());
        assert!(WardenCfg::from_map(&m).log_ingest_path.is_none());
    }
}
