use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backend::{CausalRecord, MemoryError, Table};
use super::{MemoryStore, lock};
use crate::runtime::ControlCommand;
use crate::safety::SafeModeTrigger;

/// Free pages handed back to the filesystem per maintenance pass.
const RECLAIM_PAGES: u32 = 200;

/// What one maintenance pass observed and did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub hot_bytes: u64,
    pub warm_bytes: u64,
    pub disabled: Option<String>,
    /// Rows removed to bring tables back under their caps.
    pub trimmed: u64,
    /// Causal rows moved from the hot store to the warm archive.
    pub rotated: u64,
    pub archived_lines: usize,
    pub ran_at: Option<DateTime<Utc>>,
}

impl MemoryStore {
    /// Size check, table caps, hot-to-warm rotation, then space reclamation.
    ///
    /// Crossing the size ceiling disables the store; dropping back under it
    /// re-enables. Rotation appends to the archive before deleting hot rows.
    pub async fn maintain(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport { ran_at: Some(Utc::now()), ..Default::default() };

        let hot_bytes = self.backend.storage_bytes().await.unwrap_or(0);
        report.hot_bytes = hot_bytes;
        report.warm_bytes = self.archive.size_bytes();
        self.apply_size_ceiling(hot_bytes);
        report.disabled = self.disabled_reason();
        if report.disabled.is_some() {
            return report;
        }

        for table in Table::ALL {
            match self.enforce_table_limit(table).await {
                Ok(n) => report.trimmed += n,
                Err(e) => tracing::warn!(table = table.name(), error = %e, "table limit enforcement failed"),
            }
        }

        match self.rotate().await {
            Ok((rotated, lines)) => {
                report.rotated = rotated;
                report.archived_lines = lines;
                if rotated > 0 {
                    *lock(&self.last_rotation) = report.ran_at;
                    tracing::info!(rotated, archived_lines = lines, "hot memory rotated to warm archive");
                }
            }
            Err(e) => tracing::warn!(error = %e, "memory rotation failed"),
        }

        if let Err(e) = self.backend.reclaim(RECLAIM_PAGES).await {
            tracing::debug!(error = %e, "incremental vacuum skipped");
        }
        report
    }

    fn apply_size_ceiling(&self, hot_bytes: u64) {
        let mut disabled = lock(&self.disabled);
        if hot_bytes > self.settings.max_bytes {
            if disabled.is_none() {
                let reason = format!(
                    "memory size {:.1}MB exceeds ceiling {:.1}MB",
                    mb(hot_bytes),
                    mb(self.settings.max_bytes)
                );
                tracing::error!(reason = %reason, "memory disabled");
                *disabled = Some(reason);
            }
        } else if disabled.take().is_some() {
            tracing::info!(hot_mb = mb(hot_bytes), "memory back under ceiling, re-enabled");
        }
    }

    async fn enforce_table_limit(&self, table: Table) -> Result<u64, MemoryError> {
        let limit = table.limit(&self.settings.table_limits);
        let rows = self.backend.count_rows(table).await?;
        if rows <= limit {
            return Ok(0);
        }
        let removed = self.backend.delete_oldest(table, rows - limit).await?;
        tracing::info!(table = table.name(), removed, limit, "table trimmed to cap");
        Ok(removed)
    }

    /// Move the oldest causal rows out until the hot table is at or under its cap.
    async fn rotate(&self) -> Result<(u64, usize), MemoryError> {
        let cap = self.settings.hot_row_cap;
        let mut rotated = 0u64;
        let mut lines = 0usize;
        loop {
            let count = self.backend.count_rows(Table::Memory).await?;
            if count <= cap {
                break;
            }
            let take = self.settings.rotation_chunk.min(count - cap);
            let batch = self.backend.oldest_records(take).await?;
            if batch.is_empty() {
                break;
            }
            lines += self.archive.append(archive_lines(&batch)).await?;
            let ids: Vec<_> = batch.iter().map(|r| r.id).collect();
            let deleted = self.backend.delete_records(&ids).await?;
            rotated += deleted;
            if deleted == 0 {
                break;
            }
        }
        Ok((rotated, lines))
    }
}

/// Per-record summaries followed by one aggregate line for the batch.
fn archive_lines(batch: &[CausalRecord]) -> Vec<Value> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for r in batch {
        *counts.entry(r.stimulus_type.as_str()).or_default() += 1;
    }
    let first = batch.iter().map(|r| r.ts).min();
    let last = batch.iter().map(|r| r.ts).max();

    let mut lines: Vec<Value> = batch.iter().map(CausalRecord::summary).collect();
    lines.push(serde_json::json!({
        "summary": true,
        "count": batch.len(),
        "counts_by_type": counts,
        "ts_range": [first.map(|t| t.timestamp_millis()), last.map(|t| t.timestamp_millis())],
    }));
    lines
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Spawn the periodic maintenance task. A pass that leaves memory disabled
/// asks the runtime to enter safe mode.
pub fn spawn(
    store: Arc<MemoryStore>,
    interval_secs: u64,
    control: mpsc::Sender<ControlCommand>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(interval_secs.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("memory maintenance task shutting down");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let report = store.maintain().await;
            if let Some(reason) = report.disabled {
                let cmd = ControlCommand::EnterSafeMode {
                    trigger: SafeModeTrigger::MemoryDisabled,
                    reason,
                };
                if control.try_send(cmd).is_err() {
                    tracing::warn!("control channel full, dropped memory safe-mode request");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(kind: &str, ms: i64) -> CausalRecord {
        CausalRecord {
            id: uuid::Uuid::new_v4(),
            server_id: "g".into(),
            stimulus_type: kind.into(),
            context: serde_json::json!({"content_len": 3}),
            interpretations: Value::Null,
            decision: Value::Null,
            action: serde_json::json!({"type": "reply"}),
            outcome: serde_json::json!({"success": true}),
            confidence_delta: 0.2,
            ts: DateTime::from_timestamp_millis(ms).unwrap(),
        }
    }

    #[test]
    fn archive_lines_end_with_aggregate() {
        let batch = vec![rec("message", 10), rec("message", 30), rec("silence", 20)];
        let lines = archive_lines(&batch);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["decision"], "reply");
        assert!(lines[0].get("context").is_none());
        let agg = &lines[3];
        assert_eq!(agg["summary"], true);
        assert_eq!(agg["count"], 3);
        assert_eq!(agg["counts_by_type"]["message"], 2);
        assert_eq!(agg["ts_range"][0], 10);
        assert_eq!(agg["ts_range"][1], 30);
    }
}
