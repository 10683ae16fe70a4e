use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::strategy::{Strategy, StrategyContext};
use crate::types::StrategyOutput;

/// Fan-in result for one stimulus. Outputs keep strategy order.
#[derive(Debug, Default)]
pub struct FanIn {
    pub outputs: Vec<StrategyOutput>,
    /// The deadline passed with strategies still running.
    pub timed_out: bool,
    /// Strategies that produced nothing (cancelled at the deadline or failed).
    pub missing: Vec<&'static str>,
    pub failed: usize,
}

/// Runs every strategy concurrently for one stimulus, bounded by a worker limit
/// and a hard deadline. Work still pending at the deadline is aborted.
pub struct InterpreterPool {
    strategies: Vec<Arc<dyn Strategy>>,
    workers: Arc<Semaphore>,
}

impl std::fmt::Debug for InterpreterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterPool")
            .field("strategies", &self.names())
            .field("available_workers", &self.workers.available_permits())
            .finish()
    }
}

impl InterpreterPool {
    pub fn new(strategies: Vec<Arc<dyn Strategy>>, workers: usize) -> Self {
        Self { strategies, workers: Arc::new(Semaphore::new(workers.max(1))) }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub async fn interpret(&self, ctx: Arc<StrategyContext>, deadline: Instant) -> FanIn {
        let mut set = JoinSet::new();
        for (idx, strategy) in self.strategies.iter().enumerate() {
            let strategy = Arc::clone(strategy);
            let ctx = Arc::clone(&ctx);
            let workers = Arc::clone(&self.workers);
            set.spawn(async move {
                // Closed semaphore only happens on drop; run unbounded rather than skip.
                let _permit = workers.acquire_owned().await.ok();
                (idx, strategy.interpret(&ctx).await)
            });
        }

        let mut slots: Vec<Option<StrategyOutput>> = vec![None; self.strategies.len()];
        let mut fan_in = FanIn::default();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((idx, output)))) => slots[idx] = Some(output),
                Ok(Some(Err(e))) => {
                    fan_in.failed += 1;
                    tracing::warn!(error = %e, "strategy task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    fan_in.timed_out = true;
                    set.abort_all();
                    break;
                }
            }
        }

        for (strategy, slot) in self.strategies.iter().zip(slots) {
            match slot {
                Some(output) => fan_in.outputs.push(output),
                None => fan_in.missing.push(strategy.name()),
            }
        }
        if fan_in.timed_out {
            tracing::warn!(missing = ?fan_in.missing, "interpretation deadline reached, pending strategies cancelled");
        }
        fan_in
    }
}
