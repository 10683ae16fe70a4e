mod repl;

use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use warden_core::cognition::{IntentResolver, NoIntentResolver, strategies};
use warden_core::identity::{IdentityCore, IdentityStore};
use warden_core::memory::MemoryStore;
use warden_core::safety::CircuitBreaker;
use warden_core::{Runtime, WardenCfg};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing: JSON to a file when WARDEN_LOG_FILE is set, so the prompt stays readable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match std::env::var("WARDEN_LOG_FILE") {
        Ok(path) => {
            let file = std::fs::File::create(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true).with_writer(file))
                .init();
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .init();
        }
    }

    let cfg = WardenCfg::from_env();
    let memory_breaker = Arc::new(CircuitBreaker::from_settings("memory", cfg.memory_breaker));
    let memory = Arc::new(MemoryStore::open(&cfg, memory_breaker).await?);

    let identity = IdentityCore::load(
        Arc::clone(&memory) as Arc<dyn IdentityStore>,
        cfg.identity_learning_rate,
    )
    .await;

    // No text-generation client is wired in the local console; social replies use the fallback.
    let resolver: Arc<dyn IntentResolver> = Arc::new(NoIntentResolver);
    let strategies = strategies::default_set(&cfg, None, resolver);

    let console = repl::ConsoleSettings::from_cfg(&cfg);
    let (mut runtime, handles) = Runtime::new(cfg, memory, identity, strategies);
    let token = runtime.token();

    // Run both futures on this task. Whichever finishes first cancels the other,
    // then we wait for it to wind down.
    let runtime_fut = runtime.run();
    let repl_fut = repl::run(handles, console, token.clone());
    tokio::pin!(runtime_fut);
    tokio::pin!(repl_fut);

    let mut runtime_done = false;
    let mut repl_result: Option<anyhow::Result<()>> = None;

    loop {
        tokio::select! {
            _ = &mut runtime_fut, if !runtime_done => {
                runtime_done = true;
                token.cancel();
                if repl_result.is_none() {
                    repl_result = Some((&mut repl_fut).await);
                }
            }
            result = &mut repl_fut, if repl_result.is_none() => {
                repl_result = Some(result);
                token.cancel();
            }
        }

        if runtime_done && repl_result.is_some() {
            break;
        }
    }

    repl_result.unwrap_or(Ok(()))
}
