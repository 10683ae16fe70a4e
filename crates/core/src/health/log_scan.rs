use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WardenCfg;
use crate::io::input::StimulusSender;
use crate::runtime::ControlCommand;
use crate::safety::{CircuitBreaker, SafeModeTrigger};
use crate::types::{Routing, Stimulus, StimulusKind};

const ERROR_SAMPLE: usize = 5;

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub path: PathBuf,
    pub interval: Duration,
    pub max_lines: usize,
    pub max_bytes: u64,
    pub timeout: Duration,
}

impl ScanSettings {
    /// `None` unless ingestion is enabled and a log path is configured.
    pub fn from_cfg(cfg: &WardenCfg) -> Option<Self> {
        if !cfg.log_ingest_enabled {
            return None;
        }
        Some(Self {
            path: cfg.log_ingest_path.clone()?,
            interval: Duration::from_secs(cfg.log_scan_interval_secs.max(1)),
            max_lines: cfg.log_ingest_max_lines,
            max_bytes: cfg.log_ingest_max_bytes,
            timeout: Duration::from_millis(cfg.log_ingest_timeout_ms),
        })
    }
}

/// Tails a process error log and turns new error lines into `self_health` stimuli.
#[derive(Debug)]
pub struct LogScanner {
    settings: ScanSettings,
    breaker: Arc<CircuitBreaker>,
    last_len: u64,
}

#[derive(Debug)]
pub enum ScanOutcome {
    Unchanged,
    Clean,
    Errors(Stimulus),
    Skipped,
    TimedOut,
}

impl LogScanner {
    pub fn new(settings: ScanSettings, breaker: Arc<CircuitBreaker>) -> Self {
        Self { settings, breaker, last_len: 0 }
    }

    pub async fn scan_once(&mut self) -> ScanOutcome {
        if !self.breaker.allow() {
            return ScanOutcome::Skipped;
        }
        let path = self.settings.path.clone();
        let (max_bytes, max_lines) = (self.settings.max_bytes, self.settings.max_lines);
        let read = tokio::task::spawn_blocking(move || read_tail(&path, max_bytes, max_lines));
        let (len, lines) = match tokio::time::timeout(self.settings.timeout, read).await {
            Err(_) => {
                self.breaker.record_failure("log read timed out");
                return ScanOutcome::TimedOut;
            }
            Ok(Err(e)) => {
                self.breaker.record_failure(e.to_string());
                return ScanOutcome::Skipped;
            }
            Ok(Ok(Err(e))) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, path = %self.settings.path.display(), "log read failed");
                    self.breaker.record_failure(e.to_string());
                }
                return ScanOutcome::Skipped;
            }
            Ok(Ok(Ok(tail))) => tail,
        };
        self.breaker.record_success();

        if len == self.last_len {
            return ScanOutcome::Unchanged;
        }
        self.last_len = len;

        let errors: Vec<String> = lines.into_iter().filter(|l| is_error_line(l)).collect();
        if errors.is_empty() {
            return ScanOutcome::Clean;
        }
        ScanOutcome::Errors(health_stimulus(&self.settings.path, &errors))
    }
}

fn is_error_line(line: &str) -> bool {
    line.contains("Traceback") || line.contains("Error") || line.to_lowercase().contains("exception")
}

fn health_stimulus(path: &Path, errors: &[String]) -> Stimulus {
    let sample = &errors[errors.len().saturating_sub(ERROR_SAMPLE)..];
    let mut s = Stimulus::new(StimulusKind::SelfHealth, "log_ingest", (0.2 + 0.05 * errors.len() as f32).min(1.0))
        .with("log_path", path.display().to_string())
        .with("error_sample", sample.to_vec())
        .with("count", errors.len());
    s.routing = Routing::System;
    s
}

/// Read at most `max_bytes` from the end of the file and keep the last `max_lines`.
fn read_tail(path: &Path, max_bytes: u64, max_lines: usize) -> std::io::Result<(u64, Vec<String>)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if max_bytes > 0 {
        file.seek(SeekFrom::Start(len.saturating_sub(max_bytes)))?;
    }
    let mut lines = Vec::new();
    for line in BufReader::new(file).split(b'\n') {
        lines.push(String::from_utf8_lossy(&line?).into_owned());
    }
    if max_lines > 0 && lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
    }
    Ok((len, lines))
}

/// Run the scanner until cancelled. A slow read disables ingestion for the
/// rest of the process and asks the runtime to enter safe mode.
pub fn spawn(
    mut scanner: LogScanner,
    stimuli: StimulusSender,
    control: mpsc::Sender<ControlCommand>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = scanner.settings.interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("log ingest task shutting down");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            match scanner.scan_once().await {
                ScanOutcome::Errors(stimulus) => {
                    let _ = stimuli.try_submit(stimulus);
                }
                ScanOutcome::TimedOut => {
                    tracing::warn!("log ingest too slow, disabling");
                    let cmd = ControlCommand::EnterSafeMode {
                        trigger: SafeModeTrigger::LogIngest,
                        reason: "log ingest timed out".into(),
                    };
                    if control.try_send(cmd).is_err() {
                        tracing::warn!("control channel full, dropped log-ingest safe-mode request");
                    }
                    return;
                }
                _ => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn scanner(path: PathBuf) -> LogScanner {
        let settings = ScanSettings {
            path,
            interval: Duration::from_secs(1),
            max_lines: 50,
            max_bytes: 4096,
            timeout: Duration::from_secs(2),
        };
        LogScanner::new(settings, Arc::new(CircuitBreaker::new("log_ingest", 3, 300, 900)))
    }

    #[tokio::test]
    async fn emits_health_stimulus_for_new_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app-error.log");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "starting").unwrap();
        writeln!(f, "ValueError: bad input").unwrap();
        writeln!(f, "Unhandled exception in task").unwrap();
        f.sync_all().unwrap();

        let mut sc = scanner(path.clone());
        let ScanOutcome::Errors(s) = sc.scan_once().await else {
            panic!("expected errors");
        };
        assert_eq!(s.kind, StimulusKind::SelfHealth);
        assert_eq!(s.routing, Routing::System);
        assert_eq!(s.context["count"], 2);
        assert!((s.salience - 0.3).abs() < 1e-6);

        assert!(matches!(sc.scan_once().await, ScanOutcome::Unchanged));
    }

    #[tokio::test]
    async fn missing_file_is_skipped_without_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut sc = scanner(dir.path().join("absent.log"));
        assert!(matches!(sc.scan_once().await, ScanOutcome::Skipped));
        assert!(!sc.breaker.is_tripped());
    }

    #[test]
    fn tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l.log");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        let (len, lines) = read_tail(&path, 0, 2).unwrap();
        assert_eq!(len, 8);
        assert_eq!(lines, vec!["c", "d"]);
    }
}
