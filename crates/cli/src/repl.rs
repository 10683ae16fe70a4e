use std::io::{self, Write};

use rustyline::error::ReadlineError;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use warden_core::actions::{ActionJournal, ActionRateLimiter};
use warden_core::types::{ActionIntent, ActionType};
use warden_core::{ControlCommand, RuntimeHandles, WardenCfg};

const GUILD: &str = "local";
const CHANNEL: &str = "repl";
const OPERATOR: &str = "operator";

const HELP: &str = "\
commands:
  /status      print the runtime status snapshot
  /safe        enter safe mode
  /exit-safe   leave safe mode
  /end         end your conversation session
  /journal    list your journaled tool requests
  /undo        drop the last reversible tool request from the journal
  /quit        stop the runtime and exit
anything else is sent as a chat message; address the bot by name to start a session.";

/// Console-side limits, applied before anything reaches the terminal.
#[derive(Debug, Clone)]
pub struct ConsoleSettings {
    address_name: String,
    max_actions_per_minute: usize,
    action_burst: usize,
    journal_max_per_user: usize,
}

impl ConsoleSettings {
    pub fn from_cfg(cfg: &WardenCfg) -> Self {
        Self {
            address_name: cfg.address_name.clone(),
            max_actions_per_minute: cfg.max_actions_per_minute,
            action_burst: cfg.action_burst,
            journal_max_per_user: cfg.journal_max_per_user,
        }
    }
}

/// Local executor for the action queue: prints what a chat adapter would send.
struct Console {
    limiter: ActionRateLimiter,
    journal: ActionJournal,
    name: String,
}

impl Console {
    fn new(settings: &ConsoleSettings) -> Self {
        Self {
            limiter: ActionRateLimiter::new(settings.max_actions_per_minute, settings.action_burst),
            journal: ActionJournal::new(settings.journal_max_per_user),
            name: settings.address_name.clone(),
        }
    }

    fn execute(&mut self, intent: ActionIntent) {
        let key = intent.target_id.clone().unwrap_or_else(|| CHANNEL.to_owned());
        match intent.action_type {
            ActionType::Observe => {
                if let Some(reason) = intent.metadata.get("reason").and_then(Value::as_str) {
                    println!("[{}] (observing: {reason})", self.name);
                }
                tracing::debug!(intent = %intent.id, "observe");
            }
            ActionType::Reply | ActionType::SendMessage => {
                if !self.limiter.allow(&key) {
                    tracing::warn!(target_id = %key, "action rate limited, dropped");
                    return;
                }
                let content = intent.payload.get("content").and_then(Value::as_str).unwrap_or_default();
                println!("[{}] {content}", self.name);
            }
            ActionType::React => {
                let emoji = intent.payload.get("emoji").and_then(Value::as_str).unwrap_or("+1");
                println!("[{}] reacted {emoji}", self.name);
            }
            ActionType::Defer => {
                println!("[{}] (deferred for review)", self.name);
            }
            ActionType::ToolCall => {
                let tool = intent.payload.get("tool").and_then(Value::as_str).unwrap_or("unknown");
                let requester = intent
                    .payload
                    .get("requested_by")
                    .and_then(Value::as_str)
                    .unwrap_or(OPERATOR)
                    .to_owned();
                let reversible = intent.metadata.get("reversible").and_then(Value::as_bool).unwrap_or(false);
                let args = intent.payload.get("args").cloned().unwrap_or(Value::Null);
                self.journal.record(&requester, ActionType::ToolCall, args.clone(), None, None, reversible);
                println!("[{}] tool request {tool} {args} (no executor attached)", self.name);
            }
            ActionType::Schedule => {
                tracing::warn!(intent = %intent.id, "schedule reached the executor; expected the runtime to expand it");
            }
        }
    }

    fn print_journal(&self, user: &str) {
        let mut any = false;
        for entry in self.journal.entries(user) {
            any = true;
            let mark = if entry.reversible { "reversible" } else { "final" };
            println!(
                "{} {} {} ({mark})",
                entry.recorded_at.format("%H:%M:%S"),
                entry.action_type.as_str(),
                entry.targets
            );
        }
        if !any {
            println!("journal is empty");
        }
    }

    fn undo(&mut self, user: &str) {
        match self.journal.pop_last_reversible(user) {
            Some(entry) => println!("undone: {} {}", entry.action_type.as_str(), entry.targets),
            None => println!("nothing reversible to undo"),
        }
    }
}

enum InputEvent {
    Line(String),
    Interrupted,
    Eof,
    Error(String),
}

/// Drive the console until the user quits or the runtime stops.
pub async fn run(handles: RuntimeHandles, settings: ConsoleSettings, token: CancellationToken) -> anyhow::Result<()> {
    let RuntimeHandles { stimuli, mut actions, control, status, .. } = handles;
    let mut console = Console::new(&settings);

    println!("{HELP}");
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<InputEvent>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
    spawn_input_thread(line_tx, ready_rx);
    request_next_prompt(&ready_tx);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            intent = actions.recv() => {
                let Some(intent) = intent else {
                    break;
                };
                console.execute(intent);
                io::stdout().flush()?;
            }
            line = line_rx.recv() => {
                let Some(line) = line else {
                    break;
                };
                match line {
                    InputEvent::Line(line) => {
                        let text = line.trim();
                        match text {
                            "" => {}
                            "/q" | "/quit" | "/exit" => break,
                            "/help" => println!("{HELP}"),
                            "/status" => {
                                let snapshot = status.borrow().clone();
                                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                            }
                            "/safe" => {
                                if control.send(ControlCommand::enter_manual("operator request")).await.is_err() {
                                    break;
                                }
                            }
                            "/exit-safe" => {
                                if control.send(ControlCommand::ExitSafeMode).await.is_err() {
                                    break;
                                }
                            }
                            "/end" => {
                                let cmd = ControlCommand::EndSession {
                                    user: OPERATOR.to_owned(),
                                    guild: GUILD.to_owned(),
                                    channel: CHANNEL.to_owned(),
                                };
                                if control.send(cmd).await.is_err() {
                                    break;
                                }
                            }
                            "/journal" => console.print_journal(OPERATOR),
                            "/undo" => console.undo(OPERATOR),
                            _ => {
                                if let Err(e) = stimuli.submit_message(GUILD, CHANNEL, OPERATOR, text) {
                                    eprintln!("message dropped: {e}");
                                }
                            }
                        }
                        request_next_prompt(&ready_tx);
                    }
                    InputEvent::Interrupted => {
                        token.cancel();
                        break;
                    }
                    InputEvent::Eof => break,
                    InputEvent::Error(err) => {
                        eprintln!("input error: {err}");
                        break;
                    }
                }
            }
        }
    }
    drop(ready_tx);
    println!();
    Ok(())
}

fn request_next_prompt(ready_tx: &std::sync::mpsc::Sender<()>) {
    let _ = ready_tx.send(());
}

fn spawn_input_thread(line_tx: mpsc::UnboundedSender<InputEvent>, ready_rx: std::sync::mpsc::Receiver<()>) {
    std::thread::spawn(move || {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.send(InputEvent::Error(e.to_string()));
                return;
            }
        };

        while ready_rx.recv().is_ok() {
            match editor.readline("> ") {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    if line_tx.send(InputEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    let _ = line_tx.send(InputEvent::Interrupted);
                    break;
                }
                Err(ReadlineError::Eof) => {
                    let _ = line_tx.send(InputEvent::Eof);
                    break;
                }
                Err(e) => {
                    let _ = line_tx.send(InputEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn console() -> Console {
        Console::new(&ConsoleSettings {
            address_name: "warden".into(),
            max_actions_per_minute: 10,
            action_burst: 5,
            journal_max_per_user: 2,
        })
    }

    #[test]
    fn tool_requests_are_journaled_per_requester() {
        let mut c = console();
        let intent = ActionIntent::new(ActionType::ToolCall, None)
            .with_payload("tool", "timeout_user")
            .with_payload("args", json!({"user": "u9"}))
            .with_payload("requested_by", "admin")
            .with_metadata("reversible", true);
        c.execute(intent);
        assert!(c.journal.last_reversible("admin").is_some());
        assert!(c.journal.last("operator").is_none());
    }

    #[test]
    fn undo_pops_reversible_entries_only() {
        let mut c = console();
        c.journal.record(OPERATOR, ActionType::ToolCall, json!({}), None, None, false);
        c.undo(OPERATOR);
        assert!(c.journal.last(OPERATOR).is_some());
        c.journal.record(OPERATOR, ActionType::ToolCall, json!({"n": 2}), None, None, true);
        c.undo(OPERATOR);
        assert!(c.journal.last_reversible(OPERATOR).is_none());
    }
}
