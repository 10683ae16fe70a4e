use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::types::ActionType;

/// One executed administrative action, kept for explain/undo.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub user_id: String,
    pub action_type: ActionType,
    pub targets: Value,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub reversible: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded per-user action history. The oldest entry is evicted first.
#[derive(Debug)]
pub struct ActionJournal {
    max_per_user: usize,
    entries: HashMap<String, VecDeque<JournalEntry>>,
}

impl ActionJournal {
    pub fn new(max_per_user: usize) -> Self {
        Self { max_per_user: max_per_user.max(1), entries: HashMap::new() }
    }

    pub fn record(
        &mut self,
        user_id: &str,
        action_type: ActionType,
        targets: Value,
        before: Option<Value>,
        after: Option<Value>,
        reversible: bool,
    ) -> &JournalEntry {
        let bucket = self.entries.entry(user_id.to_owned()).or_default();
        bucket.push_back(JournalEntry {
            user_id: user_id.to_owned(),
            action_type,
            targets,
            before,
            after,
            reversible,
            recorded_at: Utc::now(),
        });
        while bucket.len() > self.max_per_user {
            bucket.pop_front();
        }
        // just pushed, so never empty
        &bucket[bucket.len() - 1]
    }

    pub fn entries(&self, user_id: &str) -> impl Iterator<Item = &JournalEntry> {
        self.entries.get(user_id).into_iter().flatten()
    }

    pub fn last(&self, user_id: &str) -> Option<&JournalEntry> {
        self.entries.get(user_id)?.back()
    }

    pub fn last_reversible(&self, user_id: &str) -> Option<&JournalEntry> {
        self.entries.get(user_id)?.iter().rev().find(|e| e.reversible)
    }

    /// Remove and return the newest reversible entry (the one an undo would revert).
    pub fn pop_last_reversible(&mut self, user_id: &str) -> Option<JournalEntry> {
        let bucket = self.entries.get_mut(user_id)?;
        let idx = bucket.iter().rposition(|e| e.reversible)?;
        bucket.remove(idx)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn undo_takes_newest_reversible() {
        let mut j = ActionJournal::new(10);
        j.record("admin", ActionType::ToolCall, json!({"role": "a"}), None, None, true);
        j.record("admin", ActionType::ToolCall, json!({"role": "b"}), None, None, true);
        j.record("admin", ActionType::SendMessage, json!({}), None, None, false);

        assert_eq!(j.last("admin").unwrap().action_type, ActionType::SendMessage);
        assert_eq!(j.last_reversible("admin").unwrap().targets["role"], "b");
        let popped = j.pop_last_reversible("admin").unwrap();
        assert_eq!(popped.targets["role"], "b");
        assert_eq!(j.last_reversible("admin").unwrap().targets["role"], "a");
        assert!(j.pop_last_reversible("nobody").is_none());
    }

    #[test]
    fn oldest_entry_is_evicted_first() {
        let mut j = ActionJournal::new(2);
        for n in 1..=3 {
            j.record("admin", ActionType::ToolCall, json!({"n": n}), None, None, true);
        }
        j.record("other", ActionType::ToolCall, json!({"n": 9}), None, None, true);

        let kept: Vec<_> = j.entries("admin").map(|e| e.targets["n"].as_i64().unwrap()).collect();
        assert_eq!(kept, vec![2, 3]);
        assert_eq!(j.entries("other").count(), 1);
    }
}
