//! History store & checkpoint.
//!
//! An append-only JSONL file of [`HistoryRecord`]s plus a small JSON
//! checkpoint file for cross-restart state (`last_rebalance_ts` per
//! upkeep). The persisted state here is a flat, append-only log and a
//! handful of key-value pairs — a relational schema buys nothing a
//! JSONL file and a JSON blob don't already give us (see DESIGN.md).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::model::Decision;
use crate::orchestrator::message::CrossChainMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryRecord {
    Decision { recorded_at: DateTime<Utc>, decision: Decision },
    Message { recorded_at: DateTime<Utc>, message: CrossChainMessage },
}

impl HistoryRecord {
    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            HistoryRecord::Decision { recorded_at, .. } => *recorded_at,
            HistoryRecord::Message { recorded_at, .. } => *recorded_at,
        }
    }
}

/// Appends every `HistoryRecord` to `history_path` and keeps the most
/// recent `capacity` of them in memory for the `explain` CLI command and
/// any in-process lookup-by-id.
pub struct HistoryStore {
    path: PathBuf,
    capacity: usize,
    recent: Mutex<VecDeque<HistoryRecord>>,
    file: Mutex<File>,
}

impl HistoryStore {
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut recent = VecDeque::with_capacity(capacity.max(1));
        if let Ok(existing) = File::open(&path) {
            for line in BufReader::new(existing).lines().flatten() {
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok(record) = serde_json::from_str::<HistoryRecord>(&line) {
                    if recent.len() >= capacity.max(1) {
                        recent.pop_front();
                    }
                    recent.push_back(record);
                }
            }
        }

        Ok(Self {
            path,
            capacity: capacity.max(1),
            recent: Mutex::new(recent),
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, record: HistoryRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(&record)?;
        {
            let mut file = self.file.lock();
            writeln!(file, "{line}")?;
            file.flush()?;
        }
        let mut recent = self.recent.lock();
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(record);
        Ok(())
    }

    pub fn recent(&self, limit: usize) -> Vec<HistoryRecord> {
        let recent = self.recent.lock();
        recent.iter().rev().take(limit).cloned().collect()
    }

    /// Finds a `Message` record by `message_id`, newest first — used by
    /// the `explain` CLI command.
    pub fn find_message(&self, message_id: &str) -> Option<CrossChainMessage> {
        self.recent.lock().iter().rev().find_map(|r| match r {
            HistoryRecord::Message { message, .. } if message.message_id == message_id => Some(message.clone()),
            _ => None,
        })
    }

    /// Finds a `Decision` record by its id, newest first — used by the
    /// `explain` CLI command to surface a decision's reasoning.
    pub fn find_decision(&self, id: &str) -> Option<Decision> {
        self.recent.lock().iter().rev().find_map(|r| match r {
            HistoryRecord::Decision { decision, .. } if decision.id == id => Some(decision.clone()),
            _ => None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Small durable key-value checkpoint, persisted as one JSON object.
/// Used for `last_rebalance_ts` per upkeep so a restart doesn't replay
/// the full evaluation history from scratch.
pub struct CheckpointStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl CheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> std::io::Result<()> {
        let mut values = self.values.lock();
        values.insert(key.into(), value.into());
        let text = serde_json::to_string_pretty(&*values)?;
        std::fs::write(&self.path, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DecisionAction;

    #[test]
    fn append_and_reload_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let store = HistoryStore::open(&path, 10).unwrap();
        store
            .append(HistoryRecord::Decision {
                recorded_at: Utc::now(),
                decision: Decision::hold(vec!["test".into()], Utc::now()),
            })
            .unwrap();
        drop(store);

        let reopened = HistoryStore::open(&path, 10).unwrap();
        let records = reopened.recent(10);
        assert_eq!(records.len(), 1);
        match &records[0] {
            HistoryRecord::Decision { decision, .. } => assert_eq!(decision.action, DecisionAction::Hold),
            _ => panic!("expected decision record"),
        }
    }

    #[test]
    fn find_decision_looks_up_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = HistoryStore::open(&path, 10).unwrap();
        let decision = Decision::hold(vec!["test".into()], Utc::now());
        let id = decision.id.clone();
        store
            .append(HistoryRecord::Decision {
                recorded_at: Utc::now(),
                decision,
            })
            .unwrap();

        let found = store.find_decision(&id).expect("decision found");
        assert_eq!(found.id, id);
        assert!(store.find_decision("missing").is_none());
    }

    #[test]
    fn recent_is_bounded_by_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = HistoryStore::open(&path, 2).unwrap();
        for i in 0..5 {
            store
                .append(HistoryRecord::Decision {
                    recorded_at: Utc::now(),
                    decision: Decision::hold(vec![format!("entry {i}")], Utc::now()),
                })
                .unwrap();
        }
        assert_eq!(store.recent(10).len(), 2);
    }

    #[test]
    fn checkpoint_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        {
            let store = CheckpointStore::open(&path).unwrap();
            store.set("last_rebalance_ts:u1", "2026-01-01T00:00:00Z").unwrap();
        }
        let reopened = CheckpointStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("last_rebalance_ts:u1"),
            Some("2026-01-01T00:00:00Z".to_string())
        );
    }
}
