//! Run-scoped log sink.
//!
//! Entries carry a sequence number instead of a timestamp so two equal runs
//! produce equal logs. The sink is capped; once sealed (after a timeout) it
//! silently drops further entries.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<LogEntry>,
    dropped: u64,
    sealed: bool,
}

#[derive(Debug)]
pub struct RunLog {
    state: Mutex<LogState>,
    max_entries: usize,
}

impl RunLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            max_entries,
        }
    }

    /// Append an entry. Returns `false` when it was dropped.
    pub fn push(&self, level: LogLevel, message: impl Into<String>, data: Option<Value>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.sealed {
            return false;
        }
        if state.entries.len() >= self.max_entries {
            state.dropped += 1;
            return false;
        }
        let message = message.into();
        tracing::debug!(target: "waymark::script", level = level.as_str(), %message);
        let seq = state.entries.len() as u64 + 1;
        state.entries.push(LogEntry {
            seq,
            level,
            message,
            data,
        });
        true
    }

    /// Refuse every later entry.
    pub fn seal(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).sealed = true;
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries so far, followed by one warning if any were dropped.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = state.entries.clone();
        if state.dropped > 0 {
            out.push(LogEntry {
                seq: out.len() as u64 + 1,
                level: LogLevel::Warn,
                message: format!(
                    "log limit of {} entries reached, {} dropped",
                    self.max_entries, state.dropped
                ),
                data: None,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entries_are_sequenced_in_order() {
        let log = RunLog::new(10);
        log.push(LogLevel::Info, "one", None);
        log.push(LogLevel::Warn, "two", Some(json!({"n": 2})));
        let entries = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[1].seq, 2);
        assert_eq!(entries[1].data, Some(json!({"n": 2})));
    }

    #[test]
    fn test_overflow_reported_once() {
        let log = RunLog::new(2);
        for i in 0..5 {
            log.push(LogLevel::Info, format!("line {i}"), None);
        }
        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].level, LogLevel::Warn);
        assert!(entries[2].message.contains("3 dropped"));
    }

    #[test]
    fn test_sealed_log_drops_silently() {
        let log = RunLog::new(10);
        log.push(LogLevel::Info, "before", None);
        log.seal();
        assert!(!log.push(LogLevel::Info, "after", None));
        assert_eq!(log.snapshot().len(), 1);
    }

    #[test]
    fn test_entry_json_omits_missing_data() {
        let entry = LogEntry {
            seq: 1,
            level: LogLevel::Error,
            message: "x".into(),
            data: None,
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v, json!({"seq": 1, "level": "error", "message": "x"}));
    }
}
