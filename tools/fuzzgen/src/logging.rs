use crate::errors::FuzzError;
use crate::log_retention::enforce_total_budget;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;

/// Installs the global fmt subscriber. `RUST_LOG` wins over `level` when set.
/// Calling it twice is harmless; the second install is ignored.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Append-only JSONL file of run events (terminations, aborts, snapshots).
#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub timestamp: i64,
    pub payload: Value,
}

impl<'a> LogEvent<'a> {
    pub fn info(event_type: &'a str, payload: Value) -> Self {
        Self {
            level: "info",
            event_type,
            timestamp: crate::tree_store::system_time_unix(),
            payload,
        }
    }

    pub fn warn(event_type: &'a str, payload: Value) -> Self {
        Self {
            level: "warn",
            ..Self::info(event_type, payload)
        }
    }
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), FuzzError> {
        if let Some(parent) = self.parent_dir() {
            fs::create_dir_all(parent).map_err(|e| FuzzError::file_access(parent, e))?;
        }
        let line = serde_json::to_string(&LogEvent {
            payload: truncate_json(event.payload.clone(), self.max_payload_bytes),
            ..event.clone()
        })
        .map_err(|e| FuzzError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| FuzzError::file_access(&self.path, e))?;
        writeln!(file, "{line}").map_err(|e| FuzzError::file_access(&self.path, e))?;

        if let Some(parent) = self.parent_dir() {
            let _ = enforce_total_budget(parent, self.budget_bytes, Some(&self.path))?;
        }
        Ok(())
    }

    fn parent_dir(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let keep = max_bytes.saturating_sub(3);
    let truncated = rendered
        .char_indices()
        .take_while(|(i, c)| i + c.len_utf8() <= keep)
        .map(|(_, c)| c)
        .collect::<String>();
    Value::String(format!("{truncated}..."))
}

#[cfg(test)]
mod tests {
    use super::{truncate_json, JsonlLogger, LogEvent};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;
        logger.budget_bytes = 1024;

        logger
            .append(&LogEvent::info(
                "session_terminated",
                json!({"session": "abcdefghijklmnopqrstuvwxyz"}),
            ))
            .expect("append");
        logger
            .append(&LogEvent::warn("session_aborted", json!({"s": 1})))
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"event_type\":\"session_terminated\""));
        assert!(lines[0].contains("..."));
        assert!(lines[1].contains("\"level\":\"warn\""));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let value = truncate_json(json!("ééééééééééééé"), 8);
        let text = value.as_str().expect("string");
        assert!(text.ends_with("..."));
        assert!(text.len() <= 8);
    }
}
