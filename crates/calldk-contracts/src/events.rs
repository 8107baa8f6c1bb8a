use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

/// One stage of a dialog handoff, tagged on the wire by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandoffEvent {
    HandoffLaunched {
        pid: u32,
        program: String,
        output_path: String,
    },
    HandoffExited {
        outcome: String,
    },
    HandoffCompleted {
        text_chars: usize,
        images: usize,
    },
    HandoffFailed {
        error: String,
    },
}

impl HandoffEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HandoffLaunched { .. } => "handoff_launched",
            Self::HandoffExited { .. } => "handoff_exited",
            Self::HandoffCompleted { .. } => "handoff_completed",
            Self::HandoffFailed { .. } => "handoff_failed",
        }
    }
}

/// Shared JSONL sink for handoff events. Clones append to the same file under
/// one lock, so concurrent tool calls never interleave partial lines.
#[derive(Debug, Clone)]
pub struct HandoffJournal {
    path: Arc<PathBuf>,
    append: Arc<Mutex<()>>,
}

impl HandoffJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            append: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writer for a single handoff; every line it appends carries `handoff_id`.
    pub fn handoff(&self, handoff_id: impl Into<String>) -> HandoffLog {
        HandoffLog {
            journal: self.clone(),
            handoff_id: handoff_id.into(),
        }
    }

    fn append_line(&self, line: &str) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed creating {}", dir.display()))?;
        }
        let _held = self
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("handoff journal lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_path())
            .with_context(|| format!("failed opening {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HandoffLog {
    journal: HandoffJournal,
    handoff_id: String,
}

impl HandoffLog {
    pub fn handoff_id(&self) -> &str {
        &self.handoff_id
    }

    pub fn journal(&self) -> &HandoffJournal {
        &self.journal
    }

    /// Appends `{"type", "handoff_id", "ts", ...event fields}` and returns it.
    pub fn record(&self, event: &HandoffEvent) -> Result<Value> {
        let mut line = serde_json::to_value(event)?;
        if let Value::Object(fields) = &mut line {
            fields.insert("handoff_id".to_string(), Value::from(self.handoff_id.as_str()));
            fields.insert(
                "ts".to_string(),
                Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
            );
        }
        self.journal.append_line(&serde_json::to_string(&line)?)?;
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::{HandoffEvent, HandoffJournal};

    #[test]
    fn launched_event_line_has_type_id_and_timestamp() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("handoffs.jsonl");
        let log = HandoffJournal::new(&path).handoff("h-1");

        let event = HandoffEvent::HandoffLaunched {
            pid: 42,
            program: "calldk".to_string(),
            output_path: "/tmp/calldk-x.json".to_string(),
        };
        let recorded = log.record(&event)?;

        let content = fs::read_to_string(&path)?;
        let parsed: Value = serde_json::from_str(content.lines().next().unwrap_or(""))?;
        assert_eq!(parsed, recorded);
        assert_eq!(parsed["type"], json!(event.kind()));
        assert_eq!(parsed["handoff_id"], json!("h-1"));
        assert_eq!(parsed["pid"], json!(42));
        assert_eq!(parsed["program"], json!("calldk"));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn separate_handoffs_share_one_file_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("handoffs.jsonl");
        let journal = HandoffJournal::new(&path);
        let first = journal.handoff("h-1");
        let second = journal.clone().handoff("h-2");

        first.record(&HandoffEvent::HandoffExited {
            outcome: "exit code 0".to_string(),
        })?;
        second.record(&HandoffEvent::HandoffFailed {
            error: "boom".to_string(),
        })?;
        first.record(&HandoffEvent::HandoffCompleted {
            text_chars: 5,
            images: 0,
        })?;

        let rows: Vec<(String, String)> = fs::read_to_string(&path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .map(|row| {
                (
                    row["type"].as_str().unwrap_or("").to_string(),
                    row["handoff_id"].as_str().unwrap_or("").to_string(),
                )
            })
            .collect();
        assert_eq!(
            rows,
            vec![
                ("handoff_exited".to_string(), "h-1".to_string()),
                ("handoff_failed".to_string(), "h-2".to_string()),
                ("handoff_completed".to_string(), "h-1".to_string()),
            ]
        );
        Ok(())
    }
}
