//! Append-only JSONL event log for generation runs.
//!
//! Each project carries an `events.jsonl` in its root recording run
//! lifecycle and node transitions. The log is evidence, not state: nothing
//! reads it back at runtime, but `status` and humans do.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Default events file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a project root
pub fn events_path(project_root: &Path) -> PathBuf {
    project_root.join(EVENTS_FILE)
}

/// One recorded event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event_type: EventType,
    /// Chapter the event concerns, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    RunStarted {
        run_id: String,
        num_chapters: u32,
    },
    RunResumed {
        checkpoint_id: String,
    },
    NodeCompleted {
        node: String,
    },
    RevisionTriggered {
        revision_round: u32,
        blocker_count: u32,
    },
    ChapterStored {
        revision_id: String,
    },
    HumanReviewRequired,
    RunInterrupted,
    RunFinished {
        completed: bool,
    },
    RolledBack {
        target: String,
    },
}

impl RunEvent {
    pub fn now(event_type: EventType, chapter: Option<u32>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            chapter,
        }
    }
}

/// Append-only event log buffer.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<RunEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Record a new event in memory.
    pub fn record(&mut self, event: RunEvent) {
        self.events.push(event);
    }

    /// Append all buffered events to the file and clear the buffer.
    pub fn flush_to_file(&mut self, path: &Path) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(EngineError::storage)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(EngineError::storage)?;
        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event)?;
            writeln!(writer, "{line}").map_err(EngineError::storage)?;
        }
        writer.flush().map_err(EngineError::storage)?;
        self.events.clear();
        Ok(())
    }

    /// Read all events from a JSONL file.
    pub fn read_from_file(path: &Path) -> Result<Vec<RunEvent>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).map_err(EngineError::storage)?;
        let reader = BufReader::new(file);

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(EngineError::storage)?;
            if line.trim().is_empty() {
                continue;
            }
            let event: RunEvent = serde_json::from_str(&line)
                .map_err(|e| EngineError::Storage(format!("bad event line: {e}")))?;
            events.push(event);
        }
        Ok(events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
