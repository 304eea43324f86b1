//! Structured execution log: JSON lines per run.
//!
//! A supervision run appends one JSON object per lifecycle event: device
//! launches, setup and reset passes, restarts and their outcome, bad states
//! and episode ends. Each line carries an RFC 3339 timestamp so logs from
//! several runs can be concatenated and sorted.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the execution log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// The device came up and answered.
    SimulatorLaunched { attempt: u32 },
    /// Setup steps ran to completion.
    SetupCompleted { steps: usize },
    ResetCompleted { steps: usize },
    /// A restart was requested.
    RestartStarted { reason: String },
    RestartAttempt { attempt: u32, error: Option<String> },
    RestartCompleted { attempts: u32 },
    RestartFailed { attempts: u32, reason: String },
    /// The episode entered a bad state (e.g. the user left the app).
    BadState { reason: String, count: u32 },
    EpisodeEnded,
    /// The task's step or time limit cut the episode short.
    EpisodeTruncated { reason: String },
    /// Periodic or command-line stats snapshot.
    Stats { stats: serde_json::Value },
    Closed,
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Create a new execution log, writing to the given path.
    ///
    /// Creates the file (and parent directories) if they don't exist.
    /// Appends to an existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
