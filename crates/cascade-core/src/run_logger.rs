//! Append-only structured event log per run, written as `pipeline.log.jsonl`
//! and mirrored through `tracing` for operator-facing output.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

use crate::error::{CascadeError, Result};
use crate::run_status::Stage;

/// Severity of a log record, mirrored onto the equivalent `tracing` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One line of `pipeline.log.jsonl`.
#[derive(Debug, Serialize)]
pub struct LogRecord<'a> {
    pub ts: String,
    pub run_id: &'a str,
    pub stage: Stage,
    pub level: LogLevel,
    pub event: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<&'a str>,
}

/// An append-only, line-delimited JSON logger for a single run. Writes are
/// serialised via an internal lock and each line is written as one atomic
/// `write_all` call, so readers never observe a partial line.
pub struct RunLogger {
    run_id: String,
    file: Mutex<File>,
    path: PathBuf,
}

impl RunLogger {
    /// Opens (creating if absent) `pipeline.log.jsonl` under `run_dir` in
    /// append mode.
    pub fn open(run_dir: &Path, run_id: impl Into<String>) -> Result<Self> {
        let path = run_dir.join("pipeline.log.jsonl");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CascadeError::io(parent.display().to_string(), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CascadeError::io(path.display().to_string(), e))?;
        Ok(Self {
            run_id: run_id.into(),
            file: Mutex::new(file),
            path,
        })
    }

    /// Appends one structured record, also emitting it through `tracing` at
    /// the matching level so process-wide log sinks see it too.
    #[allow(clippy::too_many_arguments)]
    pub fn log(
        &self,
        stage: Stage,
        level: LogLevel,
        event: &str,
        message: &str,
        packet_id: Option<&str>,
        duration_ms: Option<u64>,
        error_detail: Option<&str>,
    ) -> Result<()> {
        let record = LogRecord {
            ts: Utc::now().to_rfc3339(),
            run_id: &self.run_id,
            stage,
            level,
            event,
            message,
            packet_id,
            duration_ms,
            error_detail,
        };

        match level {
            LogLevel::Info => {
                tracing::info!(run_id = %self.run_id, ?stage, event, packet_id, "{message}");
            }
            LogLevel::Warning => {
                tracing::warn!(run_id = %self.run_id, ?stage, event, packet_id, "{message}");
            }
            LogLevel::Error => {
                tracing::error!(run_id = %self.run_id, ?stage, event, packet_id, error_detail, "{message}");
            }
        }

        let mut line = serde_json::to_string(&record)
            .map_err(|e| CascadeError::json("log record", e))?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        file.write_all(line.as_bytes())
            .map_err(|e| CascadeError::io(self.path.display().to_string(), e))
    }

    /// Convenience wrapper for a stage-level informational record with no
    /// packet context.
    pub fn stage_event(&self, stage: Stage, event: &str, message: &str) -> Result<()> {
        self.log(stage, LogLevel::Info, event, message, None, None, None)
    }
}
