//! Run records and the per-run event log
//!
//! Every run produces a [`SyncRun`] and a JSON-lines artifact under the
//! runs directory: one [`RunEvent`] per line, ending with a `summary`
//! record that is written whatever the outcome. Each event is mirrored to
//! `tracing` so console and file logs carry the same story.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::SyncResult;

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RunStatus {
    /// Exit-code view of a status: skipped is not an error
    pub fn is_success(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Skipped)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Work done by one run, as reported by the job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub files_processed: u64,
    pub files_downloaded: u64,
    pub bytes_transferred: u64,
    pub records_staged: u64,
    pub records_committed: u64,
    pub records_failed: u64,
    pub import_ids: Vec<String>,
    /// Non-fatal errors, in the order they happened
    pub errors: Vec<String>,
}

/// One synchronization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub files_processed: u64,
    pub files_downloaded: u64,
    pub bytes_transferred: u64,
    pub records_staged: u64,
    pub records_committed: u64,
    pub records_failed: u64,
    pub import_ids: Vec<String>,
    /// Capped sample; `total_errors` has the full count
    pub errors: Vec<String>,
    pub total_errors: usize,
}

impl SyncRun {
    pub fn start(trigger: RunTrigger) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            trigger,
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Running,
            files_processed: 0,
            files_downloaded: 0,
            bytes_transferred: 0,
            records_staged: 0,
            records_committed: 0,
            records_failed: 0,
            import_ids: Vec::new(),
            errors: Vec::new(),
            total_errors: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn push_error(&mut self, message: impl Into<String>, cap: usize) {
        self.total_errors += 1;
        if self.errors.len() < cap {
            self.errors.push(message.into());
        }
    }

    pub fn apply(&mut self, report: RunReport, cap: usize) {
        self.files_processed = report.files_processed;
        self.files_downloaded = report.files_downloaded;
        self.bytes_transferred = report.bytes_transferred;
        self.records_staged = report.records_staged;
        self.records_committed = report.records_committed;
        self.records_failed = report.records_failed;
        self.import_ids = report.import_ids;
        for message in report.errors {
            self.push_error(message, cap);
        }
    }

    /// Set the terminal status; later calls are ignored
    pub fn finish(&mut self, status: RunStatus) {
        if self.is_terminal() {
            return;
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    pub fn summary_line(&self) -> String {
        let duration = self
            .duration()
            .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        format!(
            "run {} {}: {} file(s) processed, {} downloaded, {} byte(s), {} staged, {} committed, {} failed record(s), {} error(s) in {}",
            self.run_id,
            self.status,
            self.files_processed,
            self.files_downloaded,
            self.bytes_transferred,
            self.records_staged,
            self.records_committed,
            self.records_failed,
            self.total_errors,
            duration
        )
    }

    pub fn load_last(path: &Path) -> SyncResult<Option<Self>> {
        Ok(assessor_common::state::load_json(path)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One line of a run artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub run_id: Uuid,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub fields: serde_json::Value,
}

/// Structured event sink for a single run
pub struct RunLogger {
    run_id: Uuid,
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
}

impl RunLogger {
    /// Open `<runs_dir>/<started>-<run_id>.jsonl`
    pub fn create(runs_dir: &Path, run: &SyncRun) -> SyncResult<Self> {
        std::fs::create_dir_all(runs_dir)?;
        let path = runs_dir.join(format!(
            "{}-{}.jsonl",
            run.started_at.format("%Y%m%dT%H%M%SZ"),
            run.run_id.simple()
        ));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            run_id: run.run_id,
            path: Some(path),
            file: Some(Mutex::new(file)),
        })
    }

    /// Logger that only emits through `tracing`
    pub fn tracing_only(run_id: Uuid) -> Self {
        Self {
            run_id,
            path: None,
            file: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, message: &str, fields: serde_json::Value) {
        self.event(EventLevel::Info, message, fields);
    }

    pub fn warn(&self, message: &str, fields: serde_json::Value) {
        self.event(EventLevel::Warn, message, fields);
    }

    pub fn error(&self, message: &str, fields: serde_json::Value) {
        self.event(EventLevel::Error, message, fields);
    }

    pub fn event(&self, level: EventLevel, message: &str, fields: serde_json::Value) {
        match level {
            EventLevel::Info => info!(run_id = %self.run_id, fields = %fields, "{}", message),
            EventLevel::Warn => warn!(run_id = %self.run_id, fields = %fields, "{}", message),
            EventLevel::Error => error!(run_id = %self.run_id, fields = %fields, "{}", message),
        }

        self.append(&RunEvent {
            timestamp: Utc::now(),
            level,
            run_id: self.run_id,
            message: message.to_string(),
            fields,
        });
    }

    /// Emit the final summary and persist `run` as the last-run document
    pub fn summary(&self, run: &SyncRun, last_run_path: Option<&Path>) {
        let level = match run.status {
            RunStatus::Failed => EventLevel::Error,
            RunStatus::Skipped => EventLevel::Warn,
            _ => EventLevel::Info,
        };
        let fields = serde_json::to_value(run).unwrap_or(serde_json::Value::Null);
        self.event(level, &format!("summary: {}", run.summary_line()), fields);

        if let Some(path) = last_run_path {
            if let Err(e) = assessor_common::state::save_json(path, run) {
                warn!(path = %path.display(), error = %e, "Failed to persist last run summary");
            }
        }
    }

    fn append(&self, event: &RunEvent) {
        let Some(file) = &self.file else {
            return;
        };
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode run event");
                return;
            },
        };
        match file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    warn!(error = %e, "Failed to append run event");
                }
            },
            Err(_) => warn!("Run log file mutex poisoned"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_errors_are_capped_but_counted() {
        let mut run = SyncRun::start(RunTrigger::Manual);
        let report = RunReport {
            errors: (0..10).map(|i| format!("row {}", i)).collect(),
            ..RunReport::default()
        };
        run.apply(report, 3);
        assert_eq!(run.errors, vec!["row 0", "row 1", "row 2"]);
        assert_eq!(run.total_errors, 10);
    }

    #[test]
    fn test_finish_is_terminal_once() {
        let mut run = SyncRun::start(RunTrigger::Scheduled);
        assert_eq!(run.status, RunStatus::Running);
        run.finish(RunStatus::Skipped);
        run.finish(RunStatus::Failed);
        assert_eq!(run.status, RunStatus::Skipped);
        assert!(run.is_terminal());
        assert!(run.summary_line().contains("skipped"));
        assert!(RunStatus::Skipped.is_success());
        assert!(!RunStatus::Failed.is_success());
    }

    #[test]
    fn test_artifact_ends_with_summary() {
        let dir = TempDir::new().unwrap();
        let mut run = SyncRun::start(RunTrigger::Manual);
        let logger = RunLogger::create(&dir.path().join("runs"), &run).unwrap();

        logger.info("connected", serde_json::json!({ "host": "ftp.example.org" }));
        logger.warn("file failed", serde_json::json!({ "path": "/tax.csv" }));
        run.finish(RunStatus::Succeeded);
        let last = dir.path().join("last_run.json");
        logger.summary(&run, Some(&last));

        let content = std::fs::read_to_string(logger.path().unwrap()).unwrap();
        let events: Vec<RunEvent> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].level, EventLevel::Warn);
        assert!(events[2].message.starts_with("summary:"));
        assert!(events.iter().all(|e| e.run_id == run.run_id));

        let persisted = SyncRun::load_last(&last).unwrap().unwrap();
        assert_eq!(persisted, run);
    }
}
