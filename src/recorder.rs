//! Optional durable run log: newline-delimited step records, appendable,
//! order-preserving. Replay and audit live on top of this.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::agent::TaskReport;
use crate::history::StepRecord;

/// Sink for the audit trail. Recording failures are surfaced as warnings,
/// never as task failures; losing a log line must not lose the task.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn run_started(&self, run_id: &str, task: &str);
    async fn record_step(&self, run_id: &str, record: &StepRecord);
    async fn run_finished(&self, run_id: &str, report: &TaskReport);
}

pub struct NullRecorder;

#[async_trait]
impl RunRecorder for NullRecorder {
    async fn run_started(&self, _run_id: &str, _task: &str) {}
    async fn record_step(&self, _run_id: &str, _record: &StepRecord) {}
    async fn run_finished(&self, _run_id: &str, _report: &TaskReport) {}
}

/// Appends one JSON object per line under `<base>/<run_id>/steps.jsonl`,
/// plus `task.txt` and a final `report.json`.
pub struct JsonlRecorder {
    base_dir: PathBuf,
}

impl JsonlRecorder {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    async fn append_line(&self, path: &Path, line: &str) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }
}

#[async_trait]
impl RunRecorder for JsonlRecorder {
    async fn run_started(&self, run_id: &str, task: &str) {
        let dir = self.run_dir(run_id);
        if let Err(e) = fs::create_dir_all(&dir).await {
            warn!(run = run_id, "run log dir creation failed: {e}");
            return;
        }
        if let Err(e) = fs::write(dir.join("task.txt"), task).await {
            warn!(run = run_id, "task write failed: {e}");
        }
    }

    async fn record_step(&self, run_id: &str, record: &StepRecord) {
        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(e) => {
                warn!(run = run_id, step = record.step_number, "step serialize failed: {e}");
                return;
            }
        };
        let path = self.run_dir(run_id).join("steps.jsonl");
        if let Err(e) = self.append_line(&path, &line).await {
            warn!(run = run_id, step = record.step_number, "step append failed: {e}");
        }
    }

    async fn run_finished(&self, run_id: &str, report: &TaskReport) {
        let json = match serde_json::to_string_pretty(report) {
            Ok(j) => j,
            Err(e) => {
                warn!(run = run_id, "report serialize failed: {e}");
                return;
            }
        };
        if let Err(e) = fs::write(self.run_dir(run_id).join("report.json"), json).await {
            warn!(run = run_id, "report write failed: {e}");
        }
    }
}
