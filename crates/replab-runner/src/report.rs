use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use replab_core::{atomic_write_bytes, atomic_write_json_pretty};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// One attempt. Never mutated after it is pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub attempt: usize,
    pub success: bool,
    pub time_taken_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per (task, replica, run) results. The files are rewritten from scratch
/// after every attempt, never appended to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsReport {
    pub task_id: String,
    pub replica: usize,
    pub started_at: DateTime<Local>,
    pub records: Vec<ExperimentRecord>,
}

impl ResultsReport {
    pub fn new(task_id: impl Into<String>, replica: usize, started_at: DateTime<Local>) -> Self {
        Self {
            task_id: task_id.into(),
            replica,
            started_at,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: ExperimentRecord) {
        self.records.push(record);
    }

    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn successes(&self) -> usize {
        self.records.iter().filter(|r| r.success).count()
    }

    pub fn success_ratio(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.successes() as f64 / self.total() as f64
    }

    pub fn total_time(&self) -> f64 {
        self.records.iter().map(|r| r.time_taken_secs).sum()
    }

    pub fn average_time(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.total_time() / self.total() as f64
    }

    pub fn min_time(&self) -> f64 {
        self.records
            .iter()
            .map(|r| r.time_taken_secs)
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.min(t))))
            .unwrap_or(0.0)
    }

    pub fn max_time(&self) -> f64 {
        self.records
            .iter()
            .map(|r| r.time_taken_secs)
            .fold(0.0, f64::max)
    }

    pub fn file_stem(&self) -> String {
        format!(
            "results_{}_r{}_{}",
            sanitize_file_component(&self.task_id),
            self.replica,
            self.started_at.format("%Y%m%d_%H%M%S")
        )
    }

    pub fn text_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.txt", self.file_stem()))
    }

    pub fn json_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.file_stem()))
    }

    pub fn render_text(&self, updated_at: DateTime<Local>) -> String {
        let mut out = String::new();
        let last = self.records.last().map(|r| r.time_taken_secs).unwrap_or(0.0);
        let _ = writeln!(out, "Task ID: {}", self.task_id);
        let _ = writeln!(out, "Replica: {}", self.replica);
        let _ = writeln!(out, "Experiments completed: {}", self.total());
        let _ = writeln!(out, "Successful experiments: {}", self.successes());
        let _ = writeln!(out, "Success ratio: {:.2}", self.success_ratio());
        let _ = writeln!(out, "Time taken for last experiment: {:.2} seconds", last);
        for (i, record) in self.records.iter().enumerate() {
            let _ = writeln!(
                out,
                "Experiment {}: {}, Time taken: {:.2} seconds",
                i + 1,
                if record.success { "Success" } else { "Failure" },
                record.time_taken_secs
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Aggregated metrics:");
        let _ = writeln!(out, "Total experiments: {}", self.total());
        let _ = writeln!(out, "Total successful experiments: {}", self.successes());
        let _ = writeln!(out, "Overall success ratio: {:.2}", self.success_ratio());
        let _ = writeln!(out, "Total time taken: {:.2} seconds", self.total_time());
        let _ = writeln!(
            out,
            "Average time per experiment: {:.2} seconds",
            self.average_time()
        );
        let _ = writeln!(out, "Fastest experiment: {:.2} seconds", self.min_time());
        let _ = writeln!(out, "Slowest experiment: {:.2} seconds", self.max_time());
        let _ = writeln!(out, "Last updated: {}", updated_at.format("%Y-%m-%d %H:%M:%S"));
        out
    }

    /// Rewrites the text report and its JSON twin. Returns the text path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let now = Local::now();
        let text_path = self.text_path(dir);
        atomic_write_bytes(&text_path, self.render_text(now).as_bytes())
            .with_context(|| format!("failed writing report {}", text_path.display()))?;
        let summary = json!({
            "task_id": self.task_id,
            "replica": self.replica,
            "started_at": self.started_at.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
            "total": self.total(),
            "successes": self.successes(),
            "success_ratio": self.success_ratio(),
            "total_time_secs": self.total_time(),
            "average_time_secs": self.average_time(),
            "records": self.records,
        });
        let json_path = self.json_path(dir);
        atomic_write_json_pretty(&json_path, &summary)
            .with_context(|| format!("failed writing report {}", json_path.display()))?;
        Ok(text_path)
    }
}

fn sanitize_file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
