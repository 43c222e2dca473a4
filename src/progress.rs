//! Run progress reporting.
//!
//! Reports observable progress during `passline run` so users see how many
//! pending records are left and how each one fared. Progress is emitted on
//! **stderr** so stdout (the run report) remains parseable for scripts.

use std::io::Write;

/// A single progress event for a batch run.
#[derive(Clone, Debug)]
pub enum RunProgressEvent {
    /// Pending records were selected; `total` of them will be processed.
    Started { run_id: String, total: u64 },
    /// Record `n` of `total` finished.
    RecordFinished {
        artifact: String,
        n: u64,
        total: u64,
        completed: u64,
        failed: u64,
    },
    /// Record skipped because another worker holds it.
    RecordBusy { artifact: String },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run  12 / 1,500  app/User.php  3 completed".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Started { run_id, total } => {
                format!("run {}  {} pending records\n", run_id, format_number(*total))
            }
            RunProgressEvent::RecordFinished {
                artifact,
                n,
                total,
                completed,
                failed,
            } => {
                let mut line = format!(
                    "run  {} / {}  {}  {} completed",
                    format_number(*n),
                    format_number(*total),
                    artifact,
                    completed
                );
                if *failed > 0 {
                    line.push_str(&format!(", {} failed", failed));
                }
                line.push('\n');
                line
            }
            RunProgressEvent::RecordBusy { artifact } => {
                format!("run  {}  busy, skipped\n", artifact)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Started { run_id, total } => serde_json::json!({
                "event": "started",
                "run_id": run_id,
                "total": total
            }),
            RunProgressEvent::RecordFinished {
                artifact,
                n,
                total,
                completed,
                failed,
            } => serde_json::json!({
                "event": "record",
                "artifact": artifact,
                "n": n,
                "total": total,
                "completed": completed,
                "failed": failed
            }),
            RunProgressEvent::RecordBusy { artifact } => serde_json::json!({
                "event": "busy",
                "artifact": artifact
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
