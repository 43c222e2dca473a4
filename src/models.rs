//! Core data models used throughout passline.
//!
//! These types represent the analysis records, pass results, and per-pass
//! outcomes that flow through the ingest → run → report pipeline.

use serde::{Deserialize, Serialize};

/// Artifact as produced by ingest, before it is stored.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub artifact_path: String,
    pub language: Option<String>,
    pub raw_source: String,
    pub content_hash: String,
    pub parsed_representation: serde_json::Value,
}

/// One stored artifact and its pass-completion state.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub artifact_path: String,
    pub language: Option<String>,
    pub raw_source: String,
    pub content_hash: String,
    pub parsed_representation: serde_json::Value,
    pub current_pass_index: i64,
    pub completed_passes: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AnalysisRecord {
    pub fn has_completed(&self, pass_name: &str) -> bool {
        self.completed_passes.iter().any(|p| p == pass_name)
    }
}

/// Token accounting reported by the AI backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// What a backend produced for a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PassOutput {
    Text(String),
    Findings(serde_json::Value),
}

impl PassOutput {
    /// Column tag used by the SQLite store.
    pub fn kind(&self) -> &'static str {
        match self {
            PassOutput::Text(_) => "text",
            PassOutput::Findings(_) => "findings",
        }
    }

    /// Text form, used when later passes consume earlier results.
    pub fn as_text(&self) -> String {
        match self {
            PassOutput::Text(s) => s.clone(),
            PassOutput::Findings(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
        }
    }

    pub fn from_parts(kind: &str, body: &str) -> Self {
        match kind {
            "findings" => serde_json::from_str(body)
                .map(PassOutput::Findings)
                .unwrap_or_else(|_| PassOutput::Text(body.to_string())),
            _ => PassOutput::Text(body.to_string()),
        }
    }
}

/// Persisted outcome of one successful backend invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PassResult {
    pub pass_name: String,
    /// Prompt sent to the AI backend, or the file reference given to a tool.
    pub input: String,
    pub output: PassOutput,
    pub usage: Option<Usage>,
    pub duration_ms: u64,
    pub created_at: i64,
}

/// A single derived metric for a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Score {
    pub metric: String,
    pub value: f64,
}

/// Why a pass was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Placeholder pass with `backend = "none"`.
    NoBackend,
    DryRun,
    AlreadyCompleted,
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoBackend => write!(f, "no backend"),
            SkipReason::DryRun => write!(f, "dry run"),
            SkipReason::AlreadyCompleted => write!(f, "already completed"),
            SkipReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-pass result of one executor run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed,
    Failed { reason: String },
    Skipped { reason: SkipReason },
}

impl PassOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PassOutcome::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PassOutcome::Failed { .. })
    }

    pub fn label(&self) -> String {
        match self {
            PassOutcome::Completed => "completed".to_string(),
            PassOutcome::Failed { reason } => format!("failed ({})", reason),
            PassOutcome::Skipped { reason } => format!("skipped ({})", reason),
        }
    }
}
