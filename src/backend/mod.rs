//! Analysis backends.
//!
//! Defines the [`Backend`] trait every pass delegates to, and the two
//! concrete families:
//! - **[`AiBackend`]** renders the pass prompt and sends it to a
//!   [`CompletionClient`] (OpenAI-compatible chat completions by default).
//! - **[`StaticToolBackend`]** runs an external analysis tool against the
//!   artifact's file and parses its stdout.
//!
//! The executor picks the backend by matching on the pass's
//! [`BackendSpec`](crate::registry::BackendSpec); see [`Backends::for_spec`].

pub mod ai;
pub mod tool;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, Requires};
use crate::error::BackendError;
use crate::models::{AnalysisRecord, PassOutput, PassResult, Usage};
use crate::registry::{BackendSpec, PassDefinition};

pub use ai::{
    create_client, AiBackend, Completion, CompletionClient, CompletionRequest, OpenAiClient,
    UnavailableClient,
};
pub use tool::StaticToolBackend;

/// Everything a backend may need for one (record, pass) invocation.
///
/// Built by the executor from the record and the pass's `requires` field;
/// fields the pass did not ask for are `None`.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Correlates log lines of one batch run.
    pub run_id: String,
    pub artifact_path: String,
    /// Location of the artifact on disk (ingest root joined with the path).
    pub file_path: PathBuf,
    pub language: Option<String>,
    pub source: Option<String>,
    pub parsed: Option<String>,
    pub previous_results: Option<String>,
}

impl InvocationContext {
    pub fn build(
        run_id: &str,
        record: &AnalysisRecord,
        requires: Requires,
        prior: &[PassResult],
        artifact_root: &Path,
    ) -> Self {
        let source = || Some(record.raw_source.clone());
        let parsed = || {
            Some(
                serde_json::to_string_pretty(&record.parsed_representation)
                    .unwrap_or_else(|_| record.parsed_representation.to_string()),
            )
        };

        let (source, parsed, previous_results) = match requires {
            Requires::Raw => (source(), None, None),
            Requires::Parsed => (None, parsed(), None),
            Requires::Both => (source(), parsed(), None),
            Requires::PreviousResults => (None, None, Some(concat_results(prior))),
        };

        Self {
            run_id: run_id.to_string(),
            artifact_path: record.artifact_path.clone(),
            file_path: artifact_root.join(&record.artifact_path),
            language: record.language.clone(),
            source,
            parsed,
            previous_results,
        }
    }

    /// All requested inputs joined into one block, in a fixed order.
    pub fn combined(&self) -> String {
        let mut parts = Vec::new();
        if let Some(s) = &self.source {
            parts.push(format!("Source:\n{}", s));
        }
        if let Some(p) = &self.parsed {
            parts.push(format!("Parsed structure:\n{}", p));
        }
        if let Some(r) = &self.previous_results {
            parts.push(format!("Previous analysis:\n{}", r));
        }
        parts.join("\n\n")
    }
}

/// Prior pass outputs in completion order, each under a `### name` heading.
/// Empty when nothing has completed yet.
pub fn concat_results(prior: &[PassResult]) -> String {
    prior
        .iter()
        .map(|r| format!("### {}\n{}", r.pass_name, r.output.as_text()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// What a successful invocation produced.
#[derive(Debug, Clone)]
pub struct BackendOutput {
    /// Prompt or tool command line actually sent.
    pub input: String,
    pub output: PassOutput,
    /// Only reported by AI backends.
    pub usage: Option<Usage>,
}

/// A pluggable analysis backend.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn invoke(
        &self,
        pass: &PassDefinition,
        ctx: &InvocationContext,
    ) -> Result<BackendOutput, BackendError>;
}

/// One backend per family, shared across runner workers.
#[derive(Clone)]
pub struct Backends {
    pub ai: Arc<dyn Backend>,
    pub static_tool: Arc<dyn Backend>,
}

impl Backends {
    pub fn new(ai: Arc<dyn Backend>, static_tool: Arc<dyn Backend>) -> Self {
        Self { ai, static_tool }
    }

    /// Build the production backends from config.
    ///
    /// Never fails: a missing API key yields an AI backend whose every
    /// invocation reports [`BackendError::Unavailable`], so tool passes can
    /// still run.
    pub fn from_config(config: &Config) -> Self {
        let client = create_client(&config.ai);
        Self {
            ai: Arc::new(AiBackend::new(client)),
            static_tool: Arc::new(StaticToolBackend::new()),
        }
    }

    /// `None` for placeholder passes.
    pub fn for_spec(&self, spec: &BackendSpec) -> Option<&Arc<dyn Backend>> {
        match spec {
            BackendSpec::Ai(_) => Some(&self.ai),
            BackendSpec::StaticTool(_) => Some(&self.static_tool),
            BackendSpec::None => None,
        }
    }
}
