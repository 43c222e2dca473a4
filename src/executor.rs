//! Per-record pass execution.
//!
//! [`PassExecutor::run_missing_passes`] walks the passes a record has not
//! completed, in registry order, and drives each one through
//! `Pending → Running → Completed`, or back to `Pending` when the backend
//! fails. A failing pass never stops the passes after it, and nothing is
//! retried here: a failed pass is simply still missing on the next run.
//!
//! Result and state advance are committed together through
//! [`ArtifactStore::commit_pass`], so a record is always safe to resume. A
//! result stored without its advance is picked up instead of re-invoking
//! the backend.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::backend::{Backends, InvocationContext};
use crate::config::Requires;
use crate::error::StoreError;
use crate::models::{AnalysisRecord, PassOutcome, PassResult, SkipReason};
use crate::registry::PassRegistry;
use crate::scores::ScoreAggregator;
use crate::store::ArtifactStore;

/// Settings shared by every record of one batch run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub dry_run: bool,
    shutdown: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(dry_run: bool) -> Self {
        Self::with_shutdown(dry_run, Arc::new(AtomicBool::new(false)))
    }

    /// Share a flag that, once set, stops new passes from starting.
    pub fn with_shutdown(dry_run: bool, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            dry_run,
            shutdown,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// One pass outcome, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassReport {
    pub pass: String,
    pub outcome: PassOutcome,
}

/// What happened to one record during a run.
#[derive(Debug, Clone, Serialize)]
pub struct RecordRun {
    pub artifact_path: String,
    pub outcomes: Vec<PassReport>,
    /// Completed passes after the run.
    pub completed_passes: Vec<String>,
    /// Set when the scoring pass completed but its payload was rejected.
    pub score_error: Option<String>,
}

impl RecordRun {
    pub fn completed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.is_completed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.is_failed()).count()
    }

    fn push(&mut self, pass: &str, outcome: PassOutcome) {
        self.outcomes.push(PassReport {
            pass: pass.to_string(),
            outcome,
        });
    }
}

#[derive(Clone)]
pub struct PassExecutor {
    store: Arc<dyn ArtifactStore>,
    backends: Backends,
    artifact_root: PathBuf,
}

impl PassExecutor {
    pub fn new(store: Arc<dyn ArtifactStore>, backends: Backends) -> Self {
        Self {
            store,
            backends,
            artifact_root: PathBuf::from("."),
        }
    }

    /// Directory artifact paths are relative to (the ingest root).
    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    /// Run every pass `record` is missing.
    ///
    /// Backend failures become [`PassOutcome::Failed`] and duplicate commits
    /// become [`SkipReason::AlreadyCompleted`]. Only other store errors are
    /// returned, aborting this record.
    pub async fn run_missing_passes(
        &self,
        record: &AnalysisRecord,
        registry: &PassRegistry,
        run: &RunContext,
    ) -> Result<RecordRun, StoreError> {
        let span = tracing::info_span!(
            "record",
            run_id = %run.run_id,
            artifact = %record.artifact_path
        );
        self.run_passes(record, registry, run).instrument(span).await
    }

    async fn run_passes(
        &self,
        record: &AnalysisRecord,
        registry: &PassRegistry,
        run: &RunContext,
    ) -> Result<RecordRun, StoreError> {
        let missing = self
            .store
            .missing_passes(record, registry.get_pass_order());

        let mut report = RecordRun {
            artifact_path: record.artifact_path.clone(),
            outcomes: Vec::with_capacity(missing.len()),
            completed_passes: record.completed_passes.clone(),
            score_error: None,
        };
        if missing.is_empty() {
            tracing::debug!("no missing passes");
            return Ok(report);
        }

        let mut current = record.clone();

        for pass_name in &missing {
            if run.is_cancelled() {
                report.push(
                    pass_name,
                    PassOutcome::Skipped {
                        reason: SkipReason::Cancelled,
                    },
                );
                continue;
            }

            let def = match registry.get_definition(pass_name) {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(pass = %pass_name, error = %e, "pass lookup failed");
                    report.push(pass_name, PassOutcome::Failed { reason: e.to_string() });
                    continue;
                }
            };

            let backend = match self.backends.for_spec(&def.backend) {
                Some(b) => b,
                None => {
                    tracing::debug!(pass = %pass_name, "placeholder pass, skipping");
                    report.push(
                        pass_name,
                        PassOutcome::Skipped {
                            reason: SkipReason::NoBackend,
                        },
                    );
                    continue;
                }
            };

            let prior = if def.requires == Requires::PreviousResults {
                self.store.pass_results(current.id).await?
            } else {
                Vec::new()
            };
            let ctx = InvocationContext::build(
                &run.run_id,
                &current,
                def.requires,
                &prior,
                &self.artifact_root,
            );

            if run.dry_run {
                tracing::info!(
                    pass = %pass_name,
                    backend = backend.name(),
                    "dry run: would invoke backend"
                );
                report.push(
                    pass_name,
                    PassOutcome::Skipped {
                        reason: SkipReason::DryRun,
                    },
                );
                continue;
            }

            // A stored result the record never advanced past is kept as is.
            if self.store.latest_result(current.id, pass_name).await?.is_some() {
                match self.store.advance(&current, pass_name).await {
                    Ok(updated) => current = updated,
                    Err(StoreError::DuplicatePass { .. }) => {
                        report.push(
                            pass_name,
                            PassOutcome::Skipped {
                                reason: SkipReason::AlreadyCompleted,
                            },
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                tracing::info!(pass = %pass_name, "recovered stored result");
                report.push(pass_name, PassOutcome::Completed);
                self.score(registry, pass_name, &current, &mut report).await;
                continue;
            }

            let started = Instant::now();
            let output = match backend.invoke(def, &ctx).await {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(pass = %pass_name, error = %e, "pass failed");
                    report.push(pass_name, PassOutcome::Failed { reason: e.to_string() });
                    continue;
                }
            };

            let result = PassResult {
                pass_name: pass_name.clone(),
                input: output.input,
                output: output.output,
                usage: output.usage,
                duration_ms: started.elapsed().as_millis() as u64,
                created_at: chrono::Utc::now().timestamp(),
            };

            match self.store.commit_pass(&current, &result).await {
                Ok(updated) => current = updated,
                Err(StoreError::DuplicatePass { .. }) => {
                    tracing::warn!(pass = %pass_name, "pass already completed, discarding result");
                    report.push(
                        pass_name,
                        PassOutcome::Skipped {
                            reason: SkipReason::AlreadyCompleted,
                        },
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            tracing::info!(
                pass = %pass_name,
                duration_ms = result.duration_ms,
                tokens = result.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0),
                "pass completed"
            );
            report.push(pass_name, PassOutcome::Completed);
            self.score(registry, pass_name, &current, &mut report).await;
        }

        report.completed_passes = current.completed_passes;
        Ok(report)
    }

    async fn score(
        &self,
        registry: &PassRegistry,
        pass_name: &str,
        record: &AnalysisRecord,
        report: &mut RecordRun,
    ) {
        if !registry.is_scoring_pass(pass_name) {
            return;
        }
        let aggregator =
            ScoreAggregator::new(self.store.as_ref(), pass_name, registry.score_fields());
        match aggregator.compute_scores(record).await {
            Ok(scores) => tracing::info!(metrics = scores.len(), "scores updated"),
            Err(e) => {
                tracing::warn!(pass = %pass_name, error = %e, "malformed score payload");
                report.score_error = Some(e.to_string());
            }
        }
    }
}
