//! Batch execution over every pending record.
//!
//! [`BatchRunner::run_all`] selects the pending records, runs the executor on
//! each with bounded concurrency, and folds the per-record outcomes into a
//! [`Report`]. A record that fails to process is logged and counted; it never
//! stops the batch.
//!
//! # Concurrency
//!
//! Up to `concurrency` records are processed at once, gated by a semaphore.
//! Passes within a record always run sequentially. [`RecordLocks`] ensures a
//! record is never processed by two workers of the same runner at once; a
//! record that is already held is reported as busy instead.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};

use crate::backend::Backends;
use crate::config::{Config, PendingCheck};
use crate::error::{ConfigurationError, StoreError};
use crate::executor::{PassExecutor, PassReport, RecordRun, RunContext};
use crate::models::AnalysisRecord;
use crate::progress::{NoProgress, ProgressReporter, RunProgressEvent};
use crate::registry::PassRegistry;
use crate::store::ArtifactStore;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub concurrency: usize,
    /// Process at most this many pending records.
    pub limit: Option<usize>,
    pub pending_check: PendingCheck,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            concurrency: 1,
            limit: None,
            pending_check: PendingCheck::default(),
        }
    }
}

impl RunOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            concurrency: cfg.runner.concurrency,
            pending_check: cfg.runner.pending_check,
            ..Self::default()
        }
    }
}

// ============ Report ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// No runnable pass is missing any more.
    Completed,
    /// Some passes completed this run, some runnable ones are still missing.
    Partial,
    /// Nothing completed this run.
    NoProgress,
    /// The store failed while processing the record.
    Errored,
    /// Another worker held the record.
    Busy,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub artifact_path: String,
    pub status: RecordStatus,
    pub outcomes: Vec<PassReport>,
    pub completed_passes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_error: Option<String>,
}

/// Outcome of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub run_id: String,
    pub dry_run: bool,
    /// Set when shutdown was requested before every record was processed.
    pub cancelled: bool,
    pub pending: usize,
    pub fully_completed: usize,
    pub partially_completed: usize,
    pub no_progress: usize,
    pub errored: usize,
    pub busy: usize,
    pub records: Vec<RecordSummary>,
}

impl Report {
    fn new(run_id: &str, dry_run: bool) -> Self {
        Self {
            run_id: run_id.to_string(),
            dry_run,
            cancelled: false,
            pending: 0,
            fully_completed: 0,
            partially_completed: 0,
            no_progress: 0,
            errored: 0,
            busy: 0,
            records: Vec::new(),
        }
    }

    /// Report for a pipeline with no passes configured.
    pub fn empty(dry_run: bool) -> Self {
        Self::new("", dry_run)
    }

    fn push(&mut self, summary: RecordSummary) {
        match summary.status {
            RecordStatus::Completed => self.fully_completed += 1,
            RecordStatus::Partial => self.partially_completed += 1,
            RecordStatus::NoProgress => self.no_progress += 1,
            RecordStatus::Errored => self.errored += 1,
            RecordStatus::Busy => self.busy += 1,
        }
        self.records.push(summary);
    }

    fn add_run(&mut self, run: RecordRun, registry: &PassRegistry) {
        let remaining_runnable = registry.definitions().any(|d| {
            d.backend.is_runnable() && !run.completed_passes.iter().any(|p| p == &d.name)
        });
        let status = if !remaining_runnable {
            RecordStatus::Completed
        } else if run.completed_count() > 0 {
            RecordStatus::Partial
        } else {
            RecordStatus::NoProgress
        };
        self.push(RecordSummary {
            artifact_path: run.artifact_path,
            status,
            outcomes: run.outcomes,
            completed_passes: run.completed_passes,
            error: None,
            score_error: run.score_error,
        });
    }

    fn add_error(&mut self, record: &AnalysisRecord, error: String) {
        self.push(RecordSummary {
            artifact_path: record.artifact_path.clone(),
            status: RecordStatus::Errored,
            outcomes: Vec::new(),
            completed_passes: record.completed_passes.clone(),
            error: Some(error),
            score_error: None,
        });
    }

    fn add_busy(&mut self, record: &AnalysisRecord) {
        self.push(RecordSummary {
            artifact_path: record.artifact_path.clone(),
            status: RecordStatus::Busy,
            outcomes: Vec::new(),
            completed_passes: record.completed_passes.clone(),
            error: None,
            score_error: None,
        });
    }

    fn sort(&mut self) {
        self.records
            .sort_by(|a, b| a.artifact_path.cmp(&b.artifact_path));
    }
}

// ============ Record locks ============

/// In-process exclusion so one record has at most one active executor.
#[derive(Debug, Clone, Default)]
pub struct RecordLocks {
    held: Arc<Mutex<HashSet<i64>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `record_id`, or `None` if it is already claimed.
    pub fn try_lock(&self, record_id: i64) -> Option<RecordGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.insert(record_id) {
            Some(RecordGuard {
                locks: self.clone(),
                record_id,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self, record_id: i64) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&record_id)
    }
}

/// Releases the record claim on drop.
#[derive(Debug)]
pub struct RecordGuard {
    locks: RecordLocks,
    record_id: i64,
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.record_id);
    }
}

// ============ Runner ============

pub struct BatchRunner {
    store: Arc<dyn ArtifactStore>,
    executor: PassExecutor,
    locks: RecordLocks,
    progress: Arc<dyn ProgressReporter>,
    shutdown: Arc<AtomicBool>,
}

impl BatchRunner {
    pub fn new(store: Arc<dyn ArtifactStore>, backends: Backends) -> Self {
        Self {
            executor: PassExecutor::new(store.clone(), backends),
            store,
            locks: RecordLocks::new(),
            progress: Arc::new(NoProgress),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.executor = self.executor.with_artifact_root(root);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Share locks with another runner over the same store.
    pub fn with_locks(mut self, locks: RecordLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Setting this flag stops new records and passes from starting.
    /// Passes already in flight finish and are committed.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Build the registry from `cfg` and run it.
    ///
    /// An empty pass order means there is nothing to do; any other invalid
    /// pipeline aborts before a record is touched.
    pub async fn run_configured(&self, cfg: &Config, options: &RunOptions) -> Result<Report> {
        let registry = match PassRegistry::from_config(cfg) {
            Ok(r) => r,
            Err(ConfigurationError::EmptyPassOrder) => {
                tracing::info!("no passes configured, nothing to run");
                return Ok(Report::empty(options.dry_run));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.run_all(&registry, options).await?)
    }

    /// Run every pending record through its missing passes.
    pub async fn run_all(
        &self,
        registry: &PassRegistry,
        options: &RunOptions,
    ) -> Result<Report, StoreError> {
        let run = Arc::new(RunContext::with_shutdown(
            options.dry_run,
            self.shutdown.clone(),
        ));
        let mut report = Report::new(&run.run_id, options.dry_run);

        let mut pending = self
            .store
            .find_pending(registry.get_pass_order(), options.pending_check)
            .await?;
        if let Some(limit) = options.limit {
            pending.truncate(limit);
        }
        report.pending = pending.len();
        let total = pending.len() as u64;

        tracing::info!(
            run_id = %run.run_id,
            pending = pending.len(),
            concurrency = options.concurrency,
            dry_run = options.dry_run,
            "starting run"
        );
        self.progress.report(RunProgressEvent::Started {
            run_id: run.run_id.clone(),
            total,
        });

        let registry = Arc::new(registry.clone());
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut spawned: HashMap<Id, AnalysisRecord> = HashMap::new();
        let mut finished = 0u64;

        for record in pending {
            if run.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            // Re-check after waiting for a free worker.
            if run.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let guard = match self.locks.try_lock(record.id) {
                Some(g) => g,
                None => {
                    tracing::warn!(artifact = %record.artifact_path, "record busy, skipping");
                    self.progress.report(RunProgressEvent::RecordBusy {
                        artifact: record.artifact_path.clone(),
                    });
                    report.add_busy(&record);
                    continue;
                }
            };

            let executor = self.executor.clone();
            let task_registry = registry.clone();
            let task_run = run.clone();
            let task_record = record.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                executor
                    .run_missing_passes(&task_record, &task_registry, &task_run)
                    .await
            });
            spawned.insert(handle.id(), record);

            while let Some(joined) = tasks.try_join_next_with_id() {
                finished += 1;
                self.collect(joined, &mut spawned, &registry, &mut report, finished, total);
            }
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            finished += 1;
            self.collect(joined, &mut spawned, &registry, &mut report, finished, total);
        }

        if run.is_cancelled() {
            report.cancelled = true;
        }
        report.sort();

        tracing::info!(
            run_id = %report.run_id,
            completed = report.fully_completed,
            partial = report.partially_completed,
            no_progress = report.no_progress,
            errored = report.errored,
            busy = report.busy,
            cancelled = report.cancelled,
            "run finished"
        );
        Ok(report)
    }

    fn collect(
        &self,
        joined: Result<(Id, Result<RecordRun, StoreError>), JoinError>,
        spawned: &mut HashMap<Id, AnalysisRecord>,
        registry: &PassRegistry,
        report: &mut Report,
        n: u64,
        total: u64,
    ) {
        let (artifact, completed, failed) = match joined {
            Ok((id, Ok(run))) => {
                spawned.remove(&id);
                let counts = (run.completed_count() as u64, run.failed_count() as u64);
                let artifact = run.artifact_path.clone();
                report.add_run(run, registry);
                (artifact, counts.0, counts.1)
            }
            Ok((id, Err(e))) => match spawned.remove(&id) {
                Some(record) => {
                    tracing::error!(artifact = %record.artifact_path, error = %e, "record aborted");
                    report.add_error(&record, e.to_string());
                    (record.artifact_path, 0, 0)
                }
                None => {
                    tracing::error!(error = %e, "record aborted");
                    report.errored += 1;
                    ("<unknown>".to_string(), 0, 0)
                }
            },
            Err(e) => match spawned.remove(&e.id()) {
                Some(record) => {
                    tracing::error!(artifact = %record.artifact_path, error = %e, "record worker panicked");
                    report.add_error(&record, format!("worker panicked: {}", e));
                    (record.artifact_path, 0, 0)
                }
                None => {
                    tracing::error!(error = %e, "record worker panicked");
                    report.errored += 1;
                    ("<unknown>".to_string(), 0, 0)
                }
            },
        };
        self.progress.report(RunProgressEvent::RecordFinished {
            artifact,
            n,
            total,
            completed,
            failed,
        });
    }
}

/// Print a run report (`passline run`).
pub fn print_report(report: &Report) {
    if report.run_id.is_empty() {
        println!("No passes configured. Nothing to run.");
        return;
    }

    let mode = if report.dry_run { " (dry run)" } else { "" };
    println!("run {}{}", report.run_id, mode);
    println!("  pending records:     {}", report.pending);
    println!("  fully completed:     {}", report.fully_completed);
    println!("  partially completed: {}", report.partially_completed);
    println!("  no progress:         {}", report.no_progress);
    println!("  errored:             {}", report.errored);
    if report.busy > 0 {
        println!("  busy:                {}", report.busy);
    }
    if report.cancelled {
        println!("  cancelled before all records were processed");
    }

    for record in &report.records {
        println!();
        println!("  {}", record.artifact_path);
        if let Some(e) = &record.error {
            println!("    error: {}", e);
        }
        for o in &record.outcomes {
            println!("    {:<24} {}", o.pass, o.outcome.label());
        }
        if let Some(e) = &record.score_error {
            println!("    scores rejected: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let locks = RecordLocks::new();
        let guard = locks.try_lock(1).unwrap();
        assert!(locks.try_lock(1).is_none());
        assert!(locks.try_lock(2).is_some());
        drop(guard);
        assert!(!locks.is_locked(1));
        assert!(locks.try_lock(1).is_some());
    }

    #[test]
    fn shared_locks_see_each_other() {
        let a = RecordLocks::new();
        let b = a.clone();
        let _guard = a.try_lock(5).unwrap();
        assert!(b.try_lock(5).is_none());
    }
}
