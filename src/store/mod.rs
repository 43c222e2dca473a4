//! Storage abstraction for analysis records and pass results.
//!
//! The [`ArtifactStore`] trait defines every persistence operation the
//! executor, runner, and CLI need, so the pipeline can run against SQLite in
//! production and an in-memory store in tests.
//!
//! Implementations must be `Send + Sync` to be shared across runner workers.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::config::PendingCheck;
use crate::error::StoreError;
use crate::models::{AnalysisRecord, NewRecord, PassResult, Score};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// What [`ArtifactStore::upsert_record`] did with an ingested artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Source or parsed representation changed. Pass state is kept.
    Updated,
    Unchanged,
}

/// Abstract storage backend for the pass pipeline.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_record`](ArtifactStore::upsert_record) | Create or refresh a record from ingest |
/// | [`find_pending`](ArtifactStore::find_pending) | Records that still need passes |
/// | [`record_pass_result`](ArtifactStore::record_pass_result) | Store one pass result |
/// | [`advance`](ArtifactStore::advance) | Mark a pass completed |
/// | [`commit_pass`](ArtifactStore::commit_pass) | Both of the above, atomically |
/// | [`pass_results`](ArtifactStore::pass_results) | Results in completion order |
/// | [`save_scores`](ArtifactStore::save_scores) | Replace derived metrics |
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upsert_record(&self, record: &NewRecord) -> Result<UpsertOutcome, StoreError>;

    async fn get_record(&self, artifact_path: &str) -> Result<Option<AnalysisRecord>, StoreError>;

    /// All records, ordered by id.
    async fn list_records(&self) -> Result<Vec<AnalysisRecord>, StoreError>;

    /// Records that still need work under `check`, ordered by id.
    async fn find_pending(
        &self,
        pass_order: &[String],
        check: PendingCheck,
    ) -> Result<Vec<AnalysisRecord>, StoreError> {
        let records = self.list_records().await?;
        Ok(records
            .into_iter()
            .filter(|r| is_pending(r, pass_order, check))
            .collect())
    }

    /// `pass_order` without the passes `record` already completed.
    fn missing_passes(&self, record: &AnalysisRecord, pass_order: &[String]) -> Vec<String> {
        missing_passes(record, pass_order)
    }

    /// Store the result of a pass. Fails with [`StoreError::DuplicatePass`]
    /// if the pass is already completed or already has a result.
    async fn record_pass_result(
        &self,
        record: &AnalysisRecord,
        result: &PassResult,
    ) -> Result<(), StoreError>;

    /// Append `pass_name` to the completed list and bump the pass index.
    async fn advance(
        &self,
        record: &AnalysisRecord,
        pass_name: &str,
    ) -> Result<AnalysisRecord, StoreError>;

    /// [`record_pass_result`](Self::record_pass_result) and
    /// [`advance`](Self::advance) as one atomic unit. Returns the updated record.
    async fn commit_pass(
        &self,
        record: &AnalysisRecord,
        result: &PassResult,
    ) -> Result<AnalysisRecord, StoreError>;

    /// Results for a record in completion order.
    async fn pass_results(&self, record_id: i64) -> Result<Vec<PassResult>, StoreError>;

    async fn latest_result(
        &self,
        record_id: i64,
        pass_name: &str,
    ) -> Result<Option<PassResult>, StoreError>;

    /// Replace the stored value of each metric in `scores`.
    async fn save_scores(&self, record_id: i64, scores: &[Score]) -> Result<(), StoreError>;

    async fn scores(&self, record_id: i64) -> Result<Vec<Score>, StoreError>;

    /// Delete a record with its results and scores. Returns false if absent.
    async fn delete_record(&self, artifact_path: &str) -> Result<bool, StoreError>;
}

/// Order-preserving difference between the pass order and completed passes.
pub fn missing_passes(record: &AnalysisRecord, pass_order: &[String]) -> Vec<String> {
    pass_order
        .iter()
        .filter(|name| !record.has_completed(name))
        .cloned()
        .collect()
}

pub fn is_pending(record: &AnalysisRecord, pass_order: &[String], check: PendingCheck) -> bool {
    match check {
        PendingCheck::Count => record.completed_passes.len() < pass_order.len(),
        PendingCheck::Set => pass_order.iter().any(|name| !record.has_completed(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(completed: &[&str]) -> AnalysisRecord {
        AnalysisRecord {
            id: 1,
            artifact_path: "app/User.php".to_string(),
            language: Some("php".to_string()),
            raw_source: String::new(),
            content_hash: String::new(),
            parsed_representation: serde_json::json!({}),
            current_pass_index: completed.len() as i64,
            completed_passes: completed.iter().map(|s| s.to_string()).collect(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn order(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn missing_preserves_order() {
        let r = record(&["style"]);
        assert_eq!(
            missing_passes(&r, &order(&["doc", "style", "func", "score"])),
            order(&["doc", "func", "score"])
        );
    }

    #[test]
    fn missing_when_prefix_done() {
        let r = record(&["doc"]);
        assert_eq!(missing_passes(&r, &order(&["doc", "score"])), order(&["score"]));
    }

    #[test]
    fn count_check_ignores_which_passes_ran() {
        // Completed names from an older configuration still count.
        let r = record(&["old_a", "old_b"]);
        let o = order(&["doc", "score"]);
        assert!(!is_pending(&r, &o, PendingCheck::Count));
        assert!(is_pending(&r, &o, PendingCheck::Set));
    }

    #[test]
    fn both_checks_agree_on_fresh_record() {
        let r = record(&[]);
        let o = order(&["doc"]);
        assert!(is_pending(&r, &o, PendingCheck::Count));
        assert!(is_pending(&r, &o, PendingCheck::Set));
    }
}
