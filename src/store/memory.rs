//! In-memory [`ArtifactStore`] implementation for tests and embedding.
//!
//! All state lives behind a single `std::sync::RwLock`, so every method,
//! including [`commit_pass`](ArtifactStore::commit_pass), is atomic with
//! respect to other callers.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{AnalysisRecord, NewRecord, PassResult, Score};

use super::{ArtifactStore, UpsertOutcome};

#[derive(Default)]
struct Inner {
    next_id: i64,
    records: BTreeMap<i64, AnalysisRecord>,
    /// (record id, result) in insertion order.
    results: Vec<(i64, PassResult)>,
    scores: BTreeMap<(i64, String), f64>,
}

impl Inner {
    fn ensure_not_completed(&self, record: &AnalysisRecord, pass: &str) -> Result<(), StoreError> {
        let stored = self
            .records
            .get(&record.id)
            .ok_or_else(|| StoreError::RecordNotFound(record.artifact_path.clone()))?;
        let has_result = self
            .results
            .iter()
            .any(|(id, r)| *id == record.id && r.pass_name == pass);
        if stored.has_completed(pass) || has_result {
            return Err(StoreError::DuplicatePass {
                artifact: record.artifact_path.clone(),
                pass: pass.to_string(),
            });
        }
        Ok(())
    }

    fn advance(&mut self, record: &AnalysisRecord, pass: &str) -> Result<AnalysisRecord, StoreError> {
        let stored = self
            .records
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::RecordNotFound(record.artifact_path.clone()))?;
        if stored.has_completed(pass) {
            return Err(StoreError::DuplicatePass {
                artifact: record.artifact_path.clone(),
                pass: pass.to_string(),
            });
        }
        stored.completed_passes.push(pass.to_string());
        stored.current_pass_index += 1;
        stored.updated_at = chrono::Utc::now().timestamp();
        Ok(stored.clone())
    }
}

/// In-memory store for tests and embedding.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    // A poisoned lock only means another thread panicked mid-test; the data
    // is still structurally valid.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryStore {
    async fn upsert_record(&self, record: &NewRecord) -> Result<UpsertOutcome, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut inner = self.write();

        if let Some(existing) = inner
            .records
            .values_mut()
            .find(|r| r.artifact_path == record.artifact_path)
        {
            if existing.content_hash == record.content_hash
                && existing.parsed_representation == record.parsed_representation
            {
                return Ok(UpsertOutcome::Unchanged);
            }
            existing.language = record.language.clone();
            existing.raw_source = record.raw_source.clone();
            existing.content_hash = record.content_hash.clone();
            existing.parsed_representation = record.parsed_representation.clone();
            existing.updated_at = now;
            return Ok(UpsertOutcome::Updated);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.records.insert(
            id,
            AnalysisRecord {
                id,
                artifact_path: record.artifact_path.clone(),
                language: record.language.clone(),
                raw_source: record.raw_source.clone(),
                content_hash: record.content_hash.clone(),
                parsed_representation: record.parsed_representation.clone(),
                current_pass_index: 0,
                completed_passes: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(UpsertOutcome::Inserted)
    }

    async fn get_record(&self, artifact_path: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        Ok(self
            .read()
            .records
            .values()
            .find(|r| r.artifact_path == artifact_path)
            .cloned())
    }

    async fn list_records(&self) -> Result<Vec<AnalysisRecord>, StoreError> {
        Ok(self.read().records.values().cloned().collect())
    }

    async fn record_pass_result(
        &self,
        record: &AnalysisRecord,
        result: &PassResult,
    ) -> Result<(), StoreError> {
        let mut inner = self.write();
        inner.ensure_not_completed(record, &result.pass_name)?;
        inner.results.push((record.id, result.clone()));
        Ok(())
    }

    async fn advance(
        &self,
        record: &AnalysisRecord,
        pass_name: &str,
    ) -> Result<AnalysisRecord, StoreError> {
        self.write().advance(record, pass_name)
    }

    async fn commit_pass(
        &self,
        record: &AnalysisRecord,
        result: &PassResult,
    ) -> Result<AnalysisRecord, StoreError> {
        let mut inner = self.write();
        // A result whose pass never advanced is replaced.
        let updated = inner.advance(record, &result.pass_name)?;
        inner
            .results
            .retain(|(id, r)| !(*id == record.id && r.pass_name == result.pass_name));
        inner.results.push((record.id, result.clone()));
        Ok(updated)
    }

    async fn pass_results(&self, record_id: i64) -> Result<Vec<PassResult>, StoreError> {
        Ok(self
            .read()
            .results
            .iter()
            .filter(|(id, _)| *id == record_id)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn latest_result(
        &self,
        record_id: i64,
        pass_name: &str,
    ) -> Result<Option<PassResult>, StoreError> {
        Ok(self
            .read()
            .results
            .iter()
            .rev()
            .find(|(id, r)| *id == record_id && r.pass_name == pass_name)
            .map(|(_, r)| r.clone()))
    }

    async fn save_scores(&self, record_id: i64, scores: &[Score]) -> Result<(), StoreError> {
        let mut inner = self.write();
        for score in scores {
            inner
                .scores
                .insert((record_id, score.metric.clone()), score.value);
        }
        Ok(())
    }

    async fn scores(&self, record_id: i64) -> Result<Vec<Score>, StoreError> {
        Ok(self
            .read()
            .scores
            .iter()
            .filter(|((id, _), _)| *id == record_id)
            .map(|((_, metric), value)| Score {
                metric: metric.clone(),
                value: *value,
            })
            .collect())
    }

    async fn delete_record(&self, artifact_path: &str) -> Result<bool, StoreError> {
        let mut inner = self.write();
        let id = match inner
            .records
            .values()
            .find(|r| r.artifact_path == artifact_path)
            .map(|r| r.id)
        {
            Some(id) => id,
            None => return Ok(false),
        };
        inner.records.remove(&id);
        inner.results.retain(|(rid, _)| *rid != id);
        inner.scores.retain(|(rid, _), _| *rid != id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PassOutput;

    fn new_record(path: &str, body: &str) -> NewRecord {
        NewRecord {
            artifact_path: path.to_string(),
            language: Some("php".to_string()),
            raw_source: body.to_string(),
            content_hash: format!("hash:{}", body),
            parsed_representation: serde_json::json!({}),
        }
    }

    fn result(pass: &str) -> PassResult {
        PassResult {
            pass_name: pass.to_string(),
            input: "prompt".to_string(),
            output: PassOutput::Text("ok".to_string()),
            usage: None,
            duration_ms: 1,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn upsert_reports_insert_update_unchanged() {
        let store = InMemoryStore::new();
        let rec = new_record("a.php", "<?php 1;");
        assert_eq!(store.upsert_record(&rec).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_record(&rec).await.unwrap(), UpsertOutcome::Unchanged);
        let changed = new_record("a.php", "<?php 2;");
        assert_eq!(store.upsert_record(&changed).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.list_records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commit_pass_rejects_duplicates() {
        let store = InMemoryStore::new();
        store.upsert_record(&new_record("a.php", "x")).await.unwrap();
        let rec = store.get_record("a.php").await.unwrap().unwrap();

        let updated = store.commit_pass(&rec, &result("doc")).await.unwrap();
        assert_eq!(updated.completed_passes, vec!["doc"]);
        assert_eq!(updated.current_pass_index, 1);

        let err = store.commit_pass(&rec, &result("doc")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePass { .. }));
        assert_eq!(store.pass_results(rec.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn record_pass_result_then_advance() {
        let store = InMemoryStore::new();
        store.upsert_record(&new_record("a.php", "x")).await.unwrap();
        let rec = store.get_record("a.php").await.unwrap().unwrap();

        store.record_pass_result(&rec, &result("doc")).await.unwrap();
        let err = store.record_pass_result(&rec, &result("doc")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePass { .. }));
        assert!(store.get_record("a.php").await.unwrap().unwrap().completed_passes.is_empty());

        let advanced = store.advance(&rec, "doc").await.unwrap();
        assert_eq!(advanced.completed_passes, vec!["doc"]);
        assert_eq!(store.pass_results(rec.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commit_pass_replaces_unadvanced_result() {
        let store = InMemoryStore::new();
        store.upsert_record(&new_record("a.php", "x")).await.unwrap();
        let rec = store.get_record("a.php").await.unwrap().unwrap();
        store.record_pass_result(&rec, &result("doc")).await.unwrap();

        let mut fresh = result("doc");
        fresh.output = PassOutput::Text("fresh".to_string());
        let updated = store.commit_pass(&rec, &fresh).await.unwrap();
        assert_eq!(updated.completed_passes, vec!["doc"]);

        let results = store.pass_results(rec.id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].output, PassOutput::Text("fresh".to_string()));
    }

    #[tokio::test]
    async fn delete_cascades() {
        let store = InMemoryStore::new();
        store.upsert_record(&new_record("a.php", "x")).await.unwrap();
        let rec = store.get_record("a.php").await.unwrap().unwrap();
        store.commit_pass(&rec, &result("doc")).await.unwrap();
        store
            .save_scores(
                rec.id,
                &[Score {
                    metric: "overall_score".to_string(),
                    value: 70.0,
                }],
            )
            .await
            .unwrap();

        assert!(store.delete_record("a.php").await.unwrap());
        assert!(!store.delete_record("a.php").await.unwrap());
        assert!(store.pass_results(rec.id).await.unwrap().is_empty());
        assert!(store.scores(rec.id).await.unwrap().is_empty());
    }
}
