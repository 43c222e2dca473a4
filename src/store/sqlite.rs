//! SQLite-backed [`ArtifactStore`] implementation.
//!
//! Maps each store operation onto the `analysis_records`, `pass_results`, and
//! `scores` tables created by [`migrate`](crate::migrate). Pass commits run
//! in a single transaction so a crash can never leave a result without the
//! matching state advance (or the reverse).

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::error::StoreError;
use crate::models::{AnalysisRecord, NewRecord, PassOutput, PassResult, Score, Usage};

use super::{ArtifactStore, UpsertOutcome};

const RECORD_COLUMNS: &str = "id, artifact_path, language, raw_source, content_hash, parsed_json, \
     current_pass_index, completed_passes, created_at, updated_at";

const RESULT_COLUMNS: &str = "pass_name, input, output_kind, output, usage_json, duration_ms, created_at";

/// SQLite implementation of the [`ArtifactStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_record(row: &SqliteRow) -> Result<AnalysisRecord, StoreError> {
    let parsed_json: String = row.get("parsed_json");
    let completed_json: String = row.get("completed_passes");
    Ok(AnalysisRecord {
        id: row.get("id"),
        artifact_path: row.get("artifact_path"),
        language: row.get("language"),
        raw_source: row.get("raw_source"),
        content_hash: row.get("content_hash"),
        parsed_representation: serde_json::from_str(&parsed_json)?,
        current_pass_index: row.get("current_pass_index"),
        completed_passes: serde_json::from_str(&completed_json)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_result(row: &SqliteRow) -> Result<PassResult, StoreError> {
    let kind: String = row.get("output_kind");
    let body: String = row.get("output");
    let usage_json: Option<String> = row.get("usage_json");
    let usage = match usage_json {
        Some(s) => Some(serde_json::from_str::<Usage>(&s)?),
        None => None,
    };
    let duration_ms: i64 = row.get("duration_ms");
    Ok(PassResult {
        pass_name: row.get("pass_name"),
        input: row.get("input"),
        output: PassOutput::from_parts(&kind, &body),
        usage,
        duration_ms: duration_ms.max(0) as u64,
        created_at: row.get("created_at"),
    })
}

fn output_body(output: &PassOutput) -> Result<String, StoreError> {
    Ok(match output {
        PassOutput::Text(s) => s.clone(),
        PassOutput::Findings(v) => serde_json::to_string(v)?,
    })
}

fn duplicate(record: &AnalysisRecord, pass: &str) -> StoreError {
    StoreError::DuplicatePass {
        artifact: record.artifact_path.clone(),
        pass: pass.to_string(),
    }
}

async fn insert_result(
    conn: &mut SqliteConnection,
    record: &AnalysisRecord,
    result: &PassResult,
) -> Result<(), StoreError> {
    let usage_json = match &result.usage {
        Some(u) => Some(serde_json::to_string(u)?),
        None => None,
    };

    let inserted = sqlx::query(
        r#"
        INSERT INTO pass_results (record_id, pass_name, input, output_kind, output, usage_json, duration_ms, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.id)
    .bind(&result.pass_name)
    .bind(&result.input)
    .bind(result.output.kind())
    .bind(output_body(&result.output)?)
    .bind(usage_json)
    .bind(result.duration_ms as i64)
    .bind(result.created_at)
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(duplicate(record, &result.pass_name))
        }
        Err(e) => Err(e.into()),
    }
}

async fn append_pass(
    conn: &mut SqliteConnection,
    record: &AnalysisRecord,
    pass: &str,
) -> Result<AnalysisRecord, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM analysis_records WHERE id = ?",
        RECORD_COLUMNS
    ))
    .bind(record.id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| StoreError::RecordNotFound(record.artifact_path.clone()))?;

    let mut current = row_to_record(&row)?;
    if current.has_completed(pass) {
        return Err(duplicate(record, pass));
    }

    current.completed_passes.push(pass.to_string());
    current.current_pass_index += 1;
    current.updated_at = chrono::Utc::now().timestamp();

    sqlx::query(
        "UPDATE analysis_records SET completed_passes = ?, current_pass_index = ?, updated_at = ? WHERE id = ?",
    )
    .bind(serde_json::to_string(&current.completed_passes)?)
    .bind(current.current_pass_index)
    .bind(current.updated_at)
    .bind(current.id)
    .execute(&mut *conn)
    .await?;

    Ok(current)
}

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn upsert_record(&self, record: &NewRecord) -> Result<UpsertOutcome, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let parsed_json = serde_json::to_string(&record.parsed_representation)?;

        let existing: Option<(String, String)> = sqlx::query_as(
            "SELECT content_hash, parsed_json FROM analysis_records WHERE artifact_path = ?",
        )
        .bind(&record.artifact_path)
        .fetch_optional(&self.pool)
        .await?;

        let outcome = match existing {
            None => UpsertOutcome::Inserted,
            Some((hash, parsed)) if hash == record.content_hash && parsed == parsed_json => {
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(_) => UpsertOutcome::Updated,
        };

        // Pass state columns are left alone on conflict.
        sqlx::query(
            r#"
            INSERT INTO analysis_records (artifact_path, language, raw_source, content_hash, parsed_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(artifact_path) DO UPDATE SET
                language = excluded.language,
                raw_source = excluded.raw_source,
                content_hash = excluded.content_hash,
                parsed_json = excluded.parsed_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.artifact_path)
        .bind(&record.language)
        .bind(&record.raw_source)
        .bind(&record.content_hash)
        .bind(&parsed_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(outcome)
    }

    async fn get_record(&self, artifact_path: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM analysis_records WHERE artifact_path = ?",
            RECORD_COLUMNS
        ))
        .bind(artifact_path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list_records(&self) -> Result<Vec<AnalysisRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM analysis_records ORDER BY id ASC",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn record_pass_result(
        &self,
        record: &AnalysisRecord,
        result: &PassResult,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_result(&mut tx, record, result).await?;

        let completed: Option<String> =
            sqlx::query_scalar("SELECT completed_passes FROM analysis_records WHERE id = ?")
                .bind(record.id)
                .fetch_optional(&mut *tx)
                .await?;
        let completed: Vec<String> = match completed {
            Some(json) => serde_json::from_str(&json)?,
            None => return Err(StoreError::RecordNotFound(record.artifact_path.clone())),
        };
        if completed.iter().any(|p| p == &result.pass_name) {
            return Err(duplicate(record, &result.pass_name));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn advance(
        &self,
        record: &AnalysisRecord,
        pass_name: &str,
    ) -> Result<AnalysisRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = append_pass(&mut tx, record, pass_name).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn commit_pass(
        &self,
        record: &AnalysisRecord,
        result: &PassResult,
    ) -> Result<AnalysisRecord, StoreError> {
        // Write first so the transaction holds the write lock before it reads.
        // A result row whose pass never advanced is replaced.
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM pass_results
            WHERE record_id = ? AND pass_name = ?
              AND NOT EXISTS (
                SELECT 1 FROM analysis_records r, json_each(r.completed_passes) j
                WHERE r.id = pass_results.record_id AND j.value = pass_results.pass_name
              )
            "#,
        )
        .bind(record.id)
        .bind(&result.pass_name)
        .execute(&mut *tx)
        .await?;
        insert_result(&mut tx, record, result).await?;
        let updated = append_pass(&mut tx, record, &result.pass_name).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn pass_results(&self, record_id: i64) -> Result<Vec<PassResult>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pass_results WHERE record_id = ? ORDER BY id ASC",
            RESULT_COLUMNS
        ))
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_result).collect()
    }

    async fn latest_result(
        &self,
        record_id: i64,
        pass_name: &str,
    ) -> Result<Option<PassResult>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pass_results WHERE record_id = ? AND pass_name = ? ORDER BY id DESC LIMIT 1",
            RESULT_COLUMNS
        ))
        .bind(record_id)
        .bind(pass_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_result).transpose()
    }

    async fn save_scores(&self, record_id: i64, scores: &[Score]) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for score in scores {
            sqlx::query(
                r#"
                INSERT INTO scores (record_id, metric, value, updated_at) VALUES (?, ?, ?, ?)
                ON CONFLICT(record_id, metric) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                "#,
            )
            .bind(record_id)
            .bind(&score.metric)
            .bind(score.value)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn scores(&self, record_id: i64) -> Result<Vec<Score>, StoreError> {
        let rows = sqlx::query("SELECT metric, value FROM scores WHERE record_id = ? ORDER BY metric")
            .bind(record_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| Score {
                metric: row.get("metric"),
                value: row.get("value"),
            })
            .collect())
    }

    async fn delete_record(&self, artifact_path: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM analysis_records WHERE artifact_path = ?")
                .bind(artifact_path)
                .fetch_optional(&mut *tx)
                .await?;
        let id = match id {
            Some(id) => id,
            None => return Ok(false),
        };

        sqlx::query("DELETE FROM scores WHERE record_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pass_results WHERE record_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM analysis_records WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}
