use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // One row per artifact. `completed_passes` is a JSON array of pass names.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            artifact_path TEXT NOT NULL UNIQUE,
            language TEXT,
            raw_source TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            parsed_json TEXT NOT NULL DEFAULT '{}',
            current_pass_index INTEGER NOT NULL DEFAULT 0,
            completed_passes TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one result per (record, pass)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pass_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id INTEGER NOT NULL,
            pass_name TEXT NOT NULL,
            input TEXT NOT NULL,
            output_kind TEXT NOT NULL,
            output TEXT NOT NULL,
            usage_json TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(record_id, pass_name),
            FOREIGN KEY (record_id) REFERENCES analysis_records(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scores (
            record_id INTEGER NOT NULL,
            metric TEXT NOT NULL,
            value REAL NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (record_id, metric),
            FOREIGN KEY (record_id) REFERENCES analysis_records(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pass_results_record ON pass_results(record_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pass_results_pass ON pass_results(pass_name)")
        .execute(pool)
        .await?;

    Ok(())
}
