//! Record inspection and removal.
//!
//! `passline show <path>` prints one record with its pass state, every stored
//! result, and its scores. `passline forget <path>` deletes a record; its
//! results and scores go with it.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::models::{AnalysisRecord, PassResult, Score};
use crate::store::{missing_passes, ArtifactStore, SqliteStore};

/// Full view of one record, as printed by `show --json`.
#[derive(Debug, Clone, Serialize)]
pub struct RecordDetail {
    pub record: AnalysisRecord,
    /// Passes from the configured order that have not completed.
    pub missing_passes: Vec<String>,
    pub results: Vec<PassResult>,
    pub scores: Vec<Score>,
}

pub async fn get_record_detail(
    store: &dyn ArtifactStore,
    config: &Config,
    artifact_path: &str,
) -> Result<RecordDetail> {
    let record = match store.get_record(artifact_path).await? {
        Some(r) => r,
        None => bail!("record not found: {}", artifact_path),
    };
    let results = store.pass_results(record.id).await?;
    let scores = store.scores(record.id).await?;

    Ok(RecordDetail {
        missing_passes: missing_passes(&record, &config.pipeline.order),
        record,
        results,
        scores,
    })
}

pub async fn run_show(config: &Config, artifact_path: &str, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let detail = get_record_detail(&store, config, artifact_path).await;
    pool.close().await;
    let detail = detail?;

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    let r = &detail.record;
    println!("--- Record ---");
    println!("id:           {}", r.id);
    println!("path:         {}", r.artifact_path);
    println!("language:     {}", r.language.as_deref().unwrap_or("(unknown)"));
    println!("content_hash: {}", r.content_hash);
    println!("created_at:   {}", format_ts_iso(r.created_at));
    println!("updated_at:   {}", format_ts_iso(r.updated_at));
    println!("pass_index:   {}", r.current_pass_index);
    println!("completed:    {}", join_or_none(&r.completed_passes));
    println!("missing:      {}", join_or_none(&detail.missing_passes));
    println!();

    println!("--- Results ({}) ---", detail.results.len());
    for result in &detail.results {
        let mut header = format!(
            "[{}] {} ms, {}",
            result.pass_name,
            result.duration_ms,
            format_ts_iso(result.created_at)
        );
        if let Some(u) = &result.usage {
            header.push_str(&format!(", {} tokens ({})", u.total_tokens, u.model));
        }
        println!("{}", header);
        println!("{}", result.output.as_text());
        println!();
    }

    if !detail.scores.is_empty() {
        println!("--- Scores ---");
        for s in &detail.scores {
            println!("{:<24} {}", s.metric, s.value);
        }
    }

    Ok(())
}

pub async fn run_forget(config: &Config, artifact_path: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let deleted = store.delete_record(artifact_path).await;
    pool.close().await;

    if !deleted? {
        bail!("record not found: {}", artifact_path);
    }
    tracing::info!(artifact = %artifact_path, "record deleted");
    println!("forgot {}", artifact_path);
    Ok(())
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewRecord, PassOutput};
    use crate::store::InMemoryStore;
    use std::path::PathBuf;

    #[tokio::test]
    async fn detail_lists_missing_passes_in_order() {
        let store = InMemoryStore::new();
        store
            .upsert_record(&NewRecord {
                artifact_path: "A.php".to_string(),
                language: Some("php".to_string()),
                raw_source: "<?php".to_string(),
                content_hash: "h".to_string(),
                parsed_representation: serde_json::json!({}),
            })
            .await
            .unwrap();
        let record = store.get_record("A.php").await.unwrap().unwrap();
        store
            .commit_pass(
                &record,
                &PassResult {
                    pass_name: "style".to_string(),
                    input: String::new(),
                    output: PassOutput::Text("ok".to_string()),
                    usage: None,
                    duration_ms: 3,
                    created_at: 0,
                },
            )
            .await
            .unwrap();

        let mut config = Config::minimal(PathBuf::from("unused.sqlite"));
        config.pipeline.order = vec!["doc".into(), "style".into(), "score".into()];

        let detail = get_record_detail(&store, &config, "A.php").await.unwrap();
        assert_eq!(detail.missing_passes, vec!["doc", "score"]);
        assert_eq!(detail.results.len(), 1);
        assert!(detail.scores.is_empty());
    }

    #[tokio::test]
    async fn unknown_path_is_an_error() {
        let store = InMemoryStore::new();
        let config = Config::minimal(PathBuf::from("unused.sqlite"));
        assert!(get_record_detail(&store, &config, "nope.php").await.is_err());
    }
}
