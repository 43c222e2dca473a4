//! Database overview.
//!
//! Summarises how far the pipeline has got: record counts, per-pass
//! completion, token usage, and the average of every stored metric. Used by
//! `passline status` to check on long batch runs.

use anyhow::Result;
use sqlx::Row;
use std::collections::HashMap;

use crate::config::{Config, PendingCheck};
use crate::db;

struct PassStats {
    pass: String,
    results: i64,
    tokens: i64,
    avg_ms: f64,
    last_ts: Option<i64>,
}

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let order = &config.pipeline.order;

    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysis_records")
        .fetch_one(&pool)
        .await?;

    // Mirrors store::is_pending so the numbers agree with the next run.
    let pending: i64 = match config.runner.pending_check {
        PendingCheck::Count => {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM analysis_records WHERE json_array_length(completed_passes) < ?",
            )
            .bind(order.len() as i64)
            .fetch_one(&pool)
            .await?
        }
        PendingCheck::Set => {
            let rows: Vec<String> = sqlx::query_scalar("SELECT completed_passes FROM analysis_records")
                .fetch_all(&pool)
                .await?;
            rows.iter()
                .filter(|raw| {
                    let done: Vec<String> = serde_json::from_str(raw).unwrap_or_default();
                    order.iter().any(|p| !done.contains(p))
                })
                .count() as i64
        }
    };

    let scored: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT record_id) FROM scores")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("passline: pipeline status");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Records:     {}", total_records);
    println!("  Pending:     {}", pending);
    println!("  Scored:      {}", scored);

    let rows = sqlx::query(
        r#"
        SELECT
            pass_name,
            COUNT(*) AS results,
            COALESCE(SUM(json_extract(usage_json, '$.total_tokens')), 0) AS tokens,
            COALESCE(AVG(duration_ms), 0.0) AS avg_ms,
            MAX(created_at) AS last_ts
        FROM pass_results
        GROUP BY pass_name
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut by_pass: HashMap<String, PassStats> = rows
        .iter()
        .map(|row| {
            let s = PassStats {
                pass: row.get("pass_name"),
                results: row.get("results"),
                tokens: row.get("tokens"),
                avg_ms: row.get("avg_ms"),
                last_ts: row.get("last_ts"),
            };
            (s.pass.clone(), s)
        })
        .collect();

    // Configured order first, then passes that were removed from it.
    let mut stats: Vec<PassStats> = order
        .iter()
        .map(|name| {
            by_pass.remove(name).unwrap_or(PassStats {
                pass: name.clone(),
                results: 0,
                tokens: 0,
                avg_ms: 0.0,
                last_ts: None,
            })
        })
        .collect();
    let mut removed: Vec<PassStats> = by_pass.into_values().collect();
    removed.sort_by(|a, b| a.pass.cmp(&b.pass));
    stats.extend(removed);

    if !stats.is_empty() {
        println!();
        println!("  By pass:");
        println!(
            "  {:<24} {:>12} {:>10} {:>9}   {}",
            "PASS", "DONE", "TOKENS", "AVG MS", "LAST RUN"
        );
        println!("  {}", "-".repeat(76));
        for s in &stats {
            let last = match s.last_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            let marker = if order.contains(&s.pass) { "" } else { " *" };
            println!(
                "  {:<24} {:>12} {:>10} {:>9.0}   {}",
                format!("{}{}", s.pass, marker),
                format!("{} / {}", s.results, total_records),
                s.tokens,
                s.avg_ms,
                last
            );
        }
        if stats.iter().any(|s| !order.contains(&s.pass)) {
            println!("  * not in the configured pass order");
        }
    }

    let metric_rows = sqlx::query(
        "SELECT metric, AVG(value) AS avg, COUNT(*) AS n FROM scores GROUP BY metric ORDER BY metric",
    )
    .fetch_all(&pool)
    .await?;

    if !metric_rows.is_empty() {
        println!();
        println!("  Scores:");
        for row in &metric_rows {
            let metric: String = row.get("metric");
            let avg: f64 = row.get("avg");
            let n: i64 = row.get("n");
            println!("  {:<24} avg {:>6.1}  ({} records)", metric, avg, n);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanised() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
    }
}
