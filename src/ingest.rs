//! Artifact ingestion.
//!
//! Walks `[ingest].root`, turns every matching file into a [`NewRecord`] and
//! upserts it into the store. Re-ingesting a changed file refreshes its source
//! and parsed representation; pass state is never reset here.
//!
//! The parsed representation comes from an [`ArtifactParser`]. The default
//! [`SidecarParser`] picks up JSON that an external parser wrote next to the
//! artifact, and falls back to a small summary object when there is none.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::{Config, IngestConfig};
use crate::db;
use crate::models::NewRecord;
use crate::store::{ArtifactStore, SqliteStore, UpsertOutcome};

/// Produces the parsed representation of one artifact.
pub trait ArtifactParser: Send + Sync {
    fn parse(&self, path: &Path, relative: &str, source: &str) -> Result<serde_json::Value>;
}

/// Reads `<file><suffix>` when present, otherwise summarises the source.
pub struct SidecarParser {
    suffix: String,
}

impl SidecarParser {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl ArtifactParser for SidecarParser {
    fn parse(&self, path: &Path, relative: &str, source: &str) -> Result<serde_json::Value> {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(&self.suffix);
        let sidecar = Path::new(&sidecar);

        if sidecar.is_file() {
            let parsed = std::fs::read_to_string(sidecar)
                .with_context(|| format!("Failed to read {}", sidecar.display()))
                .and_then(|raw| {
                    serde_json::from_str::<serde_json::Value>(&raw)
                        .with_context(|| format!("Invalid JSON in {}", sidecar.display()))
                });
            match parsed {
                Ok(value) => return Ok(value),
                Err(e) => tracing::warn!(
                    path = %relative,
                    error = %format!("{:#}", e),
                    "ignoring sidecar, using summary"
                ),
            }
        }

        Ok(serde_json::json!({
            "path": relative,
            "language": detect_language(relative),
            "lines": source.lines().count(),
            "bytes": source.len(),
            "sha256": content_hash(source),
        }))
    }
}

/// Counts of what one ingest did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub scanned: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Scan the ingest root for artifacts, sorted by path.
pub fn scan_artifacts(cfg: &IngestConfig, parser: &dyn ArtifactParser) -> Result<Vec<NewRecord>> {
    let root = &cfg.root;
    if !root.exists() {
        bail!("Ingest root does not exist: {}", root.display());
    }

    let include_set = build_globset(&cfg.include_globs)?;

    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/vendor/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(cfg.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut records = Vec::new();

    for entry in WalkDir::new(root).follow_links(cfg.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if rel_str.ends_with(&cfg.parsed_suffix) || exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        let source = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %e, "skipping unreadable file");
                continue;
            }
        };
        let parsed = match parser.parse(path, &rel_str, &source) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(
                    path = %rel_str,
                    error = %format!("{:#}", e),
                    "skipping unparseable file"
                );
                continue;
            }
        };

        records.push(NewRecord {
            language: detect_language(&rel_str),
            content_hash: content_hash(&source),
            artifact_path: rel_str,
            raw_source: source,
            parsed_representation: parsed,
        });
    }

    records.sort_by(|a, b| a.artifact_path.cmp(&b.artifact_path));
    Ok(records)
}

/// Upsert every record and tally the outcomes.
pub async fn ingest_records(
    store: &dyn ArtifactStore,
    records: &[NewRecord],
) -> Result<IngestSummary> {
    let mut summary = IngestSummary {
        scanned: records.len(),
        ..Default::default()
    };
    for record in records {
        match store.upsert_record(record).await? {
            UpsertOutcome::Inserted => summary.inserted += 1,
            UpsertOutcome::Updated => summary.updated += 1,
            UpsertOutcome::Unchanged => summary.unchanged += 1,
        }
    }
    Ok(summary)
}

/// `passline ingest`.
pub async fn run_ingest(config: &Config, dry_run: bool) -> Result<()> {
    let parser = SidecarParser::new(config.ingest.parsed_suffix.clone());
    let records = scan_artifacts(&config.ingest, &parser)?;

    if dry_run {
        println!("ingest {} (dry-run)", config.ingest.root.display());
        println!("  artifacts found: {}", records.len());
        for r in &records {
            println!("  {}", r.artifact_path);
        }
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let summary = ingest_records(&store, &records).await?;
    tracing::info!(
        scanned = summary.scanned,
        inserted = summary.inserted,
        updated = summary.updated,
        "ingest finished"
    );

    println!("ingest {}", config.ingest.root.display());
    println!("  scanned: {}", summary.scanned);
    println!("  inserted: {}", summary.inserted);
    println!("  updated: {}", summary.updated);
    println!("  unchanged: {}", summary.unchanged);
    println!("ok");

    pool.close().await;
    Ok(())
}

pub fn content_hash(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Language tag from the file extension.
pub fn detect_language(path: &str) -> Option<String> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    let lang = match ext.as_str() {
        "php" | "phtml" => "php",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "py" => "python",
        "rb" => "ruby",
        "rs" => "rust",
        "go" => "go",
        "java" => "java",
        _ => return None,
    };
    Some(lang.to_string())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
