use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub passes: HashMap<String, PassConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Connection settings for the AI completion backend.
///
/// Per-pass `model`, `max_tokens`, and `temperature` override the defaults
/// declared here.
#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}

impl AiConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Suffix of the sidecar file an external parser writes next to each
    /// artifact (`Foo.php` -> `Foo.php.ast.json`).
    #[serde(default = "default_parsed_suffix")]
    pub parsed_suffix: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root: default_ingest_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            parsed_suffix: default_parsed_suffix(),
        }
    }
}

fn default_ingest_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.php".to_string()]
}
fn default_parsed_suffix() -> String {
    ".ast.json".to_string()
}

/// How the runner decides that a record still needs work.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingCheck {
    /// Pending while fewer passes are completed than the order holds.
    #[default]
    Count,
    /// Pending while any name in the order is not completed.
    Set,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub pending_check: PendingCheck,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            pending_check: PendingCheck::default(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default)]
    pub scoring_pass: Option<String>,
    #[serde(default = "default_score_fields")]
    pub score_fields: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            scoring_pass: None,
            score_fields: default_score_fields(),
        }
    }
}

pub fn default_score_fields() -> Vec<String> {
    vec![
        "documentation_score".to_string(),
        "functionality_score".to_string(),
        "style_score".to_string(),
        "overall_score".to_string(),
    ]
}

/// Which backend family a pass delegates to.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Ai,
    StaticTool,
    None,
}

/// Input a pass needs from the record.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Requires {
    #[default]
    Raw,
    Parsed,
    Both,
    PreviousResults,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutputFormat {
    #[default]
    Json,
    Text,
}

/// Raw `[passes.<name>]` table. Resolved into a
/// [`PassDefinition`](crate::registry::PassDefinition) by the registry.
#[derive(Debug, Deserialize, Clone)]
pub struct PassConfig {
    pub backend: BackendKind,
    #[serde(default)]
    pub requires: Requires,
    #[serde(default)]
    pub description: Option<String>,

    // AI passes
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub system: Option<String>,

    // Static tool passes
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub output: ToolOutputFormat,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_success_codes")]
    pub success_exit_codes: Vec<i32>,
}

fn default_tool_timeout_secs() -> u64 {
    120
}
fn default_success_codes() -> Vec<i32> {
    vec![0]
}

impl Config {
    /// Smallest usable config, for commands that only need a database path.
    pub fn minimal(db_path: PathBuf) -> Self {
        Self {
            db: DbConfig { path: db_path },
            ai: AiConfig::default(),
            ingest: IngestConfig::default(),
            runner: RunnerConfig::default(),
            pipeline: PipelineConfig::default(),
            passes: HashMap::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate runner
    if config.runner.concurrency == 0 {
        anyhow::bail!("runner.concurrency must be >= 1");
    }

    // Validate AI settings
    match config.ai.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown ai provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.ai.temperature) {
        anyhow::bail!("ai.temperature must be in [0.0, 2.0]");
    }

    if config.pipeline.score_fields.is_empty() {
        anyhow::bail!("pipeline.score_fields must list at least one metric");
    }

    // Pass definitions and the order are checked by the registry so that a
    // broken pipeline section still lets `init`, `ingest` and `status` work.
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("passline.toml");
        std::fs::write(&path, body).unwrap();
        (tmp, path)
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let (_tmp, path) = write_config("[db]\npath = \"./data/p.sqlite\"\n");
        let cfg = load_config(&path).unwrap();
        assert!(!cfg.ai.is_enabled());
        assert_eq!(cfg.runner.concurrency, 1);
        assert_eq!(cfg.runner.pending_check, PendingCheck::Count);
        assert_eq!(cfg.ingest.include_globs, vec!["**/*.php"]);
        assert_eq!(cfg.pipeline.score_fields.len(), 4);
        assert!(cfg.passes.is_empty());
    }

    #[test]
    fn parses_pass_tables() {
        let (_tmp, path) = write_config(
            r#"
[db]
path = "p.sqlite"

[runner]
pending_check = "set"

[pipeline]
order = ["doc", "lint"]

[passes.doc]
backend = "ai"
requires = "both"
prompt = "Document {{path}}"

[passes.lint]
backend = "static_tool"
command = "phpstan"
args = ["analyse", "--error-format=json", "{file}"]
output = "json"
timeout_secs = 30
success_exit_codes = [0, 1]
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.runner.pending_check, PendingCheck::Set);
        let doc = &cfg.passes["doc"];
        assert_eq!(doc.backend, BackendKind::Ai);
        assert_eq!(doc.requires, Requires::Both);
        let lint = &cfg.passes["lint"];
        assert_eq!(lint.backend, BackendKind::StaticTool);
        assert_eq!(lint.success_exit_codes, vec![0, 1]);
        assert_eq!(lint.timeout_secs, 30);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let (_tmp, path) = write_config("[db]\npath = \"p.sqlite\"\n[runner]\nconcurrency = 0\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let (_tmp, path) = write_config("[db]\npath = \"p.sqlite\"\n[ai]\nprovider = \"acme\"\n");
        assert!(load_config(&path).is_err());
    }
}
