//! Pass registry: the catalog of known passes and their global order.
//!
//! Built from the `[pipeline]` and `[passes.<name>]` sections of the config.
//! Each raw pass table is resolved once, at load time, into a
//! [`PassDefinition`] whose [`BackendSpec`] carries exactly the parameters its
//! backend needs, so the executor dispatches on an enum rather than on
//! string identifiers.
//!
//! ```toml
//! [pipeline]
//! order = ["documentation", "phpstan", "score"]
//! scoring_pass = "score"
//!
//! [passes.documentation]
//! backend = "ai"
//! requires = "raw"
//! prompt = "Write PHPDoc for:\n{{source}}"
//!
//! [passes.phpstan]
//! backend = "static_tool"
//! command = "vendor/bin/phpstan"
//! args = ["analyse", "--error-format=json", "{file}"]
//! ```
//!
//! The registry is read fresh for every batch run and is immutable while the
//! run lasts.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::config::{self, BackendKind, Config, PassConfig, Requires, ToolOutputFormat};
use crate::error::ConfigurationError;

// ═══════════════════════════════════════════════════════════════════════
// Definitions
// ═══════════════════════════════════════════════════════════════════════

/// Parameters for an AI-backed pass, with config defaults already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AiPassParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub prompt: String,
    pub system: Option<String>,
}

/// Parameters for a pass that shells out to a static-analysis tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPassParams {
    pub command: String,
    /// Arguments; `{file}` is replaced by the artifact path. When no argument
    /// contains the placeholder, the path is appended.
    pub args: Vec<String>,
    pub output: ToolOutputFormat,
    pub timeout: Duration,
    pub success_exit_codes: Vec<i32>,
}

/// Backend selection, resolved when the registry is loaded.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendSpec {
    Ai(AiPassParams),
    StaticTool(ToolPassParams),
    /// Placeholder pass: never executed, never marked complete.
    None,
}

impl BackendSpec {
    pub fn label(&self) -> &'static str {
        match self {
            BackendSpec::Ai(_) => "ai",
            BackendSpec::StaticTool(_) => "static_tool",
            BackendSpec::None => "none",
        }
    }

    pub fn is_runnable(&self) -> bool {
        !matches!(self, BackendSpec::None)
    }
}

/// One pass in the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct PassDefinition {
    pub name: String,
    /// Zero-based index in the global pass order.
    pub position: usize,
    pub backend: BackendSpec,
    pub requires: Requires,
    pub description: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct PassRegistry {
    order: Vec<String>,
    definitions: HashMap<String, PassDefinition>,
    scoring_pass: Option<String>,
    score_fields: Vec<String>,
}

impl PassRegistry {
    /// Resolve and validate every pass in `cfg.pipeline.order`.
    ///
    /// Passes defined under `[passes]` but absent from the order are ignored.
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigurationError> {
        let order = &cfg.pipeline.order;
        if order.is_empty() {
            return Err(ConfigurationError::EmptyPassOrder);
        }

        let mut seen = HashSet::new();
        let mut definitions = HashMap::with_capacity(order.len());

        for (position, name) in order.iter().enumerate() {
            if !seen.insert(name.as_str()) {
                return Err(ConfigurationError::DuplicateInOrder(name.clone()));
            }
            let raw = cfg
                .passes
                .get(name)
                .ok_or_else(|| ConfigurationError::UnknownPass(name.clone()))?;
            let definition = resolve_definition(name, position, raw, &cfg.ai)?;
            definitions.insert(name.clone(), definition);
        }

        if let Some(scoring) = &cfg.pipeline.scoring_pass {
            if !definitions.contains_key(scoring) {
                return Err(ConfigurationError::UnknownScoringPass(scoring.clone()));
            }
        }

        Ok(Self {
            order: order.clone(),
            definitions,
            scoring_pass: cfg.pipeline.scoring_pass.clone(),
            score_fields: cfg.pipeline.score_fields.clone(),
        })
    }

    pub fn get_pass_order(&self) -> &[String] {
        &self.order
    }

    pub fn get_definition(&self, name: &str) -> Result<&PassDefinition, ConfigurationError> {
        self.definitions
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownPass(name.to_string()))
    }

    /// Definitions in pass order.
    pub fn definitions(&self) -> impl Iterator<Item = &PassDefinition> {
        self.order.iter().filter_map(|n| self.definitions.get(n))
    }

    pub fn scoring_pass(&self) -> Option<&str> {
        self.scoring_pass.as_deref()
    }

    pub fn is_scoring_pass(&self, name: &str) -> bool {
        self.scoring_pass() == Some(name)
    }

    pub fn score_fields(&self) -> &[String] {
        &self.score_fields
    }
}

fn resolve_definition(
    name: &str,
    position: usize,
    raw: &PassConfig,
    ai: &config::AiConfig,
) -> Result<PassDefinition, ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::InvalidDefinition {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let backend = match raw.backend {
        BackendKind::Ai => {
            let prompt = raw
                .prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .ok_or_else(|| invalid("ai passes need a non-empty `prompt`"))?;
            let temperature = raw.temperature.unwrap_or(ai.temperature);
            if !(0.0..=2.0).contains(&temperature) {
                return Err(invalid("`temperature` must be in [0.0, 2.0]"));
            }
            let max_tokens = raw.max_tokens.unwrap_or(ai.max_tokens);
            if max_tokens == 0 {
                return Err(invalid("`max_tokens` must be > 0"));
            }
            BackendSpec::Ai(AiPassParams {
                model: raw.model.clone().unwrap_or_else(|| ai.model.clone()),
                max_tokens,
                temperature,
                prompt,
                system: raw.system.clone(),
            })
        }
        BackendKind::StaticTool => {
            let command = raw
                .command
                .clone()
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| invalid("static_tool passes need a `command`"))?;
            if raw.timeout_secs == 0 {
                return Err(invalid("`timeout_secs` must be > 0"));
            }
            if raw.success_exit_codes.is_empty() {
                return Err(invalid("`success_exit_codes` must not be empty"));
            }
            BackendSpec::StaticTool(ToolPassParams {
                command,
                args: raw.args.clone(),
                output: raw.output,
                timeout: Duration::from_secs(raw.timeout_secs),
                success_exit_codes: raw.success_exit_codes.clone(),
            })
        }
        BackendKind::None => BackendSpec::None,
    };

    Ok(PassDefinition {
        name: name.to_string(),
        position,
        backend,
        requires: raw.requires,
        description: raw.description.clone(),
    })
}

/// Print the configured pipeline (`passline passes`).
pub fn list_passes(cfg: &Config) -> Result<()> {
    let registry = match PassRegistry::from_config(cfg) {
        Ok(r) => r,
        Err(ConfigurationError::EmptyPassOrder) => {
            println!("No passes configured. Add [pipeline].order to the config.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "{:<4} {:<24} {:<12} {:<18} DETAILS",
        "#", "PASS", "BACKEND", "REQUIRES"
    );
    for def in registry.definitions() {
        let details = match &def.backend {
            BackendSpec::Ai(p) => format!("model={} max_tokens={}", p.model, p.max_tokens),
            BackendSpec::StaticTool(p) => {
                format!("{} {} (timeout {}s)", p.command, p.args.join(" "), p.timeout.as_secs())
            }
            BackendSpec::None => "placeholder".to_string(),
        };
        let marker = if registry.is_scoring_pass(&def.name) {
            " [scoring]"
        } else {
            ""
        };
        println!(
            "{:<4} {:<24} {:<12} {:<18} {}{}",
            def.position + 1,
            def.name,
            def.backend.label(),
            format!("{:?}", def.requires).to_lowercase(),
            details,
            marker
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ai_pass(prompt: &str) -> PassConfig {
        toml::from_str(&format!("backend = \"ai\"\nprompt = {:?}\n", prompt)).unwrap()
    }

    fn tool_pass(command: &str) -> PassConfig {
        toml::from_str(&format!("backend = \"static_tool\"\ncommand = {:?}\n", command)).unwrap()
    }

    fn none_pass() -> PassConfig {
        toml::from_str("backend = \"none\"\n").unwrap()
    }

    fn config_with(order: &[&str], passes: Vec<(&str, PassConfig)>) -> Config {
        let mut cfg = Config::minimal(PathBuf::from("unused.sqlite"));
        cfg.pipeline.order = order.iter().map(|s| s.to_string()).collect();
        for (name, pass) in passes {
            cfg.passes.insert(name.to_string(), pass);
        }
        cfg
    }

    #[test]
    fn resolves_backends_in_order() {
        let cfg = config_with(
            &["doc", "lint", "later"],
            vec![
                ("doc", ai_pass("Explain {{source}}")),
                ("lint", tool_pass("phpstan")),
                ("later", none_pass()),
            ],
        );
        let reg = PassRegistry::from_config(&cfg).unwrap();
        assert_eq!(reg.get_pass_order(), &["doc", "lint", "later"]);

        let doc = reg.get_definition("doc").unwrap();
        assert_eq!(doc.position, 0);
        match &doc.backend {
            BackendSpec::Ai(p) => {
                assert_eq!(p.model, "gpt-4o-mini");
                assert_eq!(p.max_tokens, 1024);
            }
            other => panic!("expected ai backend, got {:?}", other),
        }
        assert!(matches!(
            reg.get_definition("lint").unwrap().backend,
            BackendSpec::StaticTool(_)
        ));
        assert!(!reg.get_definition("later").unwrap().backend.is_runnable());

        let names: Vec<_> = reg.definitions().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["doc", "lint", "later"]);
    }

    #[test]
    fn empty_order_is_reported() {
        let cfg = config_with(&[], vec![]);
        assert_eq!(
            PassRegistry::from_config(&cfg).unwrap_err(),
            ConfigurationError::EmptyPassOrder
        );
    }

    #[test]
    fn unknown_pass_in_order() {
        let cfg = config_with(&["doc", "ghost"], vec![("doc", ai_pass("x"))]);
        assert_eq!(
            PassRegistry::from_config(&cfg).unwrap_err(),
            ConfigurationError::UnknownPass("ghost".to_string())
        );
    }

    #[test]
    fn duplicate_name_in_order() {
        let cfg = config_with(&["doc", "doc"], vec![("doc", ai_pass("x"))]);
        assert_eq!(
            PassRegistry::from_config(&cfg).unwrap_err(),
            ConfigurationError::DuplicateInOrder("doc".to_string())
        );
    }

    #[test]
    fn ai_pass_without_prompt_is_invalid() {
        let raw: PassConfig = toml::from_str("backend = \"ai\"\n").unwrap();
        let cfg = config_with(&["doc"], vec![("doc", raw)]);
        assert!(matches!(
            PassRegistry::from_config(&cfg).unwrap_err(),
            ConfigurationError::InvalidDefinition { .. }
        ));
    }

    #[test]
    fn scoring_pass_must_be_in_order() {
        let mut cfg = config_with(&["doc"], vec![("doc", ai_pass("x"))]);
        cfg.pipeline.scoring_pass = Some("score".to_string());
        assert_eq!(
            PassRegistry::from_config(&cfg).unwrap_err(),
            ConfigurationError::UnknownScoringPass("score".to_string())
        );
    }

    #[test]
    fn unknown_definition_lookup_fails() {
        let cfg = config_with(&["doc"], vec![("doc", ai_pass("x"))]);
        let reg = PassRegistry::from_config(&cfg).unwrap();
        assert!(reg.get_definition("nope").is_err());
        assert!(!reg.is_scoring_pass("doc"));
    }
}
