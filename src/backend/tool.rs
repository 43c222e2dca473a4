//! Static-analysis tool backend.
//!
//! Runs the pass's configured command against the artifact file with a hard
//! timeout, then parses stdout as JSON findings or plain text. A missing
//! binary is [`BackendError::Unavailable`]; a rejected exit code, timeout, or
//! unparseable output is [`BackendError::Invocation`].

use async_trait::async_trait;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::ToolOutputFormat;
use crate::error::BackendError;
use crate::models::PassOutput;
use crate::registry::{BackendSpec, PassDefinition, ToolPassParams};

use super::{Backend, BackendOutput, InvocationContext};

const BACKEND: &str = "static_tool";
const FILE_PLACEHOLDER: &str = "{file}";
const STDERR_TAIL: usize = 400;

/// Backend for passes declared with `backend = "static_tool"`.
#[derive(Debug, Default)]
pub struct StaticToolBackend;

impl StaticToolBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for StaticToolBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn invoke(
        &self,
        pass: &PassDefinition,
        ctx: &InvocationContext,
    ) -> Result<BackendOutput, BackendError> {
        let params = match &pass.backend {
            BackendSpec::StaticTool(p) => p,
            other => {
                return Err(BackendError::invocation(
                    BACKEND,
                    format!("pass '{}' is a {} pass", pass.name, other.label()),
                ))
            }
        };

        let file = ctx.file_path.to_string_lossy().to_string();
        let args = tool_args(params, &file);
        let command_line = format!("{} {}", params.command, args.join(" "));

        let child = Command::new(&params.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    BackendError::unavailable(BACKEND, format!("{}: {}", params.command, e))
                }
                _ => BackendError::invocation(
                    BACKEND,
                    format!("failed to spawn {}: {}", params.command, e),
                ),
            })?;

        // Dropping the future on timeout kills the child.
        let output = match tokio::time::timeout(params.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(BackendError::invocation(
                    BACKEND,
                    format!("{} failed: {}", params.command, e),
                ))
            }
            Err(_) => {
                return Err(BackendError::invocation(
                    BACKEND,
                    format!(
                        "{} timed out after {}s",
                        params.command,
                        params.timeout.as_secs()
                    ),
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        match output.status.code() {
            Some(code) if params.success_exit_codes.contains(&code) => {}
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(BackendError::invocation(
                    BACKEND,
                    format!(
                        "{} exited with {}: {}",
                        params.command,
                        code.map(|c| c.to_string())
                            .unwrap_or_else(|| "signal".to_string()),
                        tail(stderr.trim(), STDERR_TAIL)
                    ),
                ));
            }
        }

        Ok(BackendOutput {
            input: command_line,
            output: parse_output(params.output, &stdout)?,
            usage: None,
        })
    }
}

/// Substitute `{file}`; append the file when no argument mentions it.
pub fn tool_args(params: &ToolPassParams, file: &str) -> Vec<String> {
    let mut args: Vec<String> = params
        .args
        .iter()
        .map(|a| a.replace(FILE_PLACEHOLDER, file))
        .collect();
    if !params.args.iter().any(|a| a.contains(FILE_PLACEHOLDER)) {
        args.push(file.to_string());
    }
    args
}

pub fn parse_output(format: ToolOutputFormat, stdout: &str) -> Result<PassOutput, BackendError> {
    match format {
        ToolOutputFormat::Json => serde_json::from_str(stdout.trim())
            .map(PassOutput::Findings)
            .map_err(|e| {
                BackendError::invocation(BACKEND, format!("unparseable JSON output: {}", e))
            }),
        ToolOutputFormat::Text => Ok(PassOutput::Text(stdout.trim_end().to_string())),
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Requires;
    use std::path::PathBuf;
    use std::time::Duration;

    fn params(command: &str, args: &[&str], output: ToolOutputFormat) -> ToolPassParams {
        ToolPassParams {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            output,
            timeout: Duration::from_secs(5),
            success_exit_codes: vec![0],
        }
    }

    fn pass(p: ToolPassParams) -> PassDefinition {
        PassDefinition {
            name: "lint".to_string(),
            position: 0,
            backend: BackendSpec::StaticTool(p),
            requires: Requires::Raw,
            description: None,
        }
    }

    fn ctx() -> InvocationContext {
        InvocationContext {
            run_id: "r".to_string(),
            artifact_path: "User.php".to_string(),
            file_path: PathBuf::from("/tmp/User.php"),
            language: None,
            source: None,
            parsed: None,
            previous_results: None,
        }
    }

    #[test]
    fn file_placeholder_is_substituted() {
        let p = params("phpstan", &["analyse", "--path={file}"], ToolOutputFormat::Json);
        assert_eq!(tool_args(&p, "a.php"), vec!["analyse", "--path=a.php"]);
    }

    #[test]
    fn file_is_appended_without_placeholder() {
        let p = params("phpcs", &["--report=json"], ToolOutputFormat::Json);
        assert_eq!(tool_args(&p, "a.php"), vec!["--report=json", "a.php"]);
    }

    #[test]
    fn json_output_must_parse() {
        assert!(matches!(
            parse_output(ToolOutputFormat::Json, "{\"errors\": 1}\n"),
            Ok(PassOutput::Findings(_))
        ));
        assert!(matches!(
            parse_output(ToolOutputFormat::Json, "Line 3: error"),
            Err(BackendError::Invocation { .. })
        ));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("héllo", 3), "llo");
        assert_eq!(tail("ab", 10), "ab");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_and_parses_json() {
        let p = params(
            "sh",
            &["-c", "printf '{\"file\": \"%s\"}' \"$0\"", "{file}"],
            ToolOutputFormat::Json,
        );
        let out = StaticToolBackend::new().invoke(&pass(p), &ctx()).await.unwrap();
        assert_eq!(
            out.output,
            PassOutput::Findings(serde_json::json!({"file": "/tmp/User.php"}))
        );
        assert!(out.usage.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_invocation_error() {
        let p = params("sh", &["-c", "echo boom >&2; exit 3", "{file}"], ToolOutputFormat::Text);
        let err = StaticToolBackend::new().invoke(&pass(p), &ctx()).await.unwrap_err();
        match err {
            BackendError::Invocation { reason, .. } => {
                assert!(reason.contains("exited with 3"));
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_is_invocation_error() {
        let mut p = params("sh", &["-c", "sleep 5", "{file}"], ToolOutputFormat::Text);
        p.timeout = Duration::from_millis(100);
        let err = StaticToolBackend::new().invoke(&pass(p), &ctx()).await.unwrap_err();
        assert!(matches!(err, BackendError::Invocation { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let p = params("passline-no-such-tool", &[], ToolOutputFormat::Text);
        let err = StaticToolBackend::new().invoke(&pass(p), &ctx()).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable { .. }));
    }
}
