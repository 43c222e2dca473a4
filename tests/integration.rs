//! End-to-end CLI tests.
//!
//! Each test builds a scratch project with PHP files and a config whose
//! passes are shell one-liners, then drives the `passline` binary through
//! init → ingest → run → show.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const TOOL_PASSES: &str = r#"
[pipeline]
order = ["lines", "shape", "grade"]
scoring_pass = "grade"

[passes.lines]
backend = "static_tool"
description = "Line count"
command = "sh"
args = ["-c", 'wc -l < "$0" | tr -d " "', "{file}"]
output = "text"

[passes.shape]
backend = "static_tool"
command = "sh"
args = ["-c", 'printf "{\"lines\": %s}" "$(wc -l < "$0" | tr -d " ")"', "{file}"]
output = "json"

[passes.grade]
backend = "static_tool"
command = "sh"
args = ["-c", 'echo "{\"documentation_score\": 70, \"functionality_score\": 80, \"style_score\": 90, \"overall_score\": 80}"', "{file}"]
output = "json"
"#;

const MIXED_PASSES: &str = r#"
[pipeline]
order = ["lines", "summary"]

[passes.lines]
backend = "static_tool"
command = "sh"
args = ["-c", 'wc -l < "$0" | tr -d " "', "{file}"]
output = "text"

[passes.summary]
backend = "ai"
prompt = "Summarise {{path}}:\n{{source}}"
"#;

fn passline_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("passline");
    path
}

fn setup_test_env(passes: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let src = root.join("src");
    fs::create_dir_all(src.join("Models")).unwrap();
    fs::write(
        src.join("Models/User.php"),
        "<?php\n\nclass User\n{\n    public $name;\n}\n",
    )
    .unwrap();
    fs::write(src.join("helpers.php"), "<?php\nfunction slug($s) { return $s; }\n").unwrap();
    fs::write(src.join("notes.txt"), "not php\n").unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/passline.sqlite"

[ingest]
root = "{}/src"
include_globs = ["**/*.php"]

[ai]
provider = "disabled"
"#,
        root.display(),
        root.display()
    ) + passes;

    let config_path = config_dir.join("passline.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_passline(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = passline_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run passline binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn prepared(passes: &str) -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env(passes);
    let (_, stderr, ok) = run_passline(&config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    let (_, stderr, ok) = run_passline(&config_path, &["ingest"]);
    assert!(ok, "ingest failed: {}", stderr);
    (tmp, config_path)
}

fn run_json(config_path: &Path, extra: &[&str]) -> serde_json::Value {
    let mut args = vec!["run", "--json", "--progress", "off"];
    args.extend_from_slice(extra);
    let (stdout, stderr, ok) = run_passline(config_path, &args);
    assert!(ok, "run failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("bad report {}: {}", e, stdout))
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env(TOOL_PASSES);

    let (stdout, _, ok) = run_passline(&config_path, &["init"]);
    assert!(ok);
    assert!(stdout.contains("initialized"));

    let (_, _, ok) = run_passline(&config_path, &["init"]);
    assert!(ok, "second init failed (not idempotent)");
}

#[test]
fn test_ingest_counts_and_dry_run() {
    let (_tmp, config_path) = setup_test_env(TOOL_PASSES);
    run_passline(&config_path, &["init"]);

    let (stdout, _, ok) = run_passline(&config_path, &["ingest", "--dry-run"]);
    assert!(ok);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("artifacts found: 2"));
    assert!(stdout.contains("Models/User.php"));

    let (stdout, _, ok) = run_passline(&config_path, &["ingest"]);
    assert!(ok);
    assert!(stdout.contains("inserted: 2"), "got: {}", stdout);

    let (stdout, _, _) = run_passline(&config_path, &["ingest"]);
    assert!(stdout.contains("unchanged: 2"), "got: {}", stdout);
}

#[test]
fn test_passes_lists_order() {
    let (_tmp, config_path) = setup_test_env(TOOL_PASSES);
    let (stdout, _, ok) = run_passline(&config_path, &["passes"]);
    assert!(ok);
    let lines = stdout.find("lines").unwrap();
    let shape = stdout.find("shape").unwrap();
    let grade = stdout.find("grade").unwrap();
    assert!(lines < shape && shape < grade);
    assert!(stdout.contains("static_tool"));
}

#[test]
fn test_dry_run_writes_nothing() {
    let (_tmp, config_path) = prepared(TOOL_PASSES);

    let report = run_json(&config_path, &["--dry-run"]);
    assert_eq!(report["dry_run"], true);
    assert_eq!(report["pending"], 2);
    assert_eq!(report["no_progress"], 2);

    let (stdout, _, ok) = run_passline(&config_path, &["show", "helpers.php", "--json"]);
    assert!(ok);
    let detail: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(detail["results"].as_array().unwrap().len(), 0);
    assert_eq!(detail["record"]["current_pass_index"], 0);
}

#[test]
fn test_run_completes_and_is_idempotent() {
    let (_tmp, config_path) = prepared(TOOL_PASSES);

    let report = run_json(&config_path, &["--concurrency", "2"]);
    assert_eq!(report["fully_completed"], 2, "report: {}", report);
    assert_eq!(report["errored"], 0);

    let again = run_json(&config_path, &[]);
    assert_eq!(again["pending"], 0);

    let (stdout, _, ok) = run_passline(&config_path, &["show", "Models/User.php", "--json"]);
    assert!(ok);
    let detail: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(
        detail["record"]["completed_passes"],
        serde_json::json!(["lines", "shape", "grade"])
    );

    let results = detail["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["output"]["value"], "6");
    assert_eq!(results[1]["output"]["value"]["lines"], 6);

    let scores = detail["scores"].as_array().unwrap();
    assert_eq!(scores.len(), 4);
    assert!(scores
        .iter()
        .any(|s| s["metric"] == "overall_score" && s["value"] == 80.0));
}

#[test]
fn test_unavailable_ai_backend_leaves_record_partial() {
    let (_tmp, config_path) = prepared(MIXED_PASSES);

    let report = run_json(&config_path, &[]);
    assert_eq!(report["partially_completed"], 2, "report: {}", report);

    let record = &report["records"][0];
    assert_eq!(record["outcomes"][0]["outcome"]["status"], "completed");
    assert_eq!(record["outcomes"][1]["outcome"]["status"], "failed");
    assert!(record["outcomes"][1]["outcome"]["reason"]
        .as_str()
        .unwrap()
        .contains("unavailable"));

    // Only the failed pass is attempted again.
    let again = run_json(&config_path, &[]);
    assert_eq!(again["records"][0]["outcomes"].as_array().unwrap().len(), 1);
}

#[test]
fn test_status_and_text_show() {
    let (_tmp, config_path) = prepared(TOOL_PASSES);
    run_json(&config_path, &[]);

    let (stdout, _, ok) = run_passline(&config_path, &["status"]);
    assert!(ok);
    assert!(stdout.contains("Records:     2"), "got: {}", stdout);
    assert!(stdout.contains("Pending:     0"));
    assert!(stdout.contains("overall_score"));

    let (stdout, _, ok) = run_passline(&config_path, &["show", "helpers.php"]);
    assert!(ok);
    assert!(stdout.contains("--- Record ---"));
    assert!(stdout.contains("[grade]"));
    assert!(stdout.contains("--- Scores ---"));
}

#[test]
fn test_forget_removes_record() {
    let (_tmp, config_path) = prepared(TOOL_PASSES);
    run_json(&config_path, &[]);

    let (stdout, _, ok) = run_passline(&config_path, &["forget", "helpers.php"]);
    assert!(ok);
    assert!(stdout.contains("forgot helpers.php"));

    let (_, _, ok) = run_passline(&config_path, &["show", "helpers.php"]);
    assert!(!ok);
    let (_, _, ok) = run_passline(&config_path, &["forget", "helpers.php"]);
    assert!(!ok);

    // Re-ingesting brings it back with no completed passes.
    let (stdout, _, _) = run_passline(&config_path, &["ingest"]);
    assert!(stdout.contains("inserted: 1"));
    let report = run_json(&config_path, &[]);
    assert_eq!(report["pending"], 1);
}

#[test]
fn test_invalid_pipeline_aborts_run() {
    let broken = r#"
[pipeline]
order = ["lines", "nope"]

[passes.lines]
backend = "static_tool"
command = "sh"
args = ["-c", "true"]
output = "text"
"#;
    let (_tmp, config_path) = prepared(broken);
    let (_, stderr, ok) = run_passline(&config_path, &["run"]);
    assert!(!ok);
    assert!(stderr.contains("nope"), "stderr: {}", stderr);
}
