use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "batchline_cli_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn batchline(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_batchline"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("run batchline {args:?}: {e}"))
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

#[test]
fn help_lists_subcommands() {
    let output = batchline(&["help"]);
    assert!(output.status.success(), "batchline help failed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run"), "missing run in help output");
    assert!(stdout.contains("validate"), "missing validate in help output");
    assert!(stdout.contains("defaults"), "missing defaults in help output");
}

#[test]
fn defaults_prints_loadable_config() {
    let output = batchline(&["defaults"]);
    assert!(output.status.success(), "defaults failed");

    let value = stdout_json(&output);
    assert_eq!(value["config_schema_version"], 1);
    assert_eq!(value["batch_size"], 1);
    assert_eq!(value["batching_timeout_ms"], 3000);

    let dir = unique_temp_dir("defaults");
    let path = dir.join("engine.json");
    fs::write(&path, &output.stdout).expect("write config");
    let output = batchline(&["validate", "--config", path.to_str().expect("utf8 path")]);
    assert!(
        output.status.success(),
        "defaults output should validate: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn validate_json_reports_resolved_sizing() {
    let dir = unique_temp_dir("validate_ok");
    let path = dir.join("engine.json");
    fs::write(
        &path,
        r#"{"config_schema_version":1,"batch_size":4,"batching_timeout_ms":25}"#,
    )
    .expect("write config");

    let output = batchline(&[
        "validate",
        "--config",
        path.to_str().expect("utf8 path"),
        "--json",
    ]);
    assert!(output.status.success(), "validate failed");

    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "validate");
    assert_eq!(value["ok"], true);
    assert_eq!(value["batch_size"], 4);
    // 3 per-item tasks times 4 items plus 4 batch tasks.
    assert_eq!(value["worker_threads"], 16);
    assert_eq!(value["queue_capacity"], 256);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn validate_json_rejects_schema_mismatch() {
    let dir = unique_temp_dir("validate_bad");
    let path = dir.join("engine.json");
    fs::write(&path, r#"{"config_schema_version":7,"batch_size":4}"#).expect("write config");

    let output = batchline(&[
        "validate",
        "--config",
        path.to_str().expect("utf8 path"),
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(100));

    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "validate");
    assert_eq!(value["ok"], false);
    assert!(
        value["error"]
            .as_str()
            .is_some_and(|e| e.contains("Config schema mismatch")),
        "error should report the schema mismatch: {value}"
    );
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn validate_missing_file_exits_with_config_code() {
    let output = batchline(&[
        "validate",
        "--config",
        "/nonexistent/batchline/engine.json",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(100));
    assert_eq!(stdout_json(&output)["ok"], false);
}

#[test]
fn run_json_summarizes_every_frame() {
    let output = batchline(&[
        "run",
        "--frames",
        "10",
        "--batch-size",
        "4",
        "--timeout-ms",
        "1000",
        "--progress",
        "off",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "run");
    assert_eq!(value["ok"], true);
    assert_eq!(value["frames"], 10);
    assert_eq!(value["items"], 10);
    assert_eq!(value["succeeded"], 10);
    assert_eq!(value["failed"], 0);
    // Two full batches plus the remainder sealed by timeout or EOS.
    assert_eq!(value["batches"], 3);
}

#[test]
fn run_object_mode_counts_objects() {
    let output = batchline(&[
        "run",
        "--frames",
        "3",
        "--batch-size",
        "2",
        "--object-infer",
        "--objects-per-frame",
        "3",
        "--progress",
        "off",
        "--json",
    ]);
    assert!(output.status.success(), "object run failed");

    let value = stdout_json(&output);
    assert_eq!(value["frames"], 3);
    assert_eq!(value["items"], 9);
    assert_eq!(value["succeeded"], 9);
    assert_eq!(value["batches"], 5);
}

#[test]
fn run_interval_skips_frames() {
    let output = batchline(&[
        "run",
        "--frames",
        "6",
        "--interval",
        "3",
        "--timeout-ms",
        "0",
        "--progress",
        "off",
        "--json",
    ]);
    assert!(output.status.success(), "interval run failed");

    let value = stdout_json(&output);
    assert_eq!(value["items"], 6);
    assert_eq!(value["succeeded"], 2);
    assert_eq!(value["skipped"], 4);
}

#[test]
fn run_jsonl_progress_goes_to_stderr() {
    let output = batchline(&[
        "run",
        "--frames",
        "4",
        "--progress",
        "jsonl",
        "--json",
    ]);
    assert!(output.status.success(), "jsonl run failed");

    // stdout holds exactly the summary.
    assert_eq!(stdout_json(&output)["command"], "run");

    let stderr = String::from_utf8_lossy(&output.stderr);
    let final_line = stderr
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .find(|v| v["type"] == "progress" && v["final"] == true)
        .expect("final progress line on stderr");
    assert_schema_version(&final_line);
    assert_eq!(final_line["items"]["submitted"], 4);
}

#[test]
fn run_rejects_zero_batch_size() {
    let output = batchline(&["run", "--batch-size", "0", "--json"]);
    assert_eq!(output.status.code(), Some(100));

    let value = stdout_json(&output);
    assert_eq!(value["command"], "run");
    assert_eq!(value["ok"], false);
}
