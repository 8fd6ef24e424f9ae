use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ck<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ck"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ck binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ck(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ck command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_failure_message<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ck(args);
    assert!(!output.status.success(), "command unexpectedly succeeded");
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

// Test IDs: TCLI-001
#[test]
fn db_commands_report_and_apply_migrations() {
    let sandbox = unique_temp_dir("cadencekernel-cli-db");
    let db = sandbox.join("cadence.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_str(&before, "contract_version"), "cli.v1");
    assert_eq!(as_i64(&before, "current_version"), 0);

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_i64(&dry_run, "current_version"), 0);
    assert_eq!(
        dry_run
            .get("would_apply_versions")
            .and_then(Value::as_array)
            .map(std::vec::Vec::len)
            .unwrap_or_default(),
        2
    );

    let still_unmigrated = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&still_unmigrated, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-002
#[test]
fn model_lifecycle_round_trip() {
    let sandbox = unique_temp_dir("cadencekernel-cli-model");
    let db = sandbox.join("cadence.sqlite3");

    let team = run_json([
        "--db",
        path_str(&db),
        "team",
        "create",
        "--team-id",
        "alpha",
        "--name",
        "Alpha",
    ]);
    assert_eq!(as_str(&team, "team_id"), "alpha");

    let first = run_json([
        "--db",
        path_str(&db),
        "model",
        "establish",
        "--team-id",
        "alpha",
        "--start-on",
        "2024-01-01",
        "--framework",
        "scrum",
        "--estimation",
        "story-points",
    ]);
    assert!(first.get("closed").map_or(false, Value::is_null));
    let first_id = as_str(&first, "established").to_string();

    let second = run_json([
        "--db",
        path_str(&db),
        "model",
        "establish",
        "--team-id",
        "alpha",
        "--start-on",
        "2025-01-01",
        "--framework",
        "kanban",
        "--estimation",
        "count",
    ]);
    assert_eq!(as_str(&second, "closed"), first_id);

    let timeline = run_json([
        "--db",
        path_str(&db),
        "model",
        "timeline",
        "--team-id",
        "alpha",
        "--as-of",
        "2024-06-15",
    ]);
    let entries = timeline
        .get("entries")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("timeline has no entries array: {timeline}"));
    assert_eq!(entries.len(), 2);
    assert_eq!(as_str(&entries[0], "state"), "active");
    assert_eq!(as_str(&entries[1], "state"), "future");

    let removed = run_json([
        "--db",
        path_str(&db),
        "model",
        "remove",
        "--team-id",
        "alpha",
        "--record-id",
        as_str(&second, "established"),
    ]);
    assert_eq!(as_str(&removed, "team_id"), "alpha");

    let reopened = run_json(["--db", path_str(&db), "model", "reopen", "--team-id", "alpha"]);
    assert_eq!(as_str(&reopened, "reopened"), first_id);

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-003
#[test]
fn sequencing_violations_surface_kernel_errors() {
    let sandbox = unique_temp_dir("cadencekernel-cli-errors");
    let db = sandbox.join("cadence.sqlite3");

    let _team = run_json([
        "--db",
        path_str(&db),
        "team",
        "create",
        "--team-id",
        "alpha",
        "--name",
        "Alpha",
    ]);
    let only = run_json([
        "--db",
        path_str(&db),
        "model",
        "establish",
        "--team-id",
        "alpha",
        "--start-on",
        "2024-01-01",
        "--framework",
        "scrum",
        "--estimation",
        "story-points",
    ]);

    let same_day = run_failure_message([
        "--db",
        path_str(&db),
        "model",
        "establish",
        "--team-id",
        "alpha",
        "--start-on",
        "2024-01-01",
        "--framework",
        "kanban",
        "--estimation",
        "count",
    ]);
    assert!(same_day.contains("invalid sequencing"), "stderr was: {same_day}");

    let protected = run_failure_message([
        "--db",
        path_str(&db),
        "model",
        "remove",
        "--team-id",
        "alpha",
        "--record-id",
        as_str(&only, "established"),
    ]);
    assert!(protected.contains("last record protected"), "stderr was: {protected}");

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-004
#[test]
fn checkpoint_reconcile_and_plan_show() {
    let sandbox = unique_temp_dir("cadencekernel-cli-checkpoints");
    let db = sandbox.join("cadence.sqlite3");

    let _team = run_json([
        "--db",
        path_str(&db),
        "team",
        "create",
        "--team-id",
        "alpha",
        "--name",
        "Alpha",
    ]);

    let plan = run_json([
        "--db",
        path_str(&db),
        "checkpoint",
        "reconcile",
        "--team-id",
        "alpha",
        "--spec",
        r#"{"record_id":null,"due_on":"2024-06-01","metric":"velocity","target":40.0}"#,
        "--spec",
        r#"{"record_id":null,"due_on":"2024-12-01","metric":"velocity","target":45.0}"#,
    ]);
    let plan_id = as_str(&plan, "plan_id").to_string();
    assert!(plan_id.starts_with("plan_"));
    assert_eq!(
        plan.pointer("/plan/added").and_then(Value::as_array).map(std::vec::Vec::len),
        Some(2)
    );

    let shown = run_json(["--db", path_str(&db), "plan", "show", "--plan-id", &plan_id]);
    assert_eq!(as_str(&shown, "plan_id"), plan_id);
    assert_eq!(as_str(&shown, "collection"), "checkpoints");

    let listed = run_json([
        "--db",
        path_str(&db),
        "checkpoint",
        "list",
        "--team-id",
        "alpha",
    ]);
    assert_eq!(
        listed.get("checkpoints").and_then(Value::as_array).map(std::vec::Vec::len),
        Some(2)
    );

    let duplicate = run_failure_message([
        "--db",
        path_str(&db),
        "checkpoint",
        "reconcile",
        "--team-id",
        "alpha",
        "--spec",
        r#"{"record_id":null,"due_on":"2025-03-01","metric":"velocity","target":50.0}"#,
        "--spec",
        r#"{"record_id":null,"due_on":"2025-03-01","metric":"throughput","target":12.0}"#,
    ]);
    assert!(duplicate.contains("duplicate discriminator"), "stderr was: {duplicate}");

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-005
#[test]
fn membership_add_rejects_overlapping_spans() {
    let sandbox = unique_temp_dir("cadencekernel-cli-memberships");
    let db = sandbox.join("cadence.sqlite3");

    let first = run_json([
        "--db",
        path_str(&db),
        "membership",
        "add",
        "--parent-team",
        "tribe",
        "--child-team",
        "alpha",
        "--start-on",
        "2023-01-01",
        "--end-on",
        "2023-12-31",
    ]);
    assert!(first.get("id").is_some());

    let disjoint = run_json([
        "--db",
        path_str(&db),
        "membership",
        "add",
        "--parent-team",
        "tribe",
        "--child-team",
        "alpha",
        "--start-on",
        "2024-01-01",
    ]);
    assert!(disjoint.get("id").is_some());

    let overlapping = run_failure_message([
        "--db",
        path_str(&db),
        "membership",
        "add",
        "--parent-team",
        "tribe",
        "--child-team",
        "alpha",
        "--start-on",
        "2024-06-01",
    ]);
    assert!(overlapping.contains("overlap conflict"), "stderr was: {overlapping}");

    let _ = fs::remove_dir_all(&sandbox);
}
