use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

fn lake_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_lake"))
}

async fn issues(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    let page: usize = q.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let limit: usize = q.get("limit").and_then(|p| p.parse().ok()).unwrap_or(100);
    let data: Vec<Value> = (1..=3u64)
        .skip((page - 1) * limit)
        .take(limit)
        .map(|id| json!({"id": id, "title": format!("issue {id}")}))
        .collect();
    Json(json!({"data": data, "total": 3}))
}

/// Start a mock tracker API on its own runtime; returns its base URL.
fn spawn_api() -> String {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let router = Router::new()
                .route("/projects/{project}/issues", get(issues))
                .route("/private", get(|| async { (StatusCode::UNAUTHORIZED, "bad token") }));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, router).await.unwrap();
        });
    });
    format!("http://{}/", rx.recv().unwrap())
}

fn setup_test_env(endpoint: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/lake.sqlite"

[api]
requests_per_hour = 360000

[logging]
level = "warn"

[collectors.issues]
plugin = "tracker"
endpoint = "{endpoint}"
url_template = "projects/{{{{Params.ProjectId}}}}/issues"
scope = {{ ProjectId = 5 }}
page_size = 2
items_pointer = "/data"
total_pointer = "/total"
since_param = "updated_after"

[collectors.private]
plugin = "tracker"
endpoint = "{endpoint}"
url_template = "private"
scope = {{ ProjectId = 5 }}
page_size = 0
token = "nope"
"#,
        root = root.display(),
        endpoint = endpoint
    );

    let config_path = config_dir.join("lake.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_lake(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = lake_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run lake binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("http://127.0.0.1:9/");

    let (stdout, stderr, success) = run_lake(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("lake.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9/");

    let (_, _, success1) = run_lake(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_lake(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_states_empty_after_init() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9/");

    run_lake(&config_path, &["init"]);
    let (stdout, _, success) = run_lake(&config_path, &["states"]);
    assert!(success);
    assert!(stdout.contains("No collector states."));

    let (stdout, _, success) = run_lake(&config_path, &["history"]);
    assert!(success);
    assert!(stdout.contains("No subtask history."));
}

#[test]
fn test_collect_records_state_and_history() {
    let endpoint = spawn_api();
    let (_tmp, config_path) = setup_test_env(&endpoint);

    run_lake(&config_path, &["init"]);
    let (stdout, stderr, success) = run_lake(&config_path, &["collect", "issues", "--progress", "off"]);
    assert!(success, "collect failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Collected 'issues'"));

    let (stdout, _, success) = run_lake(&config_path, &["states"]);
    assert!(success);
    assert!(stdout.contains("_raw_tracker_issues"));
    assert!(stdout.contains(r#"{"ConnectionId":1,"ProjectId":5}"#));

    let (stdout, _, success) = run_lake(&config_path, &["history"]);
    assert!(success);
    assert!(stdout.contains("tracker/issues"));
    assert!(stdout.contains("succeeded"));
}

#[test]
fn test_collect_full_with_time_after() {
    let endpoint = spawn_api();
    let (_tmp, config_path) = setup_test_env(&endpoint);

    let (stdout, stderr, success) = run_lake(
        &config_path,
        &["collect", "issues", "--full", "--time-after", "2024-01-01", "--progress", "json"],
    );
    assert!(success, "collect failed: stdout={}, stderr={}", stdout, stderr);

    let (stdout, _, _) = run_lake(&config_path, &["states"]);
    assert!(stdout.contains("time_after=2024-01-01T00:00:00+00:00"));
}

#[test]
fn test_collect_unauthorized_fails_and_is_recorded() {
    let endpoint = spawn_api();
    let (_tmp, config_path) = setup_test_env(&endpoint);

    let (_, stderr, success) = run_lake(&config_path, &["collect", "private", "--progress", "off"]);
    assert!(!success, "collect of a 401 endpoint should fail");
    assert!(stderr.contains("unauthorized"), "stderr={}", stderr);

    let (stdout, _, _) = run_lake(&config_path, &["history"]);
    assert!(stdout.contains("failed"));

    let (stdout, _, _) = run_lake(&config_path, &["states"]);
    assert!(stdout.contains("No collector states."));
}

#[test]
fn test_collect_unknown_collector_fails() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9/");

    let (_, stderr, success) = run_lake(&config_path, &["collect", "nonexistent"]);
    assert!(!success);
    assert!(stderr.contains("no collector named 'nonexistent'"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("lake.toml");
    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}/lake.sqlite\"\n[pipeline]\nbatch_size = 0\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, _, success) = run_lake(&config_path, &["init"]);
    assert!(!success);
}
