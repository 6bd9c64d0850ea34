//! The `rentsync` binary driven end to end.

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rentsync_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("rentsync");
    path
}

fn run_rentsync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = rentsync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rentsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

async fn run_rentsync_async(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = tokio::process::Command::new(rentsync_binary())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .await
        .unwrap();
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = common::workspace("http://127.0.0.1:9", "");

    let (stdout, stderr, success) = run_rentsync(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/rentsync.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = common::workspace("http://127.0.0.1:9", "");

    let (_, _, success1) = run_rentsync(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_rentsync(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_stats_on_empty_database() {
    let (_tmp, config_path) = common::workspace("http://127.0.0.1:9", "");

    run_rentsync(&config_path, &["init"]);
    let (stdout, stderr, success) = run_rentsync(&config_path, &["stats"]);
    assert!(success, "stats failed: stderr={}", stderr);
    assert!(stdout.contains("booking_segments"));
    assert!(stdout.contains("No runs recorded yet."));
}

#[test]
fn test_missing_config_fails() {
    let tmp = tempfile::TempDir::new().unwrap();
    let (_, stderr, success) = run_rentsync(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr={}", stderr);
}

#[test]
fn test_invalid_config_fails() {
    let (_tmp, config_path) = common::workspace("http://127.0.0.1:9", "[staging]\ntables = [\"bookings\", \"clients\"]\n");

    let (_, stderr, success) = run_rentsync(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("must be listed before"), "stderr={}", stderr);
}

#[test]
fn test_fields_help_lists_entities() {
    let output = Command::new(rentsync_binary())
        .args(["fields", "--help"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("possible values: contact, product, deal"), "stdout={}", stdout);

    let (_tmp, config_path) = common::workspace("http://127.0.0.1:9", "");
    let (_, stderr, success) = run_rentsync(&config_path, &["fields", "lead"]);
    assert!(!success);
    assert!(stderr.contains("invalid value 'lead'"), "stderr={}", stderr);
}

#[test]
fn test_file_logging_writes_log_file() {
    let (tmp, config_path) = common::workspace("http://127.0.0.1:9", "");

    let (_, stderr, success) = run_rentsync(&config_path, &["--log", "file", "init"]);
    assert!(success, "init failed: stderr={}", stderr);
    let logs: Vec<_> = fs::read_dir(tmp.path().join("logs"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(logs.len(), 1, "{:?}", logs);
    assert!(logs[0].starts_with("rentsync_") && logs[0].ends_with(".log"));
}

#[tokio::test]
async fn test_import_then_stats() {
    let server = MockServer::start().await;
    let (_tmp, config_path) = common::workspace(&server.uri(), "");

    let collections = [
        ("sources", json!({"sources": [{"id": 5, "name": "Airbnb"}]})),
        ("booking_comments", json!({"booking_comments": []})),
        ("accounts", json!({"accounts": []})),
        ("bookings_fees", json!({"bookings_fees": []})),
        (
            "bookings",
            json!({"bookings": [{
                "id": 100,
                "links": {"client": 1, "rental": 10, "source": 5},
                "status": "Booked",
                "start_at": "2030-05-01T16:00:00Z",
                "end_at": "2030-05-03T10:00:00Z",
                "final_price": "200.0"
            }]}),
        ),
        ("clients", json!({"clients": [{"id": 1, "fullname": "Jane Doe"}]})),
        ("rentals", json!({"rentals": [{"id": 10, "name": "Loft"}]})),
    ];
    for (name, body) in collections {
        Mock::given(method("GET"))
            .and(path(format!("/api/v3/{}", name)))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
    }

    let (_, stderr, success) = run_rentsync_async(&config_path, &["init"]).await;
    assert!(success, "init failed: stderr={}", stderr);

    let (stdout, stderr, success) = run_rentsync_async(&config_path, &["import", "--progress", "off"]).await;
    assert!(success, "import failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("import"));
    assert!(stdout.contains("total: added 4,"), "stdout={}", stdout);

    let (stdout, _, success) = run_rentsync_async(&config_path, &["import", "--dry-run", "--progress", "off"]).await;
    assert!(success);
    assert!(stdout.contains("(dry-run)"));
    assert!(stdout.contains("total (planned): added 0,"), "stdout={}", stdout);

    let (stdout, _, success) = run_rentsync_async(&config_path, &["stats"]).await;
    assert!(success);
    assert!(stdout.contains("Recent runs:"));
}
