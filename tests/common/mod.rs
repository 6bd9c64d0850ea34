//! Shared helpers for integration tests: a temp workspace with a config
//! file and token files pointing at a mock server.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use rentsync::config::{self, Config};
use rentsync_core::{Fields, Value};
use tempfile::TempDir;

/// Write `config/rentsync.toml` plus both token files under a fresh temp dir.
///
/// `server_uri` is used for both remotes; `extra` is appended verbatim.
pub fn workspace(server_uri: &str, extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    write_token(&root.join("config/source_token.json"), "source-old", "source-refresh");
    write_token(&root.join("config/crm_token.json"), "crm-token", "crm-refresh");

    let content = format!(
        r#"[db]
path = "{root}/data/rentsync.sqlite"

[logging]
dir = "{root}/logs"

[source]
base_url = "{uri}/api/v3"
token_url = "{uri}/oauth/token"
token_file = "{root}/config/source_token.json"
client_id = "source-client"
client_secret = "source-secret"
per_page = 2

[crm]
base_url = "{uri}/rest"
token_url = "{uri}/oauth/token"
token_file = "{root}/config/crm_token.json"
client_id = "crm-client"

[retry]
max_attempts = 2
auth_delay_secs = 0
server_delay_secs = 0
rate_limit_fallback_secs = 0
rate_limit_max_secs = 1
timeout_secs = 5
{extra}
"#,
        root = root.display(),
        uri = server_uri,
        extra = extra,
    );
    let config_path = root.join("config/rentsync.toml");
    fs::write(&config_path, content).unwrap();
    (tmp, config_path)
}

pub fn load(config_path: &Path) -> Config {
    config::load_config(config_path).unwrap()
}

pub fn write_token(path: &Path, access: &str, refresh: &str) {
    let token = serde_json::json!({"access_token": access, "refresh_token": refresh, "scope": "crm"});
    fs::write(path, serde_json::to_string_pretty(&token).unwrap()).unwrap();
}

/// A JSON object as a record's field map.
pub fn fields(json: serde_json::Value) -> Fields {
    match Value::from_json(&json) {
        Value::Record(fields) => fields,
        other => panic!("expected a JSON object, got {:?}", other),
    }
}
