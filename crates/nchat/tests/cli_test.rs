//! E2E tests for the offline parts of the CLI.

mod common;

use tempfile::TempDir;
use tokio::process::Command;

const TEST_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

fn setup_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    let config_content = serde_json::json!({ "relays": ["ws://127.0.0.1:9"] });
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(&config_content).unwrap(),
    )
    .unwrap();
    dir
}

async fn nchat(dir: &TempDir, args: &[&str]) -> (bool, serde_json::Value, String) {
    let output = Command::new(common::nchat_binary())
        .arg("--json")
        .arg("--data-dir")
        .arg(dir.path())
        .args(args)
        .output()
        .await
        .expect("Failed to run nchat");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let json = stdout
        .lines()
        .last()
        .and_then(|line| serde_json::from_str(line).ok())
        .unwrap_or(serde_json::Value::Null);
    (output.status.success(), json, stderr)
}

#[tokio::test]
async fn test_login_then_whoami() {
    let dir = setup_dir();

    let (ok, v, _) = nchat(&dir, &["whoami"]).await;
    assert!(ok);
    assert_eq!(v["data"]["logged_in"], false);

    let (ok, login, stderr) = nchat(&dir, &["login", TEST_KEY]).await;
    assert!(ok, "login failed: {stderr}");

    let (ok, v, _) = nchat(&dir, &["whoami"]).await;
    assert!(ok);
    assert_eq!(v["data"]["logged_in"], true);
    assert_eq!(v["data"]["pubkey"], login["data"]["pubkey"]);
    assert!(v["data"]["npub"].as_str().unwrap().starts_with("npub1"));
}

#[tokio::test]
async fn test_invalid_key_is_rejected() {
    let dir = setup_dir();
    let (ok, _, stderr) = nchat(&dir, &["login", "not-a-key"]).await;
    assert!(!ok);
    let err: serde_json::Value = serde_json::from_str(stderr.lines().last().unwrap()).unwrap();
    assert_eq!(err["status"], "error");
}

#[tokio::test]
async fn test_relay_add_list_remove() {
    let dir = setup_dir();

    let (ok, _, _) = nchat(&dir, &["relay", "add", "relay.example.com"]).await;
    assert!(ok);
    let (_, v, _) = nchat(&dir, &["relay", "list"]).await;
    let relays: Vec<String> = serde_json::from_value(v["data"]["relays"].clone()).unwrap();
    assert_eq!(relays, vec!["ws://127.0.0.1:9", "wss://relay.example.com"]);

    let (ok, _, _) = nchat(&dir, &["relay", "remove", "wss://relay.example.com"]).await;
    assert!(ok);
    let (ok, _, _) = nchat(&dir, &["relay", "remove", "wss://relay.example.com"]).await;
    assert!(!ok);
}

#[tokio::test]
async fn test_history_of_unknown_room_is_empty() {
    let dir = setup_dir();
    let channel = format!("#{}", "ab".repeat(32));
    let (ok, v, stderr) = nchat(&dir, &["history", &channel]).await;
    assert!(ok, "history failed: {stderr}");
    assert_eq!(v["data"]["messages"], serde_json::json!([]));
}

#[tokio::test]
async fn test_profile_without_fields_autogenerates_identity_then_fails() {
    let dir = setup_dir();
    let (ok, _, stderr) = nchat(&dir, &["profile"]).await;
    assert!(!ok);
    assert!(stderr.contains("Generated new identity"), "stderr: {stderr}");
    assert!(stderr.contains("Nothing to update"), "stderr: {stderr}");

    let cfg_raw = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
    let cfg: serde_json::Value = serde_json::from_str(&cfg_raw).unwrap();
    assert_eq!(cfg["private_key"].as_str().unwrap().len(), 64);
}
