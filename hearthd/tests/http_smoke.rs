//! Smoke tests for the hearthd HTTP surface.
//!
//! Each test spawns the real hearthd binary on a free port with a temp
//! config. Container runs go through a stub runtime script, so the full
//! chat path (queue → runner → router → SSE) is exercised without Docker.

use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

const TOKEN: &str = "smoke-token";

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to :0");
    listener.local_addr().unwrap().port()
}

/// Stub container runtime: answers info/ps/stop/kill, and for `run` reads
/// one stdin line then replays the given stdout script.
fn write_fake_runtime(dir: &Path, run_body: &str) -> PathBuf {
    let path = dir.join("fake-docker");
    let script = format!(
        r#"#!/bin/sh
case "$1" in
  info|ps|stop|kill) exit 0 ;;
  run)
    read line
{run_body}
    ;;
esac
"#
    );
    std::fs::write(&path, script).expect("write fake runtime");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_test_config(dir: &Path, port: u16, runtime_bin: &Path) -> PathBuf {
    let config_path = dir.join("hearth.toml");
    let toml = format!(
        r#"
assistant_name = "Hearth"
main_group_folder = "main"

[server]
host = "127.0.0.1"
port = {port}
auth_token = "{TOKEN}"
max_body_bytes = 65536

[storage]
data_dir = "{data}"
store_dir = "{store}"
groups_dir = "{groups}"

[container]
runtime_bin = "{runtime}"
skip_runtime_check = true
idle_timeout_ms = 5000
exit_grace_ms = 500

[ipc]
poll_interval_ms = 100

[scheduler]
poll_interval_ms = 200
timezone = "UTC"
"#,
        data = dir.join("data").display(),
        store = dir.join("store").display(),
        groups = dir.join("groups").display(),
        runtime = runtime_bin.display(),
    );
    std::fs::write(&config_path, toml).expect("write test config");
    config_path
}

fn hearthd_binary() -> PathBuf {
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..");
    let output = Command::new("cargo")
        .args(["build", "--bin", "hearthd", "--workspace"])
        .current_dir(&workspace_root)
        .output()
        .expect("cargo build");
    assert!(
        output.status.success(),
        "cargo build failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    workspace_root.join("target/debug/hearthd")
}

struct TestServer {
    child: Child,
    base_url: String,
}

impl TestServer {
    fn start(config_path: &Path, port: u16) -> Self {
        let binary = hearthd_binary();
        let child = Command::new(&binary)
            .args(["serve", "--config", config_path.to_str().unwrap()])
            .env("RUST_LOG", "warn")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("spawn hearthd");

        let server = TestServer {
            child,
            base_url: format!("http://127.0.0.1:{port}"),
        };
        server.wait_ready();
        server
    }

    fn wait_ready(&self) {
        let client = reqwest::blocking::Client::new();
        for _ in 0..100 {
            if client
                .get(format!("{}/api/health", self.base_url))
                .timeout(Duration::from_millis(200))
                .send()
                .is_ok()
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("hearthd did not become ready within 10 seconds");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
        let _ = self.child.wait();
    }
}

fn client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(20))
        .build()
        .unwrap()
}

fn default_run_body() -> &'static str {
    r#"    echo '{"type":"message","text":"echo: hello"}'
    echo '{"type":"session","sessionId":"sess-smoke"}'
    echo '{"type":"done"}'"#
}

fn start_default_server(dir: &tempfile::TempDir) -> (TestServer, u16) {
    let port = free_port();
    let runtime = write_fake_runtime(dir.path(), default_run_body());
    let config = write_test_config(dir.path(), port, &runtime);
    (TestServer::start(&config, port), port)
}

#[test]
fn health_is_open_and_ok() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = start_default_server(&dir);

    let resp = client()
        .get(format!("{}/api/health", server.base_url))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["status"], "ok");
}

#[test]
fn bearer_token_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = start_default_server(&dir);
    let client = client();

    let resp = client
        .get(format!("{}/api/groups", server.base_url))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("{}/api/groups", server.base_url))
        .bearer_auth("wrong-token")
        .send()
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(format!("{}/api/groups", server.base_url))
        .bearer_auth(TOKEN)
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);
    let groups: serde_json::Value = resp.json().unwrap();
    assert!(groups
        .as_array()
        .unwrap()
        .iter()
        .any(|g| g["id"] == "main"));
}

#[test]
fn preflight_gets_cors_headers() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = start_default_server(&dir);

    let resp = client()
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/api/chat", server.base_url),
        )
        .header("Origin", "http://localhost:5173")
        .send()
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .unwrap()
            .to_str()
            .unwrap(),
        "http://localhost:5173"
    );
    assert!(resp
        .headers()
        .get("access-control-allow-methods")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("DELETE"));
}

#[test]
fn group_create_validates_and_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = start_default_server(&dir);
    let client = client();
    let url = format!("{}/api/groups", server.base_url);

    let resp = client
        .post(&url)
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"name": "Team A"}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["id"], "team-a");
    assert_eq!(body["folder"], "team-a");

    let resp = client
        .post(&url)
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"name": "Team A"}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = client
        .post(&url)
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"name": ""}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(&url)
        .bearer_auth(TOKEN)
        .send()
        .unwrap();
    let groups: serde_json::Value = resp.json().unwrap();
    let team = groups
        .as_array()
        .unwrap()
        .iter()
        .find(|g| g["id"] == "team-a")
        .expect("team-a listed");
    assert!(team["added_at"].as_str().unwrap().ends_with('Z'));
}

#[test]
fn chat_rejects_bad_bodies() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = start_default_server(&dir);
    let client = client();
    let url = format!("{}/api/chat", server.base_url);

    let resp = client
        .post(&url)
        .bearer_auth(TOKEN)
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(&url)
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"prompt": ""}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(&url)
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"prompt": "hi", "groupId": "!!!"}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[test]
fn chat_streams_and_auto_registers() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = start_default_server(&dir);
    let client = client();

    let resp = client
        .post(format!("{}/api/chat", server.base_url))
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"prompt": "hi", "groupId": "Team A"}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = resp.text().unwrap();
    assert!(body.contains("event: message"), "body: {body}");
    assert!(body.contains("echo: hello"), "body: {body}");
    assert!(body.contains("event: done"), "body: {body}");
    assert!(body.contains("sess-smoke"), "body: {body}");

    // First chat to an unknown group registers it under the normalized id.
    let groups: serde_json::Value = client
        .get(format!("{}/api/groups", server.base_url))
        .bearer_auth(TOKEN)
        .send()
        .unwrap()
        .json()
        .unwrap();
    let team = groups
        .as_array()
        .unwrap()
        .iter()
        .find(|g| g["id"] == "team-a")
        .expect("auto-registered group");
    assert_eq!(team["name"], "Team A");
}

#[test]
fn second_chat_for_same_group_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let runtime = write_fake_runtime(
        dir.path(),
        r#"    echo '{"type":"message","text":"working"}'
    sleep 2
    echo '{"type":"done"}'"#,
    );
    let config = write_test_config(dir.path(), port, &runtime);
    let server = TestServer::start(&config, port);

    let base_url = server.base_url.clone();
    let first = std::thread::spawn(move || {
        client()
            .post(format!("{base_url}/api/chat"))
            .bearer_auth(TOKEN)
            .json(&serde_json::json!({"prompt": "hi", "groupId": "main"}))
            .send()
            .unwrap()
            .text()
            .unwrap()
    });

    std::thread::sleep(Duration::from_millis(700));
    let resp = client()
        .post(format!("{}/api/chat", server.base_url))
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"prompt": "again", "groupId": "main"}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 409);

    // The first stream is unperturbed and completes.
    let body = first.join().unwrap();
    assert!(body.contains("working"), "body: {body}");
    assert!(body.contains("event: done"), "body: {body}");
}

#[test]
fn buffered_ipc_message_arrives_before_new_output() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = start_default_server(&dir);
    let client = client();

    // Agent-emitted async message lands while nobody is subscribed.
    let inbox = dir.path().join("data/ipc/main/messages");
    std::fs::create_dir_all(&inbox).unwrap();
    std::fs::write(
        inbox.join("001-note.json"),
        serde_json::json!({"type": "message", "chatJid": "main", "text": "ping"}).to_string(),
    )
    .unwrap();

    // Wait for a mediator poll cycle.
    std::thread::sleep(Duration::from_millis(600));

    let body = client
        .post(format!("{}/api/chat", server.base_url))
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"prompt": "hi", "groupId": "main"}))
        .send()
        .unwrap()
        .text()
        .unwrap();

    let buffered = body.find("Hearth: ping").expect("buffered message present");
    let live = body.find("echo: hello").expect("live output present");
    assert!(
        buffered < live,
        "buffered message must precede live output: {body}"
    );
}

#[test]
fn session_delete_without_live_container_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = start_default_server(&dir);

    let resp = client()
        .delete(format!("{}/api/groups/main/session", server.base_url))
        .bearer_auth(TOKEN)
        .send()
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[test]
fn oversized_body_is_413() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = start_default_server(&dir);

    let huge = "x".repeat(70_000);
    let resp = client()
        .post(format!("{}/api/chat", server.base_url))
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"prompt": huge}))
        .send()
        .unwrap();
    assert_eq!(resp.status(), 413);
}
