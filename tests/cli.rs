mod common;

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

fn crag_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("crag");
    path
}

/// Temp workspace with a config pointing at `addr` and a few source files.
fn setup_test_env(addr: SocketAddr) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha\n\nRust programming with cargo and crates.\n\nOwnership and borrowing.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.txt"),
        "Beta notes on deployment.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    let config_content = format!(
        r#"[store]
path = "{root}/data/rag.sqlite"

[pipeline]
stage_workers = 2
index_threshold = 1000

[search]
top_k = 3

[embedding]
provider = "openai"
model = "mock-embed"
url = "http://{addr}/v1/embeddings"
dimensions = 4
max_tokens = 8
max_inputs = 2
"#,
        root = root.display(),
        addr = addr
    );
    let config_path = root.join("rag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_crag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = crag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run crag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// The mock endpoint runs on its own runtime while the blocking CLI calls
/// execute on the test thread.
fn mock_endpoint() -> (tokio::runtime::Runtime, SocketAddr) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (addr, _seen) = rt.block_on(common::spawn_mock_server());
    (rt, addr)
}

#[test]
fn test_init_creates_database() {
    let (_rt, addr) = mock_endpoint();
    let (tmp, config) = setup_test_env(addr);

    let (stdout, stderr, ok) = run_crag(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Vector store initialized"));
    assert!(tmp.path().join("data/rag.sqlite").exists());

    let (_, stderr, ok) = run_crag(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_ingest_then_count() {
    let (_rt, addr) = mock_endpoint();
    let (tmp, config) = setup_test_env(addr);
    let file = tmp.path().join("files/alpha.md");

    let (stdout, stderr, ok) = run_crag(
        &config,
        &[
            "ingest",
            file.to_str().unwrap(),
            "--id",
            "alpha",
            "--scope",
            "conv-1",
            "--progress",
            "off",
        ],
    );
    assert!(ok, "ingest failed: {}", stderr);
    assert!(stdout.contains("alpha:"));
    assert!(stdout.contains("rows inserted"));

    let (stdout, _, ok) = run_crag(&config, &["count", "--scope", "conv-1"]);
    assert!(ok);
    let rows: usize = stdout.trim().parse().unwrap();
    assert!(rows >= 2);

    let (stdout, _, ok) = run_crag(
        &config,
        &["count", "--scope", "conv-1", "--file-id", "alpha"],
    );
    assert!(ok);
    assert_eq!(stdout.trim().parse::<usize>().unwrap(), rows);
}

#[test]
fn test_reingest_does_not_duplicate() {
    let (_rt, addr) = mock_endpoint();
    let (tmp, config) = setup_test_env(addr);
    let file = tmp.path().join("files/beta.txt");
    let args = [
        "ingest",
        file.to_str().unwrap(),
        "--id",
        "beta",
        "--progress",
        "off",
    ];

    let (_, stderr, ok) = run_crag(&config, &args);
    assert!(ok, "first ingest failed: {}", stderr);
    let (first, _, _) = run_crag(&config, &["count"]);

    let (stdout, stderr, ok) = run_crag(&config, &args);
    assert!(ok, "second ingest failed: {}", stderr);
    assert!(stdout.contains("replaced"));
    let (second, _, _) = run_crag(&config, &["count"]);
    assert_eq!(first.trim(), second.trim());
}

#[test]
fn test_ingest_json_progress_on_stderr() {
    let (_rt, addr) = mock_endpoint();
    let (tmp, config) = setup_test_env(addr);
    let file = tmp.path().join("files/alpha.md");

    let (_, stderr, ok) = run_crag(
        &config,
        &["ingest", file.to_str().unwrap(), "--progress", "json"],
    );
    assert!(ok, "ingest failed: {}", stderr);

    let events: Vec<serde_json::Value> = stderr
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .filter(|v: &serde_json::Value| v["event"] == "ingest")
        .collect();
    assert!(!events.is_empty());
    let last = events.last().unwrap();
    assert_eq!(last["stage_id"], "persist");
    assert_eq!(last["state"], "success");
    assert_eq!(last["finished"], true);
}

#[test]
fn test_ingest_missing_file_fails() {
    let (_rt, addr) = mock_endpoint();
    let (tmp, config) = setup_test_env(addr);
    let missing = tmp.path().join("files/nope.md");

    let (_, stderr, ok) = run_crag(
        &config,
        &["ingest", missing.to_str().unwrap(), "--progress", "off"],
    );
    assert!(!ok);
    assert!(stderr.contains("404"));
}

#[test]
fn test_search_returns_hits() {
    let (_rt, addr) = mock_endpoint();
    let (tmp, config) = setup_test_env(addr);
    for name in ["alpha.md", "beta.txt"] {
        let file = tmp.path().join("files").join(name);
        let (_, stderr, ok) = run_crag(
            &config,
            &["ingest", file.to_str().unwrap(), "--scope", "conv", "--progress", "off"],
        );
        assert!(ok, "ingest failed: {}", stderr);
    }

    let (stdout, stderr, ok) = run_crag(&config, &["search", "cargo crates", "--scope", "conv"]);
    assert!(ok, "search failed: {}", stderr);
    let hits: Vec<&str> = stdout.lines().filter(|l| l.starts_with(|c: char| c.is_ascii_digit())).collect();
    assert!(!hits.is_empty());
    assert!(hits.len() <= 3);
}

#[test]
fn test_search_unknown_scope_fails() {
    let (_rt, addr) = mock_endpoint();
    let (_tmp, config) = setup_test_env(addr);
    run_crag(&config, &["init"]);

    let (_, stderr, ok) = run_crag(&config, &["search", "anything", "--scope", "ghost"]);
    assert!(!ok);
    assert!(stderr.contains("404"));
}

#[test]
fn test_forget_removes_file_rows() {
    let (_rt, addr) = mock_endpoint();
    let (tmp, config) = setup_test_env(addr);
    let file = tmp.path().join("files/alpha.md");
    let (_, stderr, ok) = run_crag(
        &config,
        &["ingest", file.to_str().unwrap(), "--id", "alpha", "--progress", "off"],
    );
    assert!(ok, "ingest failed: {}", stderr);

    let (stdout, stderr, ok) = run_crag(&config, &["forget", "--file-id", "alpha"]);
    assert!(ok, "forget failed: {}", stderr);
    assert!(stdout.starts_with("Deleted"));

    let (stdout, _, ok) = run_crag(&config, &["count"]);
    assert!(ok);
    assert_eq!(stdout.trim(), "0");
}

#[test]
fn test_missing_config_fails() {
    let (stdout, stderr, ok) = run_crag(Path::new("/nonexistent/rag.toml"), &["init"]);
    assert!(!ok);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Failed to read config file"));
}
