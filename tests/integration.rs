use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn esync_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_esync"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.",
    )
    .unwrap();

    fs::write(
        root.join("entities.jsonl"),
        concat!(
            r#"{"entity_id":"t1","entity_type":"Ticket","name":"Login broken","fields":{"body":"Users cannot log in"},"embeddable_fields":["body"]}"#,
            "\n",
            r#"{"entity_id":"t2","entity_type":"Ticket","name":"Slow search","fields":{"body":"Search takes 10s"},"embeddable_fields":["body"]}"#,
            "\n"
        ),
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/esync.sqlite"

[retry]
destination_base_secs = 0
deadlock_base_ms = 1

[embedding]
provider = "hash"
dims = 32

[destinations]
vector = "sqlite"
archive_dir = "{root}/data/archive"

[sources.filesystem]
root = "{root}/files"
include_globs = ["**/*.md", "**/*.txt"]

[sources.jsonl]
path = "{root}/entities.jsonl"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("esync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_esync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = esync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run esync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn counter(stdout: &str, name: &str) -> u64 {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(&format!("{}:", name)))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| panic!("no '{}' counter in output: {}", name, stdout))
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_esync(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/esync.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_esync(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_esync(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_sync_filesystem_inserts_everything() {
    let (tmp, config_path) = setup_test_env();

    run_esync(&config_path, &["init"]);
    let (stdout, stderr, success) = run_esync(&config_path, &["sync", "filesystem"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(counter(&stdout, "inserted"), 3);
    assert_eq!(counter(&stdout, "skipped"), 0);
    assert!(stdout.contains("ok"));

    let archived = tmp.path().join("data/archive/filesystem/File/alpha.md.json");
    assert!(archived.exists(), "raw archive missing {}", archived.display());
}

#[test]
fn test_resync_keeps_unchanged_entities() {
    let (_tmp, config_path) = setup_test_env();

    run_esync(&config_path, &["init"]);
    run_esync(&config_path, &["sync", "filesystem"]);
    let (stdout, _, success) = run_esync(&config_path, &["sync", "filesystem"]);
    assert!(success);
    assert_eq!(counter(&stdout, "inserted"), 0);
    assert_eq!(counter(&stdout, "updated"), 0);
    assert_eq!(counter(&stdout, "kept"), 3);
}

#[test]
fn test_modified_and_removed_files() {
    let (tmp, config_path) = setup_test_env();

    run_esync(&config_path, &["init"]);
    run_esync(&config_path, &["sync", "filesystem"]);

    let files_dir = tmp.path().join("files");
    fs::write(files_dir.join("alpha.md"), "# Alpha Document Updated\n\nThis file was modified.").unwrap();
    fs::remove_file(files_dir.join("gamma.txt")).unwrap();

    let (stdout, stderr, success) = run_esync(&config_path, &["sync", "filesystem"]);
    assert!(success, "sync failed: {}", stderr);
    assert_eq!(counter(&stdout, "updated"), 1);
    assert_eq!(counter(&stdout, "kept"), 1);
    assert_eq!(counter(&stdout, "deleted"), 1);
    assert_eq!(counter(&stdout, "orphans"), 1);
}

#[test]
fn test_sync_jsonl_with_custom_sync_id() {
    let (_tmp, config_path) = setup_test_env();

    run_esync(&config_path, &["init"]);
    let (stdout, stderr, success) =
        run_esync(&config_path, &["sync", "jsonl", "--sync-id", "tickets"]);
    assert!(success, "sync failed: {}", stderr);
    assert!(stdout.contains("sync id:   tickets"));
    assert_eq!(counter(&stdout, "inserted"), 2);
}

#[test]
fn test_json_progress_on_stderr() {
    let (_tmp, config_path) = setup_test_env();

    run_esync(&config_path, &["init"]);
    let (_, stderr, success) =
        run_esync(&config_path, &["sync", "jsonl", "--progress", "json"]);
    assert!(success);
    let finished = stderr
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .find(|v| v["event"] == "finished")
        .unwrap_or_else(|| panic!("no finished event in: {}", stderr));
    assert_eq!(finished["counters"]["inserted"], 2);
    assert!(finished["error"].is_null());
}

#[test]
fn test_stats_after_sync() {
    let (_tmp, config_path) = setup_test_env();

    run_esync(&config_path, &["init"]);
    run_esync(&config_path, &["sync", "filesystem"]);
    let (stdout, _, success) = run_esync(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Records:     3"), "got: {}", stdout);
    assert!(stdout.contains("filesystem"));
}

#[test]
fn test_unknown_source_is_rejected() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success) = run_esync(&config_path, &["sync", "nonexistent"]);
    assert!(!success);
}

#[test]
fn test_unconfigured_source_fails() {
    let (tmp, config_path) = setup_test_env();
    let minimal = tmp.path().join("config/minimal.toml");
    fs::write(
        &minimal,
        format!("[db]\npath = \"{}/data/min.sqlite\"\n", tmp.path().display()),
    )
    .unwrap();
    let _ = config_path;

    let (_, stderr, success) = run_esync(&minimal, &["sync", "jsonl"]);
    assert!(!success);
    assert!(stderr.contains("not configured"), "got: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, _, success) = run_esync(&tmp.path().join("absent.toml"), &["init"]);
    assert!(!success);
}
