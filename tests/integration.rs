use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kbsync_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kbsync"))
}

fn write_config(root: &Path, extra: &str) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[db]
path = "{root}/data/kb.sqlite"

[store]
collection = "handbook"
batch_size = 2

[index]
dimensions = 256

[chunking]
max_tokens = 700

[embedding]
provider = "hash"

[sync]
root = "{root}/files"
include_globs = ["**/*.md", "**/*.txt"]
concurrency = 2

[sync.metadata]
provider = "internal"
{extra}"#,
        root = root.display(),
        extra = extra
    );
    let config_path = config_dir.join("kbsync.toml");
    fs::write(&config_path, config_content).unwrap();
    config_path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("data")).unwrap();
    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("notes")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("notes/gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(files_dir.join("ignored.png"), "not text").unwrap();

    let config_path = write_config(&root, "");
    (tmp, config_path)
}

fn run_kbsync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kbsync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kbsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn init_and_sync(config_path: &Path) {
    let (stdout, stderr, success) = run_kbsync(config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    let (stdout, stderr, success) = run_kbsync(config_path, &["sync"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kbsync(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_kbsync(&config_path, &["init"]);
    assert!(success, "second init failed");
}

#[test]
fn test_sync_ingests_matching_files() {
    let (_tmp, config_path) = setup_test_env();
    run_kbsync(&config_path, &["init"]);

    let (stdout, stderr, success) = run_kbsync(&config_path, &["sync"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("files: 3"), "got: {}", stdout);
    assert!(stdout.contains("new: 3"), "got: {}", stdout);
    assert!(stdout.contains("ok"));
}

#[test]
fn test_resync_is_noop() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, _, success) = run_kbsync(&config_path, &["sync"]);
    assert!(success);
    assert!(stdout.contains("unchanged: 3"), "got: {}", stdout);
    assert!(stdout.contains("chunks written: 0"), "got: {}", stdout);
    assert!(stdout.contains("chunks deleted: 0"), "got: {}", stdout);
}

#[test]
fn test_content_change_is_detected() {
    let (tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    fs::write(
        tmp.path().join("files/alpha.md"),
        "# Alpha Document Updated\n\nThis file was modified.",
    )
    .unwrap();

    let (stdout, _, success) = run_kbsync(&config_path, &["sync"]);
    assert!(success);
    assert!(stdout.contains("content_changed: 1"), "got: {}", stdout);
    assert!(stdout.contains("unchanged: 2"), "got: {}", stdout);
}

#[test]
fn test_metadata_change_via_add() {
    let (tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let file = tmp.path().join("files/beta.md");
    let (stdout, stderr, success) = run_kbsync(
        &config_path,
        &["add", file.to_str().unwrap(), "--meta", "label=final", "--meta", "version=2"],
    );
    assert!(success, "add failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("state: metadata_changed"), "got: {}", stdout);
    assert!(stdout.contains("chunks deleted: 0"), "got: {}", stdout);

    let (stdout, _, success) = run_kbsync(&config_path, &["info", "beta.md"]);
    assert!(success);
    let info: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(info["label"], "final");
    assert_eq!(info["version"], 2);
    assert_eq!(info["provider"], "internal");
    assert_eq!(info["filename"], "beta.md");
    assert_eq!(info["file_hash"].as_str().map(str::len), Some(64));
}

#[test]
fn test_add_under_sync_root_matches_sync_filename() {
    let (tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let file = tmp.path().join("files/notes/gamma.txt");
    let (stdout, stderr, success) = run_kbsync(&config_path, &["add", file.to_str().unwrap()]);
    assert!(success, "add failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("add notes/gamma.txt"), "got: {}", stdout);
    assert!(stdout.contains("state: unchanged"), "got: {}", stdout);

    let (_, _, success) = run_kbsync(&config_path, &["info", "gamma.txt"]);
    assert!(!success, "no second copy should be stored under the bare name");
}

#[test]
fn test_nested_files_use_relative_filename() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, stderr, success) = run_kbsync(&config_path, &["info", "notes/gamma.txt"]);
    assert!(success, "info failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("notes/gamma.txt"));
}

#[test]
fn test_delete_then_resync_is_new() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, _, success) = run_kbsync(&config_path, &["delete", "alpha.md"]);
    assert!(success);
    assert!(stdout.contains("deleted 1 chunks for alpha.md"), "got: {}", stdout);

    let (_, _, success) = run_kbsync(&config_path, &["info", "alpha.md"]);
    assert!(!success, "info should fail for a deleted file");

    let (stdout, _, success) = run_kbsync(&config_path, &["delete", "alpha.md"]);
    assert!(success);
    assert!(stdout.contains("deleted 0 chunks"));

    let (stdout, _, success) = run_kbsync(&config_path, &["sync"]);
    assert!(success);
    assert!(stdout.contains("new: 1"), "got: {}", stdout);
    assert!(stdout.contains("unchanged: 2"), "got: {}", stdout);
}

#[test]
fn test_search_ranks_matching_file_first() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, stderr, success) =
        run_kbsync(&config_path, &["search", "Rust programming cargo crates"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    let first = stdout.lines().next().unwrap_or_default();
    assert!(first.contains("alpha.md"), "got: {}", stdout);
}

#[test]
fn test_search_with_filter() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, _, success) = run_kbsync(
        &config_path,
        &["search", "Rust programming", "--where", "filename=beta.md"],
    );
    assert!(success);
    assert!(stdout.contains("beta.md"));
    assert!(!stdout.contains("alpha.md"));
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout1, _, _) = run_kbsync(&config_path, &["search", "document", "--limit", "3"]);
    let (stdout2, _, _) = run_kbsync(&config_path, &["search", "document", "--limit", "3"]);
    assert_eq!(stdout1, stdout2);
}

#[test]
fn test_add_unreadable_file_fails() {
    let (tmp, config_path) = setup_test_env();
    run_kbsync(&config_path, &["init"]);

    let missing = tmp.path().join("files/ghost.md");
    let (_, stderr, success) = run_kbsync(
        &config_path,
        &["add", missing.to_str().unwrap(), "--filename", "ghost.md"],
    );
    assert!(!success);
    assert!(stderr.contains("extraction failed"), "got: {}", stderr);
}

#[test]
fn test_invalid_config_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), "");
    let bad = fs::read_to_string(&config_path)
        .unwrap()
        .replace("provider = \"hash\"", "provider = \"hash\"\ndims = 8");
    fs::write(&config_path, bad).unwrap();

    let (_, stderr, success) = run_kbsync(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("index.dimensions"), "got: {}", stderr);
}
