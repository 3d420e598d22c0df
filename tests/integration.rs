use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.html"),
        "<h2>Beta</h2><p>Deployment notes for the <a href=\"/k8s\">cluster</a>.</p>",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file about infrastructure.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/harvest.sqlite"

[harvest]
workers = 2
batch_size = 2
page_size = 10
"#,
        root.display()
    );

    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn create_filesystem(tmp: &TempDir, config_path: &Path) -> String {
    let root = tmp.path().join("files");
    let set_root = format!("root={}", root.display());
    let (stdout, stderr, success) =
        run_harvest(config_path, &["create", "filesystem", "--set", &set_root]);
    assert!(success, "create failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("created connector 1 (filesystem)"));
    "1".to_string()
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success1) = run_harvest(&config_path, &["init"]);
    assert!(success1, "First init failed");
    assert!(stdout.contains("initialized"));

    let (_, _, success2) = run_harvest(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_types_lists_builtin_connectors() {
    let (_tmp, config_path) = setup_test_env();
    run_harvest(&config_path, &["init"]);

    let (stdout, stderr, success) = run_harvest(&config_path, &["types"]);
    assert!(success, "types failed: stderr={}", stderr);
    assert!(stdout.contains("confluence"));
    assert!(stdout.contains("Confluence"));
    assert!(stdout.contains("filesystem"));
    assert!(stdout.contains("root*"));
}

#[test]
fn test_create_without_required_field_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_harvest(&config_path, &["init"]);

    let (_, stderr, success) = run_harvest(&config_path, &["create", "filesystem"]);
    assert!(!success, "create without root should fail");
    assert!(stderr.contains("invalid configuration"));

    let (stdout, _, _) = run_harvest(&config_path, &["list"]);
    assert!(!stdout.contains("filesystem"));
}

#[test]
fn test_sync_filesystem_then_incremental() {
    let (tmp, config_path) = setup_test_env();
    run_harvest(&config_path, &["init"]);
    let id = create_filesystem(&tmp, &config_path);

    let (stdout, stderr, success) = run_harvest(&config_path, &["sync", &id]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("candidates: 3"));
    assert!(stdout.contains("fed: 3"));
    assert!(!stdout.contains("watermark: unchanged"));
    assert!(stdout.contains("ok"));

    let (stdout, stderr, success) = run_harvest(&config_path, &["sync", &id]);
    assert!(success, "second sync failed: stderr={}", stderr);
    assert!(stdout.contains("listed: 3"));
    assert!(stdout.contains("fed: 0"));
}

#[test]
fn test_sync_all_and_list() {
    let (tmp, config_path) = setup_test_env();
    run_harvest(&config_path, &["init"]);
    create_filesystem(&tmp, &config_path);

    let (stdout, _, _) = run_harvest(&config_path, &["list"]);
    assert!(stdout.contains("never"));

    let (stdout, stderr, success) = run_harvest(&config_path, &["sync", "all"]);
    assert!(success, "sync all failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("sync 1 (filesystem)"));
    assert!(stdout.contains("fed: 3"));

    let (stdout, _, success) = run_harvest(&config_path, &["list"]);
    assert!(success);
    assert!(stdout.contains("filesystem"));
    assert!(!stdout.contains("never"));
}

#[test]
fn test_delete_twice_fails() {
    let (tmp, config_path) = setup_test_env();
    run_harvest(&config_path, &["init"]);
    let id = create_filesystem(&tmp, &config_path);

    let (stdout, stderr, success) = run_harvest(&config_path, &["delete", &id]);
    assert!(success, "delete failed: stderr={}", stderr);
    assert!(stdout.contains("deleted connector 1"));

    let (_, stderr, success) = run_harvest(&config_path, &["delete", &id]);
    assert!(!success, "second delete should fail");
    assert!(stderr.contains("connector instance 1 does not exist"));

    let (_, stderr, success) = run_harvest(&config_path, &["sync", &id]);
    assert!(!success);
    assert!(stderr.contains("does not exist"));
}

#[test]
fn test_missing_config_fails() {
    let (stdout, stderr, success) =
        run_harvest(Path::new("/nonexistent/harvest.toml"), &["list"]);
    assert!(!success, "should fail with missing config: stdout={}", stdout);
    assert!(stderr.contains("Failed to read config file"));
}
