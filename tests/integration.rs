use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const PARSER: &str = "pub fn parse_config(path: &str) -> Config {\n    let text = read_file(path);\n    toml_parse(text)\n}\n";
const RENDER: &str = "def render_widget(widget):\n    return template.render(widget)\n";
const SERVER: &str = "pub fn start_server(port: u16) {\n    listen(port);\n}\n";

fn chx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("chx");
    path
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(repo: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn write(repo: &Path, path: &str, content: &str) {
    let full = repo.join(path);
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(full, content).unwrap();
}

fn write_config(root: &Path, embedding_dims: usize) -> PathBuf {
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/chx.sqlite"

[index]
root = "{root}/repo"
max_concurrent_files = 2

[chunking]
window_lines = 40
overlap_lines = 5

[retrieval]
final_limit = 5

[embedding]
provider = "hashing"
dims = {dims}
"#,
        root = root.display(),
        dims = embedding_dims
    );

    let config_path = config_dir.join("chx.toml");
    fs::write(&config_path, config_content).unwrap();
    config_path
}

/// A temp dir holding `repo/` (a git repository with two source files),
/// `data/`, and `config/chx.toml`.
fn setup_test_env() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let repo = root.join("repo");
    fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-q"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test"]);
    git(&repo, &["config", "commit.gpgsign", "false"]);

    write(&repo, "src/config.rs", PARSER);
    write(&repo, "web/render.py", RENDER);
    write(&repo, "notes.bin", "not indexable");

    let config_path = write_config(&root, 256);
    (tmp, config_path, repo)
}

fn run_chx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = chx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run chx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn index_json(config_path: &Path, extra: &[&str]) -> serde_json::Value {
    let mut args = vec!["index", "--json"];
    args.extend_from_slice(extra);
    let (stdout, stderr, success) = run_chx(config_path, &args);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap()
}

fn search_json(config_path: &Path, extra: &[&str]) -> serde_json::Value {
    let mut args = vec!["search", "--json"];
    args.extend_from_slice(extra);
    let (stdout, stderr, success) = run_chx(config_path, &args);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap()
}

fn result_paths(outcome: &serde_json::Value) -> Vec<String> {
    outcome["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["chunk"]["path"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_init_idempotent() {
    if !git_available() {
        return;
    }
    let (tmp, config_path, _repo) = setup_test_env();

    let (stdout, stderr, success) = run_chx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/chx.sqlite").exists());

    let (_, _, success) = run_chx(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_index_then_search() {
    if !git_available() {
        return;
    }
    let (_tmp, config_path, _repo) = setup_test_env();

    let report = index_json(&config_path, &[]);
    assert_eq!(report["success"], true);
    assert_eq!(report["files_indexed"], 2);
    assert_eq!(report["incremental"], false);
    assert!(report.get("error").is_none());
    assert!(report["chunks_created"].as_u64().unwrap() >= 2);
    assert_eq!(report["vectors_stored"], report["chunks_created"]);

    let outcome = search_json(&config_path, &["parse_config"]);
    let top = &outcome["results"][0];
    assert_eq!(top["rank"], 1);
    assert_eq!(top["chunk"]["path"], "src/config.rs");
    assert_eq!(top["chunk"]["symbol"], "parse_config");
    assert_eq!(top["chunk"]["rev"], "worktree");

    let (stdout, _, success) = run_chx(&config_path, &["search", "parse_config", "--explain"]);
    assert!(success);
    assert!(stdout.contains("1. ["));
    assert!(stdout.contains("src/config.rs:1-4 (parse_config)"));
    assert!(stdout.contains("bm25:"));
}

#[test]
fn test_second_run_is_a_noop() {
    if !git_available() {
        return;
    }
    let (_tmp, config_path, _repo) = setup_test_env();

    let first = index_json(&config_path, &[]);
    let second = index_json(&config_path, &[]);
    assert_eq!(second["success"], true);
    assert_eq!(second["tree_sha"], first["tree_sha"]);
    assert_eq!(second["files_indexed"], 0);
    assert_eq!(second["chunks_created"], 0);
    assert_eq!(second["chunks_deleted"], 0);
}

#[test]
fn test_incremental_update_and_delete() {
    if !git_available() {
        return;
    }
    let (_tmp, config_path, repo) = setup_test_env();
    index_json(&config_path, &[]);

    write(&repo, "src/server.rs", SERVER);
    fs::remove_file(repo.join("src/config.rs")).unwrap();

    let report = index_json(&config_path, &[]);
    assert_eq!(report["incremental"], true);
    assert_eq!(report["files_indexed"], 1);
    assert!(report["chunks_deleted"].as_u64().unwrap() >= 1);

    let outcome = search_json(&config_path, &["start_server"]);
    assert_eq!(result_paths(&outcome)[0], "src/server.rs");

    let outcome = search_json(&config_path, &["parse_config"]);
    assert!(!result_paths(&outcome).contains(&"src/config.rs".to_string()));
    assert_eq!(outcome["missing_chunks"], 0);
}

#[test]
fn test_staged_mode_ignores_unstaged_files() {
    if !git_available() {
        return;
    }
    let (_tmp, config_path, repo) = setup_test_env();
    git(&repo, &["add", "src/config.rs"]);

    let report = index_json(&config_path, &["--staged"]);
    assert_eq!(report["files_indexed"], 1);

    let outcome = search_json(&config_path, &["render_widget"]);
    assert!(!result_paths(&outcome).contains(&"web/render.py".to_string()));
    let outcome = search_json(&config_path, &["parse_config"]);
    assert_eq!(outcome["results"][0]["chunk"]["rev"], "staged");
}

#[test]
fn test_revision_mode_records_commit() {
    if !git_available() {
        return;
    }
    let (_tmp, config_path, repo) = setup_test_env();
    git(&repo, &["add", "-A"]);
    git(&repo, &["commit", "-q", "-m", "initial"]);

    let report = index_json(&config_path, &["--rev", "HEAD"]);
    assert_eq!(report["success"], true);

    let outcome = search_json(&config_path, &["parse_config"]);
    let rev = outcome["results"][0]["chunk"]["rev"].as_str().unwrap();
    assert_eq!(rev.len(), 40);
}

#[test]
fn test_search_filters() {
    if !git_available() {
        return;
    }
    let (_tmp, config_path, _repo) = setup_test_env();
    index_json(&config_path, &[]);

    let outcome = search_json(&config_path, &["render widget config", "--path", "web/**"]);
    let paths = result_paths(&outcome);
    assert!(!paths.is_empty());
    assert!(paths.iter().all(|p| p.starts_with("web/")));

    let outcome = search_json(&config_path, &["render widget config", "--lang", "rust"]);
    assert!(outcome["results"]
        .as_array()
        .unwrap()
        .iter()
        .all(|r| r["chunk"]["lang"] == "rust"));

    let outcome = search_json(&config_path, &["render widget config", "--limit", "1"]);
    assert_eq!(outcome["results"].as_array().unwrap().len(), 1);
}

#[test]
fn test_model_change_requires_force() {
    if !git_available() {
        return;
    }
    let (tmp, config_path, _repo) = setup_test_env();
    index_json(&config_path, &[]);

    let config_path = write_config(tmp.path(), 128);
    let (stdout, stderr, success) = run_chx(&config_path, &["index", "--json"]);
    assert!(!success, "index should fail after a model change");
    assert!(stderr.contains("model"), "stderr={}", stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["success"], false);
    assert_eq!(report["chunks_created"], 0);

    let report = index_json(&config_path, &["--force"]);
    assert_eq!(report["success"], true);
    assert_eq!(report["files_indexed"], 2);

    let (stdout, _, success) = run_chx(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("hashing/feature-hash-v1@128"));
    assert!(!stdout.contains("WARNING"));
}

#[test]
fn test_status_reports_counts() {
    if !git_available() {
        return;
    }
    let (_tmp, config_path, _repo) = setup_test_env();

    let (stdout, _, success) = run_chx(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("never indexed"));

    index_json(&config_path, &[]);
    let (stdout, _, success) = run_chx(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("Files:       2"));
    assert!(stdout.contains("worktree"));
    assert!(stdout.contains("python"));
    assert!(stdout.contains("rust"));
}

#[test]
fn test_empty_query_fails() {
    if !git_available() {
        return;
    }
    let (_tmp, config_path, _repo) = setup_test_env();
    index_json(&config_path, &[]);

    let (_, stderr, success) = run_chx(&config_path, &["search", "  "]);
    assert!(!success);
    assert!(stderr.contains("search"));
}

#[test]
fn test_invalid_config_fails() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("chx.toml");
    fs::write(
        &config_path,
        "[db]\npath = \"x.sqlite\"\n[chunking]\nwindow_lines = 0\n",
    )
    .unwrap();

    let (_, stderr, success) = run_chx(&config_path, &["status"]);
    assert!(!success);
    assert!(stderr.contains("window_lines"));
}

#[test]
fn test_missing_config_fails() {
    let (_, stderr, success) = run_chx(Path::new("/nonexistent/chx.toml"), &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
