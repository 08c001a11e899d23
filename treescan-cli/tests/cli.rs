use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Run the CLI against a database in `work`, with the in-process cache
fn treescan(work: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_treescan"))
        .current_dir(work)
        .env_remove("TREESCAN_DATABASE")
        .env_remove("TREESCAN_REDIS_URL")
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(work.join("scans.db"))
        .args(["--cache", "memory", "--json"])
        .args(args)
        .output()
        .unwrap()
}

fn json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "treescan failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_scan_show_tree() {
    let src = TempDir::new().unwrap();
    std::fs::write(src.path().join("main.py"), "print('hi')\n").unwrap();
    std::fs::write(src.path().join("lib.go"), "package lib\n\nfunc F() {}\n").unwrap();
    std::fs::write(src.path().join("notes.txt"), "skip me\n").unwrap();
    let work = TempDir::new().unwrap();

    let report = json(&treescan(
        work.path(),
        &[
            "scan",
            &src.path().to_string_lossy(),
            "--repo-url",
            "local-fixture",
            "--batch-size",
            "1",
        ],
    ));
    assert_eq!(report["chunks"], 2);
    assert_eq!(report["batches"], 2);
    assert_eq!(report["lines"], 4);
    assert_eq!(report["repo_url"], "local-fixture");
    let scan_id = report["scan_id"].as_i64().unwrap().to_string();

    let shown = json(&treescan(work.path(), &["show", &scan_id]));
    assert_eq!(shown["scan"]["status"], "done");
    let relpaths: Vec<&str> = shown["chunks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["relpath"].as_str().unwrap())
        .collect();
    assert_eq!(relpaths, vec!["lib.go", "main.py"]);

    let listed = json(&treescan(work.path(), &["show"]));
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let tree = json(&treescan(work.path(), &["tree", &scan_id, "main.py"]));
    assert_eq!(tree["type"], "module");
    assert!(!tree["children"].as_array().unwrap().is_empty());
}

#[test]
fn test_errors_use_json_envelope() {
    let work = TempDir::new().unwrap();

    let output = treescan(work.path(), &["show", "42"]);
    assert_eq!(output.status.code(), Some(1));
    let envelope: serde_json::Value = serde_json::from_slice(&output.stderr).unwrap();
    assert_eq!(envelope["code"], "scan_not_found");

    json(&treescan(work.path(), &["init"]));
    assert!(work.path().join("treescan.toml").exists());
    let output = treescan(work.path(), &["init"]);
    assert_eq!(output.status.code(), Some(1));
    let envelope: serde_json::Value = serde_json::from_slice(&output.stderr).unwrap();
    assert_eq!(envelope["code"], "config_error");
}
