//! End-to-end scans over temporary source trees

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use treescan_core::store::{compress, content_hash, decode_blob};
use treescan_core::{
    syntax, BlobCache, Config, GrammarRegistry, MemoryCache, ScanDb, ScanDeps, ScanEngine, ScanStatus,
    SyntaxNode,
};

fn deps(cache: Arc<MemoryCache>, batch_size: usize) -> ScanDeps {
    let mut config = Config::default();
    config.scan.batch_size = batch_size;
    ScanDeps::new(config, Arc::new(GrammarRegistry::with_defaults()), cache)
}

fn engine(source_ref: &str, deps: ScanDeps) -> ScanEngine {
    ScanEngine::new(source_ref, deps, ScanDb::open_in_memory().unwrap())
}

/// Serialize `path` the same way a worker does, without going through the pipeline
fn expected_hash(registry: &GrammarRegistry, path: &Path) -> String {
    let grammar = registry.resolve(path).unwrap();
    let source = std::fs::read(path).unwrap();
    let mut parser = tree_sitter::Parser::new();
    parser.set_language(grammar.language()).unwrap();
    let tree = parser.parse(&source, None).unwrap();
    let node = SyntaxNode::from_tree_sitter(tree.root_node(), syntax::DEFAULT_MAX_TREE_DEPTH).unwrap();
    let serialized = syntax::encode(&node).unwrap();
    content_hash(&compress(&serialized).unwrap())
}

#[test]
fn test_four_languages_end_to_end() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    std::fs::write(root.join("main.py"), "print('hello')\n").unwrap();
    std::fs::write(root.join("app.js"), "console.log(1);\n").unwrap();
    std::fs::write(root.join("lib.ts"), "const x: number = 1;\n").unwrap();
    std::fs::write(root.join("main.go"), "package main\n").unwrap();

    let cache = Arc::new(MemoryCache::new());
    let mut engine = engine("file://fixture", deps(cache.clone(), 5000));
    let scan_id = engine.run(root).unwrap();

    let db = engine.db();
    assert_eq!(db.get_scan(scan_id).unwrap().status, ScanStatus::Done);

    let chunks = db.list_chunks(scan_id).unwrap();
    assert_eq!(chunks.len(), 4);
    let relpaths: HashSet<_> = chunks.iter().map(|c| c.relpath.as_str()).collect();
    assert_eq!(relpaths.len(), 4);

    let registry = GrammarRegistry::with_defaults();
    for chunk in &chunks {
        assert_eq!(chunk.n_lines, 1, "{}", chunk.relpath);
        assert_eq!(chunk.file_sha256, expected_hash(&registry, &root.join(&chunk.relpath)));

        let (sha, blob) = db.chunk_blob(scan_id, &chunk.relpath).unwrap().unwrap();
        assert_eq!(sha, content_hash(&blob));
        assert_eq!(cache.get(&sha).unwrap(), Some(blob.clone()));
        let tree = decode_blob(&blob).unwrap();
        assert!(tree.node_count() > 1);
    }

    let langs: HashSet<_> = chunks.iter().map(|c| c.lang.as_str()).collect();
    assert_eq!(
        langs,
        HashSet::from(["python", "javascript", "typescript", "go"])
    );
}

#[test]
fn test_identical_files_share_one_blob_across_scans() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let body = "def f(x):\n    return x + 1\n";
    std::fs::write(first.path().join("a.py"), body).unwrap();
    std::fs::write(first.path().join("b.py"), body).unwrap();
    std::fs::create_dir_all(second.path().join("nested")).unwrap();
    std::fs::write(second.path().join("nested/c.py"), body).unwrap();

    let cache = Arc::new(MemoryCache::new());
    let mut engine = engine("dedup", deps(cache.clone(), 5000));
    let scan_a = engine.run(first.path()).unwrap();
    let scan_b = engine.run(second.path()).unwrap();
    assert_ne!(scan_a, scan_b);

    let mut hashes: Vec<String> = engine
        .db()
        .list_chunks(scan_a)
        .unwrap()
        .into_iter()
        .chain(engine.db().list_chunks(scan_b).unwrap())
        .map(|c| c.file_sha256)
        .collect();
    assert_eq!(hashes.len(), 3);
    hashes.dedup();
    assert_eq!(hashes.len(), 1);

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.write_count(), 3);
}

#[test]
fn test_tree_without_supported_files() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("README.md"), "# readme\n").unwrap();
    std::fs::write(dir.path().join("data.json"), "{}\n").unwrap();

    let mut engine = engine("empty", deps(Arc::new(MemoryCache::new()), 5000));
    let report = engine.run_with_report(dir.path()).unwrap();

    assert_eq!(report.files_discovered, 0);
    assert_eq!(report.chunks, 0);
    assert_eq!(report.batches, 0);
    assert_eq!(engine.db().count_chunks(report.scan_id).unwrap(), 0);
    assert_eq!(
        engine.db().get_scan(report.scan_id).unwrap().status,
        ScanStatus::Done
    );
}

#[test]
fn test_batches_cover_every_file_once() {
    let dir = TempDir::new().unwrap();
    let exts = ["py", "js", "ts", "tsx", "go", "rs"];
    let n = 47;
    for i in 0..n {
        let sub = dir.path().join(format!("d{}", i % 5));
        std::fs::create_dir_all(&sub).unwrap();
        let ext = exts[i % exts.len()];
        let body = match ext {
            "go" => format!("package p{}\n", i),
            "rs" => format!("fn f{}() {{}}\n", i),
            _ => format!("let v{} = {};\n", i, i),
        };
        std::fs::write(sub.join(format!("f{}.{}", i, ext)), body).unwrap();
    }
    std::fs::write(dir.path().join("notes.txt"), "ignored\n").unwrap();

    let mut engine = engine("partition", deps(Arc::new(MemoryCache::new()), 10));
    let report = engine.run_with_report(dir.path()).unwrap();

    assert_eq!(report.files_discovered, n);
    assert_eq!(report.batches, n.div_ceil(10));
    assert_eq!(report.chunks + report.failed + report.skipped, n);

    let stored: HashSet<String> = engine
        .db()
        .list_chunks(report.scan_id)
        .unwrap()
        .into_iter()
        .map(|c| c.relpath)
        .collect();
    let failed: HashSet<String> = engine
        .db()
        .list_failures(report.scan_id)
        .unwrap()
        .into_iter()
        .map(|f| f.relpath)
        .collect();
    assert_eq!(stored.len() + failed.len(), n);
    assert!(stored.is_disjoint(&failed));
}

#[test]
fn test_line_count_matches_terminators() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("hundred.py"), "x = 1\n".repeat(100)).unwrap();
    // Still counted even though the parse recovers from errors
    std::fs::write(dir.path().join("broken.js"), "function (\n{{{\n)))\n").unwrap();
    std::fs::write(dir.path().join("noeol.go"), "package main").unwrap();

    let mut engine = engine("lines", deps(Arc::new(MemoryCache::new()), 5000));
    let scan_id = engine.run(dir.path()).unwrap();

    let lines: Vec<(String, i64)> = engine
        .db()
        .list_chunks(scan_id)
        .unwrap()
        .into_iter()
        .map(|c| (c.relpath, c.n_lines))
        .collect();
    assert_eq!(
        lines,
        vec![
            ("broken.js".to_string(), 3),
            ("hundred.py".to_string(), 100),
            ("noeol.go".to_string(), 0),
        ]
    );
}

#[test]
fn test_unreadable_file_is_recorded_not_fatal() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("ok.py"), "a = 1\n").unwrap();
    std::fs::write(dir.path().join("huge.py"), "b = 2\n".repeat(100)).unwrap();

    let mut deps = deps(Arc::new(MemoryCache::new()), 5000);
    deps.config.scan.max_file_bytes = 64;
    let mut engine = engine("limits", deps);
    let scan_id = engine.run(dir.path()).unwrap();

    assert_eq!(engine.db().get_scan(scan_id).unwrap().status, ScanStatus::Done);
    assert_eq!(engine.db().count_chunks(scan_id).unwrap(), 1);
    let failures = engine.db().list_failures(scan_id).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].relpath, "huge.py");
    assert_eq!(failures[0].stage.as_str(), "read");
}

#[test]
fn test_deeply_nested_file_does_not_abort_scan() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("ok.py"), "a = 1\n").unwrap();
    let depth = 1_000_000;
    let mut nested = String::with_capacity(2 * depth + 8);
    nested.push_str("x = ");
    nested.push_str(&"[".repeat(depth));
    nested.push('1');
    nested.push_str(&"]".repeat(depth));
    nested.push('\n');
    std::fs::write(dir.path().join("nested.py"), nested).unwrap();

    let cache = Arc::new(MemoryCache::new());
    let mut engine = engine("nested", deps(cache.clone(), 5000));
    let report = engine.run_with_report(dir.path()).unwrap();

    assert_eq!(report.chunks, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(engine.db().get_scan(report.scan_id).unwrap().status, ScanStatus::Done);
    let failures = engine.db().list_failures(report.scan_id).unwrap();
    assert_eq!(failures[0].relpath, "nested.py");
    assert_eq!(failures[0].stage.as_str(), "encode");
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_deep_tree_within_limit_is_stored() {
    let dir = TempDir::new().unwrap();
    let depth = 20_000;
    let source = format!("x = {}1{}\n", "[".repeat(depth), "]".repeat(depth));
    std::fs::write(dir.path().join("deep.py"), source).unwrap();

    let mut engine = engine("deep", deps(Arc::new(MemoryCache::new()), 5000));
    let scan_id = engine.run(dir.path()).unwrap();

    let (_, blob) = engine.db().chunk_blob(scan_id, "deep.py").unwrap().unwrap();
    // Decoded on a 2 MiB stack, the size of a tokio blocking thread
    let tree_depth = std::thread::Builder::new()
        .stack_size(2 * 1024 * 1024)
        .spawn(move || decode_blob(&blob).unwrap().depth())
        .unwrap()
        .join()
        .unwrap();
    assert!(tree_depth > depth);
}

#[cfg(target_os = "linux")]
#[test]
fn test_non_utf8_names_do_not_collide() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(OsStr::from_bytes(b"\xff.py")), "a = 1\n").unwrap();
    std::fs::write(dir.path().join(OsStr::from_bytes(b"\xfe.py")), "b = 2\n").unwrap();
    std::fs::write(dir.path().join("ok.py"), "c = 3\n").unwrap();

    let mut engine = engine("names", deps(Arc::new(MemoryCache::new()), 5000));
    let report = engine.run_with_report(dir.path()).unwrap();

    assert_eq!(report.chunks, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(engine.db().get_scan(report.scan_id).unwrap().status, ScanStatus::Done);
    let failures = engine.db().list_failures(report.scan_id).unwrap();
    assert!(failures.iter().all(|f| f.stage.as_str() == "read"));
    let chunks = engine.db().list_chunks(report.scan_id).unwrap();
    assert_eq!(chunks[0].relpath, "ok.py");
}

/// Reference bound: 10,000 files × 100 lines at ≥ 50,000 lines/s in release
/// builds on a 4-core machine. Run with `cargo test --release -- --ignored`.
#[test]
#[ignore]
fn test_throughput_bound() {
    const FILES: usize = 10_000;
    const LINES: usize = 100;
    const MIN_LINES_PER_SEC: f64 = 50_000.0;

    let dir = TempDir::new().unwrap();
    let body = "def handler(request):\n    return request\n".repeat(LINES / 2);
    for i in 0..FILES {
        let sub = dir.path().join(format!("pkg{}", i % 100));
        std::fs::create_dir_all(&sub).unwrap();
        let source = body.replace("handler", &format!("h{}", i));
        std::fs::write(sub.join(format!("m{}.py", i)), source).unwrap();
    }

    let mut engine = engine("bench", deps(Arc::new(MemoryCache::new()), 5000));
    let started = Instant::now();
    let report = engine.run_with_report(dir.path()).unwrap();
    let elapsed = started.elapsed().as_secs_f64();

    assert_eq!(report.chunks, FILES);
    assert_eq!(report.lines, FILES * LINES);
    let rate = report.lines as f64 / elapsed;
    assert!(
        rate >= MIN_LINES_PER_SEC,
        "{:.0} lines/s is below the {:.0} lines/s bound",
        rate,
        MIN_LINES_PER_SEC
    );
}
