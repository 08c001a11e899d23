//! Treescan CLI - run scans and inspect stored syntax trees

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use treescan_core::config::{CacheBackend, ENV_DATABASE, ENV_REDIS_URL};
use treescan_core::source::head_commit_sha;
use treescan_core::store::{decode_blob, verify_blob};
use treescan_core::syntax;
use treescan_core::{
    Config, GrammarRegistry, MemoryCache, ScanDb, ScanDeps, ScanEngine, ScanError, ScanReport,
    SourceTree, SyntaxNode,
};

const DEFAULT_CONFIG_PATH: &str = "treescan.toml";

#[derive(Parser)]
#[command(name = "treescan")]
#[command(about = "Repository-wide syntax-tree extraction", long_about = None)]
struct Cli {
    /// Config file (default: ./treescan.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path, overrides store.database
    #[arg(long, global = true, env = ENV_DATABASE)]
    db: Option<PathBuf>,

    /// Blob cache backend, overrides cache.backend
    #[arg(long, global = true, value_enum)]
    cache: Option<CacheArg>,

    /// Redis URL, overrides cache.redis_url
    #[arg(long, global = true, env = ENV_REDIS_URL)]
    redis_url: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CacheArg {
    Redis,
    Memory,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default treescan.toml
    Init,

    /// Scan a local directory or a git repository
    Scan {
        /// Directory to scan
        path: Option<PathBuf>,

        /// Clone this repository into a temporary directory and scan it
        #[arg(long, conflicts_with = "path")]
        repo: Option<String>,

        /// Label recorded as the scan's repo_url (local scans only)
        #[arg(long, conflicts_with = "repo")]
        repo_url: Option<String>,

        /// Files per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Parse worker threads (0 = CPU count)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// List recent scans, or show one scan's chunks and failures
    Show {
        scan_id: Option<i64>,

        /// Number of scans to list
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the stored syntax tree of one file
    Tree {
        scan_id: i64,
        relpath: String,

        /// Only print nodes down to this depth
        #[arg(long)]
        depth: Option<usize>,
    },

    /// Scan a synthetic corpus and report throughput
    Bench {
        #[arg(long, default_value_t = 10_000)]
        files: usize,

        /// Lines per file
        #[arg(long, default_value_t = 100)]
        lines: usize,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        workers: Option<usize>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("treescan_core=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Init => cmd_init(&cli),
        Commands::Scan {
            path,
            repo,
            repo_url,
            batch_size,
            workers,
        } => cmd_scan(
            &cli,
            path.as_deref(),
            repo.as_deref(),
            repo_url.as_deref(),
            *batch_size,
            *workers,
        ),
        Commands::Show { scan_id, limit } => cmd_show(&cli, *scan_id, *limit),
        Commands::Tree {
            scan_id,
            relpath,
            depth,
        } => cmd_tree(&cli, *scan_id, relpath, *depth),
        Commands::Bench {
            files,
            lines,
            batch_size,
            workers,
        } => cmd_bench(&cli, *files, *lines, *batch_size, *workers),
    };

    if let Err(e) = result {
        if cli.json {
            let envelope = e.envelope();
            let rendered = serde_json::to_string_pretty(&envelope)
                .unwrap_or_else(|_| format!("{{\"code\":\"{}\"}}", envelope.code));
            eprintln!("{}", rendered);
        } else {
            eprintln!("{}: {}", "Error".red(), e);
            let hint = e.envelope().hint;
            if !hint.is_empty() {
                eprintln!("{}: {}", "Hint".yellow(), hint);
            }
        }
        std::process::exit(1);
    }
}

/// Config file, then CLI overrides
fn load_config(cli: &Cli) -> treescan_core::Result<Config> {
    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    let path = match &cli.config {
        Some(path) => Some(path.as_path()),
        None if default_path.exists() => Some(default_path),
        None => None,
    };
    let mut config = Config::load_or_default(path)?;
    if let Some(db) = &cli.db {
        config.store.database = db.clone();
    }
    if let Some(url) = &cli.redis_url {
        config.cache.redis_url = url.clone();
    }
    if let Some(cache) = cli.cache {
        config.cache.backend = match cache {
            CacheArg::Redis => CacheBackend::Redis,
            CacheArg::Memory => CacheBackend::Memory,
        };
    }
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> treescan_core::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init(cli: &Cli) -> treescan_core::Result<()> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    Config::init(&path)?;

    if cli.json {
        print_json(&serde_json::json!({ "created": path }))
    } else {
        println!("{} {}", "Created".green(), path.display());
        Ok(())
    }
}

fn cmd_scan(
    cli: &Cli,
    path: Option<&Path>,
    repo: Option<&str>,
    repo_url: Option<&str>,
    batch_size: Option<usize>,
    workers: Option<usize>,
) -> treescan_core::Result<()> {
    let mut config = load_config(cli)?;
    if let Some(n) = batch_size {
        config.scan.batch_size = n;
    }
    if let Some(n) = workers {
        config.scan.workers = n;
    }

    let (tree, source_ref) = match repo {
        Some(url) => (SourceTree::clone_repo(url)?, url.to_string()),
        None => {
            let root = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
            let label = match repo_url {
                Some(label) => label.to_string(),
                None => root.canonicalize().unwrap_or_else(|_| root.clone()).display().to_string(),
            };
            (SourceTree::local(&root), label)
        }
    };

    let deps = ScanDeps::from_config(config)?;
    let mut engine = ScanEngine::open(&source_ref, deps)?;
    let report = engine.run_with_report(tree.path())?;
    let commit = head_commit_sha(tree.path());

    if cli.json {
        let mut value = serde_json::to_value(&report)?;
        value["repo_url"] = serde_json::json!(source_ref);
        value["commit_sha"] = serde_json::json!(commit);
        print_json(&value)
    } else {
        print_report(&source_ref, &report);
        if let Some(sha) = commit {
            println!("{}: {}", "Commit".blue(), sha);
        }
        Ok(())
    }
}

fn print_report(source_ref: &str, report: &ScanReport) {
    println!("{}: {} ({})", "Scan".green(), report.scan_id, source_ref);
    println!(
        "{}: {} files in {} batches",
        "Parsed".green(),
        report.chunks,
        report.batches
    );
    if report.failed > 0 {
        println!("{}: {} files", "Failed".red(), report.failed);
    }
    if report.skipped > 0 {
        println!("{}: {} files (no grammar)", "Skipped".yellow(), report.skipped);
    }
    println!(
        "{}: {} lines in {:.2}s ({:.0} lines/s)",
        "Lines".blue(),
        report.lines,
        report.elapsed.as_secs_f64(),
        report.lines_per_second()
    );
}

fn cmd_show(cli: &Cli, scan_id: Option<i64>, limit: usize) -> treescan_core::Result<()> {
    let config = load_config(cli)?;
    let db = ScanDb::open(&config.store.database)?;

    let Some(scan_id) = scan_id else {
        let scans = db.list_scans(limit)?;
        if cli.json {
            return print_json(&scans);
        }
        if scans.is_empty() {
            println!("No scans in {}", config.store.database.display());
        }
        for scan in scans {
            let status = match scan.status.as_str() {
                "done" => scan.status.as_str().green(),
                "running" => scan.status.as_str().yellow(),
                other => other.red(),
            };
            println!(
                "{:>6}  {:<9}  {:>7} chunks  {}",
                scan.id,
                status,
                db.count_chunks(scan.id)?,
                scan.repo_url
            );
        }
        return Ok(());
    };

    let scan = db.get_scan(scan_id)?;
    let chunks = db.list_chunks(scan_id)?;
    let failures = db.list_failures(scan_id)?;

    if cli.json {
        return print_json(&serde_json::json!({
            "scan": scan,
            "chunks": chunks,
            "failures": failures,
        }));
    }

    println!("{}: {} ({})", "Scan".green(), scan.id, scan.repo_url);
    println!("{}: {}", "Status".blue(), scan.status.as_str());
    if let Some(error) = &scan.error {
        println!("{}: {}", "Error".red(), error);
    }
    for chunk in &chunks {
        println!(
            "  {}  {:<10} {:>6}  {}",
            chunk.file_sha256[..12.min(chunk.file_sha256.len())].dimmed(),
            chunk.lang,
            chunk.n_lines,
            chunk.relpath
        );
    }
    for failure in &failures {
        println!(
            "  {} {} [{}]: {}",
            "failed".red(),
            failure.relpath,
            failure.stage.as_str(),
            failure.message
        );
    }
    println!(
        "{}: {} chunks, {} failures",
        "Total".blue(),
        chunks.len(),
        failures.len()
    );
    Ok(())
}

fn cmd_tree(cli: &Cli, scan_id: i64, relpath: &str, depth: Option<usize>) -> treescan_core::Result<()> {
    let config = load_config(cli)?;
    let db = ScanDb::open(&config.store.database)?;
    db.get_scan(scan_id)?;

    let Some((hash, compressed)) = db.chunk_blob(scan_id, relpath)? else {
        return Err(ScanError::BlobNotFound(format!("{} in scan {}", relpath, scan_id)));
    };
    verify_blob(&hash, &compressed)?;
    let tree = decode_blob(&compressed)?;

    if cli.json {
        println!("{}", String::from_utf8_lossy(&syntax::encode(&tree)?));
        return Ok(());
    }

    println!("{} {}", relpath.bold(), hash.dimmed());
    let mut out = String::new();
    render_tree(&tree, depth, &mut out);
    print!("{}", out);
    Ok(())
}

/// Indented outline of `root`, one line per node, in source order
fn render_tree(root: &SyntaxNode, max_depth: Option<usize>, out: &mut String) {
    let mut pending = vec![(root, 0usize)];
    while let Some((node, level)) = pending.pop() {
        out.push_str(&format!(
            "{}{} [{}:{} - {}:{}]\n",
            "  ".repeat(level),
            node.kind,
            node.start.row,
            node.start.column,
            node.end.row,
            node.end.column
        ));
        if max_depth.is_some_and(|max| level >= max) {
            continue;
        }
        pending.extend(node.children.iter().rev().map(|child| (child, level + 1)));
    }
}

/// Python module of `lines` lines, unique per index
fn synthetic_module(index: usize, lines: usize) -> String {
    let mut body = String::with_capacity(lines * 24);
    let mut written = 0;
    while written < lines {
        if lines - written >= 2 {
            body.push_str(&format!("def f{}_{}(x):\n    return x + {}\n", index, written, written));
            written += 2;
        } else {
            body.push_str(&format!("v{} = {}\n", index, written));
            written += 1;
        }
    }
    body
}

fn cmd_bench(
    cli: &Cli,
    files: usize,
    lines: usize,
    batch_size: Option<usize>,
    workers: Option<usize>,
) -> treescan_core::Result<()> {
    let mut config = load_config(cli)?;
    if let Some(n) = batch_size {
        config.scan.batch_size = n;
    }
    if let Some(n) = workers {
        config.scan.workers = n;
    }

    let corpus = tempfile::Builder::new().prefix("treescan-bench-").tempdir()?;
    for i in 0..files {
        let dir = corpus.path().join(format!("pkg{:03}", i % 100));
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(format!("mod{}.py", i)), synthetic_module(i, lines))?;
    }

    // Throwaway store so benchmark runs never touch real data
    let workers = config.worker_count();
    let deps = ScanDeps::new(
        config,
        Arc::new(GrammarRegistry::with_defaults()),
        Arc::new(MemoryCache::new()),
    );
    let mut engine = ScanEngine::new("bench", deps, ScanDb::open_in_memory()?);
    let report = engine.run_with_report(corpus.path())?;

    if cli.json {
        let mut value = serde_json::to_value(&report)?;
        value["workers"] = serde_json::json!(workers);
        value["lines_per_second"] = serde_json::json!(report.lines_per_second());
        print_json(&value)
    } else {
        println!(
            "{}: {} files x {} lines, {} workers",
            "Corpus".blue(),
            files,
            lines,
            workers
        );
        print_report("bench", &report);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treescan_core::Position;

    #[test]
    fn test_synthetic_module_line_count() {
        for lines in [0, 1, 2, 7, 100] {
            let body = synthetic_module(3, lines);
            assert_eq!(body.matches('\n').count(), lines);
        }
    }

    #[test]
    fn test_render_tree_respects_depth() {
        let leaf = SyntaxNode {
            kind: "identifier".to_string(),
            start: Position { row: 0, column: 0 },
            end: Position { row: 0, column: 1 },
            children: vec![],
        };
        let root = SyntaxNode {
            kind: "module".to_string(),
            start: Position { row: 0, column: 0 },
            end: Position { row: 1, column: 0 },
            children: vec![leaf],
        };

        let mut full = String::new();
        render_tree(&root, None, &mut full);
        assert_eq!(full, "module [0:0 - 1:0]\n  identifier [0:0 - 0:1]\n");

        let mut shallow = String::new();
        render_tree(&root, Some(0), &mut shallow);
        assert_eq!(shallow, "module [0:0 - 1:0]\n");
    }

    fn node(kind: &str, children: Vec<SyntaxNode>) -> SyntaxNode {
        SyntaxNode {
            kind: kind.to_string(),
            start: Position { row: 0, column: 0 },
            end: Position { row: 0, column: 0 },
            children,
        }
    }

    #[test]
    fn test_render_tree_deep_chain_in_source_order() {
        let mut chain = node("leaf", vec![]);
        for _ in 0..3000 {
            chain = node("list", vec![chain]);
        }
        let root = node("module", vec![node("first", vec![]), chain, node("last", vec![])]);

        let mut out = String::new();
        render_tree(&root, None, &mut out);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3004);
        assert_eq!(lines[0], "module [0:0 - 0:0]");
        assert_eq!(lines[1], "  first [0:0 - 0:0]");
        assert_eq!(lines[2], "  list [0:0 - 0:0]");
        assert_eq!(lines[3002].trim_start(), "leaf [0:0 - 0:0]");
        assert_eq!(lines[3003], "  last [0:0 - 0:0]");
    }
}
