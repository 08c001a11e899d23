//! Per-file unit of work: read, parse, serialize, compress, hash, cache.

use crate::grammar::GrammarRegistry;
use crate::store::ContentStore;
use crate::syntax::{self, SyntaxNode, DEFAULT_MAX_TREE_DEPTH};
use serde::Serialize;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

thread_local! {
    /// One parser per worker thread; parse state is never shared.
    static PARSER: RefCell<tree_sitter::Parser> = RefCell::new(tree_sitter::Parser::new());
}

/// Everything persisted for one successfully parsed file
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub file_sha256: String,
    pub compressed_ast: Vec<u8>,
    pub relpath: String,
    pub lang: String,
    pub n_lines: usize,
}

/// Pipeline stage a file failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Read,
    Parse,
    Encode,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Parse => "parse",
            Self::Encode => "encode",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "parse" => Some(Self::Parse),
            "encode" => Some(Self::Encode),
            _ => None,
        }
    }
}

/// A file that could not be turned into a chunk
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub relpath: String,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum FileOutcome {
    Chunk(ChunkPayload),
    /// No grammar registered for the extension. Not an error.
    Skipped { relpath: String },
    Failed(FileFailure),
}

/// Number of `\n` bytes
pub fn count_lines(source: &[u8]) -> usize {
    source.iter().filter(|&&b| b == b'\n').count()
}

/// Path relative to the scan root, as stored in `ast_chunks.relpath`.
/// A path that is not valid UTF-8 comes back as `Err` holding its lossy form,
/// which is not unique and must not be stored as a chunk.
pub fn relative_path(root: &Path, path: &Path) -> Result<String, String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    match rel.to_str() {
        Some(s) => Ok(s.to_string()),
        None => Err(rel.to_string_lossy().into_owned()),
    }
}

fn parse_source(language: &tree_sitter::Language, source: &[u8]) -> Result<tree_sitter::Tree, String> {
    PARSER.with(|cell| {
        let mut parser = cell.borrow_mut();
        parser.reset();
        parser.set_language(language).map_err(|e| e.to_string())?;
        parser
            .parse(source, None)
            .ok_or_else(|| "parser produced no tree".to_string())
    })
}

/// Parse worker. Cheap to clone; share one per scan.
#[derive(Clone)]
pub struct ParseWorker {
    root: PathBuf,
    registry: Arc<GrammarRegistry>,
    store: ContentStore,
    max_file_bytes: u64,
    max_tree_depth: usize,
}

impl ParseWorker {
    pub fn new(
        root: &Path,
        registry: Arc<GrammarRegistry>,
        store: ContentStore,
        max_file_bytes: u64,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            registry,
            store,
            max_file_bytes,
            max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
        }
    }

    /// Files whose syntax tree nests deeper than this fail at the encode stage
    pub fn with_max_tree_depth(mut self, max_tree_depth: usize) -> Self {
        self.max_tree_depth = max_tree_depth;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Process one file. Read, parse and encode problems are reported as
    /// [`FileOutcome::Failed`]; only cache failures return `Err`.
    pub fn process(&self, path: &Path) -> crate::Result<FileOutcome> {
        let (relpath, utf8_path) = match relative_path(&self.root, path) {
            Ok(relpath) => (relpath, true),
            Err(lossy) => (lossy, false),
        };

        let Some(grammar) = self.registry.resolve(path) else {
            debug!(relpath = %relpath, "no grammar, skipping");
            return Ok(FileOutcome::Skipped { relpath });
        };

        let failed = |stage: FailureStage, message: String| -> crate::Result<FileOutcome> {
            warn!(relpath = %relpath, stage = stage.as_str(), error = %message, "file failed");
            Ok(FileOutcome::Failed(FileFailure {
                relpath: relpath.clone(),
                stage,
                message,
            }))
        };

        if !utf8_path {
            return failed(FailureStage::Read, "path is not valid UTF-8".to_string());
        }

        match fs::metadata(path) {
            Ok(meta) if meta.len() > self.max_file_bytes => {
                return failed(
                    FailureStage::Read,
                    format!("file is {} bytes, limit is {}", meta.len(), self.max_file_bytes),
                );
            }
            Ok(_) => {}
            Err(e) => return failed(FailureStage::Read, e.to_string()),
        }

        let source = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => return failed(FailureStage::Read, e.to_string()),
        };
        let n_lines = count_lines(&source);

        let tree = match parse_source(grammar.language(), &source) {
            Ok(tree) => tree,
            Err(message) => return failed(FailureStage::Parse, message),
        };

        let node = match SyntaxNode::from_tree_sitter(tree.root_node(), self.max_tree_depth) {
            Ok(node) => node,
            Err(e) => return failed(FailureStage::Encode, e.to_string()),
        };
        drop(tree);
        let serialized = match syntax::encode(&node) {
            Ok(bytes) => bytes,
            Err(e) => return failed(FailureStage::Encode, e.to_string()),
        };
        drop(node);

        let blob = self.store.put_tree(&serialized)?;

        Ok(FileOutcome::Chunk(ChunkPayload {
            file_sha256: blob.hash,
            compressed_ast: blob.compressed,
            relpath,
            lang: grammar.lang().to_string(),
            n_lines,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use crate::store::{content_hash, BlobCache, MemoryCache};
    use tempfile::TempDir;

    /// Cache that is always down
    struct DownCache;

    impl BlobCache for DownCache {
        fn put(&self, _hash: &str, _bytes: &[u8]) -> crate::Result<bool> {
            Err(ScanError::Cache("connection refused".to_string()))
        }
        fn get(&self, _hash: &str) -> crate::Result<Option<Vec<u8>>> {
            Err(ScanError::Cache("connection refused".to_string()))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn worker(root: &Path, cache: Arc<dyn BlobCache>) -> ParseWorker {
        ParseWorker::new(
            root,
            Arc::new(GrammarRegistry::with_defaults()),
            ContentStore::new(cache),
            1024 * 1024,
        )
    }

    #[test]
    fn test_count_lines() {
        assert_eq!(count_lines(b""), 0);
        assert_eq!(count_lines(b"no newline"), 0);
        assert_eq!(count_lines(b"a\nb\n"), 2);
        assert_eq!(count_lines(b"a\r\nb"), 1);
        let hundred = "print('hello world')\n".repeat(100);
        assert_eq!(count_lines(hundred.as_bytes()), 100);
    }

    #[test]
    fn test_process_produces_chunk() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        let path = dir.path().join("pkg/main.go");
        std::fs::write(&path, "package main\n").unwrap();

        let cache = Arc::new(MemoryCache::new());
        let outcome = worker(dir.path(), cache.clone()).process(&path).unwrap();
        let chunk = match outcome {
            FileOutcome::Chunk(chunk) => chunk,
            other => panic!("expected chunk, got {:?}", other),
        };

        assert_eq!(chunk.relpath, Path::new("pkg").join("main.go").to_string_lossy());
        assert_eq!(chunk.lang, "go");
        assert_eq!(chunk.n_lines, 1);
        assert_eq!(chunk.file_sha256, content_hash(&chunk.compressed_ast));
        assert!(cache.contains(&chunk.file_sha256).unwrap());
    }

    #[test]
    fn test_unsupported_extension_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello\n").unwrap();

        let cache = Arc::new(MemoryCache::new());
        let outcome = worker(dir.path(), cache.clone()).process(&path).unwrap();
        assert!(matches!(outcome, FileOutcome::Skipped { ref relpath } if relpath == "notes.txt"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_missing_file_is_read_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.py");
        let outcome = worker(dir.path(), Arc::new(MemoryCache::new()))
            .process(&path)
            .unwrap();
        assert!(matches!(
            outcome,
            FileOutcome::Failed(FileFailure { stage: FailureStage::Read, .. })
        ));
    }

    #[test]
    fn test_oversized_file_is_read_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.js");
        std::fs::write(&path, "x;\n".repeat(100)).unwrap();
        let worker = ParseWorker::new(
            dir.path(),
            Arc::new(GrammarRegistry::with_defaults()),
            ContentStore::new(Arc::new(MemoryCache::new())),
            10,
        );
        let outcome = worker.process(&path).unwrap();
        assert!(matches!(
            outcome,
            FileOutcome::Failed(FileFailure { stage: FailureStage::Read, .. })
        ));
    }

    #[test]
    fn test_malformed_source_still_produces_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.py");
        std::fs::write(&path, "def (:\n  )))\n").unwrap();
        let outcome = worker(dir.path(), Arc::new(MemoryCache::new()))
            .process(&path)
            .unwrap();
        let chunk = match outcome {
            FileOutcome::Chunk(chunk) => chunk,
            other => panic!("expected chunk, got {:?}", other),
        };
        assert_eq!(chunk.n_lines, 2);
    }

    #[test]
    fn test_non_utf8_source_is_parsed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latin1.py");
        std::fs::write(&path, b"s = '\xe9t\xe9'\n").unwrap();
        let outcome = worker(dir.path(), Arc::new(MemoryCache::new()))
            .process(&path)
            .unwrap();
        assert!(matches!(outcome, FileOutcome::Chunk(_)));
    }

    #[test]
    fn test_tree_depth_limit_is_configurable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shallow.py");
        std::fs::write(&path, "x = [[1]]\n").unwrap();

        let limited = worker(dir.path(), Arc::new(MemoryCache::new())).with_max_tree_depth(3);
        assert!(matches!(
            limited.process(&path).unwrap(),
            FileOutcome::Failed(FileFailure { stage: FailureStage::Encode, .. })
        ));
        let roomy = worker(dir.path(), Arc::new(MemoryCache::new())).with_max_tree_depth(64);
        assert!(matches!(roomy.process(&path).unwrap(), FileOutcome::Chunk(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_path_is_read_failure() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join(OsStr::from_bytes(b"\xff.py"));
        std::fs::write(&path, "x = 1\n").unwrap();

        let cache = Arc::new(MemoryCache::new());
        let outcome = worker(dir.path(), cache.clone()).process(&path).unwrap();
        match outcome {
            FileOutcome::Failed(failure) => {
                assert_eq!(failure.stage, FailureStage::Read);
                assert_eq!(failure.relpath, "\u{fffd}.py");
            }
            other => panic!("expected read failure, got {:?}", other),
        }
        assert!(cache.is_empty());
        assert_eq!(relative_path(dir.path(), &dir.path().join("ok.py")), Ok("ok.py".to_string()));
    }

    #[test]
    fn test_cache_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.ts");
        std::fs::write(&path, "let a = 1;\n").unwrap();
        let result = worker(dir.path(), Arc::new(DownCache)).process(&path);
        assert!(matches!(result, Err(ScanError::Cache(_))));
    }

    #[test]
    fn test_failure_stage_names_roundtrip() {
        for stage in [FailureStage::Read, FailureStage::Parse, FailureStage::Encode] {
            assert_eq!(FailureStage::from_name(stage.as_str()), Some(stage));
        }
        assert_eq!(FailureStage::from_name("other"), None);
    }
}
