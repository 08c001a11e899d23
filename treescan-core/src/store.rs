//! Content-addressed store client: LZ4 compression, SHA-256 addressing and the
//! blob cache backends.

use crate::config::{CacheBackend, CacheConfig};
use crate::error::ScanError;
use crate::syntax::{self, SyntaxNode};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Compress with the LZ4 frame format. Same input, same output.
pub fn compress(bytes: &[u8]) -> crate::Result<Vec<u8>> {
    let mut encoder = FrameEncoder::new(Vec::with_capacity(bytes.len() / 2));
    encoder.write_all(bytes)?;
    encoder
        .finish()
        .map_err(|e| ScanError::Io(std::io::Error::other(e.to_string())))
}

pub fn decompress(bytes: &[u8]) -> crate::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len() * 4);
    FrameDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Lowercase hex SHA-256 digest
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Key/value blob cache keyed by content hash.
///
/// Writes are idempotent: putting an existing key leaves the stored value
/// unchanged. Implementations must tolerate concurrent writers.
pub trait BlobCache: Send + Sync {
    /// Store `bytes` under `hash` unless present. Returns `true` if a new
    /// entry was created.
    fn put(&self, hash: &str, bytes: &[u8]) -> crate::Result<bool>;

    fn get(&self, hash: &str) -> crate::Result<Option<Vec<u8>>>;

    fn contains(&self, hash: &str) -> crate::Result<bool> {
        Ok(self.get(hash)?.is_some())
    }

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// In-process cache
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct entries
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `put` calls received, including no-op ones
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    fn poisoned() -> ScanError {
        ScanError::Cache("memory cache lock poisoned".to_string())
    }
}

impl BlobCache for MemoryCache {
    fn put(&self, hash: &str, bytes: &[u8]) -> crate::Result<bool> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        if entries.contains_key(hash) {
            return Ok(false);
        }
        entries.insert(hash.to_string(), bytes.to_vec());
        Ok(true)
    }

    fn get(&self, hash: &str) -> crate::Result<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.get(hash).cloned())
    }

    fn contains(&self, hash: &str) -> crate::Result<bool> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.contains_key(hash))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed cache. Connections are pooled so each parse worker reuses one.
pub struct RedisCache {
    client: redis::Client,
    idle: Mutex<Vec<redis::Connection>>,
}

impl RedisCache {
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Connect and verify the server answers PING
    pub fn connect(url: &str) -> crate::Result<Self> {
        let client = redis::Client::open(url)?;
        let cache = Self {
            client,
            idle: Mutex::new(Vec::new()),
        };
        cache.with_conn(|conn| redis::cmd("PING").query::<String>(conn))?;
        Ok(cache)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> crate::Result<T> {
        let pooled = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self
                .client
                .get_connection_with_timeout(Self::CONNECT_TIMEOUT)?,
        };
        let result = f(&mut conn)?;
        // Only healthy connections go back to the pool
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
        Ok(result)
    }
}

impl BlobCache for RedisCache {
    fn put(&self, hash: &str, bytes: &[u8]) -> crate::Result<bool> {
        let reply: Option<String> = self.with_conn(|conn| {
            redis::cmd("SET")
                .arg(hash)
                .arg(bytes)
                .arg("NX")
                .query(conn)
        })?;
        Ok(reply.is_some())
    }

    fn get(&self, hash: &str) -> crate::Result<Option<Vec<u8>>> {
        self.with_conn(|conn| redis::cmd("GET").arg(hash).query(conn))
    }

    fn contains(&self, hash: &str) -> crate::Result<bool> {
        self.with_conn(|conn| redis::cmd("EXISTS").arg(hash).query(conn))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Build the cache selected by config
pub fn open_cache(config: &CacheConfig) -> crate::Result<Arc<dyn BlobCache>> {
    match config.backend {
        CacheBackend::Redis => Ok(Arc::new(RedisCache::connect(&config.redis_url)?)),
        CacheBackend::Memory => Ok(Arc::new(MemoryCache::new())),
    }
}

/// A compressed tree and its address
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub hash: String,
    pub compressed: Vec<u8>,
    /// Whether this write created a new cache entry
    pub created: bool,
}

/// Compress-hash-store front end over a [`BlobCache`]
#[derive(Clone)]
pub struct ContentStore {
    cache: Arc<dyn BlobCache>,
}

impl ContentStore {
    pub fn new(cache: Arc<dyn BlobCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<dyn BlobCache> {
        &self.cache
    }

    /// Compress serialized tree bytes, address them by the hash of the
    /// compressed form and write them to the cache.
    pub fn put_tree(&self, serialized: &[u8]) -> crate::Result<StoredBlob> {
        let compressed = compress(serialized)?;
        let hash = content_hash(&compressed);
        let created = self.cache.put(&hash, &compressed)?;
        Ok(StoredBlob {
            hash,
            compressed,
            created,
        })
    }

    /// Fetch a blob, verifying it still matches its address
    pub fn get_blob(&self, hash: &str) -> crate::Result<Vec<u8>> {
        let bytes = self
            .cache
            .get(hash)?
            .ok_or_else(|| ScanError::BlobNotFound(hash.to_string()))?;
        verify_blob(hash, &bytes)?;
        Ok(bytes)
    }

    /// Fetch, verify, decompress and decode a tree
    pub fn load_tree(&self, hash: &str) -> crate::Result<SyntaxNode> {
        let compressed = self.get_blob(hash)?;
        decode_blob(&compressed)
    }
}

/// Check that `bytes` hash to `hash`
pub fn verify_blob(hash: &str, bytes: &[u8]) -> crate::Result<()> {
    let actual = content_hash(bytes);
    if actual != hash {
        return Err(ScanError::Corrupt {
            hash: hash.to_string(),
            message: format!("content hashes to {}", actual),
        });
    }
    Ok(())
}

/// Decompress and decode a stored tree
pub fn decode_blob(compressed: &[u8]) -> crate::Result<SyntaxNode> {
    syntax::decode(&decompress(compressed)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_is_deterministic() {
        let data = br#"{"type":"module","start":[0,0],"end":[1,0],"children":[]}"#.repeat(50);
        let a = compress(&data).unwrap();
        let b = compress(&data).unwrap();
        assert_eq!(a, b);
        assert!(a.len() < data.len());
        assert_eq!(decompress(&a).unwrap(), data);
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(content_hash(b"abc").len(), 64);
    }

    #[test]
    fn test_memory_cache_put_is_idempotent() {
        let cache = MemoryCache::new();
        assert!(cache.put("k", b"v").unwrap());
        assert!(!cache.put("k", b"v").unwrap());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.write_count(), 2);
        assert_eq!(cache.get("k").unwrap(), Some(b"v".to_vec()));
        assert!(cache.contains("k").unwrap());
        assert!(!cache.contains("missing").unwrap());
    }

    #[test]
    fn test_put_tree_hashes_compressed_bytes() {
        let cache = Arc::new(MemoryCache::new());
        let store = ContentStore::new(cache.clone());
        let serialized = br#"{"type":"source_file","start":[0,0],"end":[0,5],"children":[]}"#;

        let blob = store.put_tree(serialized).unwrap();
        assert!(blob.created);
        assert_eq!(blob.hash, content_hash(&blob.compressed));
        assert_eq!(blob.compressed, compress(serialized).unwrap());

        let again = store.put_tree(serialized).unwrap();
        assert!(!again.created);
        assert_eq!(again.hash, blob.hash);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_load_tree_detects_corruption() {
        let cache = Arc::new(MemoryCache::new());
        let store = ContentStore::new(cache.clone());
        let serialized = br#"{"type":"module","start":[0,0],"end":[0,0],"children":[]}"#;
        let blob = store.put_tree(serialized).unwrap();

        let tree = store.load_tree(&blob.hash).unwrap();
        assert_eq!(tree.kind, "module");

        // Same key, different bytes
        let bogus = "0".repeat(64);
        cache.put(&bogus, &blob.compressed).unwrap();
        assert!(matches!(
            store.load_tree(&bogus),
            Err(ScanError::Corrupt { .. })
        ));
        assert!(matches!(
            store.load_tree(&"f".repeat(64)),
            Err(ScanError::BlobNotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_share_one_entry() {
        let cache = Arc::new(MemoryCache::new());
        let store = ContentStore::new(cache.clone());
        let serialized = br#"{"type":"program","start":[0,0],"end":[0,1],"children":[]}"#;
        let hashes: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| store.put_tree(serialized).unwrap().hash))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.write_count(), 8);
    }

    #[test]
    fn test_unreachable_redis_is_cache_error() {
        // Port 1 is never a redis server
        let err = RedisCache::connect("redis://127.0.0.1:1/0").err().unwrap();
        assert!(matches!(err, ScanError::Cache(_)));
    }
}
