use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

use crate::config::CoreConfig;

/// Files below this size go through the cached read path.
const SMALL_FILE_LIMIT: u64 = 1024 * 1024;
/// Files between the small limit and this one are read whole but never cached.
const MEDIUM_FILE_LIMIT: u64 = 10 * 1024 * 1024;
/// Chunk size used when re-joining a large file from chunked reads.
const JOIN_CHUNK_SIZE: usize = 64 * 1024;

struct CacheEntry {
    data: Arc<[u8]>,
    size: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<PathBuf, CacheEntry>,
    /// LRU order: front is the oldest access, back the most recent.
    access_order: Vec<PathBuf>,
    current_bytes: u64,
    peak_bytes: u64,
}

impl CacheState {
    fn promote(&mut self, path: &Path) {
        if let Some(pos) = self.access_order.iter().position(|p| p == path) {
            self.access_order.remove(pos);
        }
        self.access_order.push(path.to_path_buf());
    }

    /// Drop the least-recently-accessed entry, subtracting its recorded size.
    fn evict_oldest(&mut self) -> bool {
        if self.access_order.is_empty() {
            return false;
        }
        let oldest = self.access_order.remove(0);
        if let Some(entry) = self.entries.remove(&oldest) {
            self.current_bytes -= entry.size;
            debug!(path = %oldest.display(), bytes = entry.size, "evicted cache entry");
            return true;
        }
        false
    }

    fn remove(&mut self, path: &Path) {
        if let Some(entry) = self.entries.remove(path) {
            self.current_bytes -= entry.size;
        }
        if let Some(pos) = self.access_order.iter().position(|p| p == path) {
            self.access_order.remove(pos);
        }
    }
}

/// Point-in-time snapshot of cache accounting.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub current_bytes: u64,
    pub peak_bytes: u64,
    pub entries: usize,
}

/// Serves file content while keeping aggregate cached bytes at or below a
/// configured ceiling, evicting least-recently-used entries first. Files too
/// large to cache degrade to uncached or chunked reads; files above the hard
/// per-file ceiling are refused outright.
///
/// Interior locking is synchronous and never held across an await point:
/// file I/O happens outside the lock, map bookkeeping inside it.
pub struct MemoryCache {
    max_memory_bytes: u64,
    max_file_size: u64,
    cache_file_max_size: u64,
    state: Mutex<CacheState>,
}

impl MemoryCache {
    pub fn new(config: &CoreConfig) -> Self {
        Self::with_limits(
            config.max_memory_bytes(),
            config.max_file_size,
            config.cache_file_max_size,
        )
    }

    pub fn with_limits(max_memory_bytes: u64, max_file_size: u64, cache_file_max_size: u64) -> Self {
        Self {
            max_memory_bytes,
            max_file_size,
            cache_file_max_size,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Read a file through the cache. A hit promotes the entry to
    /// most-recently-used; a miss evicts until there is headroom, reads the
    /// file, and caches it only when it is small enough to be eligible.
    /// Oversized files and IO errors degrade to `None`.
    pub async fn read(&self, path: &Path) -> Option<String> {
        if let Some(data) = self.lookup(path) {
            return Some(String::from_utf8_lossy(&data).into_owned());
        }

        let meta = tokio::fs::metadata(path).await.ok()?;
        let size = meta.len();
        if size > self.max_file_size {
            debug!(path = %path.display(), size, "refusing file above hard ceiling");
            return None;
        }

        self.ensure_available(size);

        let content = tokio::fs::read(path).await.ok()?;
        let data: Arc<[u8]> = content.into();

        if size < self.cache_file_max_size {
            self.insert(path, data.clone());
        }

        Some(String::from_utf8_lossy(&data).into_owned())
    }

    /// Lazy sequence of text chunks, decoded at UTF-8 boundaries so a
    /// multi-byte character split across chunks is never mangled. Open
    /// failures produce an empty stream.
    pub fn read_chunked(&self, path: &Path, chunk_size: usize) -> impl Stream<Item = String> {
        let path = path.to_path_buf();
        let chunk_size = chunk_size.max(1);

        futures::stream::unfold(ChunkReader::Pending(path), move |mut reader| async move {
            loop {
                match reader {
                    ChunkReader::Pending(path) => match File::open(&path).await {
                        Ok(file) => reader = ChunkReader::Open(file, Vec::new()),
                        Err(_) => return None,
                    },
                    ChunkReader::Open(mut file, mut carry) => {
                        let mut buf = vec![0u8; chunk_size];
                        match file.read(&mut buf).await {
                            Ok(0) | Err(_) => {
                                if carry.is_empty() {
                                    return None;
                                }
                                let tail = String::from_utf8_lossy(&carry).into_owned();
                                return Some((tail, ChunkReader::Done));
                            }
                            Ok(n) => {
                                carry.extend_from_slice(&buf[..n]);
                                let text = take_valid_utf8(&mut carry);
                                if text.is_empty() {
                                    reader = ChunkReader::Open(file, carry);
                                    continue;
                                }
                                return Some((text, ChunkReader::Open(file, carry)));
                            }
                        }
                    }
                    ChunkReader::Done => return None,
                }
            }
        })
    }

    /// Lazy sequence of line batches of up to `max_lines`; the final partial
    /// batch is still yielded.
    pub fn read_lines_chunked(
        &self,
        path: &Path,
        max_lines: usize,
    ) -> impl Stream<Item = Vec<String>> {
        let path = path.to_path_buf();
        let max_lines = max_lines.max(1);

        futures::stream::unfold(LineReader::Pending(path), move |mut reader| async move {
            loop {
                match reader {
                    LineReader::Pending(path) => match File::open(&path).await {
                        Ok(file) => reader = LineReader::Open(BufReader::new(file).lines()),
                        Err(_) => return None,
                    },
                    LineReader::Open(mut lines) => {
                        let mut batch = Vec::with_capacity(max_lines);
                        loop {
                            match lines.next_line().await {
                                Ok(Some(line)) => {
                                    batch.push(line);
                                    if batch.len() >= max_lines {
                                        return Some((batch, LineReader::Open(lines)));
                                    }
                                }
                                Ok(None) | Err(_) => {
                                    if batch.is_empty() {
                                        return None;
                                    }
                                    return Some((batch, LineReader::Done));
                                }
                            }
                        }
                    }
                    LineReader::Done => return None,
                }
            }
        })
    }

    /// Size-tiered dispatch: small files go through the cache, medium files
    /// are read whole without caching, large files are chunk-read and
    /// re-joined. Files above the hard ceiling are refused.
    pub async fn smart_read(&self, path: &Path) -> Option<String> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        let size = meta.len();

        if size > self.max_file_size {
            return None;
        }
        if size < SMALL_FILE_LIMIT {
            return self.read(path).await;
        }
        if size < MEDIUM_FILE_LIMIT {
            let bytes = tokio::fs::read(path).await.ok()?;
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }

        let stream = self.read_chunked(path, JOIN_CHUNK_SIZE);
        futures::pin_mut!(stream);
        let mut parts = Vec::new();
        while let Some(chunk) = stream.next().await {
            parts.push(chunk);
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.concat())
    }

    /// Stream fixed-size byte chunks through a caller processor without ever
    /// materializing the whole file. One buffer of `chunk_size` is reused
    /// for every read, so peak memory stays bounded. Per-chunk processor
    /// errors are skipped; IO errors end the stream early.
    pub async fn process_large_file<R, F, Fut>(
        &self,
        path: &Path,
        processor: F,
        chunk_size: usize,
    ) -> Vec<R>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<R>>>,
    {
        let mut results = Vec::new();
        let Ok(mut file) = File::open(path).await else {
            return results;
        };

        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut carry: Vec<u8> = Vec::new();
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    carry.extend_from_slice(&buf[..n]);
                    let text = take_valid_utf8(&mut carry);
                    if text.is_empty() {
                        continue;
                    }
                    match processor(text).await {
                        Ok(Some(result)) => results.push(result),
                        Ok(None) => {}
                        Err(e) => debug!(error = %e, "chunk processor failed, skipping chunk"),
                    }
                }
                Err(_) => break,
            }
        }

        if !carry.is_empty() {
            let tail = String::from_utf8_lossy(&carry).into_owned();
            if let Ok(Some(result)) = processor(tail).await {
                results.push(result);
            }
        }

        results
    }

    /// Drop all entries and reset memory accounting to zero.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.access_order.clear();
        state.current_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            current_bytes: state.current_bytes,
            peak_bytes: state.peak_bytes,
            entries: state.entries.len(),
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.state.lock().entries.contains_key(path)
    }

    fn lookup(&self, path: &Path) -> Option<Arc<[u8]>> {
        let mut state = self.state.lock();
        let data = state.entries.get(path).map(|e| e.data.clone())?;
        state.promote(path);
        Some(data)
    }

    /// Evict least-recently-used entries until `required` bytes fit under
    /// the ceiling, or the cache is empty.
    fn ensure_available(&self, required: u64) {
        let mut state = self.state.lock();
        while state.current_bytes + required > self.max_memory_bytes {
            if !state.evict_oldest() {
                break;
            }
        }
    }

    fn insert(&self, path: &Path, data: Arc<[u8]>) {
        let size = data.len() as u64;
        let mut state = self.state.lock();

        // A concurrent read may have inserted the same path already.
        state.remove(path);

        // Re-check headroom under the lock so the ceiling invariant holds
        // even when concurrent misses raced past ensure_available.
        while state.current_bytes + size > self.max_memory_bytes {
            if !state.evict_oldest() {
                break;
            }
        }
        if state.current_bytes + size > self.max_memory_bytes {
            return;
        }

        state.entries.insert(path.to_path_buf(), CacheEntry { data, size });
        state.current_bytes += size;
        state.peak_bytes = state.peak_bytes.max(state.current_bytes);
        state.promote(path);
    }
}

enum ChunkReader {
    Pending(PathBuf),
    Open(File, Vec<u8>),
    Done,
}

enum LineReader {
    Pending(PathBuf),
    Open(tokio::io::Lines<BufReader<File>>),
    Done,
}

/// Split off and decode every complete UTF-8 sequence in `buffer`, leaving a
/// trailing incomplete sequence (if any) behind for the next chunk. Invalid
/// bytes are replaced rather than dropped.
fn take_valid_utf8(buffer: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buffer) {
        Ok(text) => {
            let text = text.to_string();
            buffer.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = buffer.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(buffer).into_owned();
            *buffer = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(buffer).into_owned();
            buffer.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_read_caches_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"hello world");
        let cache = MemoryCache::with_limits(1024, 10_000, 1_000);

        let content = cache.read(&path).await.unwrap();
        assert_eq!(content, "hello world");
        assert!(cache.contains(&path));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.current_bytes, 11);

        // Second read is a hit.
        assert_eq!(cache.read(&path).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_lru_eviction_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.txt", &vec![b'a'; 500]);
        let b = write_file(dir.path(), "b.txt", &vec![b'b'; 500]);
        // Ceiling of 800 bytes: A and B cannot coexist.
        let cache = MemoryCache::with_limits(800, 10_000, 1_000);

        cache.read(&a).await.unwrap();
        cache.read(&b).await.unwrap();

        assert!(!cache.contains(&a), "least-recently-used entry survives");
        assert!(cache.contains(&b));
        assert_eq!(cache.stats().current_bytes, 500);
    }

    #[tokio::test]
    async fn test_hit_promotes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.txt", &vec![b'a'; 300]);
        let b = write_file(dir.path(), "b.txt", &vec![b'b'; 300]);
        let c = write_file(dir.path(), "c.txt", &vec![b'c'; 300]);
        let cache = MemoryCache::with_limits(700, 10_000, 1_000);

        cache.read(&a).await.unwrap();
        cache.read(&b).await.unwrap();
        // Touch A so B becomes the LRU entry.
        cache.read(&a).await.unwrap();
        cache.read(&c).await.unwrap();

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.stats().current_bytes, 600);
    }

    #[tokio::test]
    async fn test_oversized_file_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "huge.txt", &vec![b'x'; 2048]);
        let cache = MemoryCache::with_limits(10_000, 1_024, 1_000);

        assert!(cache.read(&path).await.is_none());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().current_bytes, 0);
    }

    #[tokio::test]
    async fn test_large_but_allowed_file_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "mid.txt", &vec![b'm'; 1500]);
        // Below the hard ceiling, above the cache-eligibility threshold.
        let cache = MemoryCache::with_limits(10_000, 4_096, 1_000);

        let content = cache.read(&path).await.unwrap();
        assert_eq!(content.len(), 1500);
        assert!(!cache.contains(&path));
        assert_eq!(cache.stats().current_bytes, 0);
    }

    #[tokio::test]
    async fn test_missing_file_degrades_to_none() {
        let cache = MemoryCache::with_limits(1024, 10_000, 1_000);
        assert!(cache.read(Path::new("/no/such/file")).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_resets_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"data");
        let cache = MemoryCache::with_limits(1024, 10_000, 1_000);

        cache.read(&path).await.unwrap();
        assert_eq!(cache.stats().entries, 1);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.current_bytes, 0);
        // Peak survives a clear; it tracks the high-water mark.
        assert_eq!(stats.peak_bytes, 4);
    }

    #[tokio::test]
    async fn test_read_chunked_reassembles() {
        let dir = tempfile::tempdir().unwrap();
        let contents = "abcdefghij".repeat(10);
        let path = write_file(dir.path(), "chunky.txt", contents.as_bytes());
        let cache = MemoryCache::with_limits(1024, 10_000, 1_000);

        let stream = cache.read_chunked(&path, 16);
        futures::pin_mut!(stream);
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }

        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), contents);
    }

    #[tokio::test]
    async fn test_read_chunked_multibyte_boundary() {
        let dir = tempfile::tempdir().unwrap();
        // Three-byte characters with a chunk size that splits them.
        let contents = "日本語のテキスト";
        let path = write_file(dir.path(), "utf8.txt", contents.as_bytes());
        let cache = MemoryCache::with_limits(1024, 10_000, 1_000);

        let stream = cache.read_chunked(&path, 4);
        futures::pin_mut!(stream);
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk);
        }

        assert_eq!(out, contents);
    }

    #[tokio::test]
    async fn test_read_chunked_missing_file_is_empty_stream() {
        let cache = MemoryCache::with_limits(1024, 10_000, 1_000);
        let stream = cache.read_chunked(Path::new("/no/such/file"), 16);
        futures::pin_mut!(stream);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_read_lines_chunked_final_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let contents = (0..7).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let path = write_file(dir.path(), "lines.txt", contents.as_bytes());
        let cache = MemoryCache::with_limits(1024, 10_000, 1_000);

        let stream = cache.read_lines_chunked(&path, 3);
        futures::pin_mut!(stream);
        let mut batches = Vec::new();
        while let Some(batch) = stream.next().await {
            batches.push(batch);
        }

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 3);
        assert_eq!(batches[2], vec!["line 6"]);
    }

    #[tokio::test]
    async fn test_smart_read_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "s.txt", b"small contents");
        let cache = MemoryCache::with_limits(1024 * 1024, 20 * 1024 * 1024, 1024 * 1024);

        let content = cache.smart_read(&path).await.unwrap();
        assert_eq!(content, "small contents");
        // Small tier goes through the cache.
        assert!(cache.contains(&path));
    }

    #[tokio::test]
    async fn test_smart_read_refuses_above_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "big.txt", &vec![b'x'; 4096]);
        let cache = MemoryCache::with_limits(1024 * 1024, 1024, 512);

        assert!(cache.smart_read(&path).await.is_none());
    }

    #[tokio::test]
    async fn test_process_large_file_collects_results() {
        let dir = tempfile::tempdir().unwrap();
        let contents = "needle".to_string() + &"hay".repeat(200) + "needle";
        let path = write_file(dir.path(), "stack.txt", contents.as_bytes());
        let cache = MemoryCache::with_limits(1024, 10_000, 1_000);

        let results = cache
            .process_large_file(
                &path,
                |chunk: String| async move {
                    Ok(Some(chunk.matches("needle").count()))
                },
                64,
            )
            .await;

        let total: usize = results.iter().sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_process_large_file_skips_failing_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "x.txt", &vec![b'x'; 256]);
        let cache = MemoryCache::with_limits(1024, 10_000, 1_000);

        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let results = cache
            .process_large_file(
                &path,
                {
                    let calls = calls.clone();
                    move |chunk: String| {
                        let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        async move {
                            if n == 0 {
                                anyhow::bail!("bad chunk")
                            }
                            Ok(Some(chunk.len()))
                        }
                    }
                },
                64,
            )
            .await;

        // First chunk failed and was skipped; the rest were collected.
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_take_valid_utf8_keeps_incomplete_tail() {
        let bytes = "héllo".as_bytes();
        // Split inside the two-byte 'é'.
        let mut buffer = bytes[..2].to_vec();
        let text = take_valid_utf8(&mut buffer);
        assert_eq!(text, "h");
        assert_eq!(buffer.len(), 1);

        buffer.extend_from_slice(&bytes[2..]);
        let rest = take_valid_utf8(&mut buffer);
        assert_eq!(rest, "éllo");
        assert!(buffer.is_empty());
    }
}
