use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures::future::join_all;
use globset::Glob;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};

/// Candidate enumeration stops after this many files.
const MAX_CANDIDATE_FILES: usize = 1000;
/// Files searched concurrently per batch.
const SEARCH_BATCH_SIZE: usize = 20;
/// Files indexed concurrently per batch.
const INDEX_BATCH_SIZE: usize = 10;
/// Files above this size are scanned in bounded line windows.
const LARGE_FILE_THRESHOLD: u64 = 1_000_000;
/// Window size, in lines, for large-file scanning.
const SCAN_WINDOW_LINES: usize = 10_000;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("valid word regex"));

/// One regex match within one line. Produced fresh per query, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub file_path: PathBuf,
    /// 1-based.
    pub line_number: usize,
    pub line_content: String,
    /// Byte offsets of the match within the line.
    pub match_start: usize,
    pub match_end: usize,
    pub context_before: Option<String>,
    pub context_after: Option<String>,
}

/// Per-file inverted word index: lowercase word to the set of 1-based line
/// numbers containing it. Stale once the file's on-disk modification time
/// exceeds `modified`; staleness is checked lazily before each rebuild pass.
#[derive(Debug, Clone)]
pub struct FileIndex {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub line_count: usize,
    pub word_index: HashMap<String, HashSet<u32>>,
    pub last_indexed: SystemTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub indexed_files: usize,
    pub total_lines: usize,
    pub total_words: usize,
    pub indexed_bytes: u64,
}

/// Regex line search and indexed keyword search over a directory tree,
/// bounded by configured file-count and result-count limits.
pub struct SearchEngine {
    max_file_size: u64,
    max_results: usize,
    skip_patterns: Vec<String>,
    indices: RwLock<HashMap<PathBuf, FileIndex>>,
    /// One index rebuild pass at a time. Queries keep reading the old
    /// entries until each replacement is installed.
    rebuild_lock: tokio::sync::Mutex<()>,
}

impl SearchEngine {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            max_results: config.max_search_results,
            skip_patterns: config
                .skip_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            indices: RwLock::new(HashMap::new()),
            rebuild_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Regex line search across a directory tree (or a single file).
    /// Candidate files are capped, searched in concurrent batches, and the
    /// sorted results truncated to the configured maximum. Unreadable files
    /// are silently skipped; a missing root or invalid pattern is fatal.
    pub async fn search(
        &self,
        pattern: &str,
        root: &Path,
        file_glob: &str,
        context_lines: usize,
    ) -> Result<Vec<SearchResult>> {
        let regex = compile_pattern(pattern)?;
        let candidates = self.collect_candidates(root, file_glob)?;
        debug!(pattern, candidates = candidates.len(), "starting search");

        let batches: Vec<Vec<PathBuf>> = candidates
            .chunks(SEARCH_BATCH_SIZE)
            .map(|c| c.to_vec())
            .collect();
        let tasks = batches
            .into_iter()
            .map(|batch| self.search_batch(regex.clone(), batch, context_lines));

        let mut results = Vec::new();
        for batch_results in join_all(tasks).await {
            results.extend(batch_results);
        }

        sort_and_truncate(&mut results, self.max_results);
        Ok(results)
    }

    /// Build or refresh the inverted index for every candidate file whose
    /// on-disk modification time exceeds its stored index (or that has no
    /// stored index). Each rebuilt entry replaces the old one atomically.
    pub async fn build_index(&self, root: &Path, file_glob: &str) -> Result<()> {
        let _guard = self.rebuild_lock.lock().await;

        let candidates = self.collect_candidates(root, file_glob)?;
        let mut to_index = Vec::new();
        for path in candidates {
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            if meta.len() >= self.max_file_size {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let stale = match self.indices.read().get(&path) {
                Some(index) => index.modified < mtime,
                None => true,
            };
            if stale {
                to_index.push(path);
            }
        }
        debug!(files = to_index.len(), "indexing stale or new files");

        for batch in to_index.chunks(INDEX_BATCH_SIZE) {
            let tasks = batch.iter().map(|path| self.index_file(path.clone()));
            join_all(tasks).await;
        }
        Ok(())
    }

    /// Keyword search over the prebuilt index: only files containing every
    /// query word are regex-searched. Any word with no indexed files
    /// short-circuits to an empty result.
    pub async fn search_indexed(&self, query: &str, root: &Path) -> Result<Vec<SearchResult>> {
        let words: Vec<String> = WORD_RE
            .find_iter(&query.to_lowercase())
            .map(|m| m.as_str().to_string())
            .collect();
        if words.is_empty() {
            return Ok(Vec::new());
        }

        let regex = compile_pattern(query)?;

        let mut candidates: Option<HashSet<PathBuf>> = None;
        {
            let indices = self.indices.read();
            for word in &words {
                let with_word: HashSet<PathBuf> = indices
                    .values()
                    .filter(|index| index.word_index.contains_key(word))
                    .map(|index| index.path.clone())
                    .collect();
                candidates = Some(match candidates.take() {
                    None => with_word,
                    Some(prev) => prev.intersection(&with_word).cloned().collect(),
                });
                if matches!(&candidates, Some(c) if c.is_empty()) {
                    return Ok(Vec::new());
                }
            }
        }

        let mut paths: Vec<PathBuf> = candidates
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.starts_with(root))
            .collect();
        paths.sort();

        let mut results = Vec::new();
        for path in paths {
            results.extend(self.search_file(&regex, &path, 0).await);
        }
        sort_and_truncate(&mut results, self.max_results);
        Ok(results)
    }

    pub fn index_stats(&self) -> IndexStats {
        let indices = self.indices.read();
        IndexStats {
            indexed_files: indices.len(),
            total_lines: indices.values().map(|i| i.line_count).sum(),
            total_words: indices.values().map(|i| i.word_index.len()).sum(),
            indexed_bytes: indices.values().map(|i| i.size).sum(),
        }
    }

    fn collect_candidates(&self, root: &Path, file_glob: &str) -> Result<Vec<PathBuf>> {
        if !root.exists() {
            return Err(CoreError::PathNotFound(root.to_path_buf()));
        }
        if root.is_file() {
            return Ok(vec![root.to_path_buf()]);
        }

        let matcher = Glob::new(file_glob)
            .map_err(|e| CoreError::Config(format!("invalid file glob {:?}: {}", file_glob, e)))?
            .compile_matcher();

        let mut candidates = Vec::new();
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if self.should_skip(rel) || !matcher.is_match(rel) {
                continue;
            }
            candidates.push(entry.path().to_path_buf());
            if candidates.len() >= MAX_CANDIDATE_FILES {
                warn!(limit = MAX_CANDIDATE_FILES, "candidate file cap reached");
                break;
            }
        }
        Ok(candidates)
    }

    /// A path is skipped when any of its components contains a configured
    /// skip pattern (VCS metadata, dependency directories, binary suffixes).
    fn should_skip(&self, rel_path: &Path) -> bool {
        rel_path.components().any(|component| {
            let name = component.as_os_str().to_string_lossy().to_lowercase();
            self.skip_patterns.iter().any(|p| name.contains(p.as_str()))
        })
    }

    async fn search_batch(
        &self,
        regex: Regex,
        files: Vec<PathBuf>,
        context_lines: usize,
    ) -> Vec<SearchResult> {
        let tasks = files.into_iter().map(|path| {
            let regex = regex.clone();
            async move { self.search_file(&regex, &path, context_lines).await }
        });
        join_all(tasks).await.into_iter().flatten().collect()
    }

    /// Strategy picked by size: small files are read whole, large files are
    /// scanned in bounded line windows. Errors degrade to no matches.
    async fn search_file(
        &self,
        regex: &Regex,
        path: &Path,
        context_lines: usize,
    ) -> Vec<SearchResult> {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return Vec::new();
        };
        if meta.len() > self.max_file_size {
            return Vec::new();
        }

        if meta.len() > LARGE_FILE_THRESHOLD {
            self.search_large_file(regex, path, context_lines).await
        } else {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let lines: Vec<String> = content.lines().map(str::to_string).collect();
                    find_matches(regex, path, &lines, context_lines, 0)
                }
                Err(_) => Vec::new(),
            }
        }
    }

    /// Scan in windows of `SCAN_WINDOW_LINES`, returning as soon as any
    /// window yields matches. Favors latency over completeness on very
    /// large files: matches past the first hit window are not reported.
    async fn search_large_file(
        &self,
        regex: &Regex,
        path: &Path,
        context_lines: usize,
    ) -> Vec<SearchResult> {
        use tokio::io::AsyncBufReadExt;

        let Ok(file) = tokio::fs::File::open(path).await else {
            return Vec::new();
        };
        let mut lines = tokio::io::BufReader::new(file).lines();

        let mut window: Vec<String> = Vec::with_capacity(SCAN_WINDOW_LINES);
        let mut line_offset = 0usize;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    window.push(line);
                    if window.len() == SCAN_WINDOW_LINES {
                        let hits = find_matches(regex, path, &window, context_lines, line_offset);
                        if !hits.is_empty() {
                            return hits;
                        }
                        line_offset += window.len();
                        window.clear();
                    }
                }
                Ok(None) => break,
                Err(_) => return Vec::new(),
            }
        }
        find_matches(regex, path, &window, context_lines, line_offset)
    }

    async fn index_file(&self, path: PathBuf) {
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            return;
        };
        let Ok(content) = tokio::fs::read_to_string(&path).await else {
            return;
        };

        let mut word_index: HashMap<String, HashSet<u32>> = HashMap::new();
        let mut line_count = 0usize;
        for (i, line) in content.lines().enumerate() {
            line_count += 1;
            for word in WORD_RE.find_iter(&line.to_lowercase()) {
                word_index
                    .entry(word.as_str().to_string())
                    .or_default()
                    .insert(i as u32 + 1);
            }
        }

        let index = FileIndex {
            path: path.clone(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            line_count,
            word_index,
            last_indexed: SystemTime::now(),
        };
        self.indices.write().insert(path, index);
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex> {
    Ok(RegexBuilder::new(pattern).case_insensitive(true).build()?)
}

fn sort_and_truncate(results: &mut Vec<SearchResult>, max_results: usize) {
    results.sort_by(|a, b| {
        (&a.file_path, a.line_number, a.match_start).cmp(&(
            &b.file_path,
            b.line_number,
            b.match_start,
        ))
    });
    results.truncate(max_results);
}

/// Every non-overlapping match in every line yields a distinct result.
/// Context lines are attached verbatim, clipped at the window boundaries.
fn find_matches(
    regex: &Regex,
    path: &Path,
    lines: &[String],
    context_lines: usize,
    line_offset: usize,
) -> Vec<SearchResult> {
    let mut results = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let matches: Vec<(usize, usize)> = regex
            .find_iter(line)
            .map(|m| (m.start(), m.end()))
            .collect();
        if matches.is_empty() {
            continue;
        }

        let (context_before, context_after) = if context_lines > 0 {
            let start = i.saturating_sub(context_lines);
            let end = (i + context_lines + 1).min(lines.len());
            let before = (start < i).then(|| lines[start..i].join("\n"));
            let after = (end > i + 1).then(|| lines[i + 1..end].join("\n"));
            (before, after)
        } else {
            (None, None)
        };

        for (match_start, match_end) in matches {
            results.push(SearchResult {
                file_path: path.to_path_buf(),
                line_number: i + 1 + line_offset,
                line_content: line.clone(),
                match_start,
                match_end,
                context_before: context_before.clone(),
                context_after: context_after.clone(),
            });
        }
    }
    results
}
