use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::CoreConfig;

/// Number of items processed up front when measuring throughput for
/// adaptive batch sizing.
const ADAPTIVE_SAMPLE_SIZE: usize = 10;
/// Slowest pacing `process_with_rate_limit` will use; zero, negative, and
/// NaN rates degrade to this instead of overflowing the interval.
const MAX_DISPATCH_INTERVAL: Duration = Duration::from_secs(60);

/// A captured per-item failure: the last error after all attempts were
/// exhausted, plus how many attempts were made.
#[derive(Debug)]
pub struct TaskFailure {
    pub attempts: u32,
    pub error: anyhow::Error,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed after {} attempts: {}", self.attempts, self.error)
    }
}

/// One tagged result per submitted item, in submission order. Keeping
/// successes and failures in a single ordered sequence preserves the
/// item-to-outcome correspondence that separate lists would lose.
pub type TaskOutcome<R> = std::result::Result<R, TaskFailure>;

/// Outcome of one batch run.
#[derive(Debug)]
pub struct BatchResult<R> {
    pub success_count: usize,
    pub error_count: usize,
    pub outcomes: Vec<TaskOutcome<R>>,
    pub duration: Duration,
}

impl<R> BatchResult<R> {
    fn empty() -> Self {
        Self {
            success_count: 0,
            error_count: 0,
            outcomes: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    fn from_outcomes(outcomes: Vec<TaskOutcome<R>>, duration: Duration) -> Self {
        let success_count = outcomes.iter().filter(|o| o.is_ok()).count();
        let error_count = outcomes.len() - success_count;
        Self {
            success_count,
            error_count,
            outcomes,
            duration,
        }
    }

    /// Successful results, in submission order.
    pub fn results(&self) -> impl Iterator<Item = &R> {
        self.outcomes.iter().filter_map(|o| o.as_ref().ok())
    }

    /// Captured failures, in submission order.
    pub fn failures(&self) -> impl Iterator<Item = &TaskFailure> {
        self.outcomes.iter().filter_map(|o| o.as_ref().err())
    }

    pub fn into_results(self) -> Vec<R> {
        self.outcomes.into_iter().filter_map(|o| o.ok()).collect()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn merge(mut self, other: Self) -> Self {
        self.success_count += other.success_count;
        self.error_count += other.error_count;
        self.outcomes.extend(other.outcomes);
        self.duration += other.duration;
        self
    }
}

/// Rolling aggregate over every batch an executor has run. Never reset
/// except by an explicit `reset_stats` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub total_processed: usize,
    pub total_errors: usize,
    /// Duration-weighted running average across batches.
    pub average_duration: Duration,
    /// Items per second of the most recent batch only.
    pub throughput_per_second: f64,
}

/// Runs a caller-supplied async processor over a list of items while
/// keeping at most `max_concurrent` invocations in flight. An item holds
/// its concurrency permit for its entire retry lifetime.
pub struct BatchExecutor {
    max_concurrent: usize,
    max_retries: u32,
    base_delay: Duration,
    max_file_size: u64,
    semaphore: Arc<Semaphore>,
    stats: Mutex<BatchStats>,
}

impl BatchExecutor {
    pub fn new(config: &CoreConfig) -> Self {
        Self::with_limits(
            config.max_concurrent,
            config.max_retries,
            config.retry_base_delay(),
        )
        .file_size_ceiling(config.max_file_size)
    }

    pub fn with_limits(max_concurrent: usize, max_retries: u32, base_delay: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            max_concurrent,
            max_retries,
            base_delay,
            max_file_size: 10_000_000,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            stats: Mutex::new(BatchStats::default()),
        }
    }

    pub fn file_size_ceiling(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Process `items` in chunks of `batch_size` (defaults to the
    /// concurrency limit). Each chunk is dispatched fully concurrently and
    /// awaited before the next chunk starts. A failing item is captured as
    /// a tagged outcome and never cancels its siblings.
    pub async fn process_batch<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
        batch_size: Option<usize>,
    ) -> BatchResult<R>
    where
        T: Clone,
        F: Fn(T) -> Fut + Clone,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        if items.is_empty() {
            return BatchResult::empty();
        }

        let started = Instant::now();
        let batch_size = batch_size.unwrap_or(self.max_concurrent).max(1);
        let total = items.len();

        let mut outcomes = Vec::with_capacity(total);
        for chunk in chunked(items, batch_size) {
            let chunk_outcomes = self.run_chunk(chunk, processor.clone()).await;
            outcomes.extend(chunk_outcomes);
        }

        let duration = started.elapsed();
        let result = BatchResult::from_outcomes(outcomes, duration);
        self.record_batch(total, result.error_count, duration);
        result
    }

    /// Like `process_batch`, but invokes `progress(processed_so_far, total)`
    /// after every completed item, in processing order.
    pub async fn process_with_progress<T, R, F, Fut, P>(
        &self,
        items: Vec<T>,
        processor: F,
        mut progress: P,
        batch_size: Option<usize>,
    ) -> BatchResult<R>
    where
        T: Clone,
        F: Fn(T) -> Fut + Clone,
        Fut: Future<Output = anyhow::Result<R>>,
        P: FnMut(usize, usize),
    {
        if items.is_empty() {
            return BatchResult::empty();
        }

        let started = Instant::now();
        let batch_size = batch_size.unwrap_or(self.max_concurrent).max(1);
        let total = items.len();

        let mut outcomes = Vec::with_capacity(total);
        for chunk in chunked(items, batch_size) {
            let chunk_outcomes = self.run_chunk(chunk, processor.clone()).await;
            for outcome in chunk_outcomes {
                outcomes.push(outcome);
                progress(outcomes.len(), total);
            }
        }

        let duration = started.elapsed();
        let result = BatchResult::from_outcomes(outcomes, duration);
        self.record_batch(total, result.error_count, duration);
        result
    }

    /// Serial, permit-protected dispatch paced so consecutive dispatch
    /// timestamps are never closer than `1 / max_per_second`. A task that
    /// finishes early does not let the next one start early. Rates without
    /// a finite positive interval are paced at `MAX_DISPATCH_INTERVAL`.
    pub async fn process_with_rate_limit<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
        max_per_second: f64,
    ) -> BatchResult<R>
    where
        T: Clone,
        F: Fn(T) -> Fut + Clone,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        if items.is_empty() {
            return BatchResult::empty();
        }

        let started = Instant::now();
        let interval = Duration::try_from_secs_f64(1.0 / max_per_second)
            .unwrap_or(MAX_DISPATCH_INTERVAL)
            .min(MAX_DISPATCH_INTERVAL);
        let total = items.len();

        let mut outcomes = Vec::with_capacity(total);
        let mut next_dispatch = Instant::now();
        for item in items {
            let now = Instant::now();
            if now < next_dispatch {
                tokio::time::sleep(next_dispatch - now).await;
            }
            next_dispatch = Instant::now() + interval;
            outcomes.push(self.run_one(item, processor.clone()).await);
        }

        let duration = started.elapsed();
        let result = BatchResult::from_outcomes(outcomes, duration);
        self.record_batch(total, result.error_count, duration);
        result
    }

    /// Measure throughput on a small warm-up sample, derive a batch size
    /// targeting `target_duration` per chunk, then process the remainder
    /// with it. Outcomes preserve sample-then-remainder order.
    pub async fn adaptive_batch_size<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
        target_duration: Duration,
    ) -> BatchResult<R>
    where
        T: Clone,
        F: Fn(T) -> Fut + Clone,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        if items.is_empty() {
            return BatchResult::empty();
        }

        let total = items.len();
        let sample_size = total.min(ADAPTIVE_SAMPLE_SIZE);
        let mut sample = items;
        let remainder = sample.split_off(sample_size);

        let sample_started = Instant::now();
        let sample_result = self
            .process_batch(sample, processor.clone(), Some(sample_size))
            .await;
        let sample_elapsed = sample_started.elapsed().max(Duration::from_millis(1));

        if remainder.is_empty() {
            return sample_result;
        }

        let throughput = sample_size as f64 / sample_elapsed.as_secs_f64();
        let upper = (self.max_concurrent * 2).min(total).max(1);
        let optimal = ((throughput * target_duration.as_secs_f64()) as usize).clamp(1, upper);
        debug!(throughput, optimal, "derived adaptive batch size");

        let remainder_result = self
            .process_batch(remainder, processor, Some(optimal))
            .await;
        sample_result.merge(remainder_result)
    }

    /// Yield successful results chunk-by-chunk instead of materializing the
    /// whole batch, for memory-bounded consumption by the caller.
    pub fn process_stream<'a, T, R, F, Fut>(
        &'a self,
        items: Vec<T>,
        processor: F,
        chunk_size: usize,
    ) -> impl Stream<Item = R> + 'a
    where
        T: Clone + 'a,
        R: 'a,
        F: Fn(T) -> Fut + Clone + 'a,
        Fut: Future<Output = anyhow::Result<R>> + 'a,
    {
        let chunks: VecDeque<Vec<T>> = chunked(items, chunk_size.max(1)).into();
        let ready: VecDeque<R> = VecDeque::new();

        futures::stream::unfold((chunks, ready), move |(mut chunks, mut ready)| {
            let processor = processor.clone();
            async move {
                loop {
                    if let Some(result) = ready.pop_front() {
                        return Some((result, (chunks, ready)));
                    }
                    let chunk = chunks.pop_front()?;
                    let batch = self.process_batch(chunk, processor.clone(), None).await;
                    ready = batch.into_results().into();
                }
            }
        })
    }

    /// File-oriented batch processing: paths that do not exist, are not
    /// regular files, or exceed the size ceiling are filtered out before
    /// any processing starts.
    pub async fn process_file_batch<R, F, Fut>(
        &self,
        paths: Vec<PathBuf>,
        processor: F,
        max_file_size: Option<u64>,
    ) -> BatchResult<R>
    where
        F: Fn(PathBuf) -> Fut + Clone,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let ceiling = max_file_size.unwrap_or(self.max_file_size);

        let mut valid = Vec::with_capacity(paths.len());
        for path in paths {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() && meta.len() <= ceiling => valid.push(path),
                Ok(_) => debug!(path = %path.display(), "skipping oversized or non-file path"),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable path"),
            }
        }

        self.process_batch(valid, processor, None).await
    }

    pub fn stats(&self) -> BatchStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = BatchStats::default();
    }

    async fn run_chunk<T, R, F, Fut>(&self, chunk: Vec<T>, processor: F) -> Vec<TaskOutcome<R>>
    where
        T: Clone,
        F: Fn(T) -> Fut + Clone,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let tasks = chunk
            .into_iter()
            .map(|item| self.run_one(item, processor.clone()));
        join_all(tasks).await
    }

    /// Run a single item under one concurrency permit, retrying with
    /// exponential backoff. The permit is held across all attempts.
    async fn run_one<T, R, F, Fut>(&self, item: T, processor: F) -> TaskOutcome<R>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return Err(TaskFailure {
                    attempts: 0,
                    error: anyhow::Error::new(e),
                })
            }
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match processor(item.clone()).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt > self.max_retries {
                        warn!(attempts = attempt, error = %error, "task exhausted retries");
                        return Err(TaskFailure {
                            attempts: attempt,
                            error,
                        });
                    }
                    let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "task failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn record_batch(&self, processed: usize, errors: usize, duration: Duration) {
        let mut stats = self.stats.lock();
        let total_before = stats.total_processed;

        stats.total_processed += processed;
        stats.total_errors += errors;

        if total_before > 0 {
            let weight = total_before as f64 / (total_before + processed) as f64;
            let blended = stats.average_duration.as_secs_f64() * weight
                + duration.as_secs_f64() * (1.0 - weight);
            stats.average_duration = Duration::from_secs_f64(blended);
        } else {
            stats.average_duration = duration;
        }

        if duration > Duration::ZERO {
            stats.throughput_per_second = processed as f64 / duration.as_secs_f64();
        }
    }
}

fn chunked<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter();
    loop {
        let chunk: Vec<T> = iter.by_ref().take(size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }
    chunks
}
