//! Indexer (C5): turns a project root into a populated `VectorStore` entry
//! per file, incrementally (§4.5).
//!
//! The delta/backoff/progress shape is grounded in the pack's async indexing
//! pipelines (an embedding indexer built on `tokio::sync::Semaphore` plus
//! `CancellationToken`-aware batch loops), adapted onto this crate's own
//! `Chunker`/`VectorStore`/`RateLimiter` rather than their storage layer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::{chunk_file_autodetect_symbols, detect_language, ChunkerConfig};
use crate::config::IndexerConfig;
use crate::embedding::{EmbeddingProvider, EmbeddingRequest};
use crate::error::{Error, Result};
use crate::rate_limiter::RateLimiter;
use crate::scanner::{scan_workspace, ScanOptions};
use crate::types::{content_hash, Chunk, EmbeddedChunk};
use crate::vector_store::VectorStore;

/// Per-file state machine (§4.5): `Discovered -> Chunked -> UpToDate` or
/// `Discovered -> Chunked -> Embedding -> {Stored | Partial}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Discovered,
    Chunked,
    UpToDate,
    Embedding,
    Stored,
    Partial,
}

#[derive(Debug, Clone)]
pub struct FileProgress {
    pub path: String,
    pub state: FileState,
    pub chunks_total: usize,
    pub chunks_embedded: usize,
}

/// Callback invoked after each file's state settles, marshaled per-project
/// (§4.5: "the progress callback is invoked on the caller's project-scoped
/// sequence, never concurrently for the same project").
pub type ProgressCallback = Arc<dyn Fn(FileProgress) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct IndexSummary {
    pub files_scanned: usize,
    pub files_up_to_date: usize,
    pub files_embedded: usize,
    pub files_partial: usize,
    pub files_deleted: usize,
    pub chunks_stored: u64,
}

pub struct Indexer {
    store: Arc<VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    limiter: Arc<RateLimiter>,
    chunker_config: ChunkerConfig,
    indexer_config: IndexerConfig,
}

impl Indexer {
    pub fn new(
        store: Arc<VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        limiter: Arc<RateLimiter>,
        chunker_config: ChunkerConfig,
        indexer_config: IndexerConfig,
    ) -> Self {
        Self {
            store,
            provider,
            limiter,
            chunker_config,
            indexer_config,
        }
    }

    /// Indexes every scanned file under `repo_root` (§4.5 full pipeline).
    pub async fn index_project(
        &self,
        project_id: &str,
        repo_root: &Path,
        scan: &ScanOptions,
        cancel: &CancellationToken,
        on_progress: Option<ProgressCallback>,
    ) -> Result<IndexSummary> {
        let entries = scan_workspace(scan).map_err(|e| Error::Internal(e.to_string()))?;
        let mut summary = IndexSummary {
            files_scanned: entries.len(),
            ..Default::default()
        };

        for entry in &entries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let rel_path = entry.rel_path.to_string_lossy().replace('\\', "/");
            let (outcome, deleted_stale) = self
                .index_file_inner(project_id, repo_root, &rel_path, cancel, on_progress.clone())
                .await?;

            match outcome {
                FileState::UpToDate => summary.files_up_to_date += 1,
                FileState::Stored => summary.files_embedded += 1,
                FileState::Partial => summary.files_partial += 1,
                _ => {}
            }
            if deleted_stale {
                summary.files_deleted += 1;
            }
        }

        summary.chunks_stored = self.store.get_stats(project_id).await?.total_chunks;
        info!(project_id, scanned = summary.files_scanned, embedded = summary.files_embedded, "index_project complete");
        Ok(summary)
    }

    /// Re-indexes a single project-relative file (§4.5 steps 1-5), used by
    /// `index_project` and directly by the `index_project` tool for
    /// single-file refresh.
    pub async fn index_file(
        &self,
        project_id: &str,
        repo_root: &Path,
        rel_path: &str,
        cancel: &CancellationToken,
        on_progress: Option<ProgressCallback>,
    ) -> Result<FileState> {
        self.index_file_inner(project_id, repo_root, rel_path, cancel, on_progress)
            .await
            .map(|(state, _deleted_stale)| state)
    }

    /// Same as [`Indexer::index_file`] but also reports whether this file's
    /// delta reconciliation (§4.5 step 3) pruned any stale chunk ids, so
    /// `index_project` can roll that up into `IndexSummary.files_deleted`.
    async fn index_file_inner(
        &self,
        project_id: &str,
        repo_root: &Path,
        rel_path: &str,
        cancel: &CancellationToken,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(FileState, bool)> {
        let emit = |state: FileState, total: usize, embedded: usize| {
            if let Some(cb) = &on_progress {
                cb(FileProgress {
                    path: rel_path.to_string(),
                    state,
                    chunks_total: total,
                    chunks_embedded: embedded,
                });
            }
        };
        emit(FileState::Discovered, 0, 0);

        let abs_path = repo_root.join(rel_path);
        let content = match std::fs::read_to_string(&abs_path) {
            Ok(c) => c,
            Err(_) => {
                // Binary or unreadable file: treated as an empty chunk set,
                // matching §4.5 step 1's "non-UTF8 files are skipped".
                debug!(rel_path, "skipping non-utf8 or unreadable file");
                return Ok((FileState::UpToDate, false));
            }
        };

        let chunks = chunk_file_autodetect_symbols(project_id, rel_path, &content, &self.chunker_config);
        emit(FileState::Chunked, chunks.len(), 0);

        if chunks.is_empty() {
            let had_stored = !self.store.get_file_hashes(project_id, rel_path).await?.is_empty();
            if had_stored {
                self.store.delete(project_id, rel_path).await?;
            }
            emit(FileState::UpToDate, 0, 0);
            return Ok((FileState::UpToDate, had_stored));
        }

        // Delta per §4.5 step 3: a chunk whose id is already stored with a
        // matching content hash keeps its existing embedding; everything
        // else (new id, or an id whose content changed) is re-embedded.
        let previously_stored = self.store.list_chunks(project_id, rel_path).await?;
        let mut previously_stored_by_id: std::collections::HashMap<String, EmbeddedChunk> =
            previously_stored.into_iter().map(|ec| (ec.chunk.id.clone(), ec)).collect();

        let mut to_embed: Vec<Chunk> = Vec::new();
        let mut unchanged: Vec<EmbeddedChunk> = Vec::new();
        for chunk in &chunks {
            match previously_stored_by_id.remove(&chunk.id) {
                Some(existing) if existing.chunk.content_hash == chunk.content_hash => unchanged.push(existing),
                _ => to_embed.push(chunk.clone()),
            }
        }

        let deleted_stale = !previously_stored_by_id.is_empty();

        if to_embed.is_empty() {
            // Nothing new to embed; stale ids (renamed/removed symbols) may
            // still need pruning below.
            if !deleted_stale {
                emit(FileState::UpToDate, chunks.len(), chunks.len());
                return Ok((FileState::UpToDate, false));
            }
        }

        self.store.delete(project_id, rel_path).await?;
        if !unchanged.is_empty() {
            self.store.store_batch(project_id, &unchanged).await?;
        }

        if to_embed.is_empty() {
            emit(FileState::UpToDate, chunks.len(), chunks.len());
            return Ok((FileState::UpToDate, deleted_stale));
        }

        emit(FileState::Embedding, chunks.len(), unchanged.len());

        let total_chunks = chunks.len();
        let batch_size = self.indexer_config.embed_batch_size.max(1);
        let max_tokens_per_call = self.provider.model_info().max_tokens_per_call as u64;
        let batches = partition_into_batches(&to_embed, batch_size, max_tokens_per_call);
        let mut embedded_chunks: Vec<EmbeddedChunk> = Vec::with_capacity(to_embed.len());
        let mut any_failed = false;

        for batch in batches {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let _permit = self.limiter.acquire(cancel).await?;
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();

            match self.embed_with_retry(texts, cancel).await {
                Ok(vectors) => {
                    let now = chrono::Utc::now();
                    for (chunk, vector) in batch.iter().zip(vectors.into_iter()) {
                        embedded_chunks.push(EmbeddedChunk {
                            chunk: chunk.clone(),
                            embedding: vector,
                            created_at: now,
                            updated_at: now,
                        });
                    }
                    emit(FileState::Embedding, total_chunks, unchanged.len() + embedded_chunks.len());
                }
                Err(e) => {
                    warn!(rel_path, error = %e, "batch embedding failed after retries, marking file partial");
                    any_failed = true;
                }
            }
        }

        if !embedded_chunks.is_empty() {
            self.store.store_batch(project_id, &embedded_chunks).await?;
        }

        let final_state = if any_failed { FileState::Partial } else { FileState::Stored };
        emit(final_state, total_chunks, unchanged.len() + embedded_chunks.len());
        Ok((final_state, deleted_stale))
    }

    /// Removes a project-relative file from the index (used when the
    /// scanner no longer reports it, e.g. deletion between runs).
    pub async fn remove_file(&self, project_id: &str, rel_path: &str) -> Result<()> {
        self.store.delete(project_id, rel_path).await
    }

    /// Exponential backoff with jitter around a single batch embedding call
    /// (§4.5 failure handling: base 500ms, factor 2, max 3 attempts, ±20%
    /// jitter). Only `Upstream` (transient) errors are retried.
    async fn embed_with_retry(&self, texts: Vec<String>, cancel: &CancellationToken) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let req = EmbeddingRequest { texts: texts.clone(), model: None };
            match self.provider.generate_embeddings(req).await {
                Ok(resp) => return Ok(resp.vectors),
                Err(e) if e.is_transient() && attempt < self.indexer_config.retry_max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, ?delay, error = %e, "retrying embedding batch");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.indexer_config.retry_base_delay_ms as f64;
        let factor = self.indexer_config.retry_factor;
        let nominal = base * factor.powi(attempt as i32 - 1);
        let jitter = self.indexer_config.retry_jitter;
        let mut rng = rand::thread_rng();
        let spread: f64 = rng.gen_range(-jitter..=jitter);
        let ms = (nominal * (1.0 + spread)).max(0.0);
        Duration::from_millis(ms as u64)
    }
}

/// Splits `chunks` into batches bounded by both `batch_size` (a count) and
/// `max_tokens_per_call` (the provider's per-call token ceiling, §4.5 step
/// 4): a batch accrues chunks until either bound would be exceeded, always
/// taking at least one chunk per batch so a single oversized chunk still
/// makes forward progress.
fn partition_into_batches<'a>(chunks: &'a [Chunk], batch_size: usize, max_tokens_per_call: u64) -> Vec<&'a [Chunk]> {
    let mut batches = Vec::new();
    let mut start = 0usize;
    while start < chunks.len() {
        let mut end = start;
        let mut token_sum = 0u64;
        while end < chunks.len() {
            let next_tokens = chunks[end].token_count as u64;
            let over_count = end - start >= batch_size;
            let over_tokens = end > start && token_sum + next_tokens > max_tokens_per_call;
            if over_count || over_tokens {
                break;
            }
            token_sum += next_tokens;
            end += 1;
        }
        if end == start {
            end = start + 1;
        }
        batches.push(&chunks[start..end]);
        start = end;
    }
    batches
}

/// Re-derives the language table entry for `path`, exposed for callers
/// (e.g. the CLI) that report per-file language without chunking.
pub fn language_for(path: &str) -> String {
    detect_language(path)
}

pub fn file_content_hash(content: &str) -> String {
    content_hash(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn index_file_skips_unreadable_binary_gracefully() {
        let store = Arc::new(VectorStore::open_in_memory().await.unwrap());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(crate::embedding::LocalHashEmbeddingProvider::new(16));
        let limiter = Arc::new(RateLimiter::new(100.0, 100.0, 4));
        let indexer = Indexer::new(store, provider, limiter, ChunkerConfig::default(), IndexerConfig::default());

        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let state = indexer
            .index_file("p1", dir.path(), "does-not-exist.bin", &cancel, None)
            .await
            .unwrap();
        assert_eq!(state, FileState::UpToDate);
    }

    #[tokio::test]
    async fn index_file_embeds_and_is_idempotent() {
        let store = Arc::new(VectorStore::open_in_memory().await.unwrap());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(crate::embedding::LocalHashEmbeddingProvider::new(16));
        let limiter = Arc::new(RateLimiter::new(100.0, 100.0, 4));
        let indexer = Indexer::new(store.clone(), provider, limiter, ChunkerConfig::default(), IndexerConfig::default());

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}\nfn b() {}\n").unwrap();
        let cancel = CancellationToken::new();

        let first = indexer.index_file("p1", dir.path(), "a.rs", &cancel, None).await.unwrap();
        assert_eq!(first, FileState::Stored);
        let stats_after_first = store.get_stats("p1").await.unwrap();
        assert!(stats_after_first.total_chunks > 0);

        let second = indexer.index_file("p1", dir.path(), "a.rs", &cancel, None).await.unwrap();
        assert_eq!(second, FileState::UpToDate);
        let stats_after_second = store.get_stats("p1").await.unwrap();
        assert_eq!(stats_after_first.total_chunks, stats_after_second.total_chunks);
    }

    #[tokio::test]
    async fn index_file_reindexes_on_content_change() {
        let store = Arc::new(VectorStore::open_in_memory().await.unwrap());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(crate::embedding::LocalHashEmbeddingProvider::new(16));
        let limiter = Arc::new(RateLimiter::new(100.0, 100.0, 4));
        let indexer = Indexer::new(store.clone(), provider, limiter, ChunkerConfig::default(), IndexerConfig::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        std::fs::write(&path, "fn a() {}\n").unwrap();
        let cancel = CancellationToken::new();
        indexer.index_file("p1", dir.path(), "a.rs", &cancel, None).await.unwrap();

        std::fs::write(&path, "fn a_renamed() {}\n").unwrap();
        let state = indexer.index_file("p1", dir.path(), "a.rs", &cancel, None).await.unwrap();
        assert_eq!(state, FileState::Stored);

        let chunks = store.list_chunks("p1", "a.rs").await.unwrap();
        assert!(chunks.iter().any(|c| c.chunk.content.contains("a_renamed")));
    }
}
