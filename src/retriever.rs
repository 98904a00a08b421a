//! Retriever (C6): semantic/keyword/hybrid search, similarity lookup, and
//! context-window assembly over a `VectorStore` (§4.6).

use std::sync::Arc;

use crate::embedding::{EmbeddingProvider, EmbeddingRequest};
use crate::error::{Error, Result};
use crate::types::{ProjectStats, ScoredChunk};
use crate::vector_store::VectorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Semantic,
    Keyword,
    Hybrid,
}

impl std::str::FromStr for SearchMode {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(Error::Validation(format!("unknown search mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub top_k: usize,
    pub min_score: f32,
}

pub struct Retriever {
    store: Arc<VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    semantic_weight: f32,
    keyword_weight: f32,
}

impl Retriever {
    pub fn new(
        store: Arc<VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        semantic_weight: f32,
        keyword_weight: f32,
    ) -> Self {
        Self {
            store,
            provider,
            semantic_weight,
            keyword_weight,
        }
    }

    async fn require_indexed(&self, project_id: &str) -> Result<()> {
        let stats = self.store.get_stats(project_id).await?;
        if stats.total_chunks == 0 {
            return Err(Error::NotIndexed(project_id.to_string()));
        }
        Ok(())
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let resp = self
            .provider
            .generate_embeddings(EmbeddingRequest {
                texts: vec![query.to_string()],
                model: None,
            })
            .await?;
        Ok(resp.vectors.into_iter().next().unwrap_or_default())
    }

    /// Dispatches to semantic, keyword, or weighted hybrid ranking per
    /// `opts.mode` (§4.6 `Search`).
    pub async fn search(&self, project_id: &str, query: &str, opts: &SearchOptions) -> Result<Vec<ScoredChunk>> {
        if query.trim().is_empty() {
            return Err(Error::Validation("query must not be empty".into()));
        }
        self.require_indexed(project_id).await?;

        match opts.mode {
            SearchMode::Semantic => self.semantic_search(project_id, query, opts.top_k, opts.min_score).await,
            SearchMode::Keyword => self.keyword_search(project_id, query, opts.top_k, opts.min_score).await,
            SearchMode::Hybrid => self.hybrid_search(project_id, query, opts.top_k, opts.min_score).await,
        }
    }

    async fn semantic_search(&self, project_id: &str, query: &str, top_k: usize, min_score: f32) -> Result<Vec<ScoredChunk>> {
        let embedding = self.embed_query(query).await?;
        self.store.search(project_id, &embedding, top_k, min_score).await
    }

    /// Substring/BM25-like keyword scoring: fraction of distinct lowercase
    /// query terms present in the chunk, weighted by occurrence count
    /// (§4.6 supplement — the distilled spec left the exact keyword formula
    /// unspecified; this keeps it simple and monotonic in term coverage).
    async fn keyword_search(&self, project_id: &str, query: &str, top_k: usize, min_score: f32) -> Result<Vec<ScoredChunk>> {
        let all = self.store.list_project_chunks(project_id).await?;

        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        if terms.is_empty() {
            return Ok(vec![]);
        }

        let mut scored: Vec<ScoredChunk> = all
            .into_iter()
            .map(|ec| {
                let haystack = format!(
                    "{} {} {}",
                    ec.chunk.content.to_lowercase(),
                    ec.chunk.symbol_name.as_deref().unwrap_or("").to_lowercase(),
                    ec.chunk.path.to_lowercase(),
                );
                let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                let score = matched as f32 / terms.len() as f32;
                ScoredChunk { chunk: ec.chunk, score }
            })
            .filter(|sc| sc.score >= min_score)
            .collect();

        sort_scored(&mut scored);
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Weighted combination of semantic and keyword scores (§4.6, §9 open
    /// question 3 resolved to fixed 0.6/0.4 weights).
    async fn hybrid_search(&self, project_id: &str, query: &str, top_k: usize, min_score: f32) -> Result<Vec<ScoredChunk>> {
        let mut semantic = self.semantic_search(project_id, query, usize::MAX, -1.0).await?;
        let mut keyword = self.keyword_search(project_id, query, usize::MAX, -1.0).await?;

        normalize_scores(&mut semantic);
        normalize_scores(&mut keyword);

        let mut keyword_by_id: std::collections::HashMap<String, f32> = std::collections::HashMap::new();
        for sc in &keyword {
            keyword_by_id.insert(sc.chunk.id.clone(), sc.score);
        }

        let mut combined: Vec<ScoredChunk> = semantic
            .into_iter()
            .map(|mut sc| {
                let kw = keyword_by_id.get(&sc.chunk.id).copied().unwrap_or(0.0);
                sc.score = self.semantic_weight * sc.score + self.keyword_weight * kw;
                sc
            })
            .filter(|sc| sc.score >= min_score)
            .collect();

        sort_scored(&mut combined);
        combined.truncate(top_k);
        Ok(combined)
    }

    /// Finds chunks similar to a file/line range (§4.6 `FindSimilar`):
    /// fetches every chunk intersecting `[start_line, end_line]`, averages
    /// their embeddings component-wise, and semantic-searches using that
    /// vector, optionally excluding the source chunks themselves.
    pub async fn find_similar(
        &self,
        project_id: &str,
        file_path: &str,
        start_line: u32,
        end_line: u32,
        top_k: usize,
        min_score: f32,
        exclude_self: bool,
    ) -> Result<Vec<ScoredChunk>> {
        self.require_indexed(project_id).await?;
        let chunks = self.store.list_chunks(project_id, file_path).await?;
        let source: Vec<_> = chunks
            .into_iter()
            .filter(|c| c.chunk.start_line <= end_line && start_line <= c.chunk.end_line)
            .collect();
        if source.is_empty() {
            return Err(Error::NotFound(format!(
                "no indexed chunk intersects {file_path}:{start_line}-{end_line}"
            )));
        }

        let dim = source[0].embedding.len();
        let mut avg = vec![0f32; dim];
        for c in &source {
            for (i, v) in c.embedding.iter().enumerate() {
                avg[i] += v;
            }
        }
        let n = source.len() as f32;
        for v in &mut avg {
            *v /= n;
        }

        let source_ids: std::collections::HashSet<String> = source.into_iter().map(|c| c.chunk.id).collect();
        let fetch_k = if exclude_self { top_k + source_ids.len() } else { top_k };
        let mut results = self.store.search(project_id, &avg, fetch_k, min_score).await?;
        if exclude_self {
            results.retain(|sc| !source_ids.contains(&sc.chunk.id));
        }
        results.truncate(top_k);
        Ok(results)
    }

    /// Greedy budget-fit context assembly (§4.6 `RetrieveContext`): runs a
    /// semantic search with a fixed `topK=50` candidate pool, then packs
    /// chunks into `max_tokens` greedily by descending score before
    /// re-sorting the selection into file-then-startLine order for
    /// presentation.
    pub async fn retrieve_context(&self, project_id: &str, query: &str, max_tokens: u32) -> Result<Vec<ScoredChunk>> {
        self.require_indexed(project_id).await?;
        const CANDIDATE_POOL: usize = 50;
        let embedding = self.embed_query(query).await?;
        let candidates = self.store.search(project_id, &embedding, CANDIDATE_POOL, 0.0).await?;

        let mut budget_used = 0u32;
        let mut selected = Vec::new();
        for sc in candidates {
            if budget_used + sc.chunk.token_count > max_tokens {
                continue;
            }
            budget_used += sc.chunk.token_count;
            selected.push(sc);
            if budget_used >= max_tokens {
                break;
            }
        }

        selected.sort_by(|a, b| a.chunk.path.cmp(&b.chunk.path).then(a.chunk.start_line.cmp(&b.chunk.start_line)));
        Ok(selected)
    }

    pub async fn get_stats(&self, project_id: &str) -> Result<ProjectStats> {
        self.store.get_stats(project_id).await
    }
}

/// Divides every score in `scored` by the list's own maximum (§4.6 hybrid
/// normalization step), so semantic cosine scores and keyword coverage
/// fractions land on comparable `[0,1]` scales before being combined.
/// A zero (or empty) max leaves the list untouched.
fn normalize_scores(scored: &mut [ScoredChunk]) {
    let max = scored.iter().map(|sc| sc.score).fold(0.0f32, f32::max);
    if max <= 0.0 {
        return;
    }
    for sc in scored.iter_mut() {
        sc.score /= max;
    }
}

fn sort_scored(scored: &mut [ScoredChunk]) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.path.cmp(&b.chunk.path))
            .then_with(|| a.chunk.start_line.cmp(&b.chunk.start_line))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::LocalHashEmbeddingProvider;
    use crate::types::{Chunk, ChunkType, EmbeddedChunk};
    use chrono::Utc;

    async fn seeded_store_and_provider() -> (Arc<VectorStore>, Arc<dyn EmbeddingProvider>) {
        let store = Arc::new(VectorStore::open_in_memory().await.unwrap());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(LocalHashEmbeddingProvider::new(32));

        let samples = [
            ("a.rs", "fn add(a: i32, b: i32) -> i32 { a + b }"),
            ("b.rs", "fn subtract(a: i32, b: i32) -> i32 { a - b }"),
            ("c.rs", "struct Widget { name: String }"),
        ];

        let mut embedded = Vec::new();
        for (path, content) in samples {
            let resp = provider
                .generate_embeddings(EmbeddingRequest { texts: vec![content.to_string()], model: None })
                .await
                .unwrap();
            let chunk = Chunk::new("p1", path, content, 1, 1, ChunkType::Function, None, None, "rust");
            let now = Utc::now();
            embedded.push(EmbeddedChunk {
                chunk,
                embedding: resp.vectors[0].clone(),
                created_at: now,
                updated_at: now,
            });
        }
        store.store_batch("p1", &embedded).await.unwrap();
        (store, provider)
    }

    #[tokio::test]
    async fn search_on_unindexed_project_is_not_indexed() {
        let (store, provider) = seeded_store_and_provider().await;
        let retriever = Retriever::new(store, provider, 0.6, 0.4);
        let err = retriever
            .search("nonexistent", "add", &SearchOptions { mode: SearchMode::Semantic, top_k: 5, min_score: 0.0 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotIndexed);
    }

    #[tokio::test]
    async fn keyword_search_finds_exact_term() {
        let (store, provider) = seeded_store_and_provider().await;
        let retriever = Retriever::new(store, provider, 0.6, 0.4);
        let results = retriever
            .search("p1", "subtract", &SearchOptions { mode: SearchMode::Keyword, top_k: 5, min_score: 0.01 })
            .await
            .unwrap();
        assert!(results.iter().any(|r| r.chunk.path == "b.rs"));
    }

    #[tokio::test]
    async fn find_similar_excludes_source_chunk() {
        let (store, provider) = seeded_store_and_provider().await;
        let source = store.list_chunks("p1", "a.rs").await.unwrap()[0].clone();
        let retriever = Retriever::new(store, provider, 0.6, 0.4);
        let results = retriever
            .find_similar("p1", "a.rs", source.chunk.start_line, source.chunk.end_line, 10, -1.0, true)
            .await
            .unwrap();
        assert!(results.iter().all(|r| r.chunk.id != source.chunk.id));
    }

    #[tokio::test]
    async fn find_similar_averages_intersecting_chunk_embeddings() {
        let store = Arc::new(VectorStore::open_in_memory().await.unwrap());
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(LocalHashEmbeddingProvider::new(4));
        let now = Utc::now();
        let make = |start: u32, end: u32, embedding: Vec<f32>| EmbeddedChunk {
            chunk: Chunk::new("p1", "a.rs", format!("line {start}"), start, end, ChunkType::Function, None, None, "rust"),
            embedding,
            created_at: now,
            updated_at: now,
        };
        let c1 = make(1, 5, vec![1.0, 0.0, 0.0, 0.0]);
        let c2 = make(3, 8, vec![0.0, 1.0, 0.0, 0.0]);
        store.store_batch("p1", &[c1.clone(), c2.clone()]).await.unwrap();

        let retriever = Retriever::new(store.clone(), provider, 0.6, 0.4);
        // Range 4-4 intersects both chunks (1-5 and 3-8); excludeSelf=false
        // so the averaged query vector's own nearest neighbors (itself)
        // aren't filtered out, keeping this a direct check of the average.
        let results = retriever.find_similar("p1", "a.rs", 4, 4, 10, -1.0, false).await.unwrap();
        assert_eq!(results.len(), 2);
        // The averaged vector (0.5, 0.5, 0, 0) is equidistant (cosine) from
        // both source chunks, so they tie and fall back to path/startLine
        // ordering — c1 (startLine 1) first.
        assert_eq!(results[0].chunk.id, c1.chunk.id);
        assert_eq!(results[1].chunk.id, c2.chunk.id);
    }

    #[tokio::test]
    async fn retrieve_context_is_sorted_by_path_then_line() {
        let (store, provider) = seeded_store_and_provider().await;
        let retriever = Retriever::new(store, provider, 0.6, 0.4);
        let ctx = retriever.retrieve_context("p1", "function", 4000).await.unwrap();
        let paths: Vec<&str> = ctx.iter().map(|c| c.chunk.path.as_str()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }
}
