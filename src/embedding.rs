//! EmbeddingProvider (C3): a polymorphic capability translating batches of
//! text into vectors against a remote service (§4.3).
//!
//! The real vendor HTTP SDK is an external collaborator (§1) and out of
//! scope for this crate; `LocalHashEmbeddingProvider` below is the one
//! concrete, fully-offline implementation shipped so the pipeline is
//! exercisable without network access (SPEC_FULL §4.3 supplement). A
//! production deployment swaps in an HTTP-backed `EmbeddingProvider` without
//! touching Indexer/Retriever.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Maximum combined character budget for one `GenerateEmbeddings` call
/// (§4.3: `texts` total <= 2048).
pub const MAX_REQUEST_TEXTS: usize = 2048;

#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    pub texts: Vec<String>,
    pub model: Option<String>,
}

impl EmbeddingRequest {
    pub fn validate(&self) -> Result<()> {
        if self.texts.is_empty() {
            return Err(Error::Validation("texts must not be empty".into()));
        }
        if self.texts.len() > MAX_REQUEST_TEXTS {
            return Err(Error::Validation(format!(
                "texts exceeds the {MAX_REQUEST_TEXTS}-item ceiling: got {}",
                self.texts.len()
            )));
        }
        if self.texts.iter().any(|t| t.is_empty()) {
            return Err(Error::Validation("each text must be non-empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub vectors: Vec<Vec<f32>>,
    pub model: String,
    pub tokens_used: u64,
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub dimensions: usize,
    /// Per-call token ceiling the provider accepts in one request (§4.5 step 4).
    pub max_tokens_per_call: u32,
}

/// Capability set (§9): small record of async operations rather than a
/// deep class hierarchy. Stateless across calls — retry policy belongs to
/// the caller (Indexer), per §4.3.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn generate_embeddings(&self, req: EmbeddingRequest) -> Result<EmbeddingResponse>;
    fn model_info(&self) -> ModelInfo;
}

/// Deterministic, fully local stand-in for a remote embedding vendor.
///
/// Produces a fixed-dimensionality vector per text by hashing overlapping
/// character n-grams into buckets (a simplified feature-hashing /
/// bag-of-n-grams embedding), then L2-normalizing. Same text always yields
/// the same vector, which is sufficient for cosine ranking and for the
/// crate's invariants (§8 #3, #4) without requiring model weights or a
/// network round-trip.
pub struct LocalHashEmbeddingProvider {
    dimensions: usize,
    model_name: String,
}

impl LocalHashEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            model_name: "local-hash-ngram-v1".to_string(),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut buckets = vec![0f32; self.dimensions];
        let chars: Vec<char> = text.chars().collect();
        const N: usize = 3;
        if chars.len() < N {
            hash_into(&mut buckets, text);
        } else {
            for window in chars.windows(N) {
                let gram: String = window.iter().collect();
                hash_into(&mut buckets, &gram);
            }
        }
        l2_normalize(&mut buckets);
        buckets
    }
}

fn hash_into(buckets: &mut [f32], gram: &str) {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    gram.hash(&mut hasher);
    let h = hasher.finish();
    let idx = (h as usize) % buckets.len();
    let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
    buckets[idx] += sign;
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
}

#[async_trait]
impl EmbeddingProvider for LocalHashEmbeddingProvider {
    async fn generate_embeddings(&self, req: EmbeddingRequest) -> Result<EmbeddingResponse> {
        req.validate()?;
        let vectors: Vec<Vec<f32>> = req.texts.iter().map(|t| self.embed_one(t)).collect();
        let tokens_used: u64 = req.texts.iter().map(|t| crate::types::estimate_tokens(t) as u64).sum();
        Ok(EmbeddingResponse {
            vectors,
            model: req.model.unwrap_or_else(|| self.model_name.clone()),
            tokens_used,
        })
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.model_name.clone(),
            dimensions: self.dimensions,
            max_tokens_per_call: 8192,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_empty_texts() {
        let provider = LocalHashEmbeddingProvider::new(32);
        let err = provider
            .generate_embeddings(EmbeddingRequest { texts: vec![], model: None })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn deterministic_and_correct_dimension() {
        let provider = LocalHashEmbeddingProvider::new(64);
        let req = EmbeddingRequest {
            texts: vec!["fn main() {}".to_string()],
            model: None,
        };
        let a = provider.generate_embeddings(req.clone()).await.unwrap();
        let b = provider.generate_embeddings(req).await.unwrap();
        assert_eq!(a.vectors, b.vectors);
        assert_eq!(a.vectors[0].len(), 64);
    }
}
