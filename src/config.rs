//! Process configuration (§6: credentials and tunables are read from a
//! process configuration object at construction; no environment variables
//! are required by the core).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chunker::ChunkerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub exclude_dir_names: Vec<String>,
    pub max_file_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_dir_names: vec![],
            // §4.5 step 1: size cap of 5 MiB per file.
            max_file_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub concurrency: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10.0,
            refill_rate: 5.0,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub dimensions: usize,
    pub model: String,
    pub embed_batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimensions: 256,
            model: "local-hash-ngram-v1".to_string(),
            // §4.5 step 4 default.
            embed_batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    /// Relative to the project's data dir unless absolute.
    pub db_file_name: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            db_file_name: "embeddings.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub default_top_k: usize,
    pub default_min_score: f32,
    pub hybrid_semantic_weight: f32,
    pub hybrid_keyword_weight: f32,
    pub context_default_max_tokens: u32,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            default_min_score: 0.5,
            // §4.6/§9 open question 3: 0.6/0.4 chosen as a reasonable default.
            hybrid_semantic_weight: 0.6,
            hybrid_keyword_weight: 0.4,
            context_default_max_tokens: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub embed_batch_size: usize,
    pub retry_base_delay_ms: u64,
    pub retry_factor: f64,
    pub retry_max_attempts: u32,
    pub retry_jitter: f64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            embed_batch_size: 64,
            retry_base_delay_ms: 500,
            retry_factor: 2.0,
            retry_max_attempts: 3,
            retry_jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    /// JSON task-status file, project-root-relative, per §6.
    pub task_status_path: PathBuf,
    pub scan: ScanConfig,
    pub chunker: ChunkerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    pub retriever: RetrieverConfig,
    pub indexer: IndexerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".semantica"),
            task_status_path: PathBuf::from(".semantica/tasks.json"),
            scan: ScanConfig::default(),
            chunker: ChunkerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            retriever: RetrieverConfig::default(),
            indexer: IndexerConfig::default(),
        }
    }
}

impl Config {
    pub fn db_path(&self, repo_root: &Path) -> PathBuf {
        let dir = if self.data_dir.is_absolute() {
            self.data_dir.clone()
        } else {
            repo_root.join(&self.data_dir)
        };
        dir.join(&self.vector_store.db_file_name)
    }
}

/// Loads `<repo_root>/.semantica.json`, falling back to defaults when
/// absent or unparsable (mirrors the teacher's `load_config`).
pub fn load_config(repo_root: &Path) -> Config {
    let path = repo_root.join(".semantica.json");
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Config::default();
    };
    serde_json::from_str(&text).unwrap_or_else(|e| {
        tracing::warn!(error = %e, path = %path.display(), "failed to parse config, using defaults");
        Config::default()
    })
}

/// Stable identifier for a project root, derived from its canonicalized
/// path (§3: "stable per project root").
pub fn project_id(repo_root: &Path) -> String {
    use sha2::{Digest, Sha256};
    let canon = std::fs::canonicalize(repo_root).unwrap_or_else(|_| repo_root.to_path_buf());
    let digest = Sha256::digest(canon.to_string_lossy().as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.retriever.hybrid_semantic_weight + cfg.retriever.hybrid_keyword_weight, 1.0);
        assert!(cfg.indexer.retry_max_attempts >= 1);
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.rate_limiter.concurrency, RateLimiterConfig::default().concurrency);
    }

    #[test]
    fn project_id_is_stable_per_root() {
        let dir = tempfile::tempdir().unwrap();
        let a = project_id(dir.path());
        let b = project_id(dir.path());
        assert_eq!(a, b);
    }
}
