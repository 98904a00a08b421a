//! Core data model (§3): `Chunk`, `EmbeddedChunk`, `ProjectIndex` and the
//! small value types shared across components.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One of the five chunk shapes a `Chunker` can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Function,
    Class,
    Method,
    Block,
    File,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Function => "function",
            ChunkType::Class => "class",
            ChunkType::Method => "method",
            ChunkType::Block => "block",
            ChunkType::File => "file",
        }
    }
}

impl std::str::FromStr for ChunkType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "function" => Ok(ChunkType::Function),
            "class" => Ok(ChunkType::Class),
            "method" => Ok(ChunkType::Method),
            "block" => Ok(ChunkType::Block),
            "file" => Ok(ChunkType::File),
            other => Err(crate::error::Error::Validation(format!("unknown chunk type: {other}"))),
        }
    }
}

/// A contiguous slice of one source file (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub project_id: String,
    pub path: String,
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
    pub chunk_type: ChunkType,
    pub symbol_name: Option<String>,
    pub symbol_kind: Option<String>,
    pub language: String,
    pub token_count: u32,
    pub content_hash: String,
}

/// SHA-256 of `content`, first 16 bytes hex-encoded (32 hex chars).
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex_prefix(&digest, 16)
}

/// Stable fingerprint of `(path, start_line, end_line)`: SHA-256, first 8
/// bytes hex-encoded (16 hex chars).
pub fn chunk_id(path: &str, start_line: u32, end_line: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(start_line.to_le_bytes());
    hasher.update(b"\0");
    hasher.update(end_line.to_le_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 8)
}

fn hex_prefix(digest: &[u8], n: usize) -> String {
    digest[..n.min(digest.len())]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Estimated token count: `runeCount(content) / 4`, integer division. Must
/// stay identical between indexing and ranking (§4.2 step 5).
pub fn estimate_tokens(content: &str) -> u32 {
    (content.chars().count() / 4) as u32
}

impl Chunk {
    /// Builds a chunk, deriving `id` and `content_hash` per §3.
    pub fn new(
        project_id: impl Into<String>,
        path: impl Into<String>,
        content: impl Into<String>,
        start_line: u32,
        end_line: u32,
        chunk_type: ChunkType,
        symbol_name: Option<String>,
        symbol_kind: Option<String>,
        language: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let content = content.into();
        let id = chunk_id(&path, start_line, end_line);
        let token_count = estimate_tokens(&content);
        let content_hash = content_hash(&content);
        Self {
            id,
            project_id: project_id.into(),
            path,
            content,
            start_line,
            end_line,
            chunk_type,
            symbol_name,
            symbol_kind,
            language: language.into(),
            token_count,
            content_hash,
        }
    }
}

/// A `Chunk` plus its embedding vector and timestamps (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Aggregated stats for one project's index (§3 `ProjectIndex`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStats {
    pub project_id: String,
    pub total_chunks: u64,
    pub total_files: u64,
    pub total_tokens: u64,
    pub dimensions: usize,
    pub last_indexed: Option<chrono::DateTime<chrono::Utc>>,
    pub db_bytes: u64,
}

/// A chunk with a similarity/relevance score, returned from search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Flat symbol record the Chunker consumes (§9: no graph, just a stream).
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: String,
    /// 1-based, inclusive.
    pub start_line: u32,
    /// 1-based, inclusive.
    pub end_line: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_stable() {
        let a = chunk_id("src/main.rs", 1, 20);
        let b = chunk_id("src/main.rs", 1, 20);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn chunk_id_varies_with_inputs() {
        assert_ne!(chunk_id("a.rs", 1, 2), chunk_id("b.rs", 1, 2));
        assert_ne!(chunk_id("a.rs", 1, 2), chunk_id("a.rs", 1, 3));
    }

    #[test]
    fn content_hash_matches_sha256_prefix() {
        let h = content_hash("hello world");
        assert_eq!(h.len(), 32);
    }

    #[test]
    fn token_estimate_is_rune_count_over_four() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefg"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
