//! VectorStore (C4): durable SQLite-backed chunk+vector storage, exact
//! cosine search, per-file reconciliation (§4.4).
//!
//! Backed by `rusqlite` (bundled SQLite) with `journal_mode=WAL` and
//! `synchronous=NORMAL`, guarded by a single `tokio::sync::Mutex<Connection>`
//! since `rusqlite::Connection` is `!Sync` — the same pattern the pack's
//! SQLite-backed vector stores use (e.g. a Tauri desktop app's
//! `services/vector_store.rs`). This serializes readers and writers at the
//! connection level; §4.4's "readers use a shared lock, Search must not
//! block other readers" is satisfied logically rather than with true
//! multi-reader concurrency, which is documented as a deliberate
//! simplification for a single-process embedded store (see DESIGN.md).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{Chunk, ChunkType, EmbeddedChunk, ProjectStats, ScoredChunk};

/// Length-prefixed little-endian f32 codec (§4.4/§6 preferred encoding).
/// MUST round-trip bitwise for finite values (§8 invariant 3).
pub fn encode_embedding(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + vec.len() * 4);
    out.extend_from_slice(&(vec.len() as u32).to_le_bytes());
    for f in vec {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() < 4 {
        return Err(Error::Internal("embedding blob truncated (missing length prefix)".into()));
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let expected = 4 + len * 4;
    if bytes.len() != expected {
        return Err(Error::Internal(format!(
            "embedding blob length mismatch: expected {expected} bytes, got {}",
            bytes.len()
        )));
    }
    let mut out = Vec::with_capacity(len);
    for chunk in bytes[4..].chunks_exact(4) {
        out.push(f32::from_le_bytes(chunk.try_into().unwrap()));
    }
    Ok(out)
}

/// Cosine similarity computed in f64, truncated to f32 on return. Zero if
/// either operand has zero norm or the lengths differ (§4.4 ranking rule).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

pub struct VectorStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl VectorStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        init_schema(&conn)?;
        info!(path = %path.display(), "vector store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    pub async fn close(self) -> Result<()> {
        // Dropping the Arc<Mutex<Connection>> closes the handle; explicit
        // method kept for the §4.4 `Close` contract entry.
        drop(self);
        Ok(())
    }

    fn existing_dimensions_locked(conn: &Connection, project_id: &str) -> Result<Option<usize>> {
        let dims: Option<i64> = conn
            .query_row(
                "SELECT dimensions FROM projects WHERE id = ?1",
                params![project_id],
                |r| r.get(0),
            )
            .ok();
        Ok(dims.map(|d| d as usize))
    }

    async fn upsert_project_meta(&self, project_id: &str, dimensions: usize) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO projects (id, root_path, last_indexed, total_chunks, total_files, dimensions)
             VALUES (?1, '', ?2, 0, 0, ?3)
             ON CONFLICT(id) DO UPDATE SET last_indexed = excluded.last_indexed, dimensions = excluded.dimensions",
            params![project_id, Utc::now().to_rfc3339(), dimensions as i64],
        )?;
        Ok(())
    }

    /// Upsert by `id`, writer-exclusive (§4.4 `Store`).
    pub async fn store(&self, project_id: &str, chunk: &EmbeddedChunk) -> Result<()> {
        self.store_batch(project_id, std::slice::from_ref(chunk)).await
    }

    /// One transaction, all-or-nothing (§4.4 `StoreBatch`).
    pub async fn store_batch(&self, project_id: &str, chunks: &[EmbeddedChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let dim = chunks[0].embedding.len();
        if chunks.iter().any(|c| c.embedding.len() != dim) {
            return Err(Error::Conflict { expected: dim, actual: 0 });
        }

        {
            let conn = self.conn.lock().await;
            if let Some(existing) = Self::existing_dimensions_locked(&conn, project_id)? {
                if existing != dim {
                    return Err(Error::Conflict { expected: existing, actual: dim });
                }
            }
        }

        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            for c in chunks {
                let blob = encode_embedding(&c.embedding);
                tx.execute(
                    "INSERT INTO embeddings
                     (id, project_id, file_path, content, start_line, end_line, chunk_type,
                      symbol_name, symbol_kind, language, token_count, content_hash, embedding,
                      created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                     ON CONFLICT(project_id, id) DO UPDATE SET
                        file_path = excluded.file_path,
                        content = excluded.content,
                        start_line = excluded.start_line,
                        end_line = excluded.end_line,
                        chunk_type = excluded.chunk_type,
                        symbol_name = excluded.symbol_name,
                        symbol_kind = excluded.symbol_kind,
                        language = excluded.language,
                        token_count = excluded.token_count,
                        content_hash = excluded.content_hash,
                        embedding = excluded.embedding,
                        updated_at = excluded.updated_at",
                    params![
                        c.chunk.id,
                        c.chunk.project_id,
                        c.chunk.path,
                        c.chunk.content,
                        c.chunk.start_line,
                        c.chunk.end_line,
                        c.chunk.chunk_type.as_str(),
                        c.chunk.symbol_name,
                        c.chunk.symbol_kind,
                        c.chunk.language,
                        c.chunk.token_count,
                        c.chunk.content_hash,
                        blob,
                        c.created_at.to_rfc3339(),
                        c.updated_at.to_rfc3339(),
                    ],
                )?;
            }
            tx.commit()?;
        }

        self.upsert_project_meta(project_id, dim).await?;
        self.refresh_counts(project_id).await?;
        debug!(project_id, n = chunks.len(), "stored batch");
        Ok(())
    }

    async fn refresh_counts(&self, project_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let (total_chunks, total_files, total_tokens): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT file_path), COALESCE(SUM(token_count),0)
             FROM embeddings WHERE project_id = ?1",
            params![project_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        conn.execute(
            "UPDATE projects SET total_chunks = ?2, total_files = ?3 WHERE id = ?1",
            params![project_id, total_chunks, total_files],
        )?;
        let _ = total_tokens;
        Ok(())
    }

    /// Cosine-ranked exact scan, sorted strictly by decreasing score, ties
    /// broken by ascending `(path, startLine)` (§3 invariant 6).
    pub async fn search(
        &self,
        project_id: &str,
        query: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredChunk>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, file_path, content, start_line, end_line, chunk_type,
                    symbol_name, symbol_kind, language, token_count, content_hash, embedding
             FROM embeddings WHERE project_id = ?1",
        )?;
        let rows = stmt.query_map(params![project_id], row_to_chunk_and_blob)?;

        let mut scored: Vec<ScoredChunk> = Vec::new();
        for row in rows {
            let (chunk, blob) = row?;
            let vector = decode_embedding(&blob)?;
            let score = cosine_similarity(query, &vector);
            if score >= min_score {
                scored.push(ScoredChunk { chunk, score });
            }
        }

        sort_scored(&mut scored);
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Atomic file-scope delete (§4.4 `Delete`, §3 invariant 5).
    pub async fn delete(&self, project_id: &str, file_path: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM embeddings WHERE project_id = ?1 AND file_path = ?2",
            params![project_id, file_path],
        )?;
        drop(conn);
        self.refresh_counts(project_id).await
    }

    /// Atomic delete of embeddings + project row (§4.4 `DeleteProject`).
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM embeddings WHERE project_id = ?1", params![project_id])?;
        tx.execute("DELETE FROM projects WHERE id = ?1", params![project_id])?;
        tx.commit()?;
        Ok(())
    }

    pub async fn get_stats(&self, project_id: &str) -> Result<ProjectStats> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, i64, Option<i64>, i64)> = conn
            .query_row(
                "SELECT total_chunks, total_files, dimensions, 0 FROM projects WHERE id = ?1",
                params![project_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .ok();
        let total_tokens: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(token_count),0) FROM embeddings WHERE project_id = ?1",
                params![project_id],
                |r| r.get(0),
            )
            .unwrap_or(0);
        let last_indexed: Option<String> = conn
            .query_row("SELECT last_indexed FROM projects WHERE id = ?1", params![project_id], |r| r.get(0))
            .ok();

        let db_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        let (total_chunks, total_files, dimensions) = match row {
            Some((c, f, d, _)) => (c as u64, f as u64, d.unwrap_or(0) as usize),
            None => (0, 0, 0),
        };

        Ok(ProjectStats {
            project_id: project_id.to_string(),
            total_chunks,
            total_files,
            total_tokens: total_tokens as u64,
            dimensions,
            last_indexed: last_indexed.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
            db_bytes,
        })
    }

    pub async fn get_chunk_by_id(&self, project_id: &str, id: &str) -> Result<Option<EmbeddedChunk>> {
        let conn = self.conn.lock().await;
        let result = conn.query_row(
            "SELECT id, project_id, file_path, content, start_line, end_line, chunk_type,
                    symbol_name, symbol_kind, language, token_count, content_hash, embedding,
                    created_at, updated_at
             FROM embeddings WHERE project_id = ?1 AND id = ?2",
            params![project_id, id],
            row_to_embedded_chunk,
        );
        match result {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Chunks ordered by `startLine` (§4.4 `ListChunks`).
    pub async fn list_chunks(&self, project_id: &str, file_path: &str) -> Result<Vec<EmbeddedChunk>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, file_path, content, start_line, end_line, chunk_type,
                    symbol_name, symbol_kind, language, token_count, content_hash, embedding,
                    created_at, updated_at
             FROM embeddings WHERE project_id = ?1 AND file_path = ?2 ORDER BY start_line ASC",
        )?;
        let rows = stmt.query_map(params![project_id, file_path], row_to_embedded_chunk)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// Every chunk of a project, unranked (used by the Retriever's keyword
    /// pass, which scores by term coverage rather than cosine distance).
    pub async fn list_project_chunks(&self, project_id: &str) -> Result<Vec<EmbeddedChunk>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, file_path, content, start_line, end_line, chunk_type,
                    symbol_name, symbol_kind, language, token_count, content_hash, embedding,
                    created_at, updated_at
             FROM embeddings WHERE project_id = ?1",
        )?;
        let rows = stmt.query_map(params![project_id], row_to_embedded_chunk)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
    }

    /// `id -> contentHash` map for one file (§4.4 `GetFileHashes`), used by
    /// the Indexer to compute the delta (§4.5 step 3).
    pub async fn get_file_hashes(&self, project_id: &str, file_path: &str) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, content_hash FROM embeddings WHERE project_id = ?1 AND file_path = ?2",
        )?;
        let rows = stmt.query_map(params![project_id, file_path], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (id, hash) = row?;
            map.insert(id, hash);
        }
        Ok(map)
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

fn row_to_chunk_and_blob(row: &rusqlite::Row) -> rusqlite::Result<(Chunk, Vec<u8>)> {
    let chunk_type: String = row.get(6)?;
    Ok((
        Chunk {
            id: row.get(0)?,
            project_id: row.get(1)?,
            path: row.get(2)?,
            content: row.get(3)?,
            start_line: row.get(4)?,
            end_line: row.get(5)?,
            chunk_type: chunk_type.parse::<ChunkType>().unwrap_or(ChunkType::Block),
            symbol_name: row.get(7)?,
            symbol_kind: row.get(8)?,
            language: row.get(9)?,
            token_count: row.get(10)?,
            content_hash: row.get(11)?,
        },
        row.get(12)?,
    ))
}

fn row_to_embedded_chunk(row: &rusqlite::Row) -> rusqlite::Result<EmbeddedChunk> {
    let chunk_type: String = row.get(6)?;
    let blob: Vec<u8> = row.get(12)?;
    let embedding = decode_embedding(&blob).unwrap_or_default();
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    Ok(EmbeddedChunk {
        chunk: Chunk {
            id: row.get(0)?,
            project_id: row.get(1)?,
            path: row.get(2)?,
            content: row.get(3)?,
            start_line: row.get(4)?,
            end_line: row.get(5)?,
            chunk_type: chunk_type.parse::<ChunkType>().unwrap_or(ChunkType::Block),
            symbol_name: row.get(7)?,
            symbol_kind: row.get(8)?,
            language: row.get(9)?,
            token_count: row.get(10)?,
            content_hash: row.get(11)?,
        },
        embedding,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS embeddings (
            id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            content TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            chunk_type TEXT NOT NULL,
            symbol_name TEXT,
            symbol_kind TEXT,
            language TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (project_id, id)
        );
        CREATE INDEX IF NOT EXISTS idx_embeddings_project ON embeddings(project_id);
        CREATE INDEX IF NOT EXISTS idx_embeddings_project_file ON embeddings(project_id, file_path);
        CREATE INDEX IF NOT EXISTS idx_embeddings_project_hash ON embeddings(project_id, content_hash);
        CREATE INDEX IF NOT EXISTS idx_embeddings_project_language ON embeddings(project_id, language);
        CREATE INDEX IF NOT EXISTS idx_embeddings_project_type ON embeddings(project_id, chunk_type);

        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            root_path TEXT NOT NULL,
            last_indexed TEXT,
            total_chunks INTEGER NOT NULL DEFAULT 0,
            total_files INTEGER NOT NULL DEFAULT 0,
            dimensions INTEGER
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chunk;

    fn sample_chunk(id_suffix: &str, path: &str, start: u32, dim: usize, seed: f32) -> EmbeddedChunk {
        let chunk = Chunk {
            id: format!("id-{id_suffix}"),
            project_id: "p1".into(),
            path: path.into(),
            content: "fn x() {}".into(),
            start_line: start,
            end_line: start + 1,
            chunk_type: ChunkType::Function,
            symbol_name: Some("x".into()),
            symbol_kind: Some("function".into()),
            language: "rust".into(),
            token_count: 2,
            content_hash: crate::types::content_hash("fn x() {}"),
        };
        let now = Utc::now();
        EmbeddedChunk {
            chunk,
            embedding: vec![seed; dim],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn embedding_codec_roundtrips() {
        let v = vec![1.0f32, -2.5, 0.0, f32::MIN_POSITIVE, 3.333333];
        let encoded = encode_embedding(&v);
        let decoded = decode_embedding(&encoded).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn cosine_properties() {
        let a = vec![1.0f32, 2.0, 3.0];
        let neg_a: Vec<f32> = a.iter().map(|x| -x).collect();
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-3);
        assert!((cosine_similarity(&a, &neg_a) - (-1.0)).abs() < 1e-3);
        let ortho_a = vec![1.0f32, 0.0];
        let ortho_b = vec![0.0f32, 1.0];
        assert!(cosine_similarity(&ortho_a, &ortho_b).abs() < 1e-3);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn store_and_search_orders_by_score_then_path() {
        let store = VectorStore::open_in_memory().await.unwrap();
        let a = sample_chunk("a", "a.rs", 1, 4, 1.0);
        let b = sample_chunk("b", "b.rs", 1, 4, 1.0);
        store.store_batch("p1", &[a, b]).await.unwrap();

        let results = store.search("p1", &[1.0, 1.0, 1.0, 1.0], 10, 0.0).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.path, "a.rs");
        assert_eq!(results[1].chunk.path, "b.rs");
    }

    #[tokio::test]
    async fn mixed_dimension_insert_fails() {
        let store = VectorStore::open_in_memory().await.unwrap();
        let a = sample_chunk("a", "a.rs", 1, 4, 1.0);
        store.store_batch("p1", &[a]).await.unwrap();
        let b = sample_chunk("b", "b.rs", 1, 8, 1.0);
        let err = store.store_batch("p1", &[b]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn delete_removes_all_chunks_for_path() {
        let store = VectorStore::open_in_memory().await.unwrap();
        let a = sample_chunk("a", "a.rs", 1, 4, 1.0);
        let a2 = sample_chunk("a2", "a.rs", 5, 4, 1.0);
        let b = sample_chunk("b", "b.rs", 1, 4, 1.0);
        store.store_batch("p1", &[a, a2, b]).await.unwrap();
        store.delete("p1", "a.rs").await.unwrap();
        let remaining = store.list_chunks("p1", "a.rs").await.unwrap();
        assert!(remaining.is_empty());
        let stats = store.get_stats("p1").await.unwrap();
        assert_eq!(stats.total_chunks, 1);
    }

    #[tokio::test]
    async fn upsert_by_id_replaces_prior_row() {
        let store = VectorStore::open_in_memory().await.unwrap();
        let mut a = sample_chunk("a", "a.rs", 1, 4, 1.0);
        store.store("p1", &a).await.unwrap();
        a.chunk.content = "fn y() {}".into();
        a.chunk.content_hash = crate::types::content_hash(&a.chunk.content);
        store.store("p1", &a).await.unwrap();
        let stats = store.get_stats("p1").await.unwrap();
        assert_eq!(stats.total_chunks, 1);
        let fetched = store.get_chunk_by_id("p1", &a.chunk.id).await.unwrap().unwrap();
        assert_eq!(fetched.chunk.content, "fn y() {}");
    }

    #[tokio::test]
    async fn get_file_hashes_round_trips() {
        let store = VectorStore::open_in_memory().await.unwrap();
        let a = sample_chunk("a", "a.rs", 1, 4, 1.0);
        let hash = a.chunk.content_hash.clone();
        let id = a.chunk.id.clone();
        store.store("p1", &a).await.unwrap();
        let hashes = store.get_file_hashes("p1", "a.rs").await.unwrap();
        assert_eq!(hashes.get(&id), Some(&hash));
    }
}
