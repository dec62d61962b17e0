//! SQLite-backed vector index.
//!
//! Chunk text and metadata live in one table with the embedding stored as a
//! little-endian f32 BLOB. Search scores a bounded candidate pool with
//! cosine similarity in-process; `ef_search` caps the pool size, which is
//! the recall/effort trade-off the ANN contract exposes.

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::{Document, RetrievalCandidate, StoredChunk, VectorIndex};
use crate::core::errors::PipelineError;
use crate::pipeline::chunker::DocumentChunk;

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub async fn open(db_path: PathBuf) -> Result<Self, PipelineError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        let index = Self { pool };
        index.init_schema().await?;
        Ok(index)
    }

    async fn init_schema(&self) -> Result<(), PipelineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL DEFAULT 0,
                sequence_index INTEGER NOT NULL DEFAULT 0,
                embedding BLOB,
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        Ok(())
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        let denom = norm_a * norm_b;

        if denom <= f32::EPSILON {
            0.0
        } else {
            dot / denom
        }
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> StoredChunk {
        let token_count: i64 = row.get("token_count");
        let sequence_index: i64 = row.get("sequence_index");
        StoredChunk {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            source: row.get("source"),
            text: row.get("content"),
            token_count: token_count as usize,
            sequence_index: sequence_index as usize,
        }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert_document(
        &self,
        document: &Document,
        items: Vec<(DocumentChunk, Vec<f32>)>,
    ) -> Result<(), PipelineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        // Supersede: chunks are immutable, so re-ingestion deletes and
        // recreates rather than updating in place.
        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(&document.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        for (chunk, embedding) in &items {
            let blob = Self::serialize_embedding(embedding);
            sqlx::query(
                "INSERT INTO chunks (chunk_id, document_id, source, content, token_count, sequence_index, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&chunk.id)
            .bind(&document.id)
            .bind(&document.source_uri)
            .bind(&chunk.text)
            .bind(chunk.token_count as i64)
            .bind(chunk.sequence_index as i64)
            .bind(&blob)
            .execute(&mut *tx)
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        ef_search: usize,
    ) -> Result<Vec<RetrievalCandidate>, PipelineError> {
        let pool_size = ef_search.max(top_k).max(1) as i64;

        let rows = sqlx::query(
            "SELECT chunk_id, document_id, source, content, token_count, sequence_index, embedding
             FROM chunks
             ORDER BY rowid
             LIMIT ?1",
        )
        .bind(pool_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        let mut scored: Vec<RetrievalCandidate> = rows
            .iter()
            .filter_map(|row| {
                let embedding_bytes: Vec<u8> = row.get("embedding");
                if embedding_bytes.is_empty() {
                    return None;
                }
                let stored = Self::deserialize_embedding(&embedding_bytes);
                Some(RetrievalCandidate {
                    chunk: Self::row_to_chunk(row),
                    similarity: Self::cosine_similarity(query, &stored),
                })
            })
            .collect();

        // Stable sort keeps native index order for equal scores.
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k.max(1));

        Ok(scored)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, PipelineError> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        Ok(result.rows_affected() as usize)
    }

    async fn chunk_count(&self) -> Result<usize, PipelineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;
        Ok(count as usize)
    }

    async fn document_count(&self) -> Result<usize, PipelineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT document_id) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;
        Ok(count as usize)
    }
}
