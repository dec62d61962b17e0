//! Conversation history persistence.
//!
//! Each chat exchange is stored as two turns (user, assistant). The prompt
//! builder folds the most recent turns back into the model messages so
//! follow-up questions resolve pronouns and earlier topics.

use std::path::PathBuf;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::core::errors::PipelineError;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub async fn open(db_path: PathBuf) -> Result<Self, PipelineError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_turns_conversation
             ON conversation_turns(conversation_id, id)",
        )
        .execute(&pool)
        .await
        .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        Ok(Self { pool })
    }

    pub async fn record_turn(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO conversation_turns (conversation_id, role, content) VALUES (?1, ?2, ?3)",
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Retrieval(e.to_string()))?;
        Ok(())
    }

    /// The last `limit` turns of a conversation, oldest first.
    pub async fn recent_turns(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, PipelineError> {
        let rows = sqlx::query(
            "SELECT conversation_id, role, content, created_at
             FROM conversation_turns
             WHERE conversation_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::Retrieval(e.to_string()))?;

        let mut turns: Vec<ConversationTurn> = rows
            .iter()
            .map(|row| ConversationTurn {
                conversation_id: row.get("conversation_id"),
                role: row.get("role"),
                content: row.get("content"),
                created_at: row.get("created_at"),
            })
            .collect();
        turns.reverse();
        Ok(turns)
    }

    pub async fn turn_count(&self) -> Result<usize, PipelineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversation_turns")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PipelineError::Retrieval(e.to_string()))?;
        Ok(count as usize)
    }
}
