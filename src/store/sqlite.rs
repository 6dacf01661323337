//! SQLite 记录存储
//!
//! 使用 sqlx 异步访问 SQLite，服务重启后会话可从最后一次提交恢复。
//! 时间戳以 RFC 3339 文本、引擎状态以 JSON 文本落库。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::{RecordStore, SessionRecord, SessionStatus, StoreError};
use crate::engine::EngineState;
use crate::gateway::EnvelopeKind;
use crate::memory::Message;

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let committed: Option<i64> = row.try_get("committed_generation")?;
    Ok(SessionRecord {
        id: row.try_get("id")?,
        status: status.parse()?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
        committed_generation: committed.map(|g| g as u64),
    })
}

impl SqliteRecordStore {
    /// 打开（或创建）数据库文件
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                committed_generation INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                session_id TEXT NOT NULL,
                generation INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                source TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, generation, sequence),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS engine_states (
                session_id TEXT NOT NULL,
                generation INTEGER NOT NULL,
                version INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, generation),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn require_session(&self, session_id: &str) -> Result<(), StoreError> {
        let exists = sqlx::query("SELECT 1 FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Ok(())
        } else {
            Err(StoreError::NotFound(session_id.to_string()))
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn ensure_session(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO sessions (id, status, created_at, updated_at, committed_generation)
             VALUES (?, ?, ?, ?, NULL)",
        )
        .bind(session_id)
        .bind(SessionStatus::Active.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, status, created_at, updated_at, committed_generation FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, status, created_at, updated_at, committed_generation
             FROM sessions ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM engine_states WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn put_history(
        &self,
        session_id: &str,
        generation: u64,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        self.require_session(session_id).await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE session_id = ? AND generation = ?")
            .bind(session_id)
            .bind(generation as i64)
            .execute(&mut *tx)
            .await?;

        for message in messages {
            sqlx::query(
                "INSERT INTO messages (session_id, generation, sequence, source, kind, content, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(session_id)
            .bind(generation as i64)
            .bind(message.sequence as i64)
            .bind(&message.source)
            .bind(message.kind.as_str())
            .bind(&message.content)
            .bind(message.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn put_state(
        &self,
        session_id: &str,
        generation: u64,
        state: &EngineState,
    ) -> Result<(), StoreError> {
        self.require_session(session_id).await?;
        sqlx::query(
            "INSERT OR REPLACE INTO engine_states (session_id, generation, version, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(generation as i64)
        .bind(state.version as i64)
        .bind(&state.payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit(&self, session_id: &str, generation: u64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET committed_generation = ?, updated_at = ? WHERE id = ?",
        )
        .bind(generation as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn prune(&self, session_id: &str, keep: u64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ? AND generation < ?")
            .bind(session_id)
            .bind(keep as i64)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM engine_states WHERE session_id = ? AND generation < ?")
            .bind(session_id)
            .bind(keep as i64)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_history(&self, session_id: &str, generation: u64) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT sequence, source, kind, content, created_at FROM messages
             WHERE session_id = ? AND generation = ? ORDER BY sequence ASC",
        )
        .bind(session_id)
        .bind(generation as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Message, StoreError> {
                let sequence: i64 = row.try_get("sequence")?;
                let kind: String = row.try_get("kind")?;
                let created_at: String = row.try_get("created_at")?;
                Ok(Message {
                    sequence: sequence as u64,
                    source: row.try_get("source")?,
                    kind: EnvelopeKind::from(kind),
                    content: row.try_get("content")?,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }

    async fn load_state(
        &self,
        session_id: &str,
        generation: u64,
    ) -> Result<Option<EngineState>, StoreError> {
        let row = sqlx::query(
            "SELECT version, payload FROM engine_states WHERE session_id = ? AND generation = ?",
        )
        .bind(session_id)
        .bind(generation as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<EngineState, StoreError> {
            let version: i64 = row.try_get("version")?;
            Ok(EngineState {
                version: version as u32,
                payload: row.try_get("payload")?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Envelope;
    use crate::memory::ConversationHistory;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_checkpoint_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("convoy.db");

        let mut history = ConversationHistory::new();
        history.record(&Envelope::text("search_agent", "found 3 papers"));
        history.record(&Envelope::text("summarize_agent", "TL;DR ..."));
        let state = EngineState::new(r#"{"turns":1}"#);

        let store = SqliteRecordStore::new(&db_path).await.unwrap();
        store.ensure_session("s1").await.unwrap();
        store.put_history("s1", 1, history.messages()).await.unwrap();
        store.put_state("s1", 1, &state).await.unwrap();
        store.commit("s1", 1).await.unwrap();
        store.close().await;

        let reopened = SqliteRecordStore::new(&db_path).await.unwrap();
        let record = reopened.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.committed_generation, Some(1));
        assert_eq!(record.status, SessionStatus::Active);

        let messages = reopened.load_history("s1", 1).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sequence, 1);
        assert_eq!(messages[1].content, "TL;DR ...");
        assert_eq!(messages[1].kind, EnvelopeKind::TextMessage);
        assert_eq!(reopened.load_state("s1", 1).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_put_history_replaces_generation() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteRecordStore::new(temp_dir.path().join("t.db")).await.unwrap();
        store.ensure_session("s1").await.unwrap();

        let mut history = ConversationHistory::new();
        history.record(&Envelope::text("a", "one"));
        history.record(&Envelope::text("a", "two"));
        store.put_history("s1", 1, history.messages()).await.unwrap();
        store.put_history("s1", 1, &history.messages()[..1]).await.unwrap();
        assert_eq!(store.load_history("s1", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteRecordStore::new(temp_dir.path().join("t.db")).await.unwrap();
        store.ensure_session("s1").await.unwrap();
        store.put_state("s1", 1, &EngineState::new("{}")).await.unwrap();
        store.set_status("s1", SessionStatus::Terminated).await.unwrap();
        assert_eq!(
            store.get_session("s1").await.unwrap().unwrap().status,
            SessionStatus::Terminated
        );

        assert!(store.delete_session("s1").await.unwrap());
        assert!(store.get_session("s1").await.unwrap().is_none());
        assert!(store.load_state("s1", 1).await.unwrap().is_none());
        assert_eq!(
            store.put_state("s1", 2, &EngineState::new("{}")).await,
            Err(StoreError::NotFound("s1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_prune() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteRecordStore::new(temp_dir.path().join("t.db")).await.unwrap();
        store.ensure_session("s1").await.unwrap();
        for generation in 1..=3u64 {
            store
                .put_state("s1", generation, &EngineState::new(format!("{{\"g\":{generation}}}")))
                .await
                .unwrap();
        }
        store.prune("s1", 3).await.unwrap();
        assert!(store.load_state("s1", 1).await.unwrap().is_none());
        assert!(store.load_state("s1", 3).await.unwrap().is_some());
    }
}
