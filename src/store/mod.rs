//! 记录存储抽象层
//!
//! 定义会话 / 消息 / 引擎状态的存储接口，支持内存和 SQLite 两种实现。
//!
//! 一次 checkpoint 在物理上是多次写入：先按「代」(generation) 暂存历史与状态，
//! 再用一次 `commit` 切换会话的已提交代号。读取只看已提交的代，
//! 所以任意两次写之间崩溃都只会留下完整的旧 checkpoint。

pub mod faulty;
pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineState;
use crate::memory::Message;

pub use faulty::{FaultInjectingStore, PauseHandle, StoreOp};
pub use memory::MemoryRecordStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteRecordStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "terminated" => Ok(SessionStatus::Terminated),
            other => Err(StoreError::Corrupt(format!("unknown session status '{other}'"))),
        }
    }
}

/// 会话记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 已提交的 checkpoint 代号；从未提交过为 None
    pub committed_generation: Option<u64>,
}

impl SessionRecord {
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            committed_generation: None,
        }
    }
}

/// 记录存储接口（按会话 id 的 CRUD）
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// 不存在则创建，存在则原样返回
    async fn ensure_session(&self, session_id: &str) -> Result<SessionRecord, StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StoreError>;

    /// 删除会话及其所有代的消息与状态；不存在返回 false
    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError>;

    /// 整体替换某一代的历史
    async fn put_history(
        &self,
        session_id: &str,
        generation: u64,
        messages: &[Message],
    ) -> Result<(), StoreError>;

    async fn put_state(
        &self,
        session_id: &str,
        generation: u64,
        state: &EngineState,
    ) -> Result<(), StoreError>;

    /// 单次写入：把已提交代号切换为 generation
    async fn commit(&self, session_id: &str, generation: u64) -> Result<(), StoreError>;

    /// 删除早于 keep 的所有代
    async fn prune(&self, session_id: &str, keep: u64) -> Result<(), StoreError>;

    /// 按 sequence 升序
    async fn load_history(&self, session_id: &str, generation: u64) -> Result<Vec<Message>, StoreError>;

    async fn load_state(
        &self,
        session_id: &str,
        generation: u64,
    ) -> Result<Option<EngineState>, StoreError>;
}
