//! 会话管理接口
//!
//! 面向运维 / HTTP 层的会话查询、创建与删除；删除活跃会话前先取消其运行。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::checkpoint::PersistenceGateway;
use super::registry::SessionRegistry;
use crate::memory::Message;
use crate::store::{SessionRecord, SessionStatus, StoreError};

/// 等待被取消的会话释放准入的上限
const RELEASE_WAIT: Duration = Duration::from_secs(5);

/// 会话概览
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    /// 最新已提交消息的时间；没有消息时为创建时间
    pub last_activity: DateTime<Utc>,
    /// 当前是否有连接持有该会话
    pub active: bool,
}

#[derive(Clone)]
pub struct SessionAdmin {
    registry: Arc<SessionRegistry>,
    persistence: Arc<PersistenceGateway>,
}

impl SessionAdmin {
    pub fn new(registry: Arc<SessionRegistry>, persistence: Arc<PersistenceGateway>) -> Self {
        Self {
            registry,
            persistence,
        }
    }

    /// 新建一个会话（uuid v4）
    pub async fn create_session(&self) -> Result<SessionInfo, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let record = self.persistence.store().ensure_session(&id).await?;
        tracing::info!(session_id = %id, "Session created");
        self.describe(record).await
    }

    pub async fn session_info(&self, session_id: &str) -> Result<Option<SessionInfo>, StoreError> {
        match self.persistence.store().get_session(session_id).await? {
            Some(record) => self.describe(record).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        let records = self.persistence.store().list_sessions().await?;
        let mut infos = Vec::with_capacity(records.len());
        for record in records {
            infos.push(self.describe(record).await?);
        }
        Ok(infos)
    }

    /// 已提交的对话历史
    pub async fn history(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        self.persistence.committed_history(session_id).await
    }

    /// 删除会话及其全部消息与状态；会话不存在返回 false
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        if self.registry.cancel(session_id) {
            tracing::info!(session_id, "Cancelling live session before delete");
            let started = tokio::time::Instant::now();
            while self.registry.is_active(session_id) {
                if started.elapsed() >= RELEASE_WAIT {
                    tracing::warn!(session_id, "Session did not release in time, deleting anyway");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        let deleted = self.persistence.store().delete_session(session_id).await?;
        if deleted {
            tracing::info!(session_id, "Session deleted");
        }
        Ok(deleted)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.registry.active_ids()
    }

    async fn describe(&self, record: SessionRecord) -> Result<SessionInfo, StoreError> {
        let history = self.persistence.load_checkpoint(&record.id).await?.history;
        Ok(SessionInfo {
            active: self.registry.is_active(&record.id),
            message_count: history.len(),
            last_activity: history.last_activity().unwrap_or(record.created_at),
            id: record.id,
            status: record.status,
            created_at: record.created_at,
        })
    }
}
