//! 内存记录存储

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{RecordStore, SessionRecord, SessionStatus, StoreError};
use crate::engine::EngineState;
use crate::memory::Message;

struct StoredSession {
    record: SessionRecord,
    histories: BTreeMap<u64, Vec<Message>>,
    states: BTreeMap<u64, EngineState>,
}

#[derive(Default)]
pub struct MemoryRecordStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某会话当前保存的代号（测试用，观察清理是否生效）
    pub async fn stored_generations(&self, session_id: &str) -> Vec<u64> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.histories.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ensure_session(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| StoredSession {
                record: SessionRecord::new(session_id),
                histories: BTreeMap::new(),
                states: BTreeMap::new(),
            });
        Ok(stored.record.clone())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.record.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut records: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        stored.record.status = status;
        stored.record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn put_history(
        &self,
        session_id: &str,
        generation: u64,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        stored.histories.insert(generation, messages.to_vec());
        Ok(())
    }

    async fn put_state(
        &self,
        session_id: &str,
        generation: u64,
        state: &EngineState,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        stored.states.insert(generation, state.clone());
        Ok(())
    }

    async fn commit(&self, session_id: &str, generation: u64) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        stored.record.committed_generation = Some(generation);
        stored.record.updated_at = Utc::now();
        Ok(())
    }

    async fn prune(&self, session_id: &str, keep: u64) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if let Some(stored) = sessions.get_mut(session_id) {
            stored.histories.retain(|g, _| *g >= keep);
            stored.states.retain(|g, _| *g >= keep);
        }
        Ok(())
    }

    async fn load_history(&self, session_id: &str, generation: u64) -> Result<Vec<Message>, StoreError> {
        let sessions = self.sessions.read().await;
        let stored = sessions
            .get(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        Ok(stored.histories.get(&generation).cloned().unwrap_or_default())
    }

    async fn load_state(
        &self,
        session_id: &str,
        generation: u64,
    ) -> Result<Option<EngineState>, StoreError> {
        let sessions = self.sessions.read().await;
        let stored = sessions
            .get(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        Ok(stored.states.get(&generation).cloned())
    }
}
