//! 持久化网关
//!
//! 把「历史整体替换 + 状态覆盖」呈现为单个逻辑单元：
//! 1. 写入第 N+1 代历史
//! 2. 写入第 N+1 代状态
//! 3. commit：一次写切换已提交代号（可见点）
//! 4. 清理旧代（失败只记日志）
//!
//! 每次物理写失败按有上限的指数退避重试；同一会话的 save 不会并发（单写者）。

use std::sync::Arc;
use std::time::Duration;

use crate::config::PersistenceSection;
use crate::engine::EngineState;
use crate::memory::{ConversationHistory, Message};
use crate::store::{RecordStore, SessionStatus, StoreError};

/// 加载时遇到并发提交的最大重读次数
const SNAPSHOT_ATTEMPTS: usize = 5;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&PersistenceSection::default())
    }
}

impl From<&PersistenceSection> for RetryPolicy {
    fn from(section: &PersistenceSection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            initial_backoff: Duration::from_millis(section.initial_backoff_ms),
            max_backoff: Duration::from_millis(section.max_backoff_ms),
        }
    }
}

/// 一个会话的 checkpoint：历史与引擎状态成对出现
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// 该 checkpoint 对应的已提交代号；从未提交过为 None
    pub generation: Option<u64>,
    pub history: ConversationHistory,
    pub state: Option<EngineState>,
}

pub struct PersistenceGateway {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, session_id: &str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(StoreError::NotFound(id)) => return Err(StoreError::NotFound(id)),
                Err(e) if attempt >= self.retry.max_attempts => {
                    tracing::error!(session_id, op, attempt, "Persistence retries exhausted: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    let wait = self.retry.backoff(attempt);
                    tracing::warn!(session_id, op, attempt, ?wait, "Persistence write failed, retrying: {}", e);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    /// 准入时调用：确保会话记录存在、标记为 Active，并加载最后一次提交
    pub async fn open_session(&self, session_id: &str) -> Result<Checkpoint, StoreError> {
        let record = self
            .with_retry("ensure_session", session_id, || self.store.ensure_session(session_id))
            .await?;
        if record.status != SessionStatus::Active {
            self.store.set_status(session_id, SessionStatus::Active).await?;
        }
        self.load_checkpoint(session_id).await
    }

    /// 只读取已提交代；会话不存在时返回空 checkpoint
    ///
    /// 历史与状态分两次读取，期间可能有新的提交把这一代清理掉；
    /// 读完后复查已提交代号，变了就重读，保证返回的一对属于同一次提交。
    pub async fn load_checkpoint(&self, session_id: &str) -> Result<Checkpoint, StoreError> {
        let mut generation = self.committed_generation(session_id).await?;
        for _ in 0..SNAPSHOT_ATTEMPTS {
            let Some(current) = generation else {
                return Ok(Checkpoint::default());
            };

            let messages = self
                .with_retry("load_history", session_id, || {
                    self.store.load_history(session_id, current)
                })
                .await?;
            let state = self
                .with_retry("load_state", session_id, || {
                    self.store.load_state(session_id, current)
                })
                .await?;

            let latest = self.committed_generation(session_id).await?;
            if latest != Some(current) {
                tracing::debug!(session_id, generation = current, latest = ?latest, "Checkpoint moved during load, re-reading");
                generation = latest;
                continue;
            }

            let history = ConversationHistory::from_messages(messages)
                .map_err(|e| StoreError::Corrupt(format!("session {session_id}: {e}")))?;
            return Ok(Checkpoint {
                generation: Some(current),
                history,
                state,
            });
        }
        Err(StoreError::Backend(format!(
            "session {session_id}: checkpoint kept moving during load"
        )))
    }

    async fn committed_generation(&self, session_id: &str) -> Result<Option<u64>, StoreError> {
        let record = self
            .with_retry("get_session", session_id, || self.store.get_session(session_id))
            .await?;
        Ok(record.and_then(|r| r.committed_generation))
    }

    /// 原子地保存一对（历史，状态），返回新的已提交代号
    ///
    /// `checkpoint.generation` 是上一次提交的代号，本次写入它的下一代。
    pub async fn save_checkpoint(
        &self,
        session_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<u64, StoreError> {
        let generation = checkpoint.generation.map_or(1, |g| g + 1);
        let history = &checkpoint.history;

        self.with_retry("put_history", session_id, || {
            self.store.put_history(session_id, generation, history.messages())
        })
        .await?;
        if let Some(state) = &checkpoint.state {
            self.with_retry("put_state", session_id, || {
                self.store.put_state(session_id, generation, state)
            })
            .await?;
        }
        self.with_retry("commit", session_id, || self.store.commit(session_id, generation))
            .await?;

        if let Err(e) = self.store.prune(session_id, generation).await {
            tracing::warn!(session_id, generation, "Failed to prune old checkpoints: {}", e);
        }

        tracing::info!(
            session_id,
            generation,
            messages = history.len(),
            "Checkpoint committed"
        );
        Ok(generation)
    }

    /// 会话结束时标记 Terminated（尽力而为）
    pub async fn mark_terminated(&self, session_id: &str) {
        if let Err(e) = self
            .store
            .set_status(session_id, SessionStatus::Terminated)
            .await
        {
            tracing::warn!(session_id, "Failed to mark session terminated: {}", e);
        }
    }

    /// 已提交的历史（管理接口使用）
    pub async fn committed_history(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .load_checkpoint(session_id)
            .await?
            .history
            .into_messages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Envelope;
    use crate::store::{FaultInjectingStore, MemoryRecordStore, StoreOp};

    fn history(contents: &[&str]) -> ConversationHistory {
        let mut h = ConversationHistory::new();
        for c in contents {
            h.record(&Envelope::text("agent", *c));
        }
        h
    }

    fn pair(
        generation: Option<u64>,
        history: &ConversationHistory,
        state: &EngineState,
    ) -> Checkpoint {
        Checkpoint {
            generation,
            history: history.clone(),
            state: Some(state.clone()),
        }
    }

    fn setup() -> (Arc<FaultInjectingStore>, PersistenceGateway) {
        let store = Arc::new(FaultInjectingStore::new(Arc::new(MemoryRecordStore::new())));
        let gateway = PersistenceGateway::new(store.clone(), RetryPolicy::no_delay(3));
        (store, gateway)
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(10), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_store, gateway) = setup();
        let empty = gateway.open_session("s1").await.unwrap();
        assert_eq!(empty, Checkpoint::default());

        let h = history(&["a", "b"]);
        let state = EngineState::new(r#"{"turns":1}"#);
        let generation = gateway.save_checkpoint("s1", &pair(None, &h, &state)).await.unwrap();
        assert_eq!(generation, 1);

        let loaded = gateway.load_checkpoint("s1").await.unwrap();
        assert_eq!(loaded.generation, Some(1));
        assert_eq!(loaded.history, h);
        assert_eq!(loaded.state, Some(state));
    }

    #[tokio::test]
    async fn test_failure_between_history_and_state_keeps_old_pair() {
        let store = Arc::new(FaultInjectingStore::new(Arc::new(MemoryRecordStore::new())));
        let gateway = PersistenceGateway::new(store.clone(), RetryPolicy::no_delay(1));
        gateway.open_session("s1").await.unwrap();

        let old_history = history(&["a"]);
        let old_state = EngineState::new(r#"{"turns":1}"#);
        gateway.save_checkpoint("s1", &pair(None, &old_history, &old_state)).await.unwrap();

        store.fail_next(StoreOp::PutState, 1);
        let new_history = history(&["a", "b"]);
        let new_state = EngineState::new(r#"{"turns":2}"#);
        assert!(gateway
            .save_checkpoint("s1", &pair(Some(1), &new_history, &new_state))
            .await
            .is_err());

        let loaded = gateway.load_checkpoint("s1").await.unwrap();
        assert_eq!(loaded.history, old_history);
        assert_eq!(loaded.state, Some(old_state));

        // 下一次保存覆盖残留的暂存行
        let generation = gateway
            .save_checkpoint("s1", &pair(Some(1), &new_history, &new_state))
            .await
            .unwrap();
        assert_eq!(generation, 2);
        let loaded = gateway.load_checkpoint("s1").await.unwrap();
        assert_eq!(loaded.history, new_history);
        assert_eq!(loaded.state, Some(new_state));
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_old_pair() {
        let store = Arc::new(FaultInjectingStore::new(Arc::new(MemoryRecordStore::new())));
        let gateway = PersistenceGateway::new(store.clone(), RetryPolicy::no_delay(2));
        gateway.open_session("s1").await.unwrap();
        gateway
            .save_checkpoint("s1", &pair(None, &history(&["a"]), &EngineState::new("{}")))
            .await
            .unwrap();

        store.fail_next(StoreOp::Commit, 2);
        let result = gateway
            .save_checkpoint("s1", &pair(Some(1), &history(&["a", "b"]), &EngineState::new("{}")))
            .await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(store.calls(StoreOp::Commit), 3);
        assert_eq!(gateway.load_checkpoint("s1").await.unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (store, gateway) = setup();
        gateway.open_session("s1").await.unwrap();
        store.fail_next(StoreOp::PutHistory, 2);
        let generation = gateway
            .save_checkpoint("s1", &pair(None, &history(&["a"]), &EngineState::new("{}")))
            .await
            .unwrap();
        assert_eq!(generation, 1);
        assert_eq!(store.calls(StoreOp::PutHistory), 3);
    }

    #[tokio::test]
    async fn test_load_racing_a_commit_returns_a_committed_pair() {
        let (store, gateway) = setup();
        let gateway = Arc::new(gateway);
        gateway.open_session("s1").await.unwrap();
        let old_state = EngineState::new(r#"{"turns":1}"#);
        gateway
            .save_checkpoint("s1", &pair(None, &history(&["a"]), &old_state))
            .await
            .unwrap();

        // 读者拿到第 1 代后停住，写者提交第 2 代并清理第 1 代
        let pause = store.pause_next(StoreOp::LoadHistory);
        let reader = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.load_checkpoint("s1").await })
        };
        pause.reached.await.unwrap();

        let new_history = history(&["a", "b"]);
        let new_state = EngineState::new(r#"{"turns":2}"#);
        gateway
            .save_checkpoint("s1", &pair(Some(1), &new_history, &new_state))
            .await
            .unwrap();
        pause.resume.send(()).unwrap();

        let loaded = reader.await.unwrap().unwrap();
        assert_eq!(loaded.generation, Some(2));
        assert_eq!(loaded.history, new_history);
        assert_eq!(loaded.state, Some(new_state));
    }

    #[tokio::test]
    async fn test_reopen_marks_active() {
        let (store, gateway) = setup();
        gateway.open_session("s1").await.unwrap();
        gateway.mark_terminated("s1").await;
        assert_eq!(
            store.get_session("s1").await.unwrap().unwrap().status,
            SessionStatus::Terminated
        );
        gateway.open_session("s1").await.unwrap();
        assert_eq!(
            store.get_session("s1").await.unwrap().unwrap().status,
            SessionStatus::Active
        );
    }
}
