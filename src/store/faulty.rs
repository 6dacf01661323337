//! 故障注入存储（测试工具）
//!
//! 包装任意 RecordStore，按操作类型注入指定次数的失败，并统计调用次数。
//! 也可以让下一次某类调用在进入内层存储前暂停，用来构造并发交错。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{RecordStore, SessionRecord, SessionStatus, StoreError};
use crate::engine::EngineState;
use crate::memory::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Ensure,
    PutHistory,
    PutState,
    Commit,
    Prune,
    LoadHistory,
    LoadState,
}

#[derive(Default)]
struct Counters {
    calls: HashMap<StoreOp, u32>,
    failures: HashMap<StoreOp, u32>,
    pauses: HashMap<StoreOp, Pause>,
}

struct Pause {
    reached: oneshot::Sender<()>,
    resume: oneshot::Receiver<()>,
}

/// 暂停点的控制端：`reached` 在调用停下时完成，`resume` 放行
pub struct PauseHandle {
    pub reached: oneshot::Receiver<()>,
    pub resume: oneshot::Sender<()>,
}

pub struct FaultInjectingStore {
    inner: Arc<dyn RecordStore>,
    counters: Mutex<Counters>,
}

impl FaultInjectingStore {
    pub fn new(inner: Arc<dyn RecordStore>) -> Self {
        Self {
            inner,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// 让接下来 times 次 op 调用失败
    pub fn fail_next(&self, op: StoreOp, times: u32) {
        self.lock().failures.insert(op, times);
    }

    /// 让下一次 op 调用停在进入内层存储之前，直到 resume 被触发或丢弃
    pub fn pause_next(&self, op: StoreOp) -> PauseHandle {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        self.lock().pauses.insert(
            op,
            Pause {
                reached: reached_tx,
                resume: resume_rx,
            },
        );
        PauseHandle {
            reached: reached_rx,
            resume: resume_tx,
        }
    }

    pub fn calls(&self, op: StoreOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn hold(&self, op: StoreOp) {
        let pause = self.lock().pauses.remove(&op);
        if let Some(pause) = pause {
            let _ = pause.reached.send(());
            let _ = pause.resume.await;
        }
    }

    fn enter(&self, op: StoreOp) -> Result<(), StoreError> {
        let mut counters = self.lock();
        *counters.calls.entry(op).or_insert(0) += 1;
        match counters.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Backend(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for FaultInjectingStore {
    async fn ensure_session(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        self.enter(StoreOp::Ensure)?;
        self.inner.ensure_session(session_id).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.get_session(session_id).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.inner.list_sessions().await
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StoreError> {
        self.inner.set_status(session_id, status).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_session(session_id).await
    }

    async fn put_history(
        &self,
        session_id: &str,
        generation: u64,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        self.enter(StoreOp::PutHistory)?;
        self.inner.put_history(session_id, generation, messages).await
    }

    async fn put_state(
        &self,
        session_id: &str,
        generation: u64,
        state: &EngineState,
    ) -> Result<(), StoreError> {
        self.enter(StoreOp::PutState)?;
        self.inner.put_state(session_id, generation, state).await
    }

    async fn commit(&self, session_id: &str, generation: u64) -> Result<(), StoreError> {
        self.enter(StoreOp::Commit)?;
        self.inner.commit(session_id, generation).await
    }

    async fn prune(&self, session_id: &str, keep: u64) -> Result<(), StoreError> {
        self.enter(StoreOp::Prune)?;
        self.inner.prune(session_id, keep).await
    }

    async fn load_history(&self, session_id: &str, generation: u64) -> Result<Vec<Message>, StoreError> {
        self.hold(StoreOp::LoadHistory).await;
        self.enter(StoreOp::LoadHistory)?;
        self.inner.load_history(session_id, generation).await
    }

    async fn load_state(
        &self,
        session_id: &str,
        generation: u64,
    ) -> Result<Option<EngineState>, StoreError> {
        self.hold(StoreOp::LoadState).await;
        self.enter(StoreOp::LoadState)?;
        self.inner.load_state(session_id, generation).await
    }
}
