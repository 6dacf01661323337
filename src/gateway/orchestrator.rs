//! 回合编排器
//!
//! 每个会话一个 tokio 任务，驱动状态机：
//! Idle → AwaitingTask → EngineRunning ⇄ AwaitingUserInput → Checkpointing → AwaitingTask，
//! 任意状态可进入 Terminated（断线）或 Failed（不可恢复错误，随后回到 AwaitingTask）。
//!
//! 引擎运行期间用一个 `select!` 同时等待：取消令牌、InputBroker 的请求通知、
//! 引擎的下一个事件、客户端的下一帧。客户端看到的顺序即引擎产出顺序。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::checkpoint::{Checkpoint, PersistenceGateway};
use super::connection::ConnectionAdapter;
use super::input::{expire, InputBroker, InputError, PendingInputRequest};
use super::message::{Envelope, SYSTEM_SOURCE};
use super::registry::SessionLease;
use crate::config::SessionSection;
use crate::core::{ErrorSupervisor, FaultAction, SessionError, SessionOutcome, TurnState};
use crate::engine::{ConversationEngine, EngineError, EngineFactory, InputProvider};
use crate::memory::ConversationHistory;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// 等待人工输入的上限；None 表示无限等待
    pub input_timeout: Option<Duration>,
}

impl From<&SessionSection> for OrchestratorConfig {
    fn from(section: &SessionSection) -> Self {
        Self {
            input_timeout: section.input_timeout_secs.map(Duration::from_secs),
        }
    }
}

pub struct TurnOrchestrator<C: ConnectionAdapter> {
    session_id: String,
    lease: SessionLease,
    conn: C,
    persistence: Arc<PersistenceGateway>,
    engines: Arc<dyn EngineFactory>,
    supervisor: ErrorSupervisor,
    broker: Arc<InputBroker>,
    notices: mpsc::UnboundedReceiver<PendingInputRequest>,
    cancel: CancellationToken,
    state: TurnState,
    state_tx: watch::Sender<TurnState>,
    /// 内存中的工作集；generation 指向最后一次成功提交
    working: Checkpoint,
    /// 工作集是否有尚未落盘的进度（降级模式）
    dirty: bool,
    /// 最后一次提交是否已装载；未装载时不运行引擎
    loaded: bool,
    checkpoints: usize,
}

impl<C: ConnectionAdapter> TurnOrchestrator<C> {
    pub fn new(
        lease: SessionLease,
        conn: C,
        persistence: Arc<PersistenceGateway>,
        engines: Arc<dyn EngineFactory>,
        config: OrchestratorConfig,
    ) -> Self {
        let cancel = lease.cancel_token();
        let (broker, notices) = InputBroker::new(cancel.clone(), config.input_timeout);
        let (state_tx, _) = watch::channel(TurnState::Idle);
        Self {
            session_id: lease.session_id().to_string(),
            lease,
            conn,
            persistence,
            engines,
            supervisor: ErrorSupervisor::new(),
            broker,
            notices,
            cancel,
            state: TurnState::Idle,
            state_tx,
            working: Checkpoint::default(),
            dirty: false,
            loaded: false,
            checkpoints: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 观察状态迁移（测试与管理接口使用）
    pub fn subscribe_state(&self) -> watch::Receiver<TurnState> {
        self.state_tx.subscribe()
    }

    pub fn input_broker(&self) -> Arc<InputBroker> {
        Arc::clone(&self.broker)
    }

    fn transition(&mut self, next: TurnState) {
        if self.state == next || self.state.is_terminal() {
            return;
        }
        tracing::debug!(session_id = %self.session_id, from = %self.state, to = %next, "State transition");
        self.state = next;
        self.state_tx.send_replace(next);
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        self.conn.send_envelope(envelope).await
    }

    /// 运行会话直到断线；返回时准入凭证已释放
    pub async fn run(mut self) -> SessionOutcome {
        tracing::info!(session_id = %self.session_id, "Session started");

        if self.ensure_loaded().await {
            self.serve().await;
        }
        let final_state = TurnState::Terminated;

        self.cancel.cancel();
        self.broker.clear();
        self.persistence.mark_terminated(&self.session_id).await;
        self.transition(final_state);

        if self.dirty {
            tracing::warn!(
                session_id = %self.session_id,
                "Session ended with uncommitted progress; last committed checkpoint is kept"
            );
        }
        tracing::info!(
            session_id = %self.session_id,
            checkpoints = self.checkpoints,
            state = %final_state,
            "Session ended"
        );

        let outcome = SessionOutcome {
            session_id: self.session_id.clone(),
            final_state,
            checkpoints: self.checkpoints,
            dirty: self.dirty,
        };
        drop(self.lease);
        outcome
    }

    /// Idle：装载最后一次提交的历史与引擎状态
    async fn load(&mut self) -> Result<(), SessionError> {
        self.working = self.persistence.open_session(&self.session_id).await?;
        self.loaded = true;
        tracing::info!(
            session_id = %self.session_id,
            messages = self.working.history.len(),
            generation = ?self.working.generation,
            "Checkpoint loaded"
        );
        Ok(())
    }

    /// 尚未装载时尝试装载；失败回 error + 重试邀请，连接保持。
    /// 返回 false 表示连接已不可用
    async fn ensure_loaded(&mut self) -> bool {
        if self.loaded {
            return true;
        }
        let Err(err) = self.load().await else {
            return true;
        };
        tracing::error!(session_id = %self.session_id, "Failed to load checkpoint: {}", err);
        self.transition(TurnState::Failed);
        for envelope in self.supervisor.load_failure_envelopes(&err) {
            if self.send(&envelope).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn serve(&mut self) {
        loop {
            self.transition(TurnState::AwaitingTask);
            let task = match self.await_task().await {
                Ok(task) => task,
                Err(err) => {
                    tracing::info!(session_id = %self.session_id, "Connection closed: {}", err);
                    return;
                }
            };

            // 装载失败时不运行引擎，避免空工作集覆盖已有的提交
            if !self.loaded {
                if !self.ensure_loaded().await {
                    return;
                }
                if !self.loaded {
                    tracing::warn!(session_id = %self.session_id, "Discarding task, checkpoint not loaded");
                    continue;
                }
            }

            let result = self.run_turn(task).await;
            self.broker.clear();
            while self.notices.try_recv().is_ok() {}

            if let Err(err) = result {
                if !self.handle_fault(err).await {
                    return;
                }
            }
        }
    }

    /// 按 ErrorSupervisor 的分类处置；返回 false 表示会话应终止
    async fn handle_fault(&mut self, err: SessionError) -> bool {
        let action = self.supervisor.classify(&err);
        match action {
            FaultAction::Terminate => {
                tracing::info!(session_id = %self.session_id, "Terminating session: {}", err);
                return false;
            }
            FaultAction::Degrade => {
                tracing::error!(session_id = %self.session_id, "Checkpoint deferred: {}", err);
            }
            FaultAction::Surface => {
                tracing::error!(session_id = %self.session_id, "Unexpected session error: {}", err);
                self.transition(TurnState::Failed);
            }
            FaultAction::AbandonTurn | FaultAction::DiscardInput => {
                tracing::warn!(session_id = %self.session_id, ?action, "Turn aborted: {}", err);
                self.transition(TurnState::Failed);
            }
        }
        for envelope in self.supervisor.envelopes_for(&err) {
            if self.send(&envelope).await.is_err() {
                return false;
            }
        }
        true
    }

    /// 非法帧：回一条 error 信封后丢弃
    async fn reject_frame(&self, err: SessionError) -> Result<(), SessionError> {
        tracing::warn!(session_id = %self.session_id, state = %self.state, "Discarding malformed frame: {}", err);
        for envelope in self.supervisor.envelopes_for(&err) {
            self.send(&envelope).await?;
        }
        Ok(())
    }

    /// AwaitingTask：等到一个 TextMessage
    async fn await_task(&mut self) -> Result<String, SessionError> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SessionError::Disconnected),
                received = self.conn.receive_envelope() => received,
            };
            match received {
                Ok(envelope) if envelope.is_task() => {
                    tracing::info!(session_id = %self.session_id, "Task received");
                    return Ok(envelope.content);
                }
                Ok(envelope) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        kind = %envelope.kind,
                        "Discarding non-task envelope while awaiting task"
                    );
                }
                Err(err @ SessionError::Validation(_)) => self.reject_frame(err).await?,
                Err(err) => return Err(err),
            }
        }
    }

    /// 一个完整回合：运行引擎直到流结束且没有遗留的输入请求，然后 checkpoint
    async fn run_turn(&mut self, task: String) -> Result<(), SessionError> {
        self.transition(TurnState::EngineRunning);
        let mut engine = self.engines.create(&self.session_id);
        if let Some(state) = &self.working.state {
            engine.load_state(state).await?;
        }

        // 回合内的历史只在成功后并入工作集
        let mut history = self.working.history.clone();
        let mut next_task = Some(task);
        while let Some(task) = next_task.take() {
            next_task = self.drain(engine.as_mut(), task, &mut history).await?;
            if next_task.is_some() {
                tracing::debug!(session_id = %self.session_id, "Trailing input request answered, continuing turn");
                self.transition(TurnState::EngineRunning);
            }
        }

        let state = engine.save_state().await?;
        self.working.history = history;
        self.working.state = Some(state);
        self.dirty = true;
        self.checkpoint().await
    }

    /// EngineRunning / AwaitingUserInput：消费引擎事件流
    ///
    /// 流以未被消费的输入请求结尾时，返回该请求的回复，由调用方作为新任务继续本回合。
    async fn drain(
        &mut self,
        engine: &mut dyn ConversationEngine,
        task: String,
        history: &mut ConversationHistory,
    ) -> Result<Option<String>, SessionError> {
        let provider: Arc<dyn InputProvider> = self.broker.clone();
        let mut stream = engine.run(task, provider);
        let mut trailing_request = false;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SessionError::Disconnected),
                Some(request) = self.notices.recv() => {
                    // 引擎直接调用了 provide，没有自己发出请求事件
                    self.send(&Envelope::input_request(SYSTEM_SOURCE, request.prompt)).await?;
                    self.transition(TurnState::AwaitingUserInput);
                }
                event = stream.next() => match event {
                    None => break,
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(envelope)) if envelope.is_bookkeeping() => {
                        tracing::debug!(session_id = %self.session_id, content = %envelope.content, "Engine run finished");
                    }
                    Some(Ok(envelope)) => {
                        trailing_request = self.forward(envelope, history).await?;
                    }
                },
                received = self.conn.receive_envelope() => match received {
                    Ok(envelope) => self.route_reply(envelope),
                    Err(err @ SessionError::Validation(_)) => self.reject_frame(err).await?,
                    Err(err) => return Err(err),
                },
            }
        }
        drop(stream);

        if !trailing_request {
            return Ok(None);
        }
        if let Some(reply) = self.broker.take_answer() {
            return Ok(Some(reply));
        }
        if self.broker.is_expecting() {
            return self.await_trailing_reply().await.map(Some);
        }
        Ok(None)
    }

    /// 转发一个引擎事件；返回它是否是输入请求
    async fn forward(
        &mut self,
        envelope: Envelope,
        history: &mut ConversationHistory,
    ) -> Result<bool, SessionError> {
        self.send(&envelope).await?;

        if envelope.is_input_request() {
            self.broker.announce(&envelope.content);
            self.transition(TurnState::AwaitingUserInput);
            return Ok(true);
        }

        let sequence = history.record(&envelope);
        tracing::debug!(session_id = %self.session_id, sequence, kind = %envelope.kind, "Event recorded");
        if self.state == TurnState::AwaitingUserInput && !self.broker.is_expecting() {
            self.transition(TurnState::EngineRunning);
        }
        Ok(false)
    }

    /// 引擎运行期间收到的客户端帧：有待处理请求时作为回复，否则丢弃
    fn route_reply(&mut self, envelope: Envelope) {
        if !self.broker.is_expecting() {
            tracing::warn!(
                session_id = %self.session_id,
                kind = %envelope.kind,
                "Discarding envelope received while engine is running"
            );
            return;
        }
        if self.broker.deliver(envelope.content) {
            tracing::debug!(session_id = %self.session_id, "User input delivered");
            self.transition(TurnState::EngineRunning);
        } else {
            tracing::warn!(session_id = %self.session_id, "Duplicate reply discarded");
        }
    }

    /// 引擎流已结束但最后一个事件是输入请求：等客户端回复
    async fn await_trailing_reply(&mut self) -> Result<String, SessionError> {
        let timeout = self.broker.timeout();
        let deadline = expire(timeout);
        tokio::pin!(deadline);

        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SessionError::Disconnected),
                _ = &mut deadline => {
                    let err = InputError::TimedOut(timeout.unwrap_or_default());
                    return Err(EngineError::from(err).into());
                }
                received = self.conn.receive_envelope() => received,
            };
            match received {
                Ok(envelope) => {
                    self.broker.clear();
                    return Ok(envelope.content);
                }
                Err(err @ SessionError::Validation(_)) => self.reject_frame(err).await?,
                Err(err) => return Err(err),
            }
        }
    }

    /// Checkpointing：原子保存（历史，状态）
    async fn checkpoint(&mut self) -> Result<(), SessionError> {
        self.transition(TurnState::Checkpointing);
        let generation = self
            .persistence
            .save_checkpoint(&self.session_id, &self.working)
            .await?;
        self.working.generation = Some(generation);
        self.dirty = false;
        self.checkpoints += 1;
        Ok(())
    }
}
