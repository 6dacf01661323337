//! 会话错误类型与处置动作
//!
//! 与 ErrorSupervisor 配合：根据 SessionError 决定 Terminate / DiscardInput / AbandonTurn / Degrade / Surface。

use thiserror::Error;

use crate::engine::EngineError;
use crate::gateway::InputError;
use crate::store::StoreError;

/// 会话循环中可能出现的故障（传输、校验、引擎、持久化、未分类）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// 连接断开：终止会话，不重试，不写半截 checkpoint
    #[error("Client disconnected")]
    Disconnected,

    /// 信封格式错误或当前状态下不接受的信封
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Engine execution error: {0}")]
    EngineExecution(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// 未分类异常；transport = true 表示源自传输层，需终止连接
    #[error("Unexpected error: {message}")]
    Unexpected { message: String, transport: bool },
}

impl SessionError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
            transport: false,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
            transport: true,
        }
    }
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Input(InputError::Disconnected) => SessionError::Disconnected,
            EngineError::Input(InputError::AlreadyPending) => {
                SessionError::unexpected("input request already pending")
            }
            other => SessionError::EngineExecution(other.to_string()),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::Persistence(err.to_string())
    }
}

/// ErrorSupervisor 根据错误类型给出的处置动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultAction {
    /// 取消进行中的引擎工作，释放会话，进入 Terminated
    Terminate,
    /// 丢弃输入，可能时回一条 error 信封，保持当前状态
    DiscardInput,
    /// 放弃本轮未保存的进度，回到 AwaitingTask
    AbandonTurn,
    /// 重试耗尽：内存中保留工作集，下次 checkpoint 再写
    Degrade,
    /// 记录日志，回通用错误，Failed → AwaitingTask
    Surface,
}
