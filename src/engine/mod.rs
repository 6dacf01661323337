//! 对话引擎抽象
//!
//! Orchestrator 把引擎视为不透明的协作者：`run(task)` 返回按序产出的事件流，
//! `save_state` / `load_state` 负责快照。引擎需要人工输入时通过 [`InputProvider`] 回调，
//! 由 InputBroker 桥接到客户端。

pub mod echo;
pub mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{Envelope, InputError};

pub use echo::{EchoEngine, EchoEngineFactory};
pub use scripted::{ScriptedEngine, ScriptedEngineFactory, Step};

/// 引擎事件流
pub type EventStream<'a> = BoxStream<'a, Result<Envelope, EngineError>>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine run failed: {0}")]
    Run(String),

    #[error("Engine state error: {0}")]
    State(String),

    #[error(transparent)]
    Input(#[from] InputError),
}

/// 引擎状态快照：带版本号的文本，落库前已序列化
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub version: u32,
    pub payload: String,
}

impl EngineState {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            payload: payload.into(),
        }
    }

    pub fn from_value<T: Serialize>(value: &T) -> Result<Self, EngineError> {
        serde_json::to_string(value)
            .map(Self::new)
            .map_err(|e| EngineError::State(e.to_string()))
    }

    pub fn to_value<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EngineError> {
        if self.version != Self::CURRENT_VERSION {
            return Err(EngineError::State(format!(
                "unsupported state version {}",
                self.version
            )));
        }
        serde_json::from_str(&self.payload).map_err(|e| EngineError::State(e.to_string()))
    }
}

/// 引擎期望的「问人」回调
#[async_trait]
pub trait InputProvider: Send + Sync {
    async fn provide(&self, prompt: &str) -> Result<String, InputError>;
}

/// 多轮对话引擎
#[async_trait]
pub trait ConversationEngine: Send + Sync {
    /// 运行一个任务，事件按产出顺序返回；流结束即本次运行完成
    fn run(&mut self, task: String, input: Arc<dyn InputProvider>) -> EventStream<'_>;

    async fn save_state(&self) -> Result<EngineState, EngineError>;

    async fn load_state(&mut self, state: &EngineState) -> Result<(), EngineError>;
}

/// 每次引擎运行都构造一个新实例，再装载上一个已提交的状态
pub trait EngineFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Box<dyn ConversationEngine>;
}
