//! 状态定义：TurnState 与会话状态快照
//!
//! Orchestrator 内部维护完整状态机，结束时产出 SessionOutcome（供日志与测试使用）。

use std::fmt;

use serde::Serialize;

/// 单个会话的回合状态机
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TurnState {
    Idle,
    AwaitingTask,
    EngineRunning,
    AwaitingUserInput,
    Checkpointing,
    Terminated,
    Failed,
}

impl TurnState {
    /// Terminated 之后不再有任何迁移
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Terminated)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnState::Idle => "idle",
            TurnState::AwaitingTask => "awaiting_task",
            TurnState::EngineRunning => "engine_running",
            TurnState::AwaitingUserInput => "awaiting_user_input",
            TurnState::Checkpointing => "checkpointing",
            TurnState::Terminated => "terminated",
            TurnState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 会话结束时的结果
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub final_state: TurnState,
    /// 成功提交的 checkpoint 次数
    pub checkpoints: usize,
    /// 内存中是否还有未落盘的工作集（降级模式）
    pub dirty: bool,
}
