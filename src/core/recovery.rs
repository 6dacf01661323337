//! 错误监管
//!
//! 根据 SessionError 返回 FaultAction，并给出应发送给客户端的 error 信封序列。

use crate::core::{FaultAction, SessionError};
use crate::gateway::Envelope;

/// 故障分类：把任意层的错误映射为可执行动作（终止 / 丢弃 / 放弃本轮 / 降级 / 上报）
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorSupervisor;

impl ErrorSupervisor {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, err: &SessionError) -> FaultAction {
        match err {
            SessionError::Disconnected => FaultAction::Terminate,
            SessionError::Validation(_) => FaultAction::DiscardInput,
            SessionError::EngineExecution(_) => FaultAction::AbandonTurn,
            SessionError::Persistence(_) => FaultAction::Degrade,
            SessionError::Unexpected {
                transport: true, ..
            } => FaultAction::Terminate,
            SessionError::Unexpected { .. } => FaultAction::Surface,
        }
    }

    /// 该故障需要回给客户端的信封；中断本轮的故障附带一条重试邀请
    pub fn envelopes_for(&self, err: &SessionError) -> Vec<Envelope> {
        match self.classify(err) {
            FaultAction::Terminate => Vec::new(),
            FaultAction::DiscardInput => vec![Envelope::error(err.to_string())],
            FaultAction::AbandonTurn => vec![
                Envelope::error(format!("Error: {err}")),
                Envelope::retry_invitation(),
            ],
            FaultAction::Degrade => vec![Envelope::error(format!(
                "Warning: checkpoint deferred, session continues in memory ({err})"
            ))],
            FaultAction::Surface => vec![
                Envelope::error("Unexpected error occurred"),
                Envelope::retry_invitation(),
            ],
        }
    }

    /// 装载 checkpoint 失败：会话不能开始回合，但连接保留，邀请客户端重试
    pub fn load_failure_envelopes(&self, err: &SessionError) -> Vec<Envelope> {
        match self.classify(err) {
            FaultAction::Terminate => Vec::new(),
            _ => vec![
                Envelope::error(format!("Failed to load session: {err}")),
                Envelope::retry_invitation(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::EnvelopeKind;

    #[test]
    fn test_disconnect_terminates_silently() {
        let sup = ErrorSupervisor::new();
        let err = SessionError::Disconnected;
        assert_eq!(sup.classify(&err), FaultAction::Terminate);
        assert!(sup.envelopes_for(&err).is_empty());
    }

    #[test]
    fn test_validation_discards_with_single_error() {
        let sup = ErrorSupervisor::new();
        let err = SessionError::Validation("missing field `type`".to_string());
        assert_eq!(sup.classify(&err), FaultAction::DiscardInput);
        let envs = sup.envelopes_for(&err);
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].kind, EnvelopeKind::Error);
        assert_eq!(envs[0].source, "system");
    }

    #[test]
    fn test_engine_error_abandons_turn_and_invites_retry() {
        let sup = ErrorSupervisor::new();
        let err = SessionError::EngineExecution("model unavailable".to_string());
        assert_eq!(sup.classify(&err), FaultAction::AbandonTurn);
        let envs = sup.envelopes_for(&err);
        assert_eq!(envs.len(), 2);
        assert!(envs[0].content.contains("model unavailable"));
        assert_eq!(envs[1].kind, EnvelopeKind::UserInputRequestedEvent);
    }

    #[test]
    fn test_persistence_degrades() {
        let sup = ErrorSupervisor::new();
        let err = SessionError::Persistence("disk full".to_string());
        assert_eq!(sup.classify(&err), FaultAction::Degrade);
        let envs = sup.envelopes_for(&err);
        assert_eq!(envs.len(), 1);
        assert!(envs[0].content.starts_with("Warning"));
    }

    #[test]
    fn test_load_failure_invites_retry() {
        let sup = ErrorSupervisor::new();
        let envs = sup.load_failure_envelopes(&SessionError::Persistence("locked".to_string()));
        assert_eq!(envs.len(), 2);
        assert!(envs[0].content.starts_with("Failed to load session"));
        assert_eq!(envs[1].kind, EnvelopeKind::UserInputRequestedEvent);
        assert!(sup.load_failure_envelopes(&SessionError::Disconnected).is_empty());
    }

    #[test]
    fn test_unexpected_depends_on_origin() {
        let sup = ErrorSupervisor::new();
        assert_eq!(
            sup.classify(&SessionError::unexpected("boom")),
            FaultAction::Surface
        );
        assert_eq!(
            sup.classify(&SessionError::transport("socket reset")),
            FaultAction::Terminate
        );
        let envs = sup.envelopes_for(&SessionError::unexpected("boom"));
        assert_eq!(envs.len(), 2);
        assert!(!envs[0].content.contains("boom"));
    }
}
