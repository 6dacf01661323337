//! 对话历史
//!
//! 一个会话的有序消息序列。序号只由 Orchestrator 分配：从 1 开始、严格递增、无空洞。
//! 回合内只追加，checkpoint 时整体替换。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::{Envelope, EnvelopeKind};

/// 单条已记录的消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sequence: u64,
    pub source: String,
    pub kind: EnvelopeKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// 把一条转发出去的引擎事件记录为消息
    pub fn from_envelope(sequence: u64, env: &Envelope) -> Self {
        Self {
            sequence,
            source: env.source.clone(),
            kind: env.kind.clone(),
            content: env.content.clone(),
            created_at: Utc::now(),
        }
    }
}

/// 序号不连续时的错误（从存储加载到损坏数据时出现）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sequence gap: expected {expected}, found {found}")]
pub struct SequenceGap {
    pub expected: u64,
    pub found: u64,
}

/// 会话的对话历史
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从存储恢复；要求序号为 1..=n
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, SequenceGap> {
        for (i, m) in messages.iter().enumerate() {
            let expected = i as u64 + 1;
            if m.sequence != expected {
                return Err(SequenceGap {
                    expected,
                    found: m.sequence,
                });
            }
        }
        Ok(Self { messages })
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn next_sequence(&self) -> u64 {
        self.messages.last().map(|m| m.sequence + 1).unwrap_or(1)
    }

    /// 追加一条转发事件，返回分配的序号
    pub fn record(&mut self, env: &Envelope) -> u64 {
        let sequence = self.next_sequence();
        self.messages.push(Message::from_envelope(sequence, env));
        sequence
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.messages.last().map(|m| m.created_at)
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_assigns_gapless_sequence() {
        let mut history = ConversationHistory::new();
        assert_eq!(history.next_sequence(), 1);
        assert_eq!(history.record(&Envelope::text("agent", "a")), 1);
        assert_eq!(history.record(&Envelope::text("agent", "b")), 2);
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[1].content, "b");
        assert_eq!(history.next_sequence(), 3);
    }

    #[test]
    fn test_from_messages_rejects_gap() {
        let mut history = ConversationHistory::new();
        history.record(&Envelope::text("agent", "a"));
        history.record(&Envelope::text("agent", "b"));
        let mut messages = history.into_messages();
        messages.remove(0);
        let err = ConversationHistory::from_messages(messages).unwrap_err();
        assert_eq!(err, SequenceGap { expected: 1, found: 2 });
    }

    #[test]
    fn test_from_messages_accepts_contiguous() {
        let mut history = ConversationHistory::new();
        history.record(&Envelope::text("agent", "a"));
        let restored = ConversationHistory::from_messages(history.clone().into_messages()).unwrap();
        assert_eq!(restored, history);
        assert!(restored.last_activity().is_some());
    }
}
