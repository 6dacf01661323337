//! 会话记忆：对话历史与消息

pub mod conversation;

pub use conversation::{ConversationHistory, Message, SequenceGap};
