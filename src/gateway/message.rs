//! 信封协议定义
//!
//! 客户端与服务端之间交换的唯一消息单位。`type` 字段决定信封种类，
//! 引擎自定义的附加字段原样透传。所有入站帧都在连接边界解析为 [`Envelope`]，
//! 解析失败即为 ValidationError，不会进入状态机内部。

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::SessionError;

/// 系统生成信封的 source
pub const SYSTEM_SOURCE: &str = "system";

/// 信封种类（封闭集合 + 引擎自定义种类）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EnvelopeKind {
    /// 文本消息；客户端发送时即为任务
    TextMessage,
    /// 引擎请求人工输入
    UserInputRequestedEvent,
    /// 客户端对输入请求的显式回复
    UserInputResponse,
    /// 引擎循环结束的簿记事件，不转发也不记录
    TaskResult,
    Error,
    /// 引擎自定义种类（如 ToolCallRequestEvent），原样转发
    Other(String),
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &str {
        match self {
            EnvelopeKind::TextMessage => "TextMessage",
            EnvelopeKind::UserInputRequestedEvent => "UserInputRequestedEvent",
            EnvelopeKind::UserInputResponse => "UserInputResponse",
            EnvelopeKind::TaskResult => "TaskResult",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Other(s) => s,
        }
    }
}

impl From<String> for EnvelopeKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "TextMessage" => EnvelopeKind::TextMessage,
            "UserInputRequestedEvent" => EnvelopeKind::UserInputRequestedEvent,
            "UserInputResponse" => EnvelopeKind::UserInputResponse,
            "TaskResult" => EnvelopeKind::TaskResult,
            "error" => EnvelopeKind::Error,
            _ => EnvelopeKind::Other(s),
        }
    }
}

impl From<EnvelopeKind> for String {
    fn from(kind: EnvelopeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 线上格式
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    content: String,
    source: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// 信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub content: String,
    pub source: String,
    /// 引擎定义的附加字段，透传
    pub extra: Map<String, Value>,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = String;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        if raw.kind.trim().is_empty() {
            return Err("envelope type must not be empty".to_string());
        }
        Ok(Self {
            kind: EnvelopeKind::from(raw.kind),
            content: raw.content,
            source: raw.source,
            extra: raw.extra,
        })
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(env: Envelope) -> Self {
        Self {
            kind: env.kind.into(),
            content: env.content,
            source: env.source,
            extra: env.extra,
        }
    }
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            source: source.into(),
            extra: Map::new(),
        }
    }

    pub fn text(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::TextMessage, content, source)
    }

    pub fn input_request(source: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::UserInputRequestedEvent, prompt, source)
    }

    pub fn task_result(content: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::TaskResult, content, SYSTEM_SOURCE)
    }

    /// `{type:"error", content, source:"system"}`
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Error, message, SYSTEM_SOURCE)
    }

    /// 故障后发给客户端的重试邀请
    pub fn retry_invitation() -> Self {
        Self::input_request(SYSTEM_SOURCE, "An error occurred. Please try again.")
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn is_task(&self) -> bool {
        self.kind == EnvelopeKind::TextMessage
    }

    pub fn is_input_request(&self) -> bool {
        self.kind == EnvelopeKind::UserInputRequestedEvent
    }

    /// 引擎循环 / 结果簿记事件：静默消费
    pub fn is_bookkeeping(&self) -> bool {
        self.kind == EnvelopeKind::TaskResult
    }

    /// 解析入站帧；任何结构错误都归为 ValidationError
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text).map_err(|e| SessionError::Validation(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::unexpected(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_text_message() {
        let env = Envelope::parse(r#"{"type":"TextMessage","content":"hello","source":"user"}"#)
            .unwrap();
        assert!(env.is_task());
        assert_eq!(env.content, "hello");
        assert_eq!(env.source, "user");
        assert!(env.extra.is_empty());
    }

    #[test]
    fn test_engine_fields_pass_through() {
        let text = r#"{"type":"ToolCallExecutionEvent","content":"ok","source":"search_agent","models_usage":{"prompt_tokens":12},"id":"abc"}"#;
        let env = Envelope::parse(text).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Other("ToolCallExecutionEvent".to_string()));
        assert_eq!(env.extra.get("id"), Some(&json!("abc")));

        let out: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(out["type"], "ToolCallExecutionEvent");
        assert_eq!(out["models_usage"]["prompt_tokens"], 12);

        let tagged = Envelope::text("agent", "hi").with_field("turn", json!(2));
        let out: Value = serde_json::from_str(&tagged.to_json().unwrap()).unwrap();
        assert_eq!(out["turn"], 2);
        assert_eq!(out["type"], "TextMessage");
    }

    #[test]
    fn test_malformed_is_validation_error() {
        for text in [
            "not json",
            r#"{"content":"x","source":"user"}"#,
            r#"{"type":"TextMessage","source":"user"}"#,
            r#"{"type":"TextMessage","content":42,"source":"user"}"#,
            r#"{"type":"","content":"x","source":"user"}"#,
        ] {
            let err = Envelope::parse(text).unwrap_err();
            assert!(matches!(err, SessionError::Validation(_)), "{text}");
        }
    }

    #[test]
    fn test_error_envelope_shape() {
        let out: Value = serde_json::from_str(&Envelope::error("boom").to_json().unwrap()).unwrap();
        assert_eq!(out, json!({"type": "error", "content": "boom", "source": "system"}));
    }

    #[test]
    fn test_kind_predicates() {
        assert!(Envelope::task_result("done").is_bookkeeping());
        assert!(Envelope::retry_invitation().is_input_request());
        assert!(!Envelope::new(EnvelopeKind::UserInputResponse, "y", "user").is_task());
    }
}
