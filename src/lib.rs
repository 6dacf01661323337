//! Convoy - 会话回合编排器
//!
//! 在一个人类客户端与多轮对话引擎之间维持长连接，checkpoint 对话历史与引擎状态，
//! 使会话能跨进程重启与客户端重连继续。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话错误分类、回合状态、会话监管（取消）
//! - **engine**: 对话引擎抽象与内置引擎（脚本 / 回显）
//! - **gateway**: 注册表、连接适配、输入桥接、checkpoint、回合编排、WebSocket 接入
//! - **memory**: 对话历史
//! - **observability**: tracing 初始化
//! - **store**: 记录存储（内存 / SQLite）

pub mod config;
pub mod core;
pub mod engine;
pub mod gateway;
pub mod memory;
pub mod observability;
pub mod store;

pub use crate::core::{SessionError, SessionOutcome, TurnState};
pub use crate::gateway::{Envelope, EnvelopeKind, TurnOrchestrator};
