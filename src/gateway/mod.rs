//! 会话网关
//!
//! 一条长连接对应一个会话，一个会话由一个 [`TurnOrchestrator`] 驱动：
//!
//! - **registry**：会话 id → 活跃持有者，保证同一 id 至多一个连接
//! - **connection**：连接适配器，入站帧在这里解析为 [`Envelope`]
//! - **input**：把引擎的「问人」回调桥接到异步的客户端回复
//! - **checkpoint**：历史与引擎状态的原子 checkpoint（分代暂存 + 单次提交）
//! - **orchestrator**：回合状态机
//! - **admin**：会话查询 / 创建 / 删除
//! - **hub**：WebSocket 接入（feature `gateway`）

pub mod admin;
pub mod checkpoint;
pub mod connection;
#[cfg(feature = "gateway")]
pub mod hub;
pub mod input;
pub mod message;
pub mod orchestrator;
pub mod registry;

pub use admin::{SessionAdmin, SessionInfo};
pub use checkpoint::{Checkpoint, PersistenceGateway, RetryPolicy};
pub use connection::{ChannelClient, ChannelConnection, ConnectionAdapter};
#[cfg(feature = "gateway")]
pub use hub::{Hub, HubConfig, CHAT_PATH};
pub use input::{InputBroker, InputError, PendingInputRequest};
pub use message::{Envelope, EnvelopeKind, SYSTEM_SOURCE};
pub use orchestrator::{OrchestratorConfig, TurnOrchestrator};
pub use registry::{RegistryError, SessionLease, SessionRegistry};
