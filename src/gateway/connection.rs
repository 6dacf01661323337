//! 连接适配器
//!
//! 包装一条物理连接：`receive_envelope` 挂起直到收到帧或传输关闭，
//! `send_envelope` 在对端消失时返回 `Disconnected`。入站帧只做结构校验。

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::message::Envelope;
use crate::core::SessionError;

#[async_trait]
pub trait ConnectionAdapter: Send + Sync {
    /// 必须可安全地在 `select!` 中取消
    async fn receive_envelope(&mut self) -> Result<Envelope, SessionError>;

    async fn send_envelope(&self, envelope: &Envelope) -> Result<(), SessionError>;
}

/// 基于通道的连接：WebSocket 的读写任务与测试客户端都通过它接入
pub struct ChannelConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl ChannelConnection {
    pub fn new(
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self { inbound, outbound }
    }

    /// 内存中的一对端点
    pub fn pair() -> (Self, ChannelClient) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Self::new(in_rx, out_tx),
            ChannelClient {
                tx: Some(in_tx),
                rx: out_rx,
            },
        )
    }
}

#[async_trait]
impl ConnectionAdapter for ChannelConnection {
    async fn receive_envelope(&mut self) -> Result<Envelope, SessionError> {
        match self.inbound.recv().await {
            Some(frame) => Envelope::parse(&frame),
            None => Err(SessionError::Disconnected),
        }
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<(), SessionError> {
        self.outbound
            .send(envelope.clone())
            .map_err(|_| SessionError::Disconnected)
    }
}

/// ChannelConnection 的客户端一侧
pub struct ChannelClient {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl ChannelClient {
    pub fn send(&self, envelope: &Envelope) -> bool {
        match serde_json::to_string(envelope) {
            Ok(frame) => self.send_raw(&frame),
            Err(_) => false,
        }
    }

    /// 发送原始帧（可以是非法 JSON）
    pub fn send_raw(&self, frame: &str) -> bool {
        self.tx
            .as_ref()
            .map(|tx| tx.send(frame.to_string()).is_ok())
            .unwrap_or(false)
    }

    pub fn send_task(&self, content: &str) -> bool {
        self.send(&Envelope::text("user", content))
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// 关闭入站方向，服务端随后看到 Disconnected
    pub fn disconnect(&mut self) {
        self.tx.take();
    }
}
