//! Hub - WebSocket 接入
//!
//! 每个连接在握手时通过 `/ws/chat?session_id=<id>` 指定会话；缺少 id 直接以 400 拒绝握手。
//! 握手后向注册表申请准入，重复连接收到一条 error 信封后被关闭。
//! 读任务把文本帧送进通道，写任务把信封序列化后写回 socket，
//! 中间由一个 TurnOrchestrator 驱动整个会话。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::admin::SessionAdmin;
use super::checkpoint::{PersistenceGateway, RetryPolicy};
use super::connection::ChannelConnection;
use super::message::Envelope;
use super::orchestrator::{OrchestratorConfig, TurnOrchestrator};
use super::registry::SessionRegistry;
use crate::config::AppConfig;
use crate::engine::EngineFactory;
use crate::store::RecordStore;

/// 握手路径
pub const CHAT_PATH: &str = "/ws/chat";

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// WebSocket 监听地址
    pub bind_addr: String,
    /// 最大并发连接数
    pub max_connections: usize,
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl HubConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            bind_addr: config.gateway.bind_addr.clone(),
            max_connections: config.gateway.max_connections,
            orchestrator: OrchestratorConfig::from(&config.session),
            retry: RetryPolicy::from(&config.persistence),
        }
    }
}

/// 连接处理需要的共享上下文
#[derive(Clone)]
struct HubContext {
    registry: Arc<SessionRegistry>,
    persistence: Arc<PersistenceGateway>,
    engines: Arc<dyn EngineFactory>,
    orchestrator: OrchestratorConfig,
    connections: Arc<AtomicUsize>,
}

pub struct Hub {
    config: HubConfig,
    context: HubContext,
    shutdown: watch::Sender<bool>,
}

impl Hub {
    pub fn new(config: HubConfig, store: Arc<dyn RecordStore>, engines: Arc<dyn EngineFactory>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let context = HubContext {
            registry: SessionRegistry::new(),
            persistence: Arc::new(PersistenceGateway::new(store, config.retry)),
            engines,
            orchestrator: config.orchestrator,
            connections: Arc::new(AtomicUsize::new(0)),
        };
        Self {
            config,
            context,
            shutdown: shutdown_tx,
        }
    }

    /// 启动网关，返回实际监听地址（bind_addr 端口为 0 时由系统分配）
    pub async fn start(&self) -> Result<SocketAddr, String> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| format!("Invalid bind address: {}", e))?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind: {}", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("Failed to read local address: {}", e))?;

        tracing::info!("Gateway listening on ws://{}{}", local_addr, CHAT_PATH);

        let mut shutdown_rx = self.shutdown.subscribe();
        let context = self.context.clone();
        let max_connections = self.config.max_connections;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                // 在 accept 循环里占位，突发连接也不会超过上限
                                let slot = ConnectionSlot::acquire(&context.connections, max_connections);
                                let context = context.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, slot, context).await {
                                        tracing::warn!("Connection error from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                }
            }
            tracing::info!("Gateway accept loop stopped");
        });

        Ok(local_addr)
    }

    /// 停止接受新连接，并取消所有活跃会话
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        for session_id in self.context.registry.active_ids() {
            self.context.registry.cancel(&session_id);
        }
    }

    pub fn admin(&self) -> SessionAdmin {
        SessionAdmin::new(
            Arc::clone(&self.context.registry),
            Arc::clone(&self.context.persistence),
        )
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.context.registry)
    }

    /// 获取活跃连接数
    pub fn connection_count(&self) -> usize {
        self.context.connections.load(Ordering::Relaxed)
    }
}

/// 连接计数，drop 时归还；超出上限的连接在握手时被拒绝
struct ConnectionSlot {
    counter: Arc<AtomicUsize>,
    over_capacity: bool,
}

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max_connections: usize) -> Self {
        let previous = counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
            over_capacity: previous >= max_connections,
        }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 从查询串中取出非空的 session_id（百分号解码；解码失败视为缺失）
fn session_id_from_query(query: Option<&str>) -> Option<String> {
    let (_, raw) = query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "session_id")?;
    let value = urlencoding::decode(raw).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    slot: ConnectionSlot,
    context: HubContext,
) -> Result<(), String> {
    if slot.over_capacity {
        tracing::warn!("Connection limit reached, refusing {}", addr);
    }

    let mut session_id: Option<String> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if slot.over_capacity {
            return Err(reject(
                StatusCode::SERVICE_UNAVAILABLE,
                "connection limit reached",
            ));
        }
        if request.uri().path() != CHAT_PATH {
            return Err(reject(StatusCode::NOT_FOUND, "unknown path"));
        }
        match session_id_from_query(request.uri().query()) {
            Some(id) => {
                session_id = Some(id);
                Ok(response)
            }
            None => Err(reject(
                StatusCode::BAD_REQUEST,
                "session_id query parameter is required",
            )),
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;
    let session_id = session_id.ok_or_else(|| "handshake accepted without session id".to_string())?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let lease = match context.registry.admit(&session_id) {
        Ok(lease) => lease,
        Err(e) => {
            tracing::warn!(session_id = %session_id, "Rejecting connection from {}: {}", addr, e);
            if let Ok(text) = Envelope::error(e.to_string()).to_json() {
                let _ = ws_tx.send(WsMessage::Text(text)).await;
            }
            let _ = ws_tx.close().await;
            return Ok(());
        }
    };

    tracing::info!(session_id = %session_id, "New WebSocket connection from {}", addr);

    let cancel = lease.cancel_token();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to serialize envelope: {}", e);
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                msg = ws_rx.next() => msg,
            };
            match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if inbound_tx.send(text).is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("WebSocket receive error: {}", e);
                    break;
                }
            }
        }
        // 传输关闭即断线：让 Orchestrator 立即取消进行中的工作
        reader_cancel.cancel();
    });

    let orchestrator = TurnOrchestrator::new(
        lease,
        ChannelConnection::new(inbound_rx, outbound_tx),
        Arc::clone(&context.persistence),
        Arc::clone(&context.engines),
        context.orchestrator,
    );
    let outcome = orchestrator.run().await;

    let _ = writer.await;
    reader.abort();

    tracing::info!(
        session_id = %session_id,
        checkpoints = outcome.checkpoints,
        "WebSocket connection closed: {}",
        addr
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_query() {
        assert_eq!(session_id_from_query(Some("session_id=abc")), Some("abc".to_string()));
        assert_eq!(
            session_id_from_query(Some("token=x&session_id=s-1")),
            Some("s-1".to_string())
        );
        assert_eq!(session_id_from_query(Some("session_id=")), None);
        assert_eq!(session_id_from_query(Some("other=1")), None);
        assert_eq!(session_id_from_query(None), None);
        assert_eq!(session_id_from_query(Some("session_id=a%2Fb")), Some("a/b".to_string()));
        assert_eq!(
            session_id_from_query(Some("session_id=a%2Fb")),
            session_id_from_query(Some("session_id=a/b"))
        );
        assert_eq!(session_id_from_query(Some("session_id=%20%20")), None);
        assert_eq!(session_id_from_query(Some("session_id=%FF")), None);
    }

    #[test]
    fn test_config_from_app_config() {
        let mut app = AppConfig::default();
        app.gateway.bind_addr = "0.0.0.0:9000".to_string();
        app.persistence.max_attempts = 7;
        app.session.input_timeout_secs = Some(60);

        let config = HubConfig::from_app_config(&app);
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(
            config.orchestrator.input_timeout,
            Some(std::time::Duration::from_secs(60))
        );
    }
}
