//! 人工输入桥接
//!
//! 引擎以同步风格调用 `provide(prompt)`，InputBroker 把它桥接到异步传输：
//! 登记唯一的待处理请求，挂起在 oneshot 上，由 Orchestrator 的接收循环投递回复。
//! 断线（取消令牌触发）时挂起的调用以 `Disconnected` 返回，不会永久悬挂。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::engine::InputProvider;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("Client disconnected while waiting for input")]
    Disconnected,

    /// 同一会话出现第二个并发请求：Orchestrator 的编程错误
    #[error("An input request is already pending")]
    AlreadyPending,

    #[error("Timed out waiting for user input after {0:?}")]
    TimedOut(Duration),
}

/// 待处理的输入请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingInputRequest {
    pub prompt: String,
    pub issued_at: DateTime<Utc>,
}

impl PendingInputRequest {
    fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            issued_at: Utc::now(),
        }
    }
}

enum Slot {
    Idle,
    /// 引擎已发出输入请求事件，但尚未调用 provide
    Announced(PendingInputRequest),
    Waiting {
        request: PendingInputRequest,
        tx: oneshot::Sender<String>,
    },
    /// 回复先于 provide 到达，暂存
    Answered(String),
}

/// 单会话的输入代理，同一时刻至多一个待处理请求
pub struct InputBroker {
    slot: Mutex<Slot>,
    notices: mpsc::UnboundedSender<PendingInputRequest>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl InputBroker {
    /// 返回 broker 与「请求通知」接收端；引擎未自行发出请求事件时，通知由 Orchestrator 转成信封发给客户端
    pub fn new(
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PendingInputRequest>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let broker = Arc::new(Self {
            slot: Mutex::new(Slot::Idle),
            notices,
            cancel,
            timeout,
        });
        (broker, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Orchestrator 已把引擎的输入请求事件转发给客户端
    pub fn announce(&self, prompt: &str) {
        let mut slot = self.lock();
        if matches!(*slot, Slot::Idle) {
            *slot = Slot::Announced(PendingInputRequest::new(prompt));
        }
    }

    /// 投递客户端回复；没有请求在等待时返回 false（调用方丢弃该信封）
    pub fn deliver(&self, reply: String) -> bool {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Waiting { tx, .. } => tx.send(reply).is_ok(),
            Slot::Announced(_) => {
                *slot = Slot::Answered(reply);
                true
            }
            Slot::Answered(prev) => {
                *slot = Slot::Answered(prev);
                false
            }
            Slot::Idle => false,
        }
    }

    /// 取走提前到达的回复
    pub fn take_answer(&self) -> Option<String> {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Answered(reply) => Some(reply),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub fn pending(&self) -> Option<PendingInputRequest> {
        match &*self.lock() {
            Slot::Announced(request) | Slot::Waiting { request, .. } => Some(request.clone()),
            _ => None,
        }
    }

    pub fn is_expecting(&self) -> bool {
        self.pending().is_some()
    }

    /// 回合结束或会话终止时清空；等待中的 provide 收到 Disconnected
    pub fn clear(&self) {
        *self.lock() = Slot::Idle;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[async_trait]
impl InputProvider for InputBroker {
    async fn provide(&self, prompt: &str) -> Result<String, InputError> {
        let rx = {
            let mut slot = self.lock();
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Waiting { request, tx } => {
                    *slot = Slot::Waiting { request, tx };
                    return Err(InputError::AlreadyPending);
                }
                Slot::Answered(reply) => return Ok(reply),
                Slot::Announced(request) => {
                    let (tx, rx) = oneshot::channel();
                    *slot = Slot::Waiting { request, tx };
                    rx
                }
                Slot::Idle => {
                    let request = PendingInputRequest::new(prompt);
                    let _ = self.notices.send(request.clone());
                    let (tx, rx) = oneshot::channel();
                    *slot = Slot::Waiting { request, tx };
                    rx
                }
            }
        };

        let _guard = WaitGuard { broker: self };
        tokio::select! {
            reply = rx => reply.map_err(|_| InputError::Disconnected),
            _ = self.cancel.cancelled() => Err(InputError::Disconnected),
            _ = expire(self.timeout) => Err(InputError::TimedOut(self.timeout.unwrap_or_default())),
        }
    }
}

/// provide 的 future 被丢弃（或返回）时，清掉自己留下的 Waiting
struct WaitGuard<'a> {
    broker: &'a InputBroker,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.broker.lock();
        if let Slot::Waiting { tx, .. } = &*slot {
            if tx.is_closed() {
                *slot = Slot::Idle;
            }
        }
    }
}

/// 可选的等待上限；None 时永不触发
pub(crate) fn expire(timeout: Option<Duration>) -> impl Future<Output = ()> {
    async move {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    }
}
