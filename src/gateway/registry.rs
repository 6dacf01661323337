//! 会话注册表
//!
//! 进程内唯一的共享结构：session id → 活跃 Orchestrator。同一 id 至多一个活跃持有者，
//! 第二个连接直接被拒绝（不抢占）。准入凭证 [`SessionLease`] 在 drop 时自动释放。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::SessionSupervisor;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session {0} is already active")]
    AlreadyActive(String),
}

struct ActiveEntry {
    lease_id: u64,
    supervisor: SessionSupervisor,
    admitted_at: DateTime<Utc>,
}

/// 活跃会话表
#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<String, ActiveEntry>>,
    next_lease: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveEntry>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 准入；同一 id 的并发调用恰好一个成功
    pub fn admit(self: &Arc<Self>, session_id: &str) -> Result<SessionLease, RegistryError> {
        let mut active = self.lock();
        if active.contains_key(session_id) {
            return Err(RegistryError::AlreadyActive(session_id.to_string()));
        }
        let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let supervisor = SessionSupervisor::new();
        active.insert(
            session_id.to_string(),
            ActiveEntry {
                lease_id,
                supervisor: supervisor.clone(),
                admitted_at: Utc::now(),
            },
        );
        tracing::debug!(session_id, lease_id, "Session admitted");
        Ok(SessionLease {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
            lease_id,
            supervisor,
        })
    }

    fn release_lease(&self, session_id: &str, lease_id: u64) {
        let mut active = self.lock();
        if active.get(session_id).map(|e| e.lease_id) == Some(lease_id) {
            active.remove(session_id);
            tracing::debug!(session_id, lease_id, "Session released");
        }
    }

    /// 取消活跃会话的运行（断开其引擎与输入等待）
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.lock().get(session_id) {
            Some(entry) => {
                if !entry.supervisor.is_cancelled() {
                    tracing::debug!(session_id, lease_id = entry.lease_id, "Session cancelled");
                    entry.supervisor.cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn admitted_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.lock().get(session_id).map(|e| e.admitted_at)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

/// 准入凭证，持有期间该 id 不会被再次准入
pub struct SessionLease {
    registry: Arc<SessionRegistry>,
    session_id: String,
    lease_id: u64,
    supervisor: SessionSupervisor,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.supervisor.cancel_token()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release_lease(&self.session_id, self.lease_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_admit_rejected() {
        let registry = SessionRegistry::new();
        let lease = registry.admit("s1").unwrap();
        assert_eq!(lease.session_id(), "s1");
        assert!(matches!(
            registry.admit("s1"),
            Err(RegistryError::AlreadyActive(id)) if id == "s1"
        ));
        assert!(registry.admit("s2").is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let registry = SessionRegistry::new();
        let lease = registry.admit("s1").unwrap();
        assert!(registry.is_active("s1"));
        assert_eq!(registry.active_count(), 1);
        drop(lease);
        assert!(!registry.is_active("s1"));
        assert_eq!(registry.active_count(), 0);
        assert!(registry.admit("s1").is_ok());
    }

    #[test]
    fn test_id_stays_held_until_lease_drops() {
        let registry = SessionRegistry::new();
        let lease = registry.admit("s1").unwrap();
        assert!(registry.cancel("s1"));
        // 取消只通知持有者，准入直到凭证释放才归还
        assert!(matches!(
            registry.admit("s1"),
            Err(RegistryError::AlreadyActive(_))
        ));
        drop(lease);
        let _next = registry.admit("s1").unwrap();
        assert!(registry.is_active("s1"));
    }

    #[test]
    fn test_cancel_reaches_lease_token() {
        let registry = SessionRegistry::new();
        let lease = registry.admit("s1").unwrap();
        let token = lease.cancel_token();
        assert!(registry.cancel("s1"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel("missing"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admit_exactly_one_wins() {
        let registry = SessionRegistry::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.admit("contested")
            }));
        }
        let mut leases = Vec::new();
        let mut rejected = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(lease) => leases.push(lease),
                Err(RegistryError::AlreadyActive(_)) => rejected += 1,
            }
        }
        assert_eq!(leases.len(), 1);
        assert_eq!(rejected, 15);
    }
}
