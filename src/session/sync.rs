/// 访问管理器调用适配
///
/// 为每次调用加上超时，并把后端结果翻译成会话层的错误和结果。
use super::Session;
use crate::access::{AccessGrant, AccessManager, AccessRefusal, AuthorizeResult, Credentials, SessionId, UsageResponse};
use crate::error::{SessionError, TunnelError};
use crate::usage::Traffic;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 一次用量上报的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// 已送达
    Acked(Traffic),
    /// 已送达，但会话必须终止
    Revoked(AccessRefusal),
    /// 调用失败，增量已放回会话等待下次同步
    Failed(Traffic),
}

/// 带超时的访问管理器调用
#[derive(Clone)]
pub struct AccessSync {
    manager: Arc<dyn AccessManager>,
    timeout: Duration,
}

impl AccessSync {
    pub fn new(manager: Arc<dyn AccessManager>, timeout: Duration) -> Self {
        Self { manager, timeout }
    }

    pub fn manager(&self) -> &Arc<dyn AccessManager> {
        &self.manager
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 授权凭据
    ///
    /// 拒绝映射为 `AccessError`；超时或后端故障映射为 `GeneralError`。
    pub async fn authorize(
        &self,
        credentials: &Credentials,
        remote: SocketAddr,
    ) -> Result<AccessGrant, SessionError> {
        let result = tokio::time::timeout(self.timeout, self.manager.authorize(credentials, remote))
            .await
            .unwrap_or_else(|_| Err(TunnelError::timeout(self.timeout)));

        match result {
            Ok(AuthorizeResult::Granted(grant)) => Ok(grant),
            Ok(AuthorizeResult::Refused(reason)) => Err(SessionError::access(format!(
                "Access refused: {}",
                reason
            ))
            .with_endpoint(remote)
            .with_request_id(credentials.token_id.clone())),
            Err(e) => Err(SessionError::general(format!(
                "Access manager ({}) failed to authorize: {}",
                self.manager.name(),
                e
            ))
            .with_endpoint(remote)
            .with_request_id(credentials.token_id.clone())),
        }
    }

    /// 释放一个已授权但未建立的会话
    ///
    /// 以零用量上报关闭，尽力而为，失败只记日志。
    pub async fn release(&self, session_id: SessionId) {
        let result = tokio::time::timeout(
            self.timeout,
            self.manager
                .report_usage(session_id, Traffic::default(), true),
        )
        .await
        .unwrap_or_else(|_| Err(TunnelError::timeout(self.timeout)));

        match result {
            Ok(_) => debug!("Granted session released. SessionId: {}", session_id),
            Err(e) => warn!(
                "Failed to release granted session. SessionId: {}, Backend: {}, Error: {}",
                session_id,
                self.manager.name(),
                e
            ),
        }
    }

    /// 取出会话的用量增量并上报；失败时放回
    pub(crate) async fn report(&self, session: &Session, closed: bool) -> SyncOutcome {
        let delta = session.take_usage();
        let result = tokio::time::timeout(
            self.timeout,
            self.manager.report_usage(session.id(), delta, closed),
        )
        .await
        .unwrap_or_else(|_| Err(TunnelError::timeout(self.timeout)));

        match result {
            Ok(UsageResponse::Ack) => {
                debug!(
                    "Usage synced. SessionId: {}, Sent: {}, Received: {}, Closed: {}",
                    session.id(),
                    delta.sent,
                    delta.received,
                    closed
                );
                SyncOutcome::Acked(delta)
            }
            Ok(UsageResponse::Revoke(reason)) => SyncOutcome::Revoked(reason),
            Err(e) => {
                session.restore_usage(delta);
                warn!(
                    "Usage sync failed, will retry. SessionId: {}, Backend: {}, Error: {}",
                    session.id(),
                    self.manager.name(),
                    e
                );
                SyncOutcome::Failed(delta)
            }
        }
    }
}
