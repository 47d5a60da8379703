/// 会话
///
/// 一个会话对应一条已认证的隧道，持有其下的客户端流集合和用量累计。
///
/// 状态机：`Created -> Active -> Closing -> Closed -> Disposed`
/// - 第一个流接入后 `Created -> Active`
/// - 吊销、空闲超时或管理停止时进入 `Closing`，不再接入新流
/// - 所有流都已分离后进入 `Closed`，之后不再接受用量
/// - 最后一次用量同步（失败也不阻塞）之后进入 `Disposed`，终态
pub mod manager;
pub mod sync;

pub use manager::{SessionManager, SyncSummary};
pub use sync::{AccessSync, SyncOutcome};

use crate::access::{AccessGrant, AccessItem, AccessRefusal, SessionId};
use crate::client_stream::ClientStream;
use crate::error::SessionError;
use crate::usage::{SessionStats, Traffic, UsageCounter};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 会话状态（有序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Closing,
    Closed,
    Disposed,
}

impl SessionStatus {
    /// 是否还能接入新流
    pub fn accepts_streams(self) -> bool {
        matches!(self, Self::Created | Self::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::Active => "Active",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Disposed => "Disposed",
        };
        f.write_str(name)
    }
}

/// 会话关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 访问管理器吊销
    Revoked(AccessRefusal),
    IdleTimeout,
    AdminStop,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Revoked(reason) => write!(f, "revoked ({})", reason),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::AdminStop => write!(f, "administrative stop"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// `drain_and_sync` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// 会话已释放
    Disposed,
    /// 仍有流未分离，会话保持 Closing
    Pending,
}

struct SessionState {
    status: SessionStatus,
    streams: HashMap<String, Arc<dyn ClientStream>>,
    close_reason: Option<CloseReason>,
}

impl SessionState {
    /// 所有流都已分离时 `Closing -> Closed`
    fn settle(&mut self) -> bool {
        if self.status == SessionStatus::Closing && self.streams.is_empty() {
            self.status = SessionStatus::Closed;
            return true;
        }
        false
    }
}

pub struct Session {
    id: SessionId,
    access_item: AccessItem,
    client_id: String,
    remote_endpoint: SocketAddr,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    state: Mutex<SessionState>,
    usage: UsageCounter,
    /// 串行化同一会话上的用量同步
    sync_lock: tokio::sync::Mutex<()>,
    state_changed: Notify,
}

impl Session {
    pub fn new(grant: AccessGrant, client_id: impl Into<String>, remote_endpoint: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: grant.session_id,
            access_item: grant.access_item,
            client_id: client_id.into(),
            remote_endpoint,
            created_at: now,
            last_activity: Mutex::new(now),
            state: Mutex::new(SessionState {
                status: SessionStatus::Created,
                streams: HashMap::new(),
                close_reason: None,
            }),
            usage: UsageCounter::new(),
            sync_lock: tokio::sync::Mutex::new(()),
            state_changed: Notify::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn access_item(&self) -> &AccessItem {
        &self.access_item
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_endpoint
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().close_reason.clone()
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// 尚未同步的用量
    pub fn pending_usage(&self) -> Traffic {
        self.usage.peek()
    }

    /// 会话建立以来的总用量
    pub fn total_usage(&self) -> Traffic {
        self.usage.total()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn closed_error(&self) -> SessionError {
        SessionError::session_closed(self.id).with_endpoint(self.remote_endpoint)
    }

    /// 接入一个客户端流
    pub fn attach_stream(
        &self,
        stream_id: &str,
        stream: Arc<dyn ClientStream>,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if !state.status.accepts_streams() {
            return Err(self.closed_error().with_request_id(stream_id));
        }

        if state.streams.contains_key(stream_id) {
            return Err(SessionError::general(format!(
                "Stream {} is already attached to the session",
                stream_id
            ))
            .with_session(self.id)
            .with_endpoint(stream.endpoint_pair().remote)
            .with_request_id(stream_id));
        }

        if stream.is_disposed() {
            return Err(SessionError::general("Cannot attach a disposed stream")
                .with_session(self.id)
                .with_request_id(stream_id));
        }

        match stream.stream_id() {
            Some(existing) if existing == stream_id => {}
            _ => stream
                .set_stream_id(stream_id)
                .map_err(|e| e.with_session(self.id))?,
        }

        state.streams.insert(stream_id.to_string(), stream);
        if state.status == SessionStatus::Created {
            state.status = SessionStatus::Active;
        }
        let count = state.streams.len();
        drop(state);

        self.touch();
        debug!(
            "Stream attached. SessionId: {}, StreamId: {}, Streams: {}",
            self.id, stream_id, count
        );
        Ok(())
    }

    /// 分离一个流（调用方负责关闭它）
    pub fn detach_stream(&self, stream_id: &str) -> Result<Arc<dyn ClientStream>, SessionError> {
        let mut state = self.state.lock();
        if state.status == SessionStatus::Disposed {
            return Err(self.closed_error().with_request_id(stream_id));
        }

        let stream = state.streams.remove(stream_id).ok_or_else(|| {
            SessionError::general(format!("Stream {} is not attached", stream_id))
                .with_session(self.id)
                .with_request_id(stream_id)
        })?;
        let settled = state.settle();
        drop(state);

        if settled {
            debug!("Session {} has no streams left and is closed", self.id);
        }
        self.state_changed.notify_waiters();
        Ok(stream)
    }

    /// 分离并关闭一个流
    pub async fn close_stream(&self, stream_id: &str, graceful: bool) -> Result<(), SessionError> {
        let stream = self.detach_stream(stream_id)?;
        stream.dispose(graceful).await;
        Ok(())
    }

    /// 累加用量，可由多个流并发调用
    pub fn record_usage(&self, sent: u64, received: u64) -> Result<(), SessionError> {
        {
            // 持有状态锁写入，保证进入 Closed 之后没有新的用量
            let state = self.state.lock();
            if state.status >= SessionStatus::Closed {
                return Err(self.closed_error());
            }
            self.usage.add(sent, received);
        }

        if sent > 0 || received > 0 {
            self.touch();
        }
        Ok(())
    }

    /// 开始关闭，返回是否由本次调用触发
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        let mut state = self.state.lock();
        if !state.status.accepts_streams() {
            return false;
        }

        info!(
            "Session is closing. SessionId: {}, Reason: {}, Streams: {}",
            self.id,
            reason,
            state.streams.len()
        );
        state.status = SessionStatus::Closing;
        state.close_reason = Some(reason);
        drop(state);

        self.state_changed.notify_waiters();
        true
    }

    /// 没有流时完成 `Closing -> Closed`，返回会话是否已至少处于 Closed
    pub fn try_close(&self) -> bool {
        let mut state = self.state.lock();
        state.settle();
        state.status >= SessionStatus::Closed
    }

    /// 是否空闲超时：无流且超过 `idle_timeout` 没有活动
    pub fn is_idle_at(&self, now: Instant, idle_timeout: Duration) -> bool {
        let state = self.state.lock();
        state.status.accepts_streams()
            && state.streams.is_empty()
            && now.saturating_duration_since(self.last_activity()) >= idle_timeout
    }

    /// 分离已失效（已关闭或探测失败）的流，返回它们由调用方关闭
    pub fn sweep_dead_streams(&self) -> Vec<Arc<dyn ClientStream>> {
        let candidates: Vec<(String, Arc<dyn ClientStream>)> = self
            .state
            .lock()
            .streams
            .iter()
            .map(|(id, stream)| (id.clone(), Arc::clone(stream)))
            .collect();

        // 探测在锁外进行
        let dead: Vec<(String, Arc<dyn ClientStream>)> = candidates
            .into_iter()
            .filter(|(_, stream)| stream.is_disposed() || !stream.check_is_alive())
            .collect();
        if dead.is_empty() {
            return Vec::new();
        }

        let mut state = self.state.lock();
        let mut removed = Vec::with_capacity(dead.len());
        for (id, stream) in dead {
            // 探测期间该 ID 可能已被替换
            if matches!(state.streams.get(&id), Some(current) if Arc::ptr_eq(current, &stream)) {
                state.streams.remove(&id);
                debug!("Dead stream removed. SessionId: {}, StreamId: {}", self.id, id);
                removed.push(stream);
            }
        }
        state.settle();
        drop(state);

        if !removed.is_empty() {
            self.state_changed.notify_waiters();
        }
        removed
    }

    pub(crate) fn take_usage(&self) -> Traffic {
        self.usage.take()
    }

    pub(crate) fn restore_usage(&self, traffic: Traffic) {
        self.usage.restore(traffic)
    }

    /// 周期同步：上报当前增量
    ///
    /// 已进入 Closed 的会话由最终同步负责，这里返回 `SessionClosed`。
    pub async fn sync(&self, access: &AccessSync) -> Result<SyncOutcome, SessionError> {
        let _guard = self.sync_lock.lock().await;
        if self.status() >= SessionStatus::Closed {
            return Err(self.closed_error());
        }
        Ok(access.report(self, false).await)
    }

    /// 关闭并做最终同步
    ///
    /// `force` 为 true 时在 `wait` 内优雅关闭所有剩余流，超时则强制关闭；
    /// 为 false 时最多等待 `wait` 让流自行分离，仍有流则返回 [`DrainOutcome::Pending`]。
    /// 关闭原因由调用方先通过 [`Session::begin_close`] 设置，未设置时记为管理停止。
    pub async fn drain_and_sync(
        &self,
        access: &AccessSync,
        force: bool,
        wait: Duration,
    ) -> DrainOutcome {
        if self.status() == SessionStatus::Disposed {
            return DrainOutcome::Disposed;
        }
        self.begin_close(CloseReason::AdminStop);

        if force {
            self.dispose_all_streams(wait).await;
        } else if !self.wait_for_streams(wait).await {
            return DrainOutcome::Pending;
        }

        self.finalize(access).await;
        DrainOutcome::Disposed
    }

    /// 取走并关闭所有流，整体耗时以 `wait` 为界
    ///
    /// 到期仍未完成优雅关闭的流被强制关闭。
    async fn dispose_all_streams(&self, wait: Duration) {
        let streams: Vec<Arc<dyn ClientStream>> = {
            let mut state = self.state.lock();
            let streams = state.streams.drain().map(|(_, s)| s).collect();
            state.settle();
            streams
        };
        self.state_changed.notify_waiters();

        if streams.is_empty() {
            return;
        }

        let deadline = Instant::now() + wait;
        let forced = join_all(streams.iter().map(|stream| async move {
            if tokio::time::timeout_at(deadline, stream.dispose(true))
                .await
                .is_err()
            {
                stream.force_close();
                return true;
            }
            false
        }))
        .await
        .into_iter()
        .filter(|forced| *forced)
        .count();

        if forced > 0 {
            warn!(
                "Session {} streams did not close within {:?}, forced: {}",
                self.id, wait, forced
            );
        }
    }

    /// 等待流全部分离，返回会话是否已进入 Closed
    async fn wait_for_streams(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_close() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_close();
            }
        }
    }

    /// 最终同步并释放；重复调用不会再次同步
    async fn finalize(&self, access: &AccessSync) {
        let _guard = self.sync_lock.lock().await;
        if self.status() == SessionStatus::Disposed {
            return;
        }

        if let SyncOutcome::Failed(delta) = access.report(self, true).await {
            warn!(
                "Final usage sync failed, usage is dropped. SessionId: {}, Sent: {}, Received: {}",
                self.id, delta.sent, delta.received
            );
        }

        let reason = {
            let mut state = self.state.lock();
            state.status = SessionStatus::Disposed;
            state.streams.clear();
            state.close_reason.clone()
        };
        self.state_changed.notify_waiters();

        info!(
            "Session disposed. SessionId: {}, Reason: {}, Total: {}/{}",
            self.id,
            reason.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string()),
            self.usage.total().sent,
            self.usage.total().received
        );
    }

    pub fn stats_at(&self, now: Instant) -> SessionStats {
        let (status, stream_count) = {
            let state = self.state.lock();
            (state.status, state.streams.len())
        };
        SessionStats {
            session_id: self.id,
            token_id: self.access_item.token_id.clone(),
            status,
            stream_count,
            pending: self.usage.peek(),
            total: self.usage.total(),
            age_secs: now.saturating_duration_since(self.created_at).as_secs(),
            idle_secs: now.saturating_duration_since(self.last_activity()).as_secs(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats_at(Instant::now())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("token_id", &self.access_item.token_id)
            .field("status", &self.status())
            .field("streams", &self.stream_count())
            .finish()
    }
}
