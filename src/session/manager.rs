use super::{AccessSync, CloseReason, DrainOutcome, Session, SessionStatus, SyncOutcome};
use crate::access::{AccessGrant, AccessManager, Credentials, SessionId};
use crate::client_stream::{ClientStream, TcpClientStream};
use crate::config::{AppConfig, SessionConfig};
use crate::error::SessionError;
use crate::event_reporter::ErrorReporters;
use crate::netscan::NetScanProtector;
use crate::rate_limiter::RateLimiter;
use crate::usage::SessionStats;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 一轮 `sync_all` 的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub synced: usize,
    pub revoked: usize,
    pub failed: usize,
}

/// 会话管理器
///
/// 会话表是并发 map，各会话各自加锁，互不争用。
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    access: AccessSync,
    net_scan: Option<NetScanProtector>,
    rate_limiter: Option<RateLimiter>,
    reporters: ErrorReporters,
    config: SessionConfig,
    shutting_down: AtomicBool,
    /// 串行化会话插入，使数量上限和关闭检查在插入时生效
    insert_lock: Mutex<()>,
}

/// 授权之后插入会话表的结果
enum Admission {
    Inserted(Arc<Session>),
    Existing(Arc<Session>),
    /// 授权已获得但不能建立会话，需要通知访问管理器释放
    Released(SessionError),
    Rejected(SessionError),
}

impl SessionManager {
    pub fn new(access_manager: Arc<dyn AccessManager>, config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            access: AccessSync::new(access_manager, config.access_timeout()),
            net_scan: None,
            rate_limiter: None,
            reporters: ErrorReporters::default(),
            config,
            shutting_down: AtomicBool::new(false),
            insert_lock: Mutex::new(()),
        }
    }

    /// 按应用配置创建（含 NetScan、速率限制和上报器）
    pub fn from_config(
        access_manager: Arc<dyn AccessManager>,
        config: &AppConfig,
    ) -> anyhow::Result<Self> {
        let mut manager = Self::new(access_manager, config.session.clone())
            .with_reporters(ErrorReporters::new(&config.event_reporter));

        if let Some(net_scan) = &config.net_scan {
            manager = manager.with_net_scan(NetScanProtector::from_config(net_scan)?);
        }
        if let Some(rate_limit) = &config.rate_limit {
            manager = manager.with_rate_limiter(RateLimiter::new(rate_limit.clone()));
        }
        Ok(manager)
    }

    pub fn with_net_scan(mut self, net_scan: NetScanProtector) -> Self {
        self.net_scan = Some(net_scan);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_reporters(mut self, reporters: ErrorReporters) -> Self {
        self.reporters = reporters;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn reporters(&self) -> &ErrorReporters {
        &self.reporters
    }

    pub fn net_scan(&self) -> Option<&NetScanProtector> {
        self.net_scan.as_ref()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// 表中的会话数（含正在关闭的）
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 按日志策略记录后返回错误
    fn reject<T>(&self, err: SessionError) -> Result<T, SessionError> {
        err.log(&self.reporters);
        Err(err)
    }

    fn lookup(&self, session_id: SessionId) -> Result<Arc<Session>, SessionError> {
        match self.sessions.get(&session_id) {
            Some(entry) if entry.status() != SessionStatus::Disposed => Ok(Arc::clone(entry.value())),
            _ => Err(SessionError::session_closed(session_id)),
        }
    }

    /// 查找会话；不存在或已释放时返回 `SessionClosed`
    pub fn resolve(&self, session_id: SessionId) -> Result<Arc<Session>, SessionError> {
        self.lookup(session_id).or_else(|e| self.reject(e))
    }

    /// 授权凭据并创建会话
    ///
    /// 访问管理器返回的会话 ID 若对应表中仍可用的会话，则直接返回该会话。
    /// 关闭检查和数量上限在授权前检查一次，插入时再检查一次。
    pub async fn create_or_get(
        &self,
        credentials: &Credentials,
        remote: SocketAddr,
    ) -> Result<Arc<Session>, SessionError> {
        if self.is_shutting_down() {
            return self.reject(Self::shutting_down_error(remote));
        }

        if credentials.protocol_version < self.config.min_protocol_version {
            return self.reject(
                SessionError::unsupported_client(format!(
                    "Client protocol version {} is not supported, minimum is {}",
                    credentials.protocol_version, self.config.min_protocol_version
                ))
                .with_endpoint(remote)
                .with_request_id(credentials.client_id.clone()),
            );
        }

        if let Some(err) = self.session_limit_error(remote) {
            return self.reject(err);
        }

        let grant = match self.access.authorize(credentials, remote).await {
            Ok(grant) => grant,
            Err(e) => return self.reject(e),
        };
        let session_id = grant.session_id;

        match self.insert_granted(grant, credentials, remote) {
            Admission::Inserted(session) => {
                info!(
                    "New session created. SessionId: {}, TokenId: {}, ClientId: {}, ClientVersion: {}, Endpoint: {}",
                    session_id,
                    session.access_item().token_id,
                    credentials.client_id,
                    credentials.client_version.as_deref().unwrap_or("-"),
                    remote
                );
                Ok(session)
            }
            Admission::Existing(session) => {
                debug!(
                    "Reusing session. SessionId: {}, ClientId: {}",
                    session_id, credentials.client_id
                );
                Ok(session)
            }
            Admission::Released(err) => {
                self.access.release(session_id).await;
                self.reject(err)
            }
            Admission::Rejected(err) => self.reject(err),
        }
    }

    fn shutting_down_error(remote: SocketAddr) -> SessionError {
        SessionError::general("Server is shutting down").with_endpoint(remote)
    }

    fn session_limit_error(&self, remote: SocketAddr) -> Option<SessionError> {
        let max_sessions = self.config.max_sessions?;
        (self.sessions.len() >= max_sessions).then(|| {
            SessionError::general(format!("Session limit reached ({})", max_sessions))
                .with_endpoint(remote)
        })
    }

    /// 在插入锁内把授权结果放入会话表
    fn insert_granted(
        &self,
        grant: AccessGrant,
        credentials: &Credentials,
        remote: SocketAddr,
    ) -> Admission {
        let _guard = self.insert_lock.lock();
        let session_id = grant.session_id;

        let existing = self
            .sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(existing) = existing {
            if existing.status().accepts_streams() && !self.is_shutting_down() {
                return Admission::Existing(existing);
            }
            return Admission::Rejected(
                SessionError::session_closed(session_id).with_endpoint(remote),
            );
        }

        if self.is_shutting_down() {
            return Admission::Released(
                Self::shutting_down_error(remote).with_session(session_id),
            );
        }
        if let Some(err) = self.session_limit_error(remote) {
            return Admission::Released(err.with_session(session_id));
        }

        let session = Arc::new(Session::new(grant, credentials.client_id.clone(), remote));
        self.sessions.insert(session_id, Arc::clone(&session));
        Admission::Inserted(session)
    }

    /// 包装一条已接受的 TCP 连接，使用配置的优雅关闭时间预算
    pub fn wrap_tcp_stream(&self, stream: TcpStream) -> io::Result<Arc<TcpClientStream>> {
        Ok(Arc::new(
            TcpClientStream::new(stream)?
                .with_dispose_timeout(self.config.stream_dispose_timeout()),
        ))
    }

    /// 接入一个客户端流
    ///
    /// 依次经过速率限制、NetScan、会话查找，最后接入。
    /// 被拒绝时调用方负责关闭底层连接。
    pub fn admit_stream(
        &self,
        session_id: SessionId,
        stream_id: &str,
        stream: Arc<dyn ClientStream>,
        remote: SocketAddr,
    ) -> Result<(), SessionError> {
        if let Some(limiter) = &self.rate_limiter {
            if let Err(e) = limiter.check_admission(remote) {
                return self.reject(e.with_session(session_id).with_request_id(stream_id));
            }
        }

        if let Some(net_scan) = &self.net_scan {
            if let Err(e) = net_scan.check(remote) {
                return self.reject(e.with_session(session_id).with_request_id(stream_id));
            }
        }

        let result = self
            .lookup(session_id)
            .and_then(|session| session.attach_stream(stream_id, stream));
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.reject(e.with_endpoint(remote).with_request_id(stream_id)),
        }
    }

    /// 记录会话用量
    pub fn record_usage(
        &self,
        session_id: SessionId,
        sent: u64,
        received: u64,
    ) -> Result<(), SessionError> {
        match self
            .lookup(session_id)
            .and_then(|session| session.record_usage(sent, received))
        {
            Ok(()) => Ok(()),
            Err(e) => self.reject(e),
        }
    }

    /// 分离并关闭一个流
    pub async fn detach_stream(
        &self,
        session_id: SessionId,
        stream_id: &str,
        graceful: bool,
    ) -> Result<(), SessionError> {
        let session = self.resolve(session_id)?;
        match session.close_stream(stream_id, graceful).await {
            Ok(()) => Ok(()),
            Err(e) => self.reject(e),
        }
    }

    /// 管理停止一个会话
    pub async fn close_session(&self, session_id: SessionId) -> Result<DrainOutcome, SessionError> {
        let session = self.resolve(session_id)?;
        session.begin_close(CloseReason::AdminStop);
        let outcome = session
            .drain_and_sync(&self.access, true, self.config.drain_timeout())
            .await;
        if outcome == DrainOutcome::Disposed {
            self.sessions.remove(&session_id);
        }
        Ok(outcome)
    }

    /// 同步所有会话的用量
    ///
    /// 各会话并发同步，单个失败不影响其他会话；失败的增量留到下一轮。
    /// 被吊销的会话随即关闭。
    pub async fn sync_all(&self) -> SyncSummary {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.status() < SessionStatus::Closed)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let results = join_all(sessions.iter().map(|s| s.sync(&self.access))).await;

        let mut summary = SyncSummary::default();
        let mut revoked = Vec::new();
        for (session, result) in sessions.into_iter().zip(results) {
            match result {
                Ok(SyncOutcome::Acked(_)) => summary.synced += 1,
                Ok(SyncOutcome::Revoked(reason)) => {
                    summary.revoked += 1;
                    session.begin_close(CloseReason::Revoked(reason));
                    revoked.push(session);
                }
                Ok(SyncOutcome::Failed(_)) => summary.failed += 1,
                // 同步期间会话已关闭，由最终同步负责
                Err(_) => {}
            }
        }

        if !revoked.is_empty() {
            let drain_timeout = self.config.drain_timeout();
            join_all(
                revoked
                    .iter()
                    .map(|s| s.drain_and_sync(&self.access, true, drain_timeout)),
            )
            .await;
            for session in &revoked {
                self.sessions.remove(&session.id());
            }
        }

        if summary.failed > 0 || summary.revoked > 0 {
            info!(
                "Usage sync finished. Synced: {}, Revoked: {}, Failed: {}",
                summary.synced, summary.revoked, summary.failed
            );
        }
        summary
    }

    /// 周期维护：清理失效流、回收空闲会话、完成关闭中的会话、清理 NetScan 表
    pub async fn run_housekeeping(&self) {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut dead_streams = Vec::new();
        for session in &sessions {
            dead_streams.extend(session.sweep_dead_streams());
            if session.is_idle_at(now, idle_timeout) {
                session.begin_close(CloseReason::IdleTimeout);
            }
        }
        join_all(dead_streams.iter().map(|s| s.dispose(false))).await;

        let closing: Vec<&Arc<Session>> = sessions
            .iter()
            .filter(|s| s.status() >= SessionStatus::Closing)
            .collect();
        join_all(
            closing
                .iter()
                .map(|s| s.drain_and_sync(&self.access, false, Duration::ZERO)),
        )
        .await;

        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.status() != SessionStatus::Disposed);
        let removed = before.saturating_sub(self.sessions.len());

        if let Some(net_scan) = &self.net_scan {
            net_scan.sweep();
        }
        self.reporters.report_if_due();

        if removed > 0 || !dead_streams.is_empty() {
            debug!(
                "Housekeeping finished. RemovedSessions: {}, DeadStreams: {}, Sessions: {}",
                removed,
                dead_streams.len(),
                self.sessions.len()
            );
        }
    }

    /// 启动后台定时任务（用量同步和周期维护），直到 `cancel` 被取消
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut sync_timer = tokio::time::interval(manager.config.sync_interval());
            let mut cleanup_timer = tokio::time::interval(manager.config.cleanup_interval());
            sync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            cleanup_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // 第一次 tick 立即完成
            sync_timer.tick().await;
            cleanup_timer.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sync_timer.tick() => {
                        manager.sync_all().await;
                    }
                    _ = cleanup_timer.tick() => {
                        manager.run_housekeeping().await;
                    }
                }
            }
            debug!("Session background tasks stopped");
        })
    }

    /// 关闭所有会话
    ///
    /// 每个会话在 `drain_timeout` 内优雅关闭剩余流，然后做最终同步。
    /// 只有第一次调用生效；之后不再接受新会话。
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("Session manager is already shut down");
            return;
        }
        // 等待正在插入的会话完成，此后的插入都会看到关闭标志
        drop(self.insert_lock.lock());

        let drain_timeout = self.config.drain_timeout();
        let mut total = 0;
        loop {
            let sessions: Vec<Arc<Session>> = self
                .sessions
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            if sessions.is_empty() {
                break;
            }
            if total == 0 {
                info!("Shutting down session manager. Sessions: {}", sessions.len());
            }
            total += sessions.len();

            join_all(sessions.iter().map(|session| async move {
                session.begin_close(CloseReason::Shutdown);
                session
                    .drain_and_sync(&self.access, true, drain_timeout)
                    .await
            }))
            .await;

            for session in &sessions {
                self.sessions.remove(&session.id());
            }
        }

        self.reporters.flush();
        info!("Session manager stopped. Sessions closed: {}", total);
    }

    /// 所有会话的统计快照（按 ID 排序）
    pub fn stats(&self) -> Vec<SessionStats> {
        let now = Instant::now();
        let mut stats: Vec<SessionStats> = self
            .sessions
            .iter()
            .map(|entry| entry.stats_at(now))
            .collect();
        stats.sort_by_key(|s| s.session_id);
        stats
    }
}
