/// 错误类型定义
///
/// 会话层的失败统一使用 [`SessionError`] 携带（远端地址、所属会话、错误码、请求 ID、描述），
/// 每个错误码通过 [`SessionErrorCode::log_policy`] 查表决定日志级别以及是否聚合上报。
/// 基础设施层（配置、文件、HTTP、超时）的失败使用 [`TunnelError`]。
use crate::access::SessionId;
use crate::event_reporter::ErrorReporters;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::Level;

/// 按运行时级别输出 tracing 事件
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {{
        let level: ::tracing::Level = $level;
        if level == ::tracing::Level::ERROR {
            ::tracing::error!($($arg)+)
        } else if level == ::tracing::Level::WARN {
            ::tracing::warn!($($arg)+)
        } else if level == ::tracing::Level::INFO {
            ::tracing::info!($($arg)+)
        } else if level == ::tracing::Level::DEBUG {
            ::tracing::debug!($($arg)+)
        } else {
            ::tracing::trace!($($arg)+)
        }
    }};
}

/// 会话错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorCode {
    /// 内部错误：重复 ID、后端超时、不变量被破坏等
    GeneralError,
    /// 凭据被拒绝、吊销或过期
    AccessError,
    /// 会话已终止或不存在
    SessionClosed,
    /// 客户端协议版本不受支持
    UnsupportedClient,
    /// 同一地址在滑动窗口内的接入次数超限
    NetScanExceeded,
    /// 全局接入速率超限
    AdmissionThrottled,
}

impl SessionErrorCode {
    /// 是否属于扫描/滥用类错误
    pub fn is_abuse(self) -> bool {
        matches!(self, Self::NetScanExceeded | Self::AdmissionThrottled)
    }

    /// 查询该错误码的日志策略
    pub fn log_policy(self) -> LogPolicy {
        match self {
            Self::GeneralError => LogPolicy::individual(Level::ERROR, "session"),
            Self::AccessError => LogPolicy::individual(Level::INFO, "access"),
            Self::SessionClosed => LogPolicy::individual(Level::DEBUG, "session"),
            Self::UnsupportedClient => LogPolicy::individual(Level::WARN, "session"),
            Self::NetScanExceeded => LogPolicy::aggregate(Level::WARN, "net_protect"),
            Self::AdmissionThrottled => LogPolicy::aggregate(Level::WARN, "net_protect"),
        }
    }
}

impl fmt::Display for SessionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GeneralError => "GeneralError",
            Self::AccessError => "AccessError",
            Self::SessionClosed => "SessionClosed",
            Self::UnsupportedClient => "UnsupportedClient",
            Self::NetScanExceeded => "NetScanExceeded",
            Self::AdmissionThrottled => "AdmissionThrottled",
        };
        f.write_str(name)
    }
}

/// 日志输出方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// 每次发生都单独记录
    Individual,
    /// 交给聚合上报器，按次数或时间输出汇总
    Aggregate,
}

/// 单个错误码的日志策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPolicy {
    pub level: Level,
    pub mode: LogMode,
    /// 日志分类（对应不同的事件来源）
    pub category: &'static str,
}

impl LogPolicy {
    const fn individual(level: Level, category: &'static str) -> Self {
        Self {
            level,
            mode: LogMode::Individual,
            category,
        }
    }

    const fn aggregate(level: Level, category: &'static str) -> Self {
        Self {
            level,
            mode: LogMode::Aggregate,
            category,
        }
    }
}

/// 会话层失败
#[derive(Error, Debug, Clone)]
#[error("{message} (code: {code})")]
pub struct SessionError {
    pub remote_endpoint: Option<SocketAddr>,
    pub session_id: Option<SessionId>,
    pub code: SessionErrorCode,
    pub request_id: Option<String>,
    pub message: String,
}

impl SessionError {
    pub fn new(code: SessionErrorCode, message: impl Into<String>) -> Self {
        Self {
            remote_endpoint: None,
            session_id: None,
            code,
            request_id: None,
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(SessionErrorCode::GeneralError, message)
    }

    pub fn access(message: impl Into<String>) -> Self {
        Self::new(SessionErrorCode::AccessError, message)
    }

    pub fn unsupported_client(message: impl Into<String>) -> Self {
        Self::new(SessionErrorCode::UnsupportedClient, message)
    }

    /// 会话已关闭或不存在
    pub fn session_closed(session_id: SessionId) -> Self {
        Self::new(
            SessionErrorCode::SessionClosed,
            format!("Session {} is closed or does not exist", session_id),
        )
        .with_session(session_id)
    }

    /// NetScan 拒绝
    pub fn net_scan(remote_endpoint: SocketAddr) -> Self {
        Self::new(
            SessionErrorCode::NetScanExceeded,
            "NetScan protector does not allow this request",
        )
        .with_endpoint(remote_endpoint)
    }

    /// 全局速率限制拒绝
    pub fn throttled(remote_endpoint: SocketAddr) -> Self {
        Self::new(
            SessionErrorCode::AdmissionThrottled,
            "Admission rate limit exceeded",
        )
        .with_endpoint(remote_endpoint)
    }

    pub fn with_endpoint(mut self, remote_endpoint: SocketAddr) -> Self {
        self.remote_endpoint = Some(remote_endpoint);
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn is_session_closed(&self) -> bool {
        self.code == SessionErrorCode::SessionClosed
    }

    /// 按错误码的日志策略记录本错误
    ///
    /// 聚合类错误只会计入对应的上报器，不会逐条输出。
    pub fn log(&self, reporters: &ErrorReporters) {
        let policy = self.code.log_policy();
        if policy.mode == LogMode::Aggregate {
            if let Some(reporter) = reporters.reporter_for(self.code) {
                reporter.raise();
                return;
            }
        }

        let endpoint = self
            .remote_endpoint
            .map(|ep| ep.to_string())
            .unwrap_or_else(|| "-".to_string());
        let session = self
            .session_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let request = self.request_id.as_deref().unwrap_or("-");

        log_at!(
            policy.level,
            category = policy.category,
            "{} SessionId: {}, RequestId: {}, Endpoint: {}",
            self,
            session,
            request,
            endpoint
        );
    }
}

/// 基础设施错误
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 访问管理后端错误（文件存储或远程服务）
    #[error("Access manager error: {0}")]
    AccessBackend(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 会话层错误
    #[error(transparent)]
    Session(#[from] SessionError),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON 编解码错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP 请求错误
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建访问后端错误
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::AccessBackend(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventReporterConfig;
    use std::time::Duration;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::session_closed(SessionId(42));
        assert!(err.is_session_closed());
        assert_eq!(err.session_id, Some(SessionId(42)));
        assert_eq!(
            err.to_string(),
            "Session 42 is closed or does not exist (code: SessionClosed)"
        );
    }

    #[test]
    fn test_error_context_builders() {
        let ep: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let err = SessionError::general("duplicate stream")
            .with_endpoint(ep)
            .with_session(SessionId(7))
            .with_request_id("req-1");

        assert_eq!(err.code, SessionErrorCode::GeneralError);
        assert_eq!(err.remote_endpoint, Some(ep));
        assert_eq!(err.session_id, Some(SessionId(7)));
        assert_eq!(err.request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn test_log_policy_table() {
        for code in [
            SessionErrorCode::NetScanExceeded,
            SessionErrorCode::AdmissionThrottled,
        ] {
            assert!(code.is_abuse());
            assert_eq!(code.log_policy().mode, LogMode::Aggregate);
        }

        for code in [
            SessionErrorCode::GeneralError,
            SessionErrorCode::AccessError,
            SessionErrorCode::SessionClosed,
            SessionErrorCode::UnsupportedClient,
        ] {
            assert!(!code.is_abuse());
            assert_eq!(code.log_policy().mode, LogMode::Individual);
        }

        assert_eq!(
            SessionErrorCode::GeneralError.log_policy().level,
            Level::ERROR
        );
    }

    #[test]
    fn test_abuse_errors_are_aggregated() {
        let reporters = ErrorReporters::new(&EventReporterConfig {
            max_pending: 1000,
            report_interval_secs: 3600,
        });
        let ep: SocketAddr = "192.0.2.1:5555".parse().unwrap();

        for _ in 0..3 {
            SessionError::net_scan(ep).log(&reporters);
        }
        SessionError::throttled(ep).log(&reporters);
        SessionError::general("not aggregated").log(&reporters);

        assert_eq!(reporters.net_scan().total(), 3);
        assert_eq!(reporters.throttled().total(), 1);
    }

    #[test]
    fn test_tunnel_error_checks() {
        let timeout_err = TunnelError::timeout(Duration::from_secs(1));
        let config_err = TunnelError::config_error("bad");

        assert!(timeout_err.is_timeout());
        assert!(!timeout_err.is_config_error());
        assert!(config_err.is_config_error());
        assert!(timeout_err.to_string().contains("timeout"));

        let session_err: TunnelError = SessionError::access("revoked").into();
        assert!(session_err.to_string().contains("revoked"));
    }
}
