/// 访问管理器接口
///
/// 会话核心只依赖 [`AccessManager`] 这一抽象：授权凭据、上报用量。
/// 具体实现（本地文件存储或远程 HTTP 服务）在启动时选定一次并注入。
pub mod file;
pub mod http;

pub use file::{AccessToken, FileAccessManager};
pub use http::HttpAccessManager;

use crate::config::AccessManagerConfig;
use crate::error::Result;
use crate::usage::Traffic;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 会话 ID（由访问检查分配）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 客户端凭据（握手层已解析）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub token_id: String,
    pub secret: String,
    /// 客户端实例标识
    pub client_id: String,
    pub protocol_version: u32,
    #[serde(default)]
    pub client_version: Option<String>,
}

/// 授权记录，核心只负责携带
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessItem {
    pub token_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// 流量上限（字节，发送+接收）
    #[serde(default)]
    pub max_traffic: Option<u64>,
    /// 过期时间（Unix 时间戳，秒）
    #[serde(default)]
    pub expires_at: Option<u64>,
    /// 同一令牌允许的最大客户端数
    #[serde(default)]
    pub max_clients: Option<u32>,
}

/// 授权成功的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub session_id: SessionId,
    pub access_item: AccessItem,
}

/// 拒绝或吊销原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessRefusal {
    InvalidToken,
    Expired,
    TrafficOverflow,
    Locked,
    /// 后端不认识该会话
    SessionUnknown,
    Other(String),
}

impl fmt::Display for AccessRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidToken => write!(f, "invalid token"),
            Self::Expired => write!(f, "access expired"),
            Self::TrafficOverflow => write!(f, "traffic quota exceeded"),
            Self::Locked => write!(f, "access locked"),
            Self::SessionUnknown => write!(f, "session unknown to access manager"),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// 授权结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeResult {
    Granted(AccessGrant),
    Refused(AccessRefusal),
}

/// 用量上报的回应
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageResponse {
    Ack,
    /// 会话必须终止
    Revoke(AccessRefusal),
}

/// 访问管理器
///
/// 实现可能是本地存储也可能是远程服务，调用方不能假设低延迟或必然成功；
/// 返回 `Err` 表示本次调用失败（I/O、超时等），不代表拒绝。
#[async_trait]
pub trait AccessManager: Send + Sync {
    /// 授权凭据
    async fn authorize(
        &self,
        credentials: &Credentials,
        remote: SocketAddr,
    ) -> Result<AuthorizeResult>;

    /// 上报会话的用量增量；`closed` 表示这是会话关闭前的最后一次上报
    async fn report_usage(
        &self,
        session_id: SessionId,
        usage: Traffic,
        closed: bool,
    ) -> Result<UsageResponse>;

    /// 实现名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 根据配置创建访问管理器
pub fn create_access_manager(config: &AccessManagerConfig) -> Result<Arc<dyn AccessManager>> {
    match config {
        AccessManagerConfig::File { storage_path } => {
            let path = shellexpand::tilde(storage_path).into_owned();
            info!("Using file access manager. AccessFolder: {}", path);
            Ok(Arc::new(FileAccessManager::new(path)?))
        }
        AccessManagerConfig::Http {
            base_url,
            authorization,
            timeout_secs,
        } => {
            info!("Using HTTP access manager. BaseUrl: {}", base_url);
            Ok(Arc::new(HttpAccessManager::new(
                base_url.clone(),
                authorization.clone(),
                Duration::from_secs(*timeout_secs),
            )?))
        }
    }
}

/// 当前 Unix 时间戳（秒）
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
