/// 客户端流抽象
///
/// 一个客户端流对应隧道下的一条双向传输连接（控制通道或某个代理目标的数据通道）。
/// 会话只负责它的接入、存活检查和关闭，不读写其中的应用数据。
mod tcp;

pub use tcp::TcpClientStream;

use crate::error::SessionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// 连接两端的地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointPair {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl EndpointPair {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for EndpointPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

/// 客户端流接口
#[async_trait]
pub trait ClientStream: Send + Sync {
    /// 接入时分配的流 ID
    fn stream_id(&self) -> Option<String>;

    /// 分配流 ID，只能分配一次
    fn set_stream_id(&self, stream_id: &str) -> Result<(), SessionError>;

    fn endpoint_pair(&self) -> EndpointPair;

    fn is_disposed(&self) -> bool;

    /// 非破坏性地探测底层连接是否仍然可用（不消耗应用数据）
    fn check_is_alive(&self) -> bool;

    /// 关闭流
    ///
    /// `graceful` 为 true 时在有限时间内尝试有序关闭，超时后强制关闭；
    /// 为 false 时立即关闭。重复调用不做任何事。
    async fn dispose(&self, graceful: bool);

    /// 立即强制关闭（直接复位连接）
    ///
    /// 不受关闭标志限制：优雅关闭进行中或已被取消时仍然生效。
    fn force_close(&self);
}

/// 只能写入一次的流 ID
#[derive(Debug, Default)]
pub struct StreamId(OnceLock<String>);

impl StreamId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.0.get().cloned()
    }

    pub fn set(&self, stream_id: &str) -> Result<(), SessionError> {
        self.0.set(stream_id.to_string()).map_err(|_| {
            SessionError::general(format!(
                "Stream id is already assigned ({}), cannot reassign to {}",
                self.0.get().map(String::as_str).unwrap_or("?"),
                stream_id
            ))
            .with_request_id(stream_id)
        })
    }
}

/// 单调的关闭标志
#[derive(Debug, Default)]
pub struct DisposeFlag(AtomicBool);

impl DisposeFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// 标记为已关闭；只有第一个调用者得到 true
    pub fn begin(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
