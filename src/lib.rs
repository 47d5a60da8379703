/// Tunnel Core 库入口
///
/// 隧道服务端核心：会话生命周期、客户端流复用、NetScan 防护，
/// 以及访问管理器抽象和两种后端实现。
pub mod access;
pub mod cli;
pub mod client_stream;
pub mod config;
pub mod error;
pub mod event_reporter;
pub mod netscan;
pub mod rate_limiter;
pub mod server;
pub mod session;
pub mod usage;

// 重新导出常用类型
pub use access::{AccessManager, Credentials, SessionId};
pub use client_stream::{ClientStream, TcpClientStream};
pub use config::AppConfig;
pub use error::{Result, SessionError, SessionErrorCode, TunnelError};
pub use netscan::NetScanProtector;
pub use rate_limiter::RateLimiter;
pub use session::{Session, SessionManager, SessionStatus};
pub use usage::Traffic;
