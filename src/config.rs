use anyhow::{bail, Context};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// 会话管理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// 周期性同步用量到访问管理器的间隔（秒）
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// 后台清理（死连接、空闲会话）的间隔（秒）
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// 无连接会话的空闲超时（秒）
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// 关闭时每个会话的最长排空等待（秒）
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// 单个流优雅关闭的时间预算（毫秒）
    #[serde(default = "default_stream_dispose_timeout")]
    pub stream_dispose_timeout_ms: u64,
    /// 访问管理器调用超时（秒）
    #[serde(default = "default_access_timeout")]
    pub access_timeout_secs: u64,
    /// 允许接入的最低客户端协议版本
    #[serde(default = "default_min_protocol_version")]
    pub min_protocol_version: u32,
    /// 最大会话数（可选）
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

fn default_sync_interval() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_stream_dispose_timeout() -> u64 {
    2000
}

fn default_access_timeout() -> u64 {
    10
}

fn default_min_protocol_version() -> u32 {
    1
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            idle_timeout_secs: default_idle_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            stream_dispose_timeout_ms: default_stream_dispose_timeout(),
            access_timeout_secs: default_access_timeout(),
            min_protocol_version: default_min_protocol_version(),
            max_sessions: None,
        }
    }
}

impl SessionConfig {
    /// 同步周期，至少 1 秒
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    /// 维护周期，至少 1 秒
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn stream_dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_dispose_timeout_ms)
    }

    pub fn access_timeout(&self) -> Duration {
        Duration::from_secs(self.access_timeout_secs)
    }
}

/// NetScan 防护配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetScanConfig {
    /// 滑动窗口长度（秒）
    pub window_secs: u64,
    /// 窗口内单个地址允许的最大接入次数
    pub max_requests: usize,
    /// 不受检查的网段（CIDR）
    #[serde(default)]
    pub exempt_networks: Vec<String>,
}

impl NetScanConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// 解析豁免网段
    pub fn parse_exempt_networks(&self) -> anyhow::Result<Vec<IpNetwork>> {
        self.exempt_networks
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<IpNetwork>()
                    .with_context(|| format!("Invalid exempt network '{}'", s))
            })
            .collect()
    }
}

/// 速率限制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 每秒允许的新连接数
    pub requests_per_second: u32,
    /// 突发容量（允许短时间内的峰值连接数）
    pub burst_size: u32,
}

/// 聚合上报配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReporterConfig {
    /// 累计多少次后输出一次汇总
    #[serde(default = "default_max_pending")]
    pub max_pending: u64,
    /// 最长多久输出一次汇总（秒）
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_max_pending() -> u64 {
    100
}

fn default_report_interval() -> u64 {
    60
}

impl Default for EventReporterConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            report_interval_secs: default_report_interval(),
        }
    }
}

impl EventReporterConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

/// 访问管理器配置（启动时二选一）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AccessManagerConfig {
    /// 本地文件令牌存储
    File {
        /// 存储目录
        storage_path: String,
    },
    /// 远程 HTTP 访问管理服务
    Http {
        /// 服务基础地址
        base_url: Url,
        /// Authorization 请求头（可选）
        #[serde(default)]
        authorization: Option<String>,
        /// 请求超时（秒）
        #[serde(default = "default_access_timeout")]
        timeout_secs: u64,
    },
}

impl Default for AccessManagerConfig {
    fn default() -> Self {
        Self::File {
            storage_path: "access".to_string(),
        }
    }
}

fn default_command_file() -> String {
    "tunnel-core.cmd".to_string()
}

fn default_lock_file() -> String {
    "tunnel-core.lock".to_string()
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,
    /// NetScan 防护（缺省时禁用）
    #[serde(default)]
    pub net_scan: Option<NetScanConfig>,
    /// 全局接入速率限制（可选）
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub event_reporter: EventReporterConfig,
    #[serde(default)]
    pub access_manager: AccessManagerConfig,
    /// 命令文件路径（用于 stop 命令）
    #[serde(default = "default_command_file")]
    pub command_file: String,
    /// 单实例锁文件路径
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            net_scan: None,
            rate_limit: None,
            event_reporter: EventReporterConfig::default(),
            access_manager: AccessManagerConfig::default(),
            command_file: default_command_file(),
            lock_file: default_lock_file(),
        }
    }
}

impl AppConfig {
    /// 从 TOML 文本解析并验证
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(content).context("Failed to parse configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::from_toml_str(&content)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.session;
        if s.sync_interval_secs == 0 {
            bail!("session.sync_interval_secs must be > 0");
        }
        if s.cleanup_interval_secs == 0 {
            bail!("session.cleanup_interval_secs must be > 0");
        }
        if s.idle_timeout_secs == 0 {
            bail!("session.idle_timeout_secs must be > 0");
        }
        if s.access_timeout_secs == 0 {
            bail!("session.access_timeout_secs must be > 0");
        }
        if s.max_sessions == Some(0) {
            bail!("session.max_sessions cannot be 0");
        }

        if let Some(ref net_scan) = self.net_scan {
            if net_scan.window_secs == 0 {
                bail!("net_scan.window_secs must be > 0");
            }
            if net_scan.max_requests == 0 {
                bail!("net_scan.max_requests must be > 0");
            }
            net_scan.parse_exempt_networks()?;
        }

        if let Some(ref rate_limit) = self.rate_limit {
            if rate_limit.requests_per_second == 0 || rate_limit.burst_size == 0 {
                bail!("rate_limit.requests_per_second and rate_limit.burst_size must be > 0");
            }
        }

        if self.event_reporter.max_pending == 0 {
            bail!("event_reporter.max_pending must be > 0");
        }

        match &self.access_manager {
            AccessManagerConfig::File { storage_path } => {
                if storage_path.trim().is_empty() {
                    bail!("access_manager.storage_path cannot be empty");
                }
            }
            AccessManagerConfig::Http {
                base_url,
                timeout_secs,
                ..
            } => {
                if !matches!(base_url.scheme(), "http" | "https") {
                    bail!(
                        "access_manager.base_url must use http or https, got '{}'",
                        base_url.scheme()
                    );
                }
                if *timeout_secs == 0 {
                    bail!("access_manager.timeout_secs must be > 0");
                }
            }
        }

        if self.command_file.trim().is_empty() {
            bail!("command_file cannot be empty");
        }
        if self.lock_file.trim().is_empty() {
            bail!("lock_file cannot be empty");
        }

        Ok(())
    }
}
