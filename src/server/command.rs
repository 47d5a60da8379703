/// 基于文件的命令通道
///
/// 运行中的实例轮询命令文件；另一个进程写入命令（如 `stop`）即可控制它。
use anyhow::{Context, Result};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 主机命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    /// 同步用量后停止
    Stop,
    /// 立即同步一次用量
    Sync,
}

impl FromStr for HostCommand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(Self::Stop),
            "sync" => Ok(Self::Sync),
            other => anyhow::bail!("Unknown command '{}'", other),
        }
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => f.write_str("stop"),
            Self::Sync => f.write_str("sync"),
        }
    }
}

/// 向运行中的实例发送命令
pub async fn send_command(path: impl AsRef<Path>, command: HostCommand) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::write(path, command.to_string())
        .await
        .with_context(|| format!("Failed to write command file: {}", path.display()))?;
    info!("Command '{}' sent via {}", command, path.display());
    Ok(())
}

/// 命令文件监听器
pub struct CommandListener {
    path: PathBuf,
    poll_interval: Duration,
}

impl CommandListener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 删除启动前残留的命令文件
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Removed stale command file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove command file: {}", self.path.display())),
        }
    }

    /// 读取并消费一条命令
    pub async fn poll(&self) -> Result<Option<HostCommand>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read command file: {}", self.path.display())
                })
            }
        };
        self.clear().await?;

        if content.trim().is_empty() {
            return Ok(None);
        }
        match content.parse::<HostCommand>() {
            Ok(command) => Ok(Some(command)),
            Err(e) => {
                warn!("Ignoring command file content: {}", e);
                Ok(None)
            }
        }
    }

    /// 在后台轮询，收到的命令发往 `tx`
    pub fn spawn(self, tx: mpsc::Sender<HostCommand>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        match self.poll().await {
                            Ok(Some(command)) => {
                                info!("Received command: {}", command);
                                if tx.send(command).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Command listener error: {:#}", e),
                        }
                    }
                }
            }
            debug!("Command listener stopped");
        })
    }
}
