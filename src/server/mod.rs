mod command;
mod lock;

pub use command::{send_command, CommandListener, HostCommand};
pub use lock::InstanceLock;

use crate::access::create_access_manager;
use crate::config::AppConfig;
use crate::session::SessionManager;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 进程主机
///
/// 持有会话管理器和后台任务；收到 Ctrl+C、`stop` 命令或取消信号后
/// 调用一次 [`SessionManager::shutdown`]。
/// 配置了锁文件时，`run` 期间持有单实例锁。
pub struct ServerHost {
    manager: Arc<SessionManager>,
    command_listener: CommandListener,
    cancel: CancellationToken,
    handle_ctrl_c: bool,
    instance_lock: Option<PathBuf>,
}

impl ServerHost {
    /// 根据配置创建访问管理器和会话管理器
    pub fn new(config: &AppConfig) -> Result<Self> {
        let access = create_access_manager(&config.access_manager)
            .context("Failed to create access manager")?;
        let manager = SessionManager::from_config(access, config)?;
        Ok(Self::with_manager(
            Arc::new(manager),
            CommandListener::new(shellexpand::tilde(&config.command_file).into_owned()),
        )
        .with_instance_lock(shellexpand::tilde(&config.lock_file).into_owned()))
    }

    /// 使用已有的会话管理器（用于测试或嵌入）
    pub fn with_manager(manager: Arc<SessionManager>, command_listener: CommandListener) -> Self {
        Self {
            manager,
            command_listener,
            cancel: CancellationToken::new(),
            handle_ctrl_c: true,
            instance_lock: None,
        }
    }

    /// 运行期间持有该锁文件，已被其他实例持有时 `run` 失败
    pub fn with_instance_lock(mut self, path: impl Into<PathBuf>) -> Self {
        self.instance_lock = Some(path.into());
        self
    }

    /// 不监听 Ctrl+C（嵌入其他进程时由外部负责信号）
    pub fn without_ctrl_c(mut self) -> Self {
        self.handle_ctrl_c = false;
        self
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// 取消该 token 即可让 `run` 退出
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 运行直到收到停止信号，然后关闭所有会话
    pub async fn run(self) -> Result<()> {
        let Self {
            manager,
            command_listener,
            cancel,
            handle_ctrl_c,
            instance_lock,
        } = self;

        let _instance_lock = instance_lock.map(InstanceLock::acquire).transpose()?;
        command_listener.clear().await?;
        info!(
            "Session host started. CommandFile: {}",
            command_listener.path().display()
        );

        let background = manager.spawn_background(cancel.child_token());
        let (tx, mut rx) = mpsc::channel(8);
        let listener = command_listener.spawn(tx, cancel.child_token());

        let ctrl_c = async {
            if handle_ctrl_c {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            } else {
                std::future::pending::<()>().await;
            }
        };
        tokio::pin!(ctrl_c);

        info!("Waiting for sessions... (Press Ctrl+C to stop)");
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received shutdown signal, stopping...");
                    break;
                }
                _ = cancel.cancelled() => {
                    info!("Host cancelled, stopping...");
                    break;
                }
                command = rx.recv() => {
                    match command {
                        Some(HostCommand::Stop) => {
                            info!("Stop command received, syncing usage before shutdown");
                            manager.sync_all().await;
                            break;
                        }
                        Some(HostCommand::Sync) => {
                            let summary = manager.sync_all().await;
                            info!(
                                "On-demand sync finished. Synced: {}, Revoked: {}, Failed: {}",
                                summary.synced, summary.revoked, summary.failed
                            );
                        }
                        None => break,
                    }
                }
            }
        }

        cancel.cancel();
        if let Err(e) = background.await {
            warn!("Background task ended abnormally: {}", e);
        }
        if let Err(e) = listener.await {
            warn!("Command listener ended abnormally: {}", e);
        }

        manager.shutdown().await;
        info!("Host stopped gracefully");
        Ok(())
    }
}

/// 按配置运行主机
pub async fn run_server(config: AppConfig) -> Result<()> {
    ServerHost::new(&config)?.run().await
}
