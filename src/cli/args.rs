use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tunnel-core")]
#[command(author, version, about = "Encrypted tunnel session core", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行会话主机
    Start {
        /// 配置文件路径
        #[arg(short, long, default_value = "tunnel-core.toml")]
        config: String,
    },
    /// 停止正在运行的实例（写入命令文件）
    Stop {
        /// 配置文件路径
        #[arg(short, long, default_value = "tunnel-core.toml")]
        config: String,
    },
    /// 让正在运行的实例立即同步一次用量
    Sync {
        /// 配置文件路径
        #[arg(short, long, default_value = "tunnel-core.toml")]
        config: String,
    },
    /// 检查配置文件
    Check {
        /// 配置文件路径
        #[arg(short, long, default_value = "tunnel-core.toml")]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 在本地文件存储中生成访问令牌
    Gen {
        /// 配置文件路径
        #[arg(short, long, default_value = "tunnel-core.toml")]
        config: String,

        /// 令牌名称
        #[arg(short, long)]
        name: String,

        /// 流量上限（字节）
        #[arg(long, value_name = "BYTES")]
        max_traffic: Option<u64>,

        /// 有效天数
        #[arg(long, value_name = "DAYS")]
        expires_in_days: Option<u64>,

        /// 允许的最大客户端数
        #[arg(long)]
        max_clients: Option<u32>,
    },
    /// 列出本地文件存储中的令牌和用量
    Tokens {
        /// 配置文件路径
        #[arg(short, long, default_value = "tunnel-core.toml")]
        config: String,
    },
}
