use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::access::FileAccessManager;
use crate::config::{AccessManagerConfig, AppConfig};
use crate::server::{self, HostCommand};

use super::config::{check_config, check_config_file_permissions, expand_path};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Start { config } => {
            run_start(config).await?;
        }
        Commands::Stop { config } => {
            send_host_command(config, HostCommand::Stop).await?;
        }
        Commands::Sync { config } => {
            send_host_command(config, HostCommand::Sync).await?;
        }
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Gen {
            config,
            name,
            max_traffic,
            expires_in_days,
            max_clients,
        } => {
            run_gen(config, name, *max_traffic, *expires_in_days, *max_clients).await?;
        }
        Commands::Tokens { config } => {
            run_tokens(config).await?;
        }
    }

    Ok(())
}

fn load_config(config: &str) -> Result<AppConfig> {
    let config_path = expand_path(config)?;
    check_config_file_permissions(&config_path)?;

    info!("Loading configuration from: {}", config_path);
    AppConfig::load(&config_path)
}

/// 打开配置中的本地令牌存储
fn open_file_store(config: &AppConfig) -> Result<FileAccessManager> {
    match &config.access_manager {
        AccessManagerConfig::File { storage_path } => {
            let path = shellexpand::tilde(storage_path).into_owned();
            FileAccessManager::new(&path)
                .with_context(|| format!("Failed to open access storage: {}", path))
        }
        AccessManagerConfig::Http { base_url, .. } => anyhow::bail!(
            "Tokens are managed by the remote access manager ({}), not locally",
            base_url
        ),
    }
}

/// 本地令牌存储为空时给出提示；返回是否发出了警告
async fn warn_if_no_tokens(config: &AppConfig) -> Result<bool> {
    if !matches!(config.access_manager, AccessManagerConfig::File { .. }) {
        return Ok(false);
    }
    let store = open_file_store(config)?;
    if !store.list_tokens().await?.is_empty() {
        return Ok(false);
    }
    warn!(
        "There is no token in the store! Use the gen command to create one. Storage: {}",
        store.storage_path().display()
    );
    Ok(true)
}

/// Run session host
async fn run_start(config: &str) -> Result<()> {
    let app_config = load_config(config)?;
    warn_if_no_tokens(&app_config).await?;
    server::run_server(app_config).await
}

/// 通过命令文件向正在运行的实例发送命令
async fn send_host_command(config: &str, command: HostCommand) -> Result<()> {
    let app_config = load_config(config)?;
    let command_file = shellexpand::tilde(&app_config.command_file).into_owned();
    server::send_command(&command_file, command).await?;
    println!("Command '{}' written to {}", command, command_file);
    Ok(())
}

async fn run_gen(
    config: &str,
    name: &str,
    max_traffic: Option<u64>,
    expires_in_days: Option<u64>,
    max_clients: Option<u32>,
) -> Result<()> {
    let app_config = load_config(config)?;
    let store = open_file_store(&app_config)?;

    let expires_at =
        expires_in_days.map(|days| crate::access::unix_now() + days.saturating_mul(SECONDS_PER_DAY));
    let token = store
        .create_token(Some(name.to_string()), max_traffic, expires_at, max_clients)
        .await?;

    println!("Token created.");
    println!("  Name:   {}", name);
    println!("  Id:     {}", token.token_id);
    println!("  Secret: {}", token.secret);
    if let Some(max) = token.max_traffic {
        println!("  Max traffic: {} bytes", max);
    }
    if let Some(at) = token.expires_at {
        println!("  Expires at:  {} (unix)", at);
    }
    if let Some(max) = token.max_clients {
        println!("  Max clients: {}", max);
    }
    Ok(())
}

async fn run_tokens(config: &str) -> Result<()> {
    let app_config = load_config(config)?;
    let store = open_file_store(&app_config)?;

    let tokens = store.list_tokens().await?;
    if tokens.is_empty() {
        println!("No tokens in {}", store.storage_path().display());
        return Ok(());
    }

    println!(
        "{:<38} {:<16} {:>14} {:>14} {:>14}",
        "ID", "NAME", "SENT", "RECEIVED", "LIMIT"
    );
    for token in tokens {
        let usage = store.token_usage(&token.token_id).await?;
        println!(
            "{:<38} {:<16} {:>14} {:>14} {:>14}{}",
            token.token_id,
            token.name.as_deref().unwrap_or("-"),
            usage.sent,
            usage.received,
            token
                .max_traffic
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_string()),
            if token.locked { " (locked)" } else { "" }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(storage_path: &std::path::Path) -> AppConfig {
        AppConfig {
            access_manager: AccessManagerConfig::File {
                storage_path: storage_path.display().to_string(),
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_warns_only_when_store_is_empty() {
        let dir = std::env::temp_dir().join(format!("tunnel-core-cli-{}", uuid::Uuid::new_v4()));
        let config = file_config(&dir);

        assert!(warn_if_no_tokens(&config).await.unwrap());

        open_file_store(&config)
            .unwrap()
            .create_token(Some("alice".to_string()), None, None, None)
            .await
            .unwrap();
        assert!(!warn_if_no_tokens(&config).await.unwrap());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_remote_store_is_not_checked() {
        let config = AppConfig::from_toml_str(
            r#"
[access_manager]
type = "http"
base_url = "https://access.example.com/api/"
"#,
        )
        .unwrap();
        assert!(!warn_if_no_tokens(&config).await.unwrap());
    }
}
