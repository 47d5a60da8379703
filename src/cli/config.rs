use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{AccessManagerConfig, AppConfig};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // 其他用户或组可读（o+r / g+r）
    if mode & 0o044 != 0 {
        warn!(
            "SECURITY WARNING: Config file '{}' is readable by group or others (permissions: {:o})\n\
             It may contain the access manager authorization header.\n\
             RECOMMENDATION: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 收集配置中值得提示的问题
fn collect_warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let session = &config.session;

    if config.net_scan.is_none() {
        warnings.push("NetScan protection is disabled ([net_scan] section missing)".to_string());
    }
    if session.sync_interval_secs > session.idle_timeout_secs {
        warnings.push(format!(
            "sync_interval_secs ({}) is longer than idle_timeout_secs ({})",
            session.sync_interval_secs, session.idle_timeout_secs
        ));
    }
    if let AccessManagerConfig::Http {
        base_url,
        authorization,
        ..
    } = &config.access_manager
    {
        if base_url.scheme() == "http" && authorization.is_some() {
            warnings.push("Authorization header is sent over plain HTTP".to_string());
        }
    }
    warnings
}

fn describe(config: &AppConfig) -> serde_json::Value {
    let access = match &config.access_manager {
        AccessManagerConfig::File { storage_path } => serde_json::json!({
            "type": "file",
            "storage_path": storage_path,
        }),
        AccessManagerConfig::Http {
            base_url,
            timeout_secs,
            ..
        } => serde_json::json!({
            "type": "http",
            "base_url": base_url.as_str(),
            "timeout_secs": timeout_secs,
        }),
    };

    serde_json::json!({
        "session": config.session,
        "net_scan": config.net_scan,
        "rate_limit": config.rate_limit,
        "access_manager": access,
        "command_file": config.command_file,
        "lock_file": config.lock_file,
    })
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let json = format == "json";

    if !Path::new(config_path).exists() {
        if json {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    match AppConfig::load(config_path) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            if json {
                let result = CheckResult {
                    valid: true,
                    warnings,
                    error: None,
                    details: describe(&config),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Checking configuration file: {}\n", config_path);
                println!(
                    "✓ Sync interval: {}s, idle timeout: {}s, drain timeout: {}s",
                    config.session.sync_interval_secs,
                    config.session.idle_timeout_secs,
                    config.session.drain_timeout_secs
                );
                match &config.net_scan {
                    Some(net_scan) => println!(
                        "✓ NetScan: {} requests per {}s",
                        net_scan.max_requests, net_scan.window_secs
                    ),
                    None => println!("✓ NetScan: disabled"),
                }
                match &config.access_manager {
                    AccessManagerConfig::File { storage_path } => {
                        println!("✓ Access manager: file ({})", storage_path)
                    }
                    AccessManagerConfig::Http { base_url, .. } => {
                        println!("✓ Access manager: http ({})", base_url)
                    }
                }
                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Configuration is valid!");
            }
            Ok(())
        }
        Err(e) => {
            if json {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_makes_absolute() {
        let path = expand_path("relative.toml").unwrap();
        assert!(Path::new(&path).is_absolute());
        assert!(path.ends_with("relative.toml"));
    }

    #[test]
    fn test_warnings_for_disabled_net_scan() {
        let config = AppConfig::default();
        let warnings = collect_warnings(&config);
        assert!(warnings.iter().any(|w| w.contains("NetScan")));
    }

    #[test]
    fn test_check_missing_file_fails() {
        assert!(check_config("/nonexistent/tunnel-core.toml", "json").is_err());
    }
}
