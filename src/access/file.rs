/// 本地文件访问管理器
///
/// 目录结构：
/// - `tokens/<token_id>.json`：令牌定义
/// - `usage/<token_id>.json`：令牌累计用量
use super::{
    unix_now, AccessGrant, AccessItem, AccessManager, AccessRefusal, AuthorizeResult,
    Credentials, SessionId, UsageResponse,
};
use crate::error::{Result, TunnelError};
use crate::usage::Traffic;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const TOKENS_DIR: &str = "tokens";
const USAGE_DIR: &str = "usage";

/// 存储在文件中的令牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token_id: String,
    pub secret: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_traffic: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub max_clients: Option<u32>,
    #[serde(default)]
    pub locked: bool,
}

impl AccessToken {
    pub fn access_item(&self) -> AccessItem {
        AccessItem {
            token_id: self.token_id.clone(),
            name: self.name.clone(),
            max_traffic: self.max_traffic,
            expires_at: self.expires_at,
            max_clients: self.max_clients,
        }
    }

    /// 检查令牌当前是否可用
    fn refusal(&self, usage: Traffic, now: u64) -> Option<AccessRefusal> {
        if self.locked {
            return Some(AccessRefusal::Locked);
        }
        if matches!(self.expires_at, Some(at) if at <= now) {
            return Some(AccessRefusal::Expired);
        }
        if matches!(self.max_traffic, Some(max) if usage.total() >= max) {
            return Some(AccessRefusal::TrafficOverflow);
        }
        None
    }
}

#[derive(Debug, Clone)]
struct FileSession {
    token_id: String,
    client_id: String,
}

/// 基于本地文件的访问管理器
pub struct FileAccessManager {
    storage_path: PathBuf,
    sessions: Mutex<HashMap<SessionId, FileSession>>,
    next_session_id: AtomicU64,
    /// 串行化用量文件的读-改-写
    usage_lock: tokio::sync::Mutex<()>,
}

impl FileAccessManager {
    pub fn new(storage_path: impl Into<PathBuf>) -> Result<Self> {
        let storage_path = storage_path.into();
        std::fs::create_dir_all(storage_path.join(TOKENS_DIR))?;
        std::fs::create_dir_all(storage_path.join(USAGE_DIR))?;

        Ok(Self {
            storage_path,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            usage_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// 创建新令牌并写入存储
    pub async fn create_token(
        &self,
        name: Option<String>,
        max_traffic: Option<u64>,
        expires_at: Option<u64>,
        max_clients: Option<u32>,
    ) -> Result<AccessToken> {
        let token = AccessToken {
            token_id: uuid::Uuid::new_v4().to_string(),
            secret: uuid::Uuid::new_v4().simple().to_string(),
            name,
            max_traffic,
            expires_at,
            max_clients,
            locked: false,
        };
        self.save_token(&token).await?;
        info!("Created access token {}", token.token_id);
        Ok(token)
    }

    /// 写入（或覆盖）令牌
    pub async fn save_token(&self, token: &AccessToken) -> Result<()> {
        let path = self
            .token_path(&token.token_id)
            .ok_or_else(|| TunnelError::backend(format!("Invalid token id '{}'", token.token_id)))?;
        write_json_atomic(&path, token).await
    }

    /// 读取令牌，不存在时返回 None
    pub async fn load_token(&self, token_id: &str) -> Result<Option<AccessToken>> {
        match self.token_path(token_id) {
            Some(path) => read_json(&path).await,
            None => Ok(None),
        }
    }

    /// 列出所有令牌
    pub async fn list_tokens(&self) -> Result<Vec<AccessToken>> {
        let mut tokens = Vec::new();
        let mut dir = tokio::fs::read_dir(self.storage_path.join(TOKENS_DIR)).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<AccessToken>(&path).await {
                Ok(Some(token)) => tokens.push(token),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable token file {}: {}", path.display(), e),
            }
        }
        tokens.sort_by(|a, b| a.token_id.cmp(&b.token_id));
        Ok(tokens)
    }

    /// 令牌的累计用量
    pub async fn token_usage(&self, token_id: &str) -> Result<Traffic> {
        match self.usage_path(token_id) {
            Some(path) => Ok(read_json(&path).await?.unwrap_or_default()),
            None => Ok(Traffic::default()),
        }
    }

    /// 当前存活的会话数
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    async fn add_usage(&self, token_id: &str, delta: Traffic) -> Result<Traffic> {
        let path = self
            .usage_path(token_id)
            .ok_or_else(|| TunnelError::backend(format!("Invalid token id '{}'", token_id)))?;

        let _guard = self.usage_lock.lock().await;
        let current: Traffic = read_json(&path).await?.unwrap_or_default();
        let updated = current + delta;
        write_json_atomic(&path, &updated).await?;
        Ok(updated)
    }

    fn token_path(&self, token_id: &str) -> Option<PathBuf> {
        is_valid_token_id(token_id).then(|| {
            self.storage_path
                .join(TOKENS_DIR)
                .join(format!("{}.json", token_id))
        })
    }

    fn usage_path(&self, token_id: &str) -> Option<PathBuf> {
        is_valid_token_id(token_id).then(|| {
            self.storage_path
                .join(USAGE_DIR)
                .join(format!("{}.json", token_id))
        })
    }
}

#[async_trait]
impl AccessManager for FileAccessManager {
    async fn authorize(
        &self,
        credentials: &Credentials,
        remote: SocketAddr,
    ) -> Result<AuthorizeResult> {
        let token = match self.load_token(&credentials.token_id).await? {
            Some(token) if token.secret == credentials.secret => token,
            _ => {
                debug!(
                    "Rejected unknown token or bad secret from {} (token: {})",
                    remote, credentials.token_id
                );
                return Ok(AuthorizeResult::Refused(AccessRefusal::InvalidToken));
            }
        };

        let usage = self.token_usage(&token.token_id).await?;
        if let Some(refusal) = token.refusal(usage, unix_now()) {
            return Ok(AuthorizeResult::Refused(refusal));
        }

        let mut sessions = self.sessions.lock();

        // 同一客户端重复授权时复用已有会话
        if let Some((id, _)) = sessions.iter().find(|(_, s)| {
            s.token_id == token.token_id && s.client_id == credentials.client_id
        }) {
            return Ok(AuthorizeResult::Granted(AccessGrant {
                session_id: *id,
                access_item: token.access_item(),
            }));
        }

        if let Some(max_clients) = token.max_clients {
            let clients: HashSet<&str> = sessions
                .values()
                .filter(|s| s.token_id == token.token_id)
                .map(|s| s.client_id.as_str())
                .collect();
            if clients.len() >= max_clients as usize {
                return Ok(AuthorizeResult::Refused(AccessRefusal::Other(format!(
                    "token allows at most {} clients",
                    max_clients
                ))));
            }
        }

        let session_id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        sessions.insert(
            session_id,
            FileSession {
                token_id: token.token_id.clone(),
                client_id: credentials.client_id.clone(),
            },
        );

        Ok(AuthorizeResult::Granted(AccessGrant {
            session_id,
            access_item: token.access_item(),
        }))
    }

    async fn report_usage(
        &self,
        session_id: SessionId,
        usage: Traffic,
        closed: bool,
    ) -> Result<UsageResponse> {
        let session = self.sessions.lock().get(&session_id).cloned();
        let session = match session {
            Some(session) => session,
            None => return Ok(UsageResponse::Revoke(AccessRefusal::SessionUnknown)),
        };

        let total = if usage.is_zero() {
            self.token_usage(&session.token_id).await?
        } else {
            self.add_usage(&session.token_id, usage).await?
        };

        if closed {
            self.sessions.lock().remove(&session_id);
            return Ok(UsageResponse::Ack);
        }

        let token = match self.load_token(&session.token_id).await? {
            Some(token) => token,
            None => return Ok(UsageResponse::Revoke(AccessRefusal::InvalidToken)),
        };

        Ok(match token.refusal(total, unix_now()) {
            Some(refusal) => UsageResponse::Revoke(refusal),
            None => UsageResponse::Ack,
        })
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// 令牌 ID 只允许字母、数字、`-` 和 `_`，避免路径穿越
fn is_valid_token_id(token_id: &str) -> bool {
    !token_id.is_empty()
        && token_id.len() <= 128
        && token_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 先写临时文件再重命名，避免写到一半的文件
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
