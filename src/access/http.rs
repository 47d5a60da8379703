/// 远程 HTTP 访问管理器
///
/// - `POST {base}/sessions`：授权，回应 `{"result":"granted",...}` 或 `{"result":"refused","reason":...}`
/// - `POST {base}/sessions/{id}/usage`：上报用量，回应 `{"result":"ack"}` 或 `{"result":"revoke","reason":...}`
///
/// 非 2xx 状态视为调用失败。
use super::{
    AccessGrant, AccessItem, AccessManager, AccessRefusal, AuthorizeResult, Credentials,
    SessionId, UsageResponse,
};
use crate::error::{Result, TunnelError};
use crate::usage::Traffic;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Serialize)]
struct AuthorizeRequest<'a> {
    #[serde(flatten)]
    credentials: &'a Credentials,
    remote_endpoint: SocketAddr,
}

#[derive(Debug, Serialize)]
struct UsageRequest {
    sent: u64,
    received: u64,
    closed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum AuthorizeReply {
    Granted {
        session_id: SessionId,
        access_item: AccessItem,
    },
    Refused {
        reason: AccessRefusal,
    },
}

impl From<AuthorizeReply> for AuthorizeResult {
    fn from(reply: AuthorizeReply) -> Self {
        match reply {
            AuthorizeReply::Granted {
                session_id,
                access_item,
            } => AuthorizeResult::Granted(AccessGrant {
                session_id,
                access_item,
            }),
            AuthorizeReply::Refused { reason } => AuthorizeResult::Refused(reason),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
enum UsageReply {
    Ack,
    Revoke { reason: AccessRefusal },
}

impl From<UsageReply> for UsageResponse {
    fn from(reply: UsageReply) -> Self {
        match reply {
            UsageReply::Ack => UsageResponse::Ack,
            UsageReply::Revoke { reason } => UsageResponse::Revoke(reason),
        }
    }
}

/// 通过 HTTP 调用远程访问服务
pub struct HttpAccessManager {
    client: Client,
    base_url: Url,
    authorization: Option<String>,
}

impl HttpAccessManager {
    pub fn new(base_url: Url, authorization: Option<String>, timeout: Duration) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(TunnelError::config_error(format!(
                "Access manager base URL '{}' cannot be a base",
                base_url
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tunnel-core/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            authorization,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// 在基础 URL 之后追加路径段
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TunnelError::config_error("Access manager base URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<R> {
        let mut request = self.client.post(url.clone()).json(body);
        if let Some(auth) = &self.authorization {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TunnelError::backend(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        let reply = response.json::<R>().await?;
        debug!("Access manager call {} succeeded", url);
        Ok(reply)
    }
}

#[async_trait]
impl AccessManager for HttpAccessManager {
    async fn authorize(
        &self,
        credentials: &Credentials,
        remote: SocketAddr,
    ) -> Result<AuthorizeResult> {
        let url = self.endpoint(&["sessions"])?;
        let reply: AuthorizeReply = self
            .post(
                url,
                &AuthorizeRequest {
                    credentials,
                    remote_endpoint: remote,
                },
            )
            .await?;
        Ok(reply.into())
    }

    async fn report_usage(
        &self,
        session_id: SessionId,
        usage: Traffic,
        closed: bool,
    ) -> Result<UsageResponse> {
        let id = session_id.to_string();
        let url = self.endpoint(&["sessions", &id, "usage"])?;
        let reply: UsageReply = self
            .post(
                url,
                &UsageRequest {
                    sent: usage.sent,
                    received: usage.received,
                    closed,
                },
            )
            .await?;
        Ok(reply.into())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
