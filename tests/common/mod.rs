//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tunnel_core::access::{
    AccessGrant, AccessItem, AccessManager, AccessRefusal, AuthorizeResult, Credentials,
    SessionId, UsageResponse,
};
use tunnel_core::client_stream::{ClientStream, DisposeFlag, EndpointPair, StreamId};
use tunnel_core::config::SessionConfig;
use tunnel_core::error::{Result, SessionError, TunnelError};
use tunnel_core::usage::Traffic;

/// One call to `report_usage` seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub session_id: SessionId,
    pub usage: Traffic,
    pub closed: bool,
    /// false when the mock returned an error
    pub delivered: bool,
}

/// Scriptable in-memory access manager
#[derive(Default)]
pub struct MockAccessManager {
    next_id: AtomicU64,
    authorize_calls: AtomicUsize,
    reports: Mutex<Vec<UsageReport>>,
    fail_all_reports: AtomicBool,
    failing_sessions: Mutex<HashSet<SessionId>>,
    revocations: Mutex<HashMap<SessionId, AccessRefusal>>,
    refusal: Mutex<Option<AccessRefusal>>,
    fixed_session_id: Mutex<Option<SessionId>>,
    delay: Mutex<Duration>,
}

impl MockAccessManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        })
    }

    pub fn set_fail_reports(&self, fail: bool) {
        self.fail_all_reports.store(fail, Ordering::SeqCst);
    }

    pub fn fail_session(&self, session_id: SessionId) {
        self.failing_sessions.lock().insert(session_id);
    }

    pub fn revoke(&self, session_id: SessionId, reason: AccessRefusal) {
        self.revocations.lock().insert(session_id, reason);
    }

    pub fn refuse_with(&self, refusal: Option<AccessRefusal>) {
        *self.refusal.lock() = refusal;
    }

    /// Always grant this session id (simulates a backend that reuses sessions)
    pub fn grant_session_id(&self, session_id: Option<SessionId>) {
        *self.fixed_session_id.lock() = session_id;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn authorize_calls(&self) -> usize {
        self.authorize_calls.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<UsageReport> {
        self.reports.lock().clone()
    }

    pub fn reports_for(&self, session_id: SessionId) -> Vec<UsageReport> {
        self.reports
            .lock()
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Sum of all delivered deltas for one session
    pub fn delivered_total(&self, session_id: SessionId) -> Traffic {
        self.reports_for(session_id)
            .iter()
            .filter(|r| r.delivered)
            .fold(Traffic::default(), |acc, r| acc + r.usage)
    }

    async fn wait(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AccessManager for MockAccessManager {
    async fn authorize(
        &self,
        credentials: &Credentials,
        _remote: SocketAddr,
    ) -> Result<AuthorizeResult> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        self.wait().await;

        if let Some(refusal) = self.refusal.lock().clone() {
            return Ok(AuthorizeResult::Refused(refusal));
        }

        let fixed = *self.fixed_session_id.lock();
        let session_id =
            fixed.unwrap_or_else(|| SessionId(self.next_id.fetch_add(1, Ordering::SeqCst)));

        Ok(AuthorizeResult::Granted(AccessGrant {
            session_id,
            access_item: AccessItem {
                token_id: credentials.token_id.clone(),
                name: None,
                max_traffic: None,
                expires_at: None,
                max_clients: None,
            },
        }))
    }

    async fn report_usage(
        &self,
        session_id: SessionId,
        usage: Traffic,
        closed: bool,
    ) -> Result<UsageResponse> {
        self.wait().await;

        let fail = self.fail_all_reports.load(Ordering::SeqCst)
            || self.failing_sessions.lock().contains(&session_id);
        self.reports.lock().push(UsageReport {
            session_id,
            usage,
            closed,
            delivered: !fail,
        });

        if fail {
            return Err(TunnelError::backend("mock backend unavailable"));
        }
        match self.revocations.lock().get(&session_id) {
            Some(reason) => Ok(UsageResponse::Revoke(reason.clone())),
            None => Ok(UsageResponse::Ack),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// In-memory client stream
pub struct MockClientStream {
    id: StreamId,
    disposed: DisposeFlag,
    alive: AtomicBool,
    graceful: Mutex<Option<bool>>,
    dispose_calls: Mutex<Vec<bool>>,
    force_closes: AtomicUsize,
    dispose_delay: Duration,
    endpoints: EndpointPair,
}

impl MockClientStream {
    pub fn new() -> Arc<Self> {
        Self::with_dispose_delay(Duration::ZERO)
    }

    /// Graceful dispose takes `delay` to complete
    pub fn with_dispose_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: StreamId::new(),
            disposed: DisposeFlag::new(),
            alive: AtomicBool::new(true),
            graceful: Mutex::new(None),
            dispose_calls: Mutex::new(Vec::new()),
            force_closes: AtomicUsize::new(0),
            dispose_delay: delay,
            endpoints: EndpointPair::new(server_endpoint(), client_endpoint()),
        })
    }

    /// Simulate the peer closing the connection
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// `Some(graceful)` of the first dispose call
    pub fn disposed_with(&self) -> Option<bool> {
        *self.graceful.lock()
    }

    /// `graceful` argument of every dispose call, including no-op repeats
    pub fn dispose_calls(&self) -> Vec<bool> {
        self.dispose_calls.lock().clone()
    }

    pub fn force_closes(&self) -> usize {
        self.force_closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientStream for MockClientStream {
    fn stream_id(&self) -> Option<String> {
        self.id.get()
    }

    fn set_stream_id(&self, stream_id: &str) -> std::result::Result<(), SessionError> {
        self.id.set(stream_id)
    }

    fn endpoint_pair(&self) -> EndpointPair {
        self.endpoints
    }

    fn is_disposed(&self) -> bool {
        self.disposed.is_set()
    }

    fn check_is_alive(&self) -> bool {
        !self.is_disposed() && self.alive.load(Ordering::SeqCst)
    }

    async fn dispose(&self, graceful: bool) {
        self.dispose_calls.lock().push(graceful);
        if !self.disposed.begin() {
            return;
        }
        *self.graceful.lock() = Some(graceful);
        if graceful && !self.dispose_delay.is_zero() {
            tokio::time::sleep(self.dispose_delay).await;
        }
    }

    fn force_close(&self) {
        self.disposed.begin();
        self.force_closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn server_endpoint() -> SocketAddr {
    "127.0.0.1:443".parse().unwrap()
}

pub fn client_endpoint() -> SocketAddr {
    "198.51.100.7:50000".parse().unwrap()
}

pub fn credentials(client_id: &str) -> Credentials {
    Credentials {
        token_id: "token-1".to_string(),
        secret: "secret".to_string(),
        client_id: client_id.to_string(),
        protocol_version: 1,
        client_version: Some("1.0.0".to_string()),
    }
}

/// Session settings with short drain/access timeouts
pub fn session_config() -> SessionConfig {
    SessionConfig {
        sync_interval_secs: 30,
        cleanup_interval_secs: 10,
        idle_timeout_secs: 60,
        drain_timeout_secs: 1,
        stream_dispose_timeout_ms: 200,
        access_timeout_secs: 1,
        min_protocol_version: 1,
        max_sessions: None,
    }
}

/// Connected loopback TCP pair: (accepted, client)
pub async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (accepted.expect("Failed to accept").0, client.expect("Failed to connect"))
}

/// Unique temporary directory removed on drop
pub struct TestDir {
    pub path: PathBuf,
}

impl TestDir {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        Self { path }
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// One request seen by [`HttpResponder`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

type Handler = dyn Fn(&str, &serde_json::Value) -> (u16, serde_json::Value) + Send + Sync;

/// Minimal HTTP/1.1 server answering JSON requests with a handler
pub struct HttpResponder {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl HttpResponder {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &serde_json::Value) -> (u16, serde_json::Value) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind HTTP responder");
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = requests.clone();
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let recorded = recorded.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _ = serve_one(socket, recorded, handler).await;
                });
            }
        });

        Self {
            base_url: format!("http://{}/api/", addr),
            requests,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for HttpResponder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_one(
    mut socket: TcpStream,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    handler: Arc<Handler>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            if name == "content-length" {
                content_length = value.trim().parse().unwrap_or(0);
            } else if name == "authorization" {
                authorization = Some(value.trim().to_string());
            }
        }
    }

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body: serde_json::Value =
        serde_json::from_slice(&buf[header_end..]).unwrap_or(serde_json::Value::Null);
    let (status, reply) = handler(&path, &body);
    recorded.lock().push(RecordedRequest {
        method,
        path,
        authorization,
        body,
    });

    let payload = reply.to_string();
    let response = format!(
        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        payload.len(),
        payload
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}
