use super::{ClientStream, DisposeFlag, EndpointPair, StreamId};
use crate::error::SessionError;
use async_trait::async_trait;
use socket2::SockRef;
use std::io;
use std::mem::MaybeUninit;
use std::net::Shutdown;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// 默认的优雅关闭时间预算
const DEFAULT_DISPOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// 基于 TCP 连接的客户端流
pub struct TcpClientStream {
    stream: TcpStream,
    endpoints: EndpointPair,
    stream_id: StreamId,
    disposed: DisposeFlag,
    dispose_timeout: Duration,
}

impl TcpClientStream {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let endpoints = EndpointPair::new(stream.local_addr()?, stream.peer_addr()?);
        Ok(Self {
            stream,
            endpoints,
            stream_id: StreamId::new(),
            disposed: DisposeFlag::new(),
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
        })
    }

    /// 设置优雅关闭的时间预算
    pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout = timeout;
        self
    }

    /// 底层连接，供转发循环读写
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    fn shutdown_both(&self) {
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("Stream {} shutdown error: {}", self.endpoints, e);
            }
        }
    }

    /// 关闭写端后等待对端 EOF
    async fn graceful_close(&self) -> io::Result<()> {
        SockRef::from(&self.stream).shutdown(Shutdown::Write)?;

        let mut buf = [0u8; 4096];
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(&mut buf) {
                Ok(0) => return Ok(()),
                // 关闭阶段对端仍在发送的数据直接丢弃
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ClientStream for TcpClientStream {
    fn stream_id(&self) -> Option<String> {
        self.stream_id.get()
    }

    fn set_stream_id(&self, stream_id: &str) -> Result<(), SessionError> {
        self.stream_id
            .set(stream_id)
            .map_err(|e| e.with_endpoint(self.endpoints.remote))
    }

    fn endpoint_pair(&self) -> EndpointPair {
        self.endpoints
    }

    fn is_disposed(&self) -> bool {
        self.disposed.is_set()
    }

    fn check_is_alive(&self) -> bool {
        if self.disposed.is_set() {
            return false;
        }

        let sock = SockRef::from(&self.stream);
        match sock.take_error() {
            Ok(None) => {}
            Ok(Some(e)) => {
                debug!("Stream {} has socket error: {}", self.endpoints, e);
                return false;
            }
            Err(e) => {
                debug!("Stream {} error check failed: {}", self.endpoints, e);
                return false;
            }
        }

        // 使用 MSG_PEEK 检查连接状态而不消耗数据
        let mut buf = [MaybeUninit::<u8>::uninit(); 1];
        match sock.peek(&mut buf) {
            Ok(0) => false, // EOF，对端已关闭
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true, // 无数据，连接正常
            Err(e) => {
                debug!("Stream {} liveness check failed: {}", self.endpoints, e);
                false
            }
        }
    }

    async fn dispose(&self, graceful: bool) {
        if !self.disposed.begin() {
            return;
        }

        if graceful {
            match tokio::time::timeout(self.dispose_timeout, self.graceful_close()).await {
                Ok(Ok(())) => {
                    debug!("Stream {} closed gracefully", self.endpoints);
                    self.shutdown_both();
                    return;
                }
                Ok(Err(e)) => debug!("Stream {} graceful close failed: {}", self.endpoints, e),
                Err(_) => debug!(
                    "Stream {} graceful close timed out after {:?}, forcing",
                    self.endpoints, self.dispose_timeout
                ),
            }
        }
        self.force_close();
    }

    fn force_close(&self) {
        self.disposed.begin();
        // SO_LINGER=0：关闭时直接发送 RST
        if let Err(e) = SockRef::from(&self.stream).set_linger(Some(Duration::ZERO)) {
            debug!("Stream {} set linger failed: {}", self.endpoints, e);
        }
        self.shutdown_both();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    #[tokio::test]
    async fn test_endpoints_and_stream_id() {
        let (server, client) = tcp_pair().await;
        let stream = TcpClientStream::new(server).unwrap();

        let pair = stream.endpoint_pair();
        assert_eq!(pair.remote, client.local_addr().unwrap());
        assert_eq!(pair.local, client.peer_addr().unwrap());

        assert!(stream.set_stream_id("s1").is_ok());
        assert!(stream.set_stream_id("s2").is_err());
        assert_eq!(stream.stream_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_liveness_does_not_consume_data() {
        let (server, mut client) = tcp_pair().await;
        let stream = TcpClientStream::new(server).unwrap();

        client.write_all(b"hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stream.check_is_alive());

        // 数据仍然在缓冲区中
        let mut buf = [0u8; 5];
        stream.stream().readable().await.unwrap();
        let n = stream.stream().try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_liveness_detects_peer_close() {
        let (server, client) = tcp_pair().await;
        let stream = TcpClientStream::new(server).unwrap();
        assert!(stream.check_is_alive());

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stream.check_is_alive());
    }

    #[tokio::test]
    async fn test_graceful_dispose_sends_eof() {
        let (server, mut client) = tcp_pair().await;
        let stream = TcpClientStream::new(server)
            .unwrap()
            .with_dispose_timeout(Duration::from_millis(500));

        let peer = tokio::spawn(async move {
            let mut buf = Vec::new();
            // 读到 EOF 后关闭自身，完成关闭握手
            client.read_to_end(&mut buf).await.unwrap();
            client.shutdown().await.ok();
            buf.len()
        });

        stream.dispose(true).await;
        assert!(stream.is_disposed());
        assert!(!stream.check_is_alive());
        assert_eq!(peer.await.unwrap(), 0);

        // 第二次调用是空操作
        stream.dispose(false).await;
    }

    #[tokio::test]
    async fn test_force_close_after_cancelled_dispose() {
        let (server, _client) = tcp_pair().await;
        let stream = TcpClientStream::new(server)
            .unwrap()
            .with_dispose_timeout(Duration::from_secs(10));

        // 优雅关闭被外部超时取消，关闭标志已经置位
        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), stream.dispose(true)).await;
        assert!(cancelled.is_err());
        assert!(stream.is_disposed());
        assert_eq!(SockRef::from(stream.stream()).linger().unwrap(), None);

        stream.force_close();
        assert_eq!(
            SockRef::from(stream.stream()).linger().unwrap(),
            Some(Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn test_graceful_dispose_is_bounded() {
        let (server, _client) = tcp_pair().await;
        let stream = TcpClientStream::new(server)
            .unwrap()
            .with_dispose_timeout(Duration::from_millis(100));

        // 对端从不关闭，超时后强制关闭
        let started = std::time::Instant::now();
        stream.dispose(true).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(stream.is_disposed());
        // 超时后走强制关闭
        assert_eq!(
            SockRef::from(stream.stream()).linger().unwrap(),
            Some(Duration::ZERO)
        );
    }
}
