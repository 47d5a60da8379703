/// 全局接入速率限制器
///
/// 使用 token bucket 算法限制所有地址合计的新流接入速率，
/// 在 NetScan 检查之前执行，被拒绝的请求按扫描类错误聚合上报
use crate::config::RateLimitConfig;
use crate::error::SessionError;
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

/// 速率限制器包装器
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// 创建新的速率限制器（0 值按 1 处理，配置校验会提前拒绝 0）
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            inner: Arc::new(GovernorLimiter::direct(quota)),
            config,
        }
    }

    /// 尝试获取一个令牌（非阻塞）
    /// 返回 Ok(()) 如果允许请求，否则返回 Err(Duration) 表示需要等待的时间
    pub fn check(&self) -> Result<(), Duration> {
        match self.inner.check() {
            Ok(_) => Ok(()),
            Err(not_until) => Err(not_until.wait_time_from(DefaultClock::default().now())),
        }
    }

    /// 检查一次接入，超限时返回 `AdmissionThrottled`
    pub fn check_admission(&self, remote: SocketAddr) -> Result<(), SessionError> {
        self.check().map_err(|_| SessionError::throttled(remote))
    }

    /// 获取配置信息
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionErrorCode;

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 10,
            burst_size: 20,
        });
        assert_eq!(limiter.config().requests_per_second, 10);
        assert_eq!(limiter.config().burst_size, 20);
    }

    #[test]
    fn test_burst_then_throttled() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 1,
            burst_size: 10,
        });
        let remote: SocketAddr = "192.0.2.10:9000".parse().unwrap();

        // 前 10 个请求应该立即通过（burst_size）
        for _ in 0..10 {
            assert!(limiter.check_admission(remote).is_ok());
        }

        // 第 11 个请求应该被限流
        let err = limiter.check_admission(remote).unwrap_err();
        assert_eq!(err.code, SessionErrorCode::AdmissionThrottled);
    }

    #[test]
    fn test_clones_share_state() {
        let limiter1 = RateLimiter::new(RateLimitConfig {
            requests_per_second: 1,
            burst_size: 3,
        });
        let limiter2 = limiter1.clone();

        for _ in 0..3 {
            assert!(limiter1.check().is_ok());
        }

        // limiter2 共享同一个 governor 状态
        assert!(limiter2.check().is_err());
    }
}
