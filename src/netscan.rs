/// NetScan 防护模块
///
/// 对每个远端地址维护一个滑动时间窗口，记录最近的接入时间；
/// 窗口内次数超过阈值时拒绝接入并封禁一个窗口长度，用于抵御端口扫描和连接洪泛。
use crate::config::NetScanConfig;
use crate::error::SessionError;
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 每检查多少次顺带清理一次过期条目
const SWEEP_EVERY: u64 = 1024;

/// 单个地址的窗口记录
#[derive(Debug)]
struct WindowEntry {
    /// 已放行的接入时间（按时间升序）
    admissions: VecDeque<Instant>,
    /// 封禁截止时间
    blocked_until: Option<Instant>,
}

impl WindowEntry {
    fn new(capacity: usize) -> Self {
        Self {
            admissions: VecDeque::with_capacity(capacity.min(64)),
            blocked_until: None,
        }
    }

    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some(&front) = self.admissions.front() {
            if now.saturating_duration_since(front) >= window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_blocked(&self, now: Instant) -> bool {
        matches!(self.blocked_until, Some(until) if now < until)
    }

    /// 最后一次事件已滑出窗口且未处于封禁状态
    fn is_evictable(&self, now: Instant, window: Duration) -> bool {
        if self.is_blocked(now) {
            return false;
        }
        match self.admissions.back() {
            Some(&last) => now.saturating_duration_since(last) >= window,
            None => true,
        }
    }
}

/// NetScan 防护器
pub struct NetScanProtector {
    window: Duration,
    max_requests: usize,
    exempt_networks: Vec<IpNetwork>,
    entries: DashMap<IpAddr, WindowEntry>,
    checks: AtomicU64,
    rejected: AtomicU64,
}

impl NetScanProtector {
    /// 创建防护器：`window` 内单个地址最多放行 `max_requests` 次
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests: max_requests.max(1),
            exempt_networks: Vec::new(),
            entries: DashMap::new(),
            checks: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// 从配置创建
    pub fn from_config(config: &NetScanConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config.window(), config.max_requests)
            .with_exempt_networks(config.parse_exempt_networks()?))
    }

    /// 设置豁免网段
    pub fn with_exempt_networks(mut self, networks: Vec<IpNetwork>) -> Self {
        self.exempt_networks = networks;
        self
    }

    /// 检查一次接入请求
    pub fn check(&self, remote: SocketAddr) -> Result<(), SessionError> {
        self.check_at(remote, Instant::now())
    }

    /// 以指定时间点检查一次接入请求
    pub fn check_at(&self, remote: SocketAddr, now: Instant) -> Result<(), SessionError> {
        let ip = remote.ip();
        if self.is_exempt(ip) {
            return Ok(());
        }

        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep_at(now);
        }

        let admitted = {
            let mut entry = self
                .entries
                .entry(ip)
                .or_insert_with(|| WindowEntry::new(self.max_requests));

            if entry.is_blocked(now) {
                // 封禁期间继续尝试会延长封禁
                entry.blocked_until = Some(now + self.window);
                false
            } else {
                entry.evict_expired(now, self.window);
                if entry.admissions.len() + 1 > self.max_requests {
                    entry.blocked_until = Some(now + self.window);
                    false
                } else {
                    entry.admissions.push_back(now);
                    true
                }
            }
        };

        if admitted {
            Ok(())
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            Err(SessionError::net_scan(remote))
        }
    }

    /// 地址当前是否处于封禁状态
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.is_blocked_at(ip, Instant::now())
    }

    pub fn is_blocked_at(&self, ip: IpAddr, now: Instant) -> bool {
        self.entries
            .get(&ip)
            .map(|entry| entry.is_blocked(now))
            .unwrap_or(false)
    }

    /// 清理可回收的条目，返回清理数量
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_evictable(now, self.window));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("NetScan protector evicted {} idle entries", removed);
        }
        removed
    }

    /// 当前跟踪的地址数
    pub fn tracked_addresses(&self) -> usize {
        self.entries.len()
    }

    /// 自创建以来拒绝的次数
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    fn is_exempt(&self, ip: IpAddr) -> bool {
        self.exempt_networks.iter().any(|net| net.contains(ip))
    }
}
