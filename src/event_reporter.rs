/// 聚合事件上报
///
/// 高频低价值的事件（例如扫描流量被拒绝）不逐条写日志，
/// 而是累计后按次数或时间间隔输出一行汇总，避免被刷日志。
use crate::config::EventReporterConfig;
use crate::error::SessionErrorCode;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

struct ReporterState {
    pending: u64,
    total: u64,
    last_report: Instant,
}

/// 单类事件的聚合上报器
pub struct EventReporter {
    message: String,
    max_pending: u64,
    report_interval: Duration,
    state: Mutex<ReporterState>,
}

impl EventReporter {
    pub fn new(message: impl Into<String>, max_pending: u64, report_interval: Duration) -> Self {
        Self {
            message: message.into(),
            max_pending: max_pending.max(1),
            report_interval,
            state: Mutex::new(ReporterState {
                pending: 0,
                total: 0,
                last_report: Instant::now(),
            }),
        }
    }

    /// 记录一次事件，达到阈值时输出汇总；返回是否输出了汇总
    pub fn raise(&self) -> bool {
        self.raise_at(Instant::now())
    }

    pub fn raise_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.pending += 1;
        state.total += 1;

        if state.pending >= self.max_pending
            || now.saturating_duration_since(state.last_report) >= self.report_interval
        {
            self.emit(&mut state, now);
            return true;
        }
        false
    }

    /// 如果距上次汇总已超过间隔且有待报事件，则输出汇总
    pub fn report_if_due(&self) -> bool {
        self.report_if_due_at(Instant::now())
    }

    pub fn report_if_due_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.pending > 0
            && now.saturating_duration_since(state.last_report) >= self.report_interval
        {
            self.emit(&mut state, now);
            return true;
        }
        false
    }

    /// 输出所有待报事件
    pub fn flush(&self) {
        let mut state = self.state.lock();
        if state.pending > 0 {
            self.emit(&mut state, Instant::now());
        }
    }

    /// 自创建以来的事件总数
    pub fn total(&self) -> u64 {
        self.state.lock().total
    }

    /// 尚未汇总输出的事件数
    pub fn pending(&self) -> u64 {
        self.state.lock().pending
    }

    fn emit(&self, state: &mut ReporterState, now: Instant) {
        warn!(
            category = "net_protect",
            "{}. Count: {}, Total: {}", self.message, state.pending, state.total
        );
        state.pending = 0;
        state.last_report = now;
    }
}

/// 按错误码划分的聚合上报器集合
pub struct ErrorReporters {
    net_scan: EventReporter,
    throttled: EventReporter,
}

impl ErrorReporters {
    pub fn new(config: &EventReporterConfig) -> Self {
        Self {
            net_scan: EventReporter::new(
                "NetScan protector rejected some requests",
                config.max_pending,
                config.report_interval(),
            ),
            throttled: EventReporter::new(
                "Admission rate limiter rejected some requests",
                config.max_pending,
                config.report_interval(),
            ),
        }
    }

    pub fn reporter_for(&self, code: SessionErrorCode) -> Option<&EventReporter> {
        match code {
            SessionErrorCode::NetScanExceeded => Some(&self.net_scan),
            SessionErrorCode::AdmissionThrottled => Some(&self.throttled),
            _ => None,
        }
    }

    pub fn net_scan(&self) -> &EventReporter {
        &self.net_scan
    }

    pub fn throttled(&self) -> &EventReporter {
        &self.throttled
    }

    pub fn report_if_due(&self) {
        self.net_scan.report_if_due();
        self.throttled.report_if_due();
    }

    pub fn flush(&self) {
        self.net_scan.flush();
        self.throttled.flush();
    }
}

impl Default for ErrorReporters {
    fn default() -> Self {
        Self::new(&EventReporterConfig::default())
    }
}
