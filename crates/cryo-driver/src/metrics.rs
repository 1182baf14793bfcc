//! 会话指标
//!
//! 原子计数器，任何线程都可以无锁读取。

use std::sync::atomic::{AtomicU64, Ordering};

/// 会话实时指标
#[derive(Debug, Default)]
pub struct SessionMetrics {
    /// 发出的命令总数（不含重试）
    pub queries: AtomicU64,
    /// 重试次数
    pub retries: AtomicU64,
    /// 读超时次数
    pub timeouts: AtomicU64,
    /// 应答语法错误次数
    pub protocol_errors: AtomicU64,
    /// I/O 之前被拒绝的参数
    pub validation_rejections: AtomicU64,
    /// 仪器 `ERR` 拒绝次数
    pub device_rejections: AtomicU64,
    /// 重试耗尽次数
    pub communication_failures: AtomicU64,
    /// 链路错误次数
    pub connection_errors: AtomicU64,
    /// 被读掉丢弃的迟到应答
    pub late_replies: AtomicU64,
    /// 重新连接次数
    pub reconnects: AtomicU64,
    /// 成功轮询次数
    pub polls_ok: AtomicU64,
    /// 失败轮询次数
    pub polls_failed: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            validation_rejections: self.validation_rejections.load(Ordering::Relaxed),
            device_rejections: self.device_rejections.load(Ordering::Relaxed),
            communication_failures: self.communication_failures.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            late_replies: self.late_replies.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            polls_ok: self.polls_ok.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.queries,
            &self.retries,
            &self.timeouts,
            &self.protocol_errors,
            &self.validation_rejections,
            &self.device_rejections,
            &self.communication_failures,
            &self.connection_errors,
            &self.late_replies,
            &self.reconnects,
            &self.polls_ok,
            &self.polls_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// 指标快照（不可变）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub queries: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub protocol_errors: u64,
    pub validation_rejections: u64,
    pub device_rejections: u64,
    pub communication_failures: u64,
    pub connection_errors: u64,
    pub late_replies: u64,
    pub reconnects: u64,
    pub polls_ok: u64,
    pub polls_failed: u64,
}

impl MetricsSnapshot {
    /// 轮询成功率（百分比），无轮询时返回 100.0
    pub fn poll_success_rate(&self) -> f64 {
        let total = self.polls_ok + self.polls_failed;
        if total == 0 {
            return 100.0;
        }
        self.polls_ok as f64 / total as f64 * 100.0
    }
}
