//! 状态缓存
//!
//! 单写多读：[`StateCache::new`] 返回唯一的 [`CacheWriter`]（不可克隆，只交给轮询线程）
//! 和可克隆的 [`StateCache`] 读端。
//!
//! - 发布是整体替换（`ArcSwapOption`），读者永远看不到半条读数
//! - 读路径无锁、不做任何 I/O
//! - 轮询失败时保留上一条读数，`staleness()` 持续增长

use crate::clock::monotonic_micros;
use crate::reading::{Reading, Status};
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

#[derive(Debug)]
struct CacheInner {
    latest: ArcSwapOption<Reading>,
    /// 最近一次成功发布的时刻（未发布时为创建时刻）
    last_publish_us: AtomicU64,
    publishes: AtomicU64,
    consecutive_failures: AtomicU64,
    total_failures: AtomicU64,
    last_error: ArcSwapOption<String>,
}

/// 缓存健康快照
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHealth {
    pub publishes: u64,
    pub consecutive_failures: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
    pub staleness: Duration,
}

/// 缓存读端（可克隆，可跨线程）
#[derive(Debug, Clone)]
pub struct StateCache {
    inner: Arc<CacheInner>,
}

/// 缓存写端（唯一）
#[derive(Debug)]
pub struct CacheWriter {
    inner: Arc<CacheInner>,
    last_timestamp_us: u64,
    next_sequence: u64,
}

impl StateCache {
    /// 创建缓存，返回 (写端, 读端)
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (CacheWriter, StateCache) {
        let inner = Arc::new(CacheInner {
            latest: ArcSwapOption::empty(),
            last_publish_us: AtomicU64::new(monotonic_micros()),
            publishes: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            last_error: ArcSwapOption::empty(),
        });
        let writer = CacheWriter {
            inner: Arc::clone(&inner),
            last_timestamp_us: 0,
            next_sequence: 1,
        };
        (writer, StateCache { inner })
    }

    /// 最新读数（从未发布时为 `None`）
    pub fn latest(&self) -> Option<Reading> {
        self.inner.latest.load().as_deref().copied()
    }

    /// 距最近一次成功发布的时间（从未发布时为距创建的时间）
    pub fn staleness(&self) -> Duration {
        let last = self.inner.last_publish_us.load(Ordering::Acquire);
        Duration::from_micros(monotonic_micros().saturating_sub(last))
    }

    pub fn is_stale(&self, max: Duration) -> bool {
        self.staleness() > max
    }

    pub fn health(&self) -> CacheHealth {
        CacheHealth {
            publishes: self.inner.publishes.load(Ordering::Relaxed),
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::Relaxed),
            total_failures: self.inner.total_failures.load(Ordering::Relaxed),
            last_error: self.inner.last_error.load_full().map(|e| (*e).clone()),
            staleness: self.staleness(),
        }
    }
}

impl CacheWriter {
    /// 发布一条读数
    ///
    /// 分配序号；时间戳未超过上一条时改写为上一条 + 1 µs，保证严格递增。
    pub fn publish(&mut self, mut reading: Reading) -> Reading {
        if reading.timestamp_us <= self.last_timestamp_us {
            reading.timestamp_us = self.last_timestamp_us + 1;
        }
        reading.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.last_timestamp_us = reading.timestamp_us;

        self.inner.latest.store(Some(Arc::new(reading)));
        self.inner.last_publish_us.store(monotonic_micros(), Ordering::Release);
        self.inner.publishes.fetch_add(1, Ordering::Relaxed);
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        reading
    }

    /// 以当前时刻发布一条状态
    pub fn publish_status(&mut self, status: Status) -> Reading {
        self.publish(Reading::from_status(status, monotonic_micros()))
    }

    /// 记录一次失败的轮询（保留上一条读数）
    pub fn record_failure(&self, error: &dyn std::fmt::Display) {
        let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.total_failures.fetch_add(1, Ordering::Relaxed);
        self.inner.last_error.store(Some(Arc::new(error.to_string())));
        if failures == 1 {
            warn!("State poll failed, keeping last reading: {}", error);
        }
    }

    /// 对应的读端
    pub fn reader(&self) -> StateCache {
        StateCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::AlarmFlags;

    fn status(temperature: f64) -> Status {
        Status {
            temperature,
            setpoint: 10.0,
            heater_power: 5.0,
            ramp_rate: 1.0,
            alarms: AlarmFlags::empty(),
        }
    }

    #[test]
    fn test_empty_cache() {
        let (_writer, cache) = StateCache::new();
        assert!(cache.latest().is_none());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.staleness() >= Duration::from_millis(5));
        assert!(cache.is_stale(Duration::from_millis(1)));
    }

    #[test]
    fn test_publish_assigns_sequence_and_monotonic_timestamps() {
        let (mut writer, cache) = StateCache::new();
        let first = writer.publish(Reading::from_status(status(4.0), 100));
        let second = writer.publish(Reading::from_status(status(4.1), 100));
        let third = writer.publish(Reading::from_status(status(4.2), 50));

        assert_eq!((first.sequence, second.sequence, third.sequence), (1, 2, 3));
        assert_eq!(first.timestamp_us, 100);
        assert_eq!(second.timestamp_us, 101);
        assert_eq!(third.timestamp_us, 102);
        assert_eq!(cache.latest(), Some(third));
    }

    #[test]
    fn test_failure_keeps_last_reading() {
        let (mut writer, cache) = StateCache::new();
        let published = writer.publish_status(status(4.2));
        std::thread::sleep(Duration::from_millis(5));

        writer.record_failure(&"timeout");
        writer.record_failure(&"timeout");

        assert_eq!(cache.latest(), Some(published));
        let health = cache.health();
        assert_eq!(health.publishes, 1);
        assert_eq!(health.consecutive_failures, 2);
        assert_eq!(health.last_error.as_deref(), Some("timeout"));
        assert!(health.staleness >= Duration::from_millis(5));

        writer.publish_status(status(4.3));
        assert_eq!(cache.health().consecutive_failures, 0);
        assert_eq!(cache.health().total_failures, 2);
        assert!(cache.staleness() < Duration::from_millis(5));
    }

    #[test]
    fn test_concurrent_readers_see_whole_readings() {
        let (mut writer, cache) = StateCache::new();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let mut last_sequence = 0;
                    for _ in 0..2_000 {
                        if let Some(reading) = cache.latest() {
                            // 每条读数的温度与序号一一对应
                            assert_eq!(reading.temperature, reading.sequence as f64);
                            assert!(reading.sequence >= last_sequence);
                            last_sequence = reading.sequence;
                        }
                    }
                })
            })
            .collect();

        for i in 1..=2_000u64 {
            writer.publish(Reading::from_status(status(i as f64), i));
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(writer.reader().latest().map(|r| r.sequence), Some(2_000));
    }
}
