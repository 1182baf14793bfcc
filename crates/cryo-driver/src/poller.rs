//! 状态轮询线程
//!
//! 专用线程按固定周期发出 `STAT?`，成功则发布到缓存，失败则记录并保留旧读数。
//! 停止信号通过 shutdown 通道传递，`crossbeam_channel::select!` 同时等待
//! 周期 tick 和停止信号，因此停止不需要等到下一次 tick。

use crate::cache::CacheWriter;
use crate::clock::JoinTimeout;
use crate::error::DriverError;
use crate::metrics::SessionMetrics;
use crate::session::InstrumentSession;
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// 默认轮询周期
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 轮询线程句柄；drop 时停止并等待线程退出
#[derive(Debug)]
pub struct Poller {
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl Poller {
    /// 启动轮询线程（立即执行第一次轮询）
    pub fn spawn(
        session: Arc<InstrumentSession>,
        writer: CacheWriter,
        interval: Duration,
    ) -> Result<Self, DriverError> {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let handle = std::thread::Builder::new()
            .name("cryo-poller".to_string())
            .spawn(move || poll_loop(session, writer, interval, shutdown_rx))
            .map_err(|e| DriverError::Thread(format!("failed to spawn poller: {}", e)))?;

        info!("Poller started (interval {:?})", interval);
        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// 停止轮询并等待线程退出（幂等）
    ///
    /// 在途的 `STAT?` 会先完成。
    pub fn stop(&mut self) {
        // drop 发送端即可唤醒 select!
        self.shutdown_tx.take();
        if let Some(handle) = self.handle.take() {
            let join_timeout = Duration::from_secs(5);
            if handle.join_timeout(join_timeout).is_err() {
                error!("Poller thread failed to shut down within {:?}", join_timeout);
            } else {
                debug!("Poller stopped");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    session: Arc<InstrumentSession>,
    mut writer: CacheWriter,
    interval: Duration,
    shutdown_rx: Receiver<()>,
) {
    let ticker = tick(interval);
    if !poll_once(&session, &mut writer) {
        return;
    }

    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(ticker) -> _ => {
                if !poll_once(&session, &mut writer) {
                    break;
                }
            },
        }
    }
    trace!("Poller loop exited");
}

/// 执行一次轮询，返回是否继续
fn poll_once(session: &InstrumentSession, writer: &mut CacheWriter) -> bool {
    match session.get_status() {
        Ok(status) => {
            let reading = writer.publish_status(status);
            SessionMetrics::incr(&session.metrics().polls_ok);
            trace!(
                "Published reading #{}: T={:.2} SP={:.2}",
                reading.sequence, reading.temperature, reading.setpoint
            );
            true
        },
        Err(DriverError::Closed) => {
            debug!("Session closed, poller exiting");
            false
        },
        Err(e) => {
            SessionMetrics::incr(&session.metrics().polls_failed);
            writer.record_failure(&e);
            true
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StateCache;
    use crate::config::{InstrumentConfig, RetryPolicy};
    use cryo_transport::{Fault, SimConfig, SimTransport};

    fn open_sim() -> (Arc<InstrumentSession>, cryo_transport::SimHandle) {
        let sim = SimTransport::new(SimConfig::default());
        let handle = sim.handle();
        let config = InstrumentConfig::default()
            .with_timeout(Duration::from_millis(10))
            .with_retry(RetryPolicy::none());
        (Arc::new(InstrumentSession::open(Box::new(sim), &config).unwrap()), handle)
    }

    #[test]
    fn test_poller_publishes_readings() {
        let (session, _handle) = open_sim();
        let (writer, cache) = StateCache::new();
        let mut poller = Poller::spawn(Arc::clone(&session), writer, Duration::from_millis(10)).unwrap();

        std::thread::sleep(Duration::from_millis(80));
        let reading = cache.latest().expect("poller should publish");
        assert!(reading.sequence >= 2);
        assert!(cache.staleness() < Duration::from_millis(50));
        assert!(poller.is_running());

        poller.stop();
        poller.stop();
        assert!(!poller.is_running());
        assert!(session.metrics().snapshot().polls_ok >= 2);
    }

    #[test]
    fn test_poller_keeps_last_reading_on_failure() {
        let (session, handle) = open_sim();
        let (writer, cache) = StateCache::new();
        let _poller = Poller::spawn(Arc::clone(&session), writer, Duration::from_millis(10)).unwrap();

        std::thread::sleep(Duration::from_millis(40));
        let before = cache.latest().unwrap();
        handle.inject(Fault::Silent { count: 1_000 });
        std::thread::sleep(Duration::from_millis(80));

        let health = cache.health();
        assert!(health.consecutive_failures >= 1);
        assert!(health.last_error.is_some());
        let after = cache.latest().unwrap();
        assert!(after.sequence >= before.sequence);
        assert!(cache.staleness() >= Duration::from_millis(30));
    }

    #[test]
    fn test_poller_exits_when_session_closes() {
        let (session, _handle) = open_sim();
        let (writer, _cache) = StateCache::new();
        let poller = Poller::spawn(Arc::clone(&session), writer, Duration::from_millis(5)).unwrap();
        session.close();
        std::thread::sleep(Duration::from_millis(40));
        assert!(!poller.is_running());
    }
}
