//! 会话 API
//!
//! [`open_session`] 打开仪器并启动两个后台线程：
//! - 轮询线程：周期 `STAT?`，写入状态缓存
//! - 监督线程：驱动斜坡计划和联锁
//!
//! 两个线程与调用者只通过状态缓存和仪器会话的串行化点交互。
//! [`Session::close`] 依次停止监督线程（执行中的计划按取消处理）、轮询线程，
//! 最后关闭传输。

use crate::error::ClientError;
use crate::interlock::Interlock;
use crate::ramp::RampPlan;
use crate::supervisor::{Supervisor, SupervisorConfig, SupervisorHandle, SupervisorState, SupervisorStatus};
use cryo_driver::{
    CacheHealth, InstrumentConfig, InstrumentIdentity, InstrumentSession, MetricsSnapshot, Poller, Reading,
    SessionBuilder, StateCache,
};
use cryo_transport::Transport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// 会话配置
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub instrument: InstrumentConfig,
    pub supervisor: SupervisorConfig,
    /// 打开时即启用的联锁
    pub interlocks: Vec<Interlock>,
}

impl SessionConfig {
    pub fn new(instrument: InstrumentConfig) -> Self {
        Self {
            instrument,
            ..Default::default()
        }
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_interlock(mut self, interlock: Interlock) -> Self {
        self.interlocks.push(interlock);
        self
    }
}

impl From<InstrumentConfig> for SessionConfig {
    fn from(instrument: InstrumentConfig) -> Self {
        Self::new(instrument)
    }
}

/// 按端口字符串打开会话
///
/// # Example
///
/// ```
/// use cryo_client::open_session;
/// use cryo_driver::InstrumentConfig;
///
/// let session = open_session(InstrumentConfig::new("sim://demo")).unwrap();
/// assert_eq!(session.identity().unwrap().model, "SIM-1");
/// session.close();
/// ```
pub fn open_session(config: impl Into<SessionConfig>) -> Result<Session, ClientError> {
    let config = config.into();
    config.supervisor.validate()?;
    let instrument = SessionBuilder::from_config(config.instrument.clone()).open()?;
    Session::start(instrument, config)
}

/// 在自定义传输上打开会话（模拟器、测试替身）
pub fn open_session_with(
    transport: Box<dyn Transport>,
    config: impl Into<SessionConfig>,
) -> Result<Session, ClientError> {
    let config = config.into();
    config.supervisor.validate()?;
    let instrument = SessionBuilder::from_config(config.instrument.clone())
        .transport(transport)
        .open()?;
    Session::start(instrument, config)
}

/// 一台仪器的完整会话
pub struct Session {
    instrument: Arc<InstrumentSession>,
    cache: StateCache,
    poller: Mutex<Poller>,
    supervisor: SupervisorHandle,
    closed: AtomicBool,
}

impl Session {
    fn start(instrument: InstrumentSession, config: SessionConfig) -> Result<Self, ClientError> {
        // 范围在打开仪器后才确定（配置或 `LIM?`）
        if let Err(e) = config.supervisor.validate_for(instrument.setpoint_range()) {
            instrument.close();
            return Err(e.into());
        }
        let instrument = Arc::new(instrument);
        let (writer, cache) = StateCache::new();
        let poller = Poller::spawn(Arc::clone(&instrument), writer, config.instrument.poll_interval())?;

        let mut supervisor = Supervisor::new(instrument.clone(), cache.clone(), config.supervisor);
        for interlock in config.interlocks {
            supervisor.add_interlock(interlock);
        }
        let supervisor = SupervisorHandle::spawn(supervisor)?;

        info!(
            "Session open on {} (poll {:?})",
            instrument.address(),
            config.instrument.poll_interval()
        );
        Ok(Self {
            instrument,
            cache,
            poller: Mutex::new(poller),
            supervisor,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// 直接读取当前温度（一次 `TEMP?` 往返）
    pub fn get_temperature(&self) -> Result<f64, ClientError> {
        self.ensure_open()?;
        Ok(self.instrument.get_temperature()?)
    }

    /// 手动写入设定点
    ///
    /// 由监督线程执行，与计划的启动和推进互斥：有计划在执行时返回 `Busy`，
    /// 安全动作未完成时返回 `SafeActionPending`。
    pub fn set_setpoint(&self, value: f64) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.supervisor.set_setpoint(value)
    }

    /// 开始执行斜坡计划（需要 `Idle`）
    pub fn start_ramp(&self, plan: RampPlan) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.supervisor.start(plan)
    }

    /// 请求取消当前计划；在下一个 tick 生效
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    /// `Complete` / `Aborted` → `Idle`
    pub fn reset(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.supervisor.reset()
    }

    pub fn add_interlock(&self, interlock: Interlock) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.supervisor.add_interlock(interlock)
    }

    /// 链路故障后按原端口重新连接
    ///
    /// 断开期间轮询失败、缓存变旧；执行中的计划会因陈旧度超限而中止。
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        Ok(self.instrument.connect()?)
    }

    /// 在新的传输上重新连接
    pub fn reconnect_with(&self, transport: Box<dyn Transport>) -> Result<(), ClientError> {
        self.ensure_open()?;
        Ok(self.instrument.connect_with(transport)?)
    }

    pub fn is_connected(&self) -> bool {
        self.instrument.is_connected()
    }

    /// 缓存中的最新读数（不做 I/O）
    pub fn latest_reading(&self) -> Option<Reading> {
        self.cache.latest()
    }

    /// 距最近一次成功轮询的时间
    pub fn staleness(&self) -> Duration {
        self.cache.staleness()
    }

    pub fn cache_health(&self) -> CacheHealth {
        self.cache.health()
    }

    /// 缓存读端（可克隆、可跨线程）
    pub fn cache(&self) -> StateCache {
        self.cache.clone()
    }

    pub fn status(&self) -> SupervisorStatus {
        self.supervisor.status()
    }

    pub fn state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    pub fn identity(&self) -> Option<Arc<InstrumentIdentity>> {
        self.instrument.identity()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.instrument.metrics().snapshot()
    }

    /// 底层仪器会话（用于监督器之外的临时命令）
    pub fn instrument(&self) -> &Arc<InstrumentSession> {
        &self.instrument
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 停止监督与轮询线程并关闭传输（幂等）
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.supervisor.stop();
        self.poller.lock().stop();
        self.instrument.close();
        info!("Session {} closed", self.instrument.address());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.instrument.address())
            .field("state", &self.supervisor.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
