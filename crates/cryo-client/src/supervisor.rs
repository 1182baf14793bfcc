//! 斜坡监督器
//!
//! 状态机：`Idle → Ramping → Holding → Complete`，`Aborted` 可从任一非终止状态进入。
//!
//! - 监督器只从 [`StateCache`] 读取状态，从不自己发查询命令
//! - 写命令通过 [`ControlPort`]（即会话的串行化点）下发
//! - 每个 tick：处理取消标志 → 评估新读数上的联锁 → 检查陈旧度 → 推进计划
//! - 中止时执行一次安全动作（`CutHeater` 先关闭加热器，再写安全设定点；
//!   两部分各自独立下发，一部分失败不影响另一部分），
//!   之后不再下发任何斜坡命令；必须显式 `reset()` 才能开始新计划
//! - 手动设定点也经监督线程下发，与计划的启动、推进互斥
//!
//! [`Supervisor`] 本身是同步的状态机，[`SupervisorHandle`] 把它放到专用线程上
//! 按 `tick_interval` 驱动。

use crate::error::{AbortReason, ClientError, SupervisionError};
use crate::interlock::{Action, Interlock};
use crate::ramp::{RampPlan, RampStep};
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, bounded, select, tick, unbounded};
use cryo_driver::{DriverError, InstrumentSession, JoinTimeout, Reading, SetpointRange, StateCache};
use cryo_protocol::MAX_ROUND_TRIP_ERROR;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 监督器配置
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SupervisorConfig {
    /// tick 周期
    pub tick_interval: Duration,
    /// 到达判定容差（K）
    pub tolerance: f64,
    /// 温度需在容差内持续的时间
    pub debounce: Duration,
    /// 步骤下发 / 安全动作的最大重试次数
    pub max_step_retries: u32,
    /// 计划执行中允许的最大缓存陈旧时间
    pub max_staleness: Duration,
    /// 安全设定点（`None` 时使用仪器范围下限）
    pub safe_setpoint: Option<f64>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            tolerance: 0.1,
            debounce: Duration::from_secs(2),
            max_step_retries: 3,
            max_staleness: Duration::from_secs(5),
            safe_setpoint: None,
        }
    }
}

impl SupervisorConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_max_step_retries(mut self, retries: u32) -> Self {
        self.max_step_retries = retries;
        self
    }

    pub fn with_max_staleness(mut self, staleness: Duration) -> Self {
        self.max_staleness = staleness;
        self
    }

    pub fn with_safe_setpoint(mut self, setpoint: f64) -> Self {
        self.safe_setpoint = Some(setpoint);
        self
    }

    /// 校验与仪器无关的部分
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.tick_interval.is_zero() {
            return Err(DriverError::Validation("tick_interval must be > 0".to_string()));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(DriverError::Validation(format!(
                "tolerance {} must be finite and > 0",
                self.tolerance
            )));
        }
        if let Some(setpoint) = self.safe_setpoint
            && !setpoint.is_finite()
        {
            return Err(DriverError::Validation(format!("safe setpoint {} is not finite", setpoint)));
        }
        Ok(())
    }

    /// 结合仪器设定点范围校验：安全设定点必须落在范围内，否则中止时会被拒绝
    pub fn validate_for(&self, range: Option<SetpointRange>) -> Result<(), DriverError> {
        self.validate()?;
        if let (Some(setpoint), Some(range)) = (self.safe_setpoint, range)
            && !range.contains(setpoint)
        {
            return Err(DriverError::Validation(format!(
                "safe setpoint {:.2} outside {}",
                setpoint, range
            )));
        }
        Ok(())
    }
}

/// 对外可见的监督状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SupervisorState {
    Idle,
    Ramping { step: usize },
    Holding { step: usize },
    Complete,
    Aborted,
}

impl SupervisorState {
    /// 是否有计划正在执行
    pub fn is_active(self) -> bool {
        matches!(self, SupervisorState::Ramping { .. } | SupervisorState::Holding { .. })
    }

    /// `Complete` / `Aborted`：需要 `reset()`
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Complete | SupervisorState::Aborted)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Idle => f.write_str("Idle"),
            SupervisorState::Ramping { step } => write!(f, "Ramping (step {})", step),
            SupervisorState::Holding { step } => write!(f, "Holding (step {})", step),
            SupervisorState::Complete => f.write_str("Complete"),
            SupervisorState::Aborted => f.write_str("Aborted"),
        }
    }
}

/// 监督状态快照（每个 tick 后发布）
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    /// 当前步骤序号（仅在 `Ramping` / `Holding` 时有值）
    pub step_index: Option<usize>,
    /// 当前计划步数（没有计划时为 0）
    pub total_steps: usize,
    pub last_error: Option<String>,
    pub abort_reason: Option<AbortReason>,
    /// 安全动作尚未全部下发成功
    pub safe_action_pending: bool,
    pub ticks: u64,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Idle,
            step_index: None,
            total_steps: 0,
            last_error: None,
            abort_reason: None,
            safe_action_pending: false,
            ticks: 0,
        }
    }
}

/// 监督器下发写命令的接口
///
/// 生产环境由 [`InstrumentSession`] 实现；测试可以注入记录调用的替身。
pub trait ControlPort: Send + Sync {
    fn set_setpoint(&self, value: f64) -> Result<(), DriverError>;
    fn set_ramp_rate(&self, rate: f64) -> Result<(), DriverError>;
    fn set_heater_enabled(&self, enabled: bool) -> Result<(), DriverError>;
    fn setpoint_range(&self) -> Option<SetpointRange>;
    fn max_ramp_rate(&self) -> f64;
}

impl ControlPort for InstrumentSession {
    fn set_setpoint(&self, value: f64) -> Result<(), DriverError> {
        InstrumentSession::set_setpoint(self, value)
    }

    fn set_ramp_rate(&self, rate: f64) -> Result<(), DriverError> {
        InstrumentSession::set_ramp_rate(self, rate)
    }

    fn set_heater_enabled(&self, enabled: bool) -> Result<(), DriverError> {
        InstrumentSession::set_heater_enabled(self, enabled)
    }

    fn setpoint_range(&self) -> Option<SetpointRange> {
        InstrumentSession::setpoint_range(self)
    }

    fn max_ramp_rate(&self) -> f64 {
        InstrumentSession::max_ramp_rate(self)
    }
}

/// 当前步骤的下发进度（部分成功时只重发未完成的部分）
#[derive(Debug, Clone, Copy, Default)]
struct StepIssue {
    rate_set: bool,
    setpoint_set: bool,
    attempts: u32,
}

impl StepIssue {
    fn is_done(&self) -> bool {
        self.rate_set && self.setpoint_set
    }

    fn attempt(&mut self, port: &dyn ControlPort, step: &RampStep) -> Result<(), DriverError> {
        self.attempts += 1;
        if !self.rate_set {
            port.set_ramp_rate(step.rate)?;
            self.rate_set = true;
        }
        if !self.setpoint_set {
            port.set_setpoint(step.target_setpoint)?;
            self.setpoint_set = true;
        }
        Ok(())
    }
}

/// 中止后的安全动作
#[derive(Debug, Clone, Copy)]
struct SafeAction {
    setpoint: Option<f64>,
    cut_heater: bool,
    setpoint_done: bool,
    heater_done: bool,
    attempts: u32,
}

impl SafeAction {
    fn new(setpoint: Option<f64>, cut_heater: bool) -> Self {
        Self {
            setpoint,
            cut_heater,
            setpoint_done: setpoint.is_none(),
            heater_done: !cut_heater,
            attempts: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.setpoint_done && self.heater_done
    }

    /// 下发尚未完成的部分，返回第一个错误
    ///
    /// 加热器先于设定点：设定点被拒绝时加热器仍须断开。
    fn attempt(&mut self, port: &dyn ControlPort) -> Result<(), DriverError> {
        self.attempts += 1;
        let mut first_error = None;

        if !self.heater_done {
            match port.set_heater_enabled(false) {
                Ok(()) => self.heater_done = true,
                Err(e) => first_error = Some(e),
            }
        }
        if !self.setpoint_done
            && let Some(setpoint) = self.setpoint
        {
            match port.set_setpoint(setpoint) {
                Ok(()) => self.setpoint_done = true,
                Err(e) => {
                    first_error.get_or_insert(e);
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// 内部阶段（比 [`SupervisorState`] 多携带计时和下发进度）
#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    Ramping {
        step: usize,
        issue: StepIssue,
        /// 最近一段连续落在容差内的起点
        within_since: Option<Instant>,
    },
    Holding {
        step: usize,
        since: Instant,
    },
    Complete,
    Aborted,
}

impl Phase {
    fn state(&self) -> SupervisorState {
        match *self {
            Phase::Idle => SupervisorState::Idle,
            Phase::Ramping { step, .. } => SupervisorState::Ramping { step },
            Phase::Holding { step, .. } => SupervisorState::Holding { step },
            Phase::Complete => SupervisorState::Complete,
            Phase::Aborted => SupervisorState::Aborted,
        }
    }
}

/// 斜坡监督状态机
pub struct Supervisor {
    port: Arc<dyn ControlPort>,
    cache: StateCache,
    config: SupervisorConfig,
    interlocks: Vec<Interlock>,
    phase: Phase,
    plan: Option<RampPlan>,
    last_sequence: u64,
    safe_action: Option<SafeAction>,
    abort_reason: Option<AbortReason>,
    last_error: Option<String>,
    ticks: u64,
    cancel: Arc<AtomicBool>,
    status: Arc<ArcSwap<SupervisorStatus>>,
}

impl Supervisor {
    pub fn new(port: Arc<dyn ControlPort>, cache: StateCache, config: SupervisorConfig) -> Self {
        Self {
            port,
            cache,
            config,
            interlocks: Vec::new(),
            phase: Phase::Idle,
            plan: None,
            last_sequence: 0,
            safe_action: None,
            abort_reason: None,
            last_error: None,
            ticks: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            status: Arc::new(ArcSwap::from_pointee(SupervisorStatus::default())),
        }
    }

    pub fn add_interlock(&mut self, interlock: Interlock) {
        info!(
            "Interlock '{}' armed: {} -> {:?}",
            interlock.name(),
            interlock.condition(),
            interlock.action()
        );
        self.interlocks.push(interlock);
    }

    pub fn interlocks(&self) -> &[Interlock] {
        &self.interlocks
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// 取消标志（在下一个 tick 边界被消费）
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// 状态快照的发布点
    pub fn status_handle(&self) -> Arc<ArcSwap<SupervisorStatus>> {
        Arc::clone(&self.status)
    }

    pub fn state(&self) -> SupervisorState {
        self.phase.state()
    }

    pub fn status(&self) -> SupervisorStatus {
        (**self.status.load()).clone()
    }

    /// 开始执行计划，并立即下发第一步
    ///
    /// 计划被接受即返回 `Ok`；第一步下发失败会按重试规则在后续 tick 处理，
    /// 结果体现在 [`Supervisor::status`] 中。
    pub fn start(&mut self, plan: RampPlan) -> Result<(), ClientError> {
        let state = self.phase.state();
        match state {
            SupervisorState::Idle => {},
            SupervisorState::Ramping { .. } | SupervisorState::Holding { .. } => {
                return Err(ClientError::Busy { state });
            },
            SupervisorState::Complete | SupervisorState::Aborted => {
                return Err(ClientError::ResetRequired { state });
            },
        }
        plan.validate_for(self.port.setpoint_range(), self.port.max_ramp_rate())?;
        self.config.validate_for(self.port.setpoint_range())?;

        self.cancel.store(false, Ordering::Release);
        info!("Starting ramp plan with {} step(s)", plan.len());
        self.plan = Some(plan);
        self.last_error = None;
        self.enter_step(0);
        self.publish();
        Ok(())
    }

    /// `Complete` / `Aborted` → `Idle`
    pub fn reset(&mut self) -> Result<(), ClientError> {
        if self.safe_action.is_some() {
            return Err(ClientError::SafeActionPending);
        }
        let state = self.phase.state();
        if state.is_active() {
            return Err(ClientError::Busy { state });
        }
        if state != SupervisorState::Idle {
            info!("Supervisor reset ({} -> Idle)", state);
        }
        self.phase = Phase::Idle;
        self.plan = None;
        self.abort_reason = None;
        self.last_error = None;
        self.publish();
        Ok(())
    }

    /// 手动写入设定点
    ///
    /// 计划执行中返回 `Busy`，安全动作未完成时返回 `SafeActionPending`；
    /// `Idle` / `Complete` / `Aborted` 下直接写入仪器。
    pub fn set_setpoint(&mut self, value: f64) -> Result<(), ClientError> {
        let state = self.phase.state();
        if state.is_active() {
            return Err(ClientError::Busy { state });
        }
        if self.safe_action.is_some() {
            return Err(ClientError::SafeActionPending);
        }
        self.port.set_setpoint(value)?;
        Ok(())
    }

    /// 以当前时刻执行一个 tick
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    fn tick_at(&mut self, now: Instant) {
        self.ticks += 1;

        // 上一轮失败的安全动作，每个 tick 至多重试一次
        if self.safe_action.is_some() {
            self.run_safe_action();
        }

        if self.cancel.swap(false, Ordering::AcqRel) {
            if self.phase.state().is_active() {
                self.abort(AbortReason::Cancelled, false);
            } else {
                debug!("Cancel ignored in state {}", self.phase.state());
            }
        }

        if let Some(reading) = self.fresh_reading() {
            self.check_interlocks(&reading, now);
            self.track_target(&reading, now);
        }

        self.check_staleness();
        self.advance(now);
        self.publish();
    }

    /// 线程退出前调用：有计划在执行时按取消处理
    pub fn shutdown(&mut self) {
        if self.phase.state().is_active() {
            info!("Supervisor stopping with an active plan");
            self.abort(AbortReason::Cancelled, false);
        }
        if self.safe_action.is_some() {
            warn!("Supervisor stopping with the safe action still pending");
        }
        self.publish();
    }

    fn fresh_reading(&mut self) -> Option<Reading> {
        let reading = self.cache.latest()?;
        if reading.sequence <= self.last_sequence {
            return None;
        }
        self.last_sequence = reading.sequence;
        Some(reading)
    }

    fn check_interlocks(&mut self, reading: &Reading, now: Instant) {
        if self.phase.state().is_terminal() {
            return;
        }
        // 每个联锁都要评估，冷却计时才能各自更新；中止原因记第一个触发的
        let mut first = None;
        let mut cut_heater = false;
        for interlock in &mut self.interlocks {
            if !interlock.check(reading, now) {
                continue;
            }
            error!(
                "Interlock '{}' tripped: {} (T={:.2} K, heater={:.1}%, alarms={})",
                interlock.name(),
                interlock.condition(),
                reading.temperature,
                reading.heater_power,
                reading.alarms
            );
            cut_heater |= interlock.action() == Action::CutHeater;
            first.get_or_insert_with(|| (interlock.name().to_string(), interlock.condition().to_string()));
        }
        if let Some((name, condition)) = first {
            self.abort(AbortReason::Interlock { name, condition }, cut_heater);
        }
    }

    fn track_target(&mut self, reading: &Reading, now: Instant) {
        let Phase::Ramping {
            step,
            issue,
            within_since,
        } = &mut self.phase
        else {
            return;
        };
        if !issue.is_done() {
            return;
        }
        let Some(target) = self.plan.as_ref().and_then(|plan| plan.step(*step)) else {
            return;
        };

        // 设定点读回必须是本步目标，避免用下发前的旧读数做判定
        let within = (reading.temperature - target.target_setpoint).abs() <= self.config.tolerance
            && (reading.setpoint - target.target_setpoint).abs() <= MAX_ROUND_TRIP_ERROR + 1e-9;
        if within {
            if within_since.is_none() {
                *within_since = Some(now);
            }
        } else if within_since.take().is_some() {
            debug!("Step {}: T={:.2} left tolerance, debounce restarted", step, reading.temperature);
        }
    }

    fn check_staleness(&mut self) {
        if !self.phase.state().is_active() {
            return;
        }
        let staleness = self.cache.staleness();
        if staleness > self.config.max_staleness {
            error!(
                "No fresh reading for {:?} (limit {:?})",
                staleness, self.config.max_staleness
            );
            self.abort(AbortReason::CommunicationLost { staleness }, false);
        }
    }

    fn advance(&mut self, now: Instant) {
        match self.phase {
            Phase::Ramping {
                step,
                issue,
                within_since,
            } => {
                if !issue.is_done() {
                    self.issue_step();
                } else if let Some(since) = within_since
                    && now.saturating_duration_since(since) >= self.config.debounce
                {
                    info!("Step {} reached target, holding", step);
                    self.phase = Phase::Holding { step, since: now };
                }
            },
            Phase::Holding { step, since } => {
                let Some(plan) = self.plan.as_ref() else {
                    return;
                };
                let hold = plan.step(step).map(|s| s.hold).unwrap_or_default();
                if now.saturating_duration_since(since) < hold {
                    return;
                }
                if step + 1 < plan.len() {
                    info!("Step {} hold elapsed, starting step {}", step, step + 1);
                    self.enter_step(step + 1);
                } else {
                    info!("Ramp plan complete");
                    self.phase = Phase::Complete;
                    self.plan = None;
                }
            },
            Phase::Idle | Phase::Complete | Phase::Aborted => {},
        }
    }

    fn enter_step(&mut self, step: usize) {
        self.phase = Phase::Ramping {
            step,
            issue: StepIssue::default(),
            within_since: None,
        };
        self.issue_step();
    }

    /// 下发（或重发）当前步骤
    fn issue_step(&mut self) {
        let Phase::Ramping {
            step,
            mut issue,
            within_since,
        } = self.phase
        else {
            return;
        };
        let Some(target) = self.plan.as_ref().and_then(|plan| plan.step(step)).copied() else {
            return;
        };

        let result = issue.attempt(self.port.as_ref(), &target);
        self.phase = Phase::Ramping {
            step,
            issue,
            within_since,
        };

        match result {
            Ok(()) => {
                debug!(
                    "Step {} issued: {:.2} K at {:.2} K/min",
                    step, target.target_setpoint, target.rate
                );
            },
            Err(e) if e.is_retryable() => {
                self.last_error = Some(e.to_string());
                if issue.attempts > self.config.max_step_retries {
                    error!("Step {} not issued after {} attempts: {}", step, issue.attempts, e);
                    self.abort(
                        AbortReason::Supervision(SupervisionError::StepExhausted {
                            step,
                            attempts: issue.attempts,
                            error: e.to_string(),
                        }),
                        false,
                    );
                } else {
                    warn!(
                        "Step {} not issued (attempt {}/{}): {}, retrying next tick",
                        step,
                        issue.attempts,
                        self.config.max_step_retries + 1,
                        e
                    );
                }
            },
            Err(e) => {
                error!("Step {} failed: {}", step, e);
                self.last_error = Some(e.to_string());
                self.abort(
                    AbortReason::Supervision(SupervisionError::StepFailed {
                        step,
                        error: e.to_string(),
                    }),
                    false,
                );
            },
        }
    }

    /// 进入 `Aborted` 并执行一次安全动作
    fn abort(&mut self, reason: AbortReason, cut_heater: bool) {
        let from = self.phase.state();
        if from.is_terminal() {
            return;
        }
        match &reason {
            AbortReason::Cancelled => info!("Ramp cancelled in state {}", from),
            other => error!("Aborting from state {}: {}", from, other),
        }
        self.phase = Phase::Aborted;
        self.plan = None;
        self.abort_reason = Some(reason);

        let setpoint = self
            .config
            .safe_setpoint
            .or_else(|| self.port.setpoint_range().map(|range| range.min));
        if setpoint.is_none() && !cut_heater {
            warn!("No safe setpoint known, skipping safe action");
            return;
        }
        self.safe_action = Some(SafeAction::new(setpoint, cut_heater));
        self.run_safe_action();
    }

    fn run_safe_action(&mut self) {
        let Some(mut action) = self.safe_action else {
            return;
        };
        match action.attempt(self.port.as_ref()) {
            Ok(()) => {
                debug_assert!(action.is_done());
                info!(
                    "Safe action applied (heater cut: {}, setpoint {:?})",
                    action.cut_heater, action.setpoint
                );
                self.safe_action = None;
            },
            Err(e) if action.attempts > self.config.max_step_retries => {
                let failure = SupervisionError::SafeActionFailed {
                    attempts: action.attempts,
                    error: e.to_string(),
                };
                error!("{}", failure);
                self.last_error = Some(failure.to_string());
                self.safe_action = None;
            },
            Err(e) => {
                error!(
                    "Safe action failed (attempt {}/{}): {}, retrying next tick",
                    action.attempts,
                    self.config.max_step_retries + 1,
                    e
                );
                self.last_error = Some(e.to_string());
                self.safe_action = Some(action);
            },
        }
    }

    fn publish(&self) {
        let state = self.phase.state();
        let step_index = match state {
            SupervisorState::Ramping { step } | SupervisorState::Holding { step } => Some(step),
            _ => None,
        };
        self.status.store(Arc::new(SupervisorStatus {
            state,
            step_index,
            total_steps: self.plan.as_ref().map_or(0, RampPlan::len),
            last_error: self.last_error.clone(),
            abort_reason: self.abort_reason.clone(),
            safe_action_pending: self.safe_action.is_some(),
            ticks: self.ticks,
        }));
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("phase", &self.phase)
            .field("interlocks", &self.interlocks.len())
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

type Reply = Sender<Result<(), ClientError>>;

enum Request {
    Start(RampPlan, Reply),
    Reset(Reply),
    SetSetpoint(f64, Reply),
    AddInterlock(Interlock),
}

/// 监督线程句柄；drop 时停止线程（执行中的计划按取消处理）
pub struct SupervisorHandle {
    requests: Mutex<Option<Sender<Request>>>,
    cancel: Arc<AtomicBool>,
    status: Arc<ArcSwap<SupervisorStatus>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisorHandle {
    /// 在专用线程上运行监督器
    pub fn spawn(supervisor: Supervisor) -> Result<Self, ClientError> {
        let (requests_tx, requests_rx) = unbounded();
        let cancel = supervisor.cancel_flag();
        let status = supervisor.status_handle();
        let tick_interval = supervisor.config.tick_interval;

        let handle = std::thread::Builder::new()
            .name("cryo-supervisor".to_string())
            .spawn(move || supervise_loop(supervisor, requests_rx))
            .map_err(|e| DriverError::Thread(format!("failed to spawn supervisor: {}", e)))?;

        info!("Supervisor started (tick {:?})", tick_interval);
        Ok(Self {
            requests: Mutex::new(Some(requests_tx)),
            cancel,
            status,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn start(&self, plan: RampPlan) -> Result<(), ClientError> {
        self.call(|reply| Request::Start(plan, reply))
    }

    pub fn reset(&self) -> Result<(), ClientError> {
        self.call(Request::Reset)
    }

    /// 在监督线程上手动写入设定点（见 [`Supervisor::set_setpoint`]）
    pub fn set_setpoint(&self, value: f64) -> Result<(), ClientError> {
        self.call(|reply| Request::SetSetpoint(value, reply))
    }

    pub fn add_interlock(&self, interlock: Interlock) -> Result<(), ClientError> {
        self.sender()?
            .send(Request::AddInterlock(interlock))
            .map_err(|_| ClientError::SupervisorStopped)
    }

    /// 请求取消（下一个 tick 生效，不阻塞）
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn status(&self) -> SupervisorStatus {
        (**self.status.load()).clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.status.load().state
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// 停止线程并等待退出（幂等）
    ///
    /// 执行中的计划按取消处理，安全动作在线程退出前下发。
    pub fn stop(&self) {
        self.requests.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let join_timeout = Duration::from_secs(10);
            if handle.join_timeout(join_timeout).is_err() {
                error!("Supervisor thread failed to shut down within {:?}", join_timeout);
            } else {
                debug!("Supervisor stopped");
            }
        }
    }

    fn sender(&self) -> Result<Sender<Request>, ClientError> {
        self.requests.lock().clone().ok_or(ClientError::SupervisorStopped)
    }

    fn call(&self, request: impl FnOnce(Reply) -> Request) -> Result<(), ClientError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.sender()?
            .send(request(reply_tx))
            .map_err(|_| ClientError::SupervisorStopped)?;
        reply_rx.recv().map_err(|_| ClientError::SupervisorStopped)?
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

fn supervise_loop(mut supervisor: Supervisor, requests: Receiver<Request>) {
    let ticker = tick(supervisor.config.tick_interval);
    loop {
        select! {
            recv(requests) -> request => match request {
                Ok(Request::Start(plan, reply)) => {
                    let _ = reply.send(supervisor.start(plan));
                },
                Ok(Request::Reset(reply)) => {
                    let _ = reply.send(supervisor.reset());
                },
                Ok(Request::SetSetpoint(value, reply)) => {
                    let _ = reply.send(supervisor.set_setpoint(value));
                },
                Ok(Request::AddInterlock(interlock)) => supervisor.add_interlock(interlock),
                // 所有发送端已 drop：停止
                Err(_) => break,
            },
            recv(ticker) -> _ => supervisor.tick(),
        }
    }
    supervisor.shutdown();
    trace!("Supervisor loop exited");
}
