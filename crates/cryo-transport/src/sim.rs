//! 进程内模拟温控仪
//!
//! [`SimTransport`] 在 `write` 时解析命令、推进热模型并生成应答，
//! `read_until` 按设定的延迟交付应答。测试通过共享的 [`SimHandle`]：
//! - 注入故障（静默、乱码、设备拒绝、断线）
//! - 强制温度、报警位
//! - 检查收到的命令日志和并发访问违规计数
//!
//! # 热模型
//!
//! - 内部斜坡启用时，斜坡设定点以 `ramp_rate`（K/min）逼近目标设定点；
//!   停用时直接跳到目标
//! - 加热器开启时温度以一阶惯性（时间常数 `tau`）跟随斜坡设定点，
//!   关闭时回落到基础温度
//! - 自动模式下加热功率与跟随误差成正比，限幅 0–100 %；
//!   手动模式下等于手动输出，温度趋向该功率对应的平衡点
//! - 自动气流随过冲量增大，手动气流等于手动设定

use crate::{Transport, TransportError};
use cryo_protocol::{MAX_OUTPUT_PERCENT, alarm};
use cryo_protocol::{Command, DeviceFault, NumberFields, Payload, Reply, Verb, encode_reply, parse_command};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// 设备拒绝码：无法解析的命令
pub const ERR_UNKNOWN_COMMAND: u16 = 1;
/// 设备拒绝码：设定点超出范围
pub const ERR_SETPOINT_RANGE: u16 = 2;
/// 设备拒绝码：升温速率非法
pub const ERR_RAMP_RATE: u16 = 3;
/// 设备拒绝码：输出百分比超出 0–99.9
pub const ERR_OUTPUT_RANGE: u16 = 4;

/// 满功率时的加热器电压（V）
const HEATER_FULL_SCALE_VOLTS: f64 = 40.0;

const GARBAGE_REPLY: &[u8] = b"?#@!\n";

/// 模拟器配置
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// 用于 `describe()` 的名称
    pub name: String,
    /// `*IDN?` 应答
    pub identity: String,
    /// 加热器关闭时的平衡温度（K）
    pub base_temperature: f64,
    /// 初始温度（K）
    pub initial_temperature: f64,
    /// 初始升温速率（K/min）
    pub initial_ramp_rate: f64,
    /// 设定点允许范围（K），`LIM?` 返回此值
    pub setpoint_range: (f64, f64),
    /// 升温速率上限（K/min）
    pub max_ramp_rate: f64,
    /// 一阶惯性时间常数
    pub tau: Duration,
    /// 应答延迟
    pub latency: Duration,
    /// 温度读数噪声幅度（K，均匀分布）
    pub noise: f64,
    /// 模拟时间相对真实时间的倍率
    pub time_scale: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            identity: "CRYOCONTROL,SIM-1,SIM0001,1.0.0".to_string(),
            base_temperature: 4.2,
            initial_temperature: 4.2,
            initial_ramp_rate: 10.0,
            setpoint_range: (1.5, 320.0),
            max_ramp_rate: 50.0,
            tau: Duration::from_secs(2),
            latency: Duration::ZERO,
            noise: 0.0,
            time_scale: 1.0,
        }
    }
}

/// 可注入的故障（按请求顺序逐条消费）
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    /// 接下来 `count` 条请求没有应答（请求丢失，不生效）
    Silent { count: usize },
    /// 接下来 `count` 条请求返回无法解析的乱码
    Garbage { count: usize },
    /// 接下来 `count` 条请求被设备以 `ERR code` 拒绝
    Reject { code: u16, count: usize },
    /// 链路断开，此后所有操作返回 IO 错误
    Disconnect,
}

impl Fault {
    /// 消费一次，返回是否已耗尽
    fn consume(&mut self) -> bool {
        match self {
            Fault::Silent { count } | Fault::Garbage { count } | Fault::Reject { count, .. } => {
                *count = count.saturating_sub(1);
                *count == 0
            },
            Fault::Disconnect => false,
        }
    }
}

/// 收到的一条命令
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// 去除终止符的原始文本
    pub line: String,
    /// 可解析时的动词
    pub verb: Option<Verb>,
    /// 可解析时的命令
    pub command: Option<Command>,
    pub at: Instant,
}

#[derive(Debug)]
struct ThermalModel {
    temperature: f64,
    target: f64,
    ramp_setpoint: f64,
    ramp_rate: f64,
    heater_enabled: bool,
    heater_power: f64,
    heater_auto: bool,
    heater_output: f64,
    gas_flow_auto: bool,
    gas_flow_setpoint: f64,
    gas_flow: f64,
    ramp_enabled: bool,
    pinned: Option<f64>,
    forced_alarms: u32,
    updated_at: Instant,
}

impl ThermalModel {
    fn new(config: &SimConfig) -> Self {
        Self {
            temperature: config.initial_temperature,
            target: config.initial_temperature,
            ramp_setpoint: config.initial_temperature,
            ramp_rate: config.initial_ramp_rate,
            heater_enabled: true,
            heater_power: 0.0,
            heater_auto: true,
            heater_output: 0.0,
            gas_flow_auto: true,
            gas_flow_setpoint: 0.0,
            gas_flow: 0.0,
            ramp_enabled: true,
            pinned: None,
            forced_alarms: 0,
            updated_at: Instant::now(),
        }
    }

    fn advance(&mut self, config: &SimConfig, now: Instant) {
        let dt = now.saturating_duration_since(self.updated_at).as_secs_f64() * config.time_scale;
        self.updated_at = now;
        if dt <= 0.0 {
            return;
        }

        if self.ramp_enabled {
            let max_step = self.ramp_rate / 60.0 * dt;
            let delta = self.target - self.ramp_setpoint;
            self.ramp_setpoint += delta.clamp(-max_step, max_step);
        } else {
            self.ramp_setpoint = self.target;
        }

        // 维持某温度所需的功率与温升成正比：满量程温升对应 50 %
        let span = (config.setpoint_range.1 - config.base_temperature).max(1.0);
        let equilibrium = match (self.heater_enabled, self.heater_auto) {
            (false, _) => config.base_temperature,
            (true, true) => self.ramp_setpoint,
            (true, false) => config.base_temperature + self.heater_output / 50.0 * span,
        };

        let tau = config.tau.as_secs_f64().max(1e-3);
        let approach = 1.0 - (-dt / tau).exp();
        self.temperature += (equilibrium - self.temperature) * approach;
        if let Some(pinned) = self.pinned {
            self.temperature = pinned;
        }

        self.heater_power = match (self.heater_enabled, self.heater_auto) {
            (false, _) => 0.0,
            (true, true) => {
                let holding = 50.0 * (self.ramp_setpoint - config.base_temperature) / span;
                let tracking = 10.0 * (self.ramp_setpoint - self.temperature);
                (holding + tracking).clamp(0.0, 100.0)
            },
            (true, false) => self.heater_output,
        };

        self.gas_flow = if self.gas_flow_auto {
            (5.0 + 10.0 * (self.temperature - self.ramp_setpoint)).clamp(0.0, MAX_OUTPUT_PERCENT)
        } else {
            self.gas_flow_setpoint
        };
    }

    fn alarms(&self, config: &SimConfig) -> u32 {
        let mut bits = self.forced_alarms;
        if self.temperature > config.setpoint_range.1 {
            bits |= alarm::OVER_TEMPERATURE;
        }
        if (self.ramp_setpoint - self.target).abs() > f64::EPSILON {
            bits |= alarm::RAMP_ACTIVE;
        }
        bits
    }
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    model: ThermalModel,
    faults: VecDeque<Fault>,
    log: Vec<LogEntry>,
    /// 已生成但尚未读取的应答（就绪时刻，字节）
    pending: VecDeque<(Instant, Vec<u8>)>,
    disconnected: bool,
}

impl SimState {
    fn reported_temperature(&self) -> f64 {
        if self.config.noise > 0.0 && self.model.pinned.is_none() {
            let noise = self.config.noise;
            self.model.temperature + rand::thread_rng().gen_range(-noise..=noise)
        } else {
            self.model.temperature
        }
    }

    fn execute(&mut self, command: &Command) -> Payload {
        let reject = |code| Payload::Fault(DeviceFault { code });
        let (min, max) = self.config.setpoint_range;
        let percent = command
            .number()
            .filter(|value| (0.0..=MAX_OUTPUT_PERCENT).contains(value));

        let reply = match command.verb() {
            Verb::Identify => Reply::Text(self.config.identity.clone()),
            Verb::ReadTemperature => Reply::Number(self.reported_temperature()),
            Verb::ReadSetpoint => Reply::Number(self.model.target),
            Verb::ReadRampRate => Reply::Number(self.model.ramp_rate),
            Verb::ReadHeater => Reply::Number(self.model.heater_power),
            Verb::ReadAlarms => Reply::Integer(self.model.alarms(&self.config)),
            Verb::ReadLimits => Reply::Numbers(numbers(&[min, max])),
            Verb::ReadStatus => Reply::Numbers(numbers(&[
                self.reported_temperature(),
                self.model.target,
                self.model.heater_power,
                self.model.ramp_rate,
                f64::from(self.model.alarms(&self.config)),
            ])),
            Verb::WriteSetpoint => match command.number() {
                Some(value) if (min..=max).contains(&value) => {
                    self.model.target = value;
                    Reply::Ack
                },
                _ => return reject(ERR_SETPOINT_RANGE),
            },
            Verb::WriteRampRate => match command.number() {
                Some(rate) if rate > 0.0 && rate <= self.config.max_ramp_rate => {
                    self.model.ramp_rate = rate;
                    Reply::Ack
                },
                _ => return reject(ERR_RAMP_RATE),
            },
            Verb::WriteHeaterEnabled => match command.flag() {
                Some(enabled) => {
                    self.model.heater_enabled = enabled;
                    Reply::Ack
                },
                None => return reject(ERR_UNKNOWN_COMMAND),
            },
            Verb::ReadHeaterEnabled => Reply::Flag(self.model.heater_enabled),
            Verb::ReadHeaterVoltage => Reply::Number(self.model.heater_power / 100.0 * HEATER_FULL_SCALE_VOLTS),
            Verb::ReadHeaterAuto => Reply::Flag(self.model.heater_auto),
            Verb::ReadHeaterOutput => Reply::Number(self.model.heater_output),
            Verb::ReadGasFlow => Reply::Number(self.model.gas_flow),
            Verb::ReadGasFlowSetpoint => Reply::Number(self.model.gas_flow_setpoint),
            Verb::ReadGasFlowAuto => Reply::Flag(self.model.gas_flow_auto),
            Verb::ReadRampEnabled => Reply::Flag(self.model.ramp_enabled),
            Verb::WriteHeaterOutput => match percent {
                Some(value) => {
                    self.model.heater_output = value;
                    Reply::Ack
                },
                None => return reject(ERR_OUTPUT_RANGE),
            },
            Verb::WriteGasFlowSetpoint => match percent {
                Some(value) => {
                    self.model.gas_flow_setpoint = value;
                    Reply::Ack
                },
                None => return reject(ERR_OUTPUT_RANGE),
            },
            Verb::WriteHeaterAuto | Verb::WriteGasFlowAuto | Verb::WriteRampEnabled => {
                let Some(flag) = command.flag() else {
                    return reject(ERR_UNKNOWN_COMMAND);
                };
                match command.verb() {
                    Verb::WriteHeaterAuto => self.model.heater_auto = flag,
                    Verb::WriteGasFlowAuto => self.model.gas_flow_auto = flag,
                    _ => self.model.ramp_enabled = flag,
                }
                Reply::Ack
            },
        };
        Payload::Value(reply)
    }

    /// 处理一帧请求，返回应答（`None` 表示静默）
    fn handle_frame(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.model.advance(&self.config, now);

        let parsed = parse_command(&with_reply_terminator(frame));
        self.log.push(LogEntry {
            line: String::from_utf8_lossy(frame).trim_end().to_string(),
            verb: parsed.as_ref().ok().map(|cmd| cmd.verb()),
            command: parsed.as_ref().ok().copied(),
            at: now,
        });

        if let Some(fault) = self.faults.front_mut() {
            let injected = *fault;
            if fault.consume() {
                self.faults.pop_front();
            }
            match injected {
                Fault::Silent { .. } => return None,
                Fault::Garbage { .. } => return Some(GARBAGE_REPLY.to_vec()),
                Fault::Reject { code, .. } => {
                    return Some(encode_reply(&Payload::Fault(DeviceFault { code })));
                },
                Fault::Disconnect => {},
            }
        }

        let payload = match parsed {
            Ok(command) => self.execute(&command),
            Err(e) => {
                debug!("sim: rejecting unparseable command: {}", e);
                Payload::Fault(DeviceFault {
                    code: ERR_UNKNOWN_COMMAND,
                })
            },
        };
        Some(encode_reply(&payload))
    }
}

/// 设备侧解析需要 `\n` 结尾；主机发来的是 `\r\n`，两者兼容
fn with_reply_terminator(frame: &[u8]) -> Vec<u8> {
    let mut owned = frame.to_vec();
    if owned.last() != Some(&b'\n') {
        owned.push(b'\n');
    }
    owned
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SimState>,
    /// 正在执行的传输调用数（>1 即为并发访问）
    active_calls: AtomicUsize,
    violations: AtomicUsize,
}

/// 进入一次传输调用；离开时自动减计数
struct CallGuard<'a>(&'a Shared);

impl<'a> CallGuard<'a> {
    fn enter(shared: &'a Shared) -> Self {
        if shared.active_calls.fetch_add(1, Ordering::SeqCst) > 0 {
            shared.violations.fetch_add(1, Ordering::SeqCst);
            tracing::error!("sim: overlapping transport calls detected");
        }
        Self(shared)
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 模拟器控制句柄（可克隆，可跨线程）
#[derive(Debug, Clone)]
pub struct SimHandle {
    shared: Arc<Shared>,
}

impl SimHandle {
    /// 追加一个故障
    pub fn inject(&self, fault: Fault) {
        self.shared.state.lock().faults.push_back(fault);
    }

    pub fn clear_faults(&self) {
        self.shared.state.lock().faults.clear();
    }

    /// 强制温度读数（模型不再演化温度）
    pub fn pin_temperature(&self, temperature: f64) {
        let mut state = self.shared.state.lock();
        state.model.pinned = Some(temperature);
        state.model.temperature = temperature;
    }

    /// 恢复热模型演化
    pub fn release_temperature(&self) {
        self.shared.state.lock().model.pinned = None;
    }

    /// 强制置位报警
    pub fn set_alarms(&self, bits: u32) {
        self.shared.state.lock().model.forced_alarms = bits;
    }

    /// 修改应答延迟
    pub fn set_latency(&self, latency: Duration) {
        self.shared.state.lock().config.latency = latency;
    }

    /// 当前模型温度（不含噪声）
    pub fn temperature(&self) -> f64 {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        state.model.advance(&state.config, Instant::now());
        state.model.temperature
    }

    /// 目标设定点
    pub fn setpoint(&self) -> f64 {
        self.shared.state.lock().model.target
    }

    pub fn ramp_rate(&self) -> f64 {
        self.shared.state.lock().model.ramp_rate
    }

    pub fn heater_enabled(&self) -> bool {
        self.shared.state.lock().model.heater_enabled
    }

    pub fn heater_auto(&self) -> bool {
        self.shared.state.lock().model.heater_auto
    }

    pub fn gas_flow_auto(&self) -> bool {
        self.shared.state.lock().model.gas_flow_auto
    }

    pub fn ramp_enabled(&self) -> bool {
        self.shared.state.lock().model.ramp_enabled
    }

    /// 恢复被注入断线的链路（仪器状态保留）
    pub fn restore_link(&self) {
        let mut state = self.shared.state.lock();
        state.disconnected = false;
        state.pending.clear();
        state.faults.retain(|fault| *fault != Fault::Disconnect);
    }

    /// 打开一条连接到同一台模拟仪器的新传输（模拟重新插拔）
    pub fn attach(&self) -> SimTransport {
        let name = self.shared.state.lock().config.name.clone();
        SimTransport {
            shared: Arc::clone(&self.shared),
            name,
            closed: false,
        }
    }

    /// 收到的全部命令
    pub fn commands(&self) -> Vec<LogEntry> {
        self.shared.state.lock().log.clone()
    }

    /// 某动词被收到的次数
    pub fn count(&self, verb: Verb) -> usize {
        self.shared
            .state
            .lock()
            .log
            .iter()
            .filter(|entry| entry.verb == Some(verb))
            .count()
    }

    pub fn clear_log(&self) {
        self.shared.state.lock().log.clear();
    }

    /// 检测到的并发访问次数
    pub fn violations(&self) -> usize {
        self.shared.violations.load(Ordering::SeqCst)
    }

    /// 链路是否已被注入断线
    pub fn is_disconnected(&self) -> bool {
        self.shared.state.lock().disconnected
    }
}

/// 模拟传输
pub struct SimTransport {
    shared: Arc<Shared>,
    name: String,
    closed: bool,
}

impl SimTransport {
    pub fn new(config: SimConfig) -> Self {
        let name = config.name.clone();
        let model = ThermalModel::new(&config);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    config,
                    model,
                    faults: VecDeque::new(),
                    log: Vec::new(),
                    pending: VecDeque::new(),
                    disconnected: false,
                }),
                active_calls: AtomicUsize::new(0),
                violations: AtomicUsize::new(0),
            }),
            name,
            closed: false,
        }
    }

    /// 获取控制句柄
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.shared.state.lock().disconnected {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated link down",
            )));
        }
        Ok(())
    }
}

impl Transport for SimTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let _guard = CallGuard::enter(&self.shared);
        self.check_open()?;
        trace!("sim rx {:?}", String::from_utf8_lossy(bytes));

        let mut state = self.shared.state.lock();
        if matches!(state.faults.front(), Some(Fault::Disconnect)) {
            state.faults.pop_front();
            state.disconnected = true;
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated link down",
            )));
        }
        if let Some(reply) = state.handle_frame(bytes) {
            let ready_at = Instant::now() + state.config.latency;
            state.pending.push_back((ready_at, reply));
        }
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let _guard = CallGuard::enter(&self.shared);
        self.check_open()?;

        let deadline = Instant::now() + timeout;
        let next = self.shared.state.lock().pending.front().map(|(ready_at, _)| *ready_at);
        match next {
            Some(ready_at) if ready_at <= deadline => {
                sleep_until(ready_at);
                let mut state = self.shared.state.lock();
                let (_, mut reply) = state.pending.pop_front().ok_or(TransportError::Timeout)?;
                if let Some(pos) = reply.iter().position(|b| *b == terminator) {
                    reply.truncate(pos + 1);
                }
                trace!("sim tx {:?}", String::from_utf8_lossy(&reply));
                Ok(reply)
            },
            _ => {
                sleep_until(deadline);
                Err(TransportError::Timeout)
            },
        }
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        let _guard = CallGuard::enter(&self.shared);
        self.check_open()?;
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        // 只丢弃已"到达"的字节，尚在路上的迟到应答仍会到达
        state.pending.retain(|(ready_at, _)| *ready_at > now);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!("sim://{} closed", self.name);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn describe(&self) -> String {
        format!("sim://{}", self.name)
    }
}

fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        std::thread::sleep(deadline - now);
    }
}

fn numbers(values: &[f64]) -> NumberFields {
    values.iter().copied().collect()
}
