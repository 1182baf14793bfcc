//! 仪器会话
//!
//! 每台仪器一个 [`InstrumentSession`]：独占一个传输通道，所有命令在同一把
//! `parking_lot::Mutex` 下"写一行、读一行"，保证半双工链路上任意时刻最多一条命令在途。
//!
//! # 重试语义
//!
//! | 失败类型            | 处理                                       |
//! |---------------------|--------------------------------------------|
//! | 读/写超时           | 指数退避后重发，最多 `max_retries` 次        |
//! | 应答语法错误 / 失步 | 立即返回 `Protocol`，不重试                 |
//! | 仪器 `ERR <code>`   | 立即返回 `Rejected`，不重试                 |
//! | 链路 IO / 断开      | 立即返回 `Connection`，需要重新连接          |
//!
//! 重试与退避都在锁内完成：同一条命令的所有尝试之间不会插入其他命令。
//!
//! # 迟到应答
//!
//! 超时的请求仍可能在之后得到应答。会话记录"已发出、未读到应答"的请求数：
//! 下一条命令发出前先按该数目读掉迟到的帧（每帧至多等待 `2 × timeout`，
//! 遇到超时即停止），每次尝试前再丢弃输入缓冲中已到达的字节。
//! 比这更晚的应答视为丢失。

use crate::config::{InstrumentConfig, RetryPolicy, SetpointRange};
use crate::error::DriverError;
use crate::metrics::SessionMetrics;
use crate::reading::{AlarmFlags, Status};
use arc_swap::ArcSwapOption;
use cryo_protocol::{
    Command, LIMITS_FIELDS, ProtocolError, REPLY_TERMINATOR, Reply, Response, STATUS_FIELDS, Verb,
    decode, encode,
};
use cryo_protocol::MAX_OUTPUT_PERCENT;
use cryo_transport::{Transport, TransportAddress, TransportError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 仪器身份（打开会话时由 `*IDN?` 建立，关闭时丢弃）
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstrumentIdentity {
    /// 链路描述（如 `serial:/dev/ttyUSB0@9600`）
    pub address: String,
    pub vendor: String,
    pub model: String,
    pub serial: String,
    /// 原始固件版本字段
    pub firmware_raw: String,
    /// 可解析为语义化版本时的固件版本
    pub firmware: Option<semver::Version>,
}

impl InstrumentIdentity {
    /// 解析 `vendor,model,serial,firmware`
    pub fn parse(address: impl Into<String>, text: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<&str> = text.split(',').map(str::trim).collect();
        let [vendor, model, serial, firmware] = fields.as_slice() else {
            return Err(ProtocolError::FieldCount {
                expected: cryo_protocol::IDENTITY_FIELDS,
                actual: fields.len(),
            });
        };

        Ok(Self {
            address: address.into(),
            vendor: vendor.to_string(),
            model: model.to_string(),
            serial: serial.to_string(),
            firmware_raw: firmware.to_string(),
            firmware: parse_firmware(firmware),
        })
    }
}

impl std::fmt::Display for InstrumentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} (S/N {}, firmware {}) at {}",
            self.vendor, self.model, self.serial, self.firmware_raw, self.address
        )
    }
}

/// 固件版本常见写法：`1.4.2`、`v1.4`、`1.4`
fn parse_firmware(raw: &str) -> Option<semver::Version> {
    let trimmed = raw.trim_start_matches(['v', 'V']);
    if let Ok(version) = semver::Version::parse(trimmed) {
        return Some(version);
    }
    match trimmed.split('.').count() {
        1 => semver::Version::parse(&format!("{}.0.0", trimmed)).ok(),
        2 => semver::Version::parse(&format!("{}.0", trimmed)).ok(),
        _ => None,
    }
}

/// 已打开的链路
struct Link {
    transport: Box<dyn Transport>,
    /// 已写出但尚未读到应答的请求数
    unanswered: usize,
}

impl Link {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            unanswered: 0,
        }
    }
}

/// 仪器会话
///
/// 可以放进 `Arc` 在轮询线程、监督线程和调用者之间共享；
/// 内部锁保证命令串行。
pub struct InstrumentSession {
    /// 串行化点；`None` 表示已断开或已关闭
    link: Mutex<Option<Link>>,
    /// 通过端口字符串打开时记录的地址，`connect` 用它重新打开
    reopen: Option<TransportAddress>,
    address: String,
    timeout: Duration,
    retry: RetryPolicy,
    max_ramp_rate: f64,
    setpoint_range: OnceLock<SetpointRange>,
    identity: ArcSwapOption<InstrumentIdentity>,
    closed: AtomicBool,
    metrics: Arc<SessionMetrics>,
}

impl InstrumentSession {
    /// 在已打开的传输通道上建立会话
    ///
    /// 依次执行 `*IDN?` 和（未配置范围时）`LIM?`；任一步失败都会关闭传输并返回错误。
    pub fn open(transport: Box<dyn Transport>, config: &InstrumentConfig) -> Result<Self, DriverError> {
        config.validate()?;
        let address = transport.describe();

        let session = Self {
            link: Mutex::new(Some(Link::new(transport))),
            reopen: None,
            address,
            timeout: config.timeout(),
            retry: config.retry,
            max_ramp_rate: config.max_ramp_rate,
            setpoint_range: OnceLock::new(),
            identity: ArcSwapOption::empty(),
            closed: AtomicBool::new(false),
            metrics: Arc::new(SessionMetrics::new()),
        };

        if let Err(e) = session.initialize(config.setpoint_range) {
            error!("Failed to initialize session on {}: {}", session.address, e);
            session.close();
            return Err(e);
        }
        Ok(session)
    }

    /// 记录可重新打开的地址（由 builder 按端口字符串打开时设置）
    pub(crate) fn with_reopen(mut self, address: TransportAddress) -> Self {
        self.reopen = Some(address);
        self
    }

    fn initialize(&self, configured_range: Option<SetpointRange>) -> Result<(), DriverError> {
        let identity = self.identify()?;
        info!("Connected to {}", identity);
        self.identity.store(Some(Arc::new(identity)));

        let range = match configured_range {
            Some(range) => range,
            None => {
                let (min, max) = self.get_limits()?;
                SetpointRange::new(min, max).map_err(|_| {
                    DriverError::Protocol(ProtocolError::UnexpectedReply {
                        verb: Verb::ReadLimits,
                        reply: format!("{},{}", min, max),
                    })
                })?
            },
        };
        debug!("Setpoint range for {}: {}", self.address, range);
        let _ = self.setpoint_range.set(range);
        Ok(())
    }

    /// 发送一条命令并等待应答
    ///
    /// 阻塞时间上限约为 `timeout × (max_retries + 1)` 加退避时间；
    /// 上一条命令留下未应答的请求时，还要加上读掉迟到应答的时间。
    pub fn query(&self, command: &Command) -> Result<Response, DriverError> {
        let verb = command.verb();
        let frame = encode(command)?;

        let mut guard = self.link.lock();
        let link = guard.as_mut().ok_or_else(|| self.not_connected())?;
        SessionMetrics::incr(&self.metrics.queries);

        if link.unanswered > 0 {
            self.drain_late_replies(link)?;
        }

        let attempts = self.retry.attempts();
        for attempt in 0..attempts {
            if attempt > 0 {
                SessionMetrics::incr(&self.metrics.retries);
                let backoff = self.retry.backoff(attempt - 1);
                warn!(
                    "{}: no reply to {} (attempt {}/{}), retrying in {:?}",
                    self.address, verb, attempt, attempts, backoff
                );
                spin_sleep::sleep(backoff);
            }
            link.transport.discard_input().map_err(|e| self.link_failure(e))?;

            match link.transport.write(&frame) {
                Ok(()) => link.unanswered += 1,
                Err(TransportError::Timeout) => {
                    SessionMetrics::incr(&self.metrics.timeouts);
                    continue;
                },
                Err(e) => return Err(self.link_failure(e)),
            }

            match link.transport.read_until(REPLY_TERMINATOR, self.timeout) {
                Ok(reply) => {
                    // 重发的是同一条命令，先到的应答无论属于哪次尝试都有效
                    link.unanswered -= 1;
                    let response = decode(command, &reply).map_err(|e| self.malformed(verb, e))?;
                    debug!("{}: {} -> {:?}", self.address, verb, response.payload());
                    return Ok(response);
                },
                Err(TransportError::Timeout) => {
                    SessionMetrics::incr(&self.metrics.timeouts);
                },
                Err(TransportError::Overflow { limit }) => {
                    link.unanswered -= 1;
                    return Err(self.malformed(
                        verb,
                        ProtocolError::FrameTooLong {
                            len: limit.saturating_add(1),
                            max: limit,
                        },
                    ));
                },
                Err(e) => return Err(self.link_failure(e)),
            }
        }

        SessionMetrics::incr(&self.metrics.communication_failures);
        error!("{}: {} failed after {} attempts", self.address, verb, attempts);
        Err(DriverError::Communication { verb, attempts })
    }

    /// 读掉先前超时请求的迟到应答
    fn drain_late_replies(&self, link: &mut Link) -> Result<(), DriverError> {
        let expected = std::mem::take(&mut link.unanswered);
        let window = self.timeout.saturating_mul(2);
        for _ in 0..expected {
            match link.transport.read_until(REPLY_TERMINATOR, window) {
                Ok(frame) => {
                    SessionMetrics::incr(&self.metrics.late_replies);
                    debug!(
                        "{}: dropped late reply {:?}",
                        self.address,
                        String::from_utf8_lossy(&frame).trim_end()
                    );
                },
                Err(TransportError::Timeout) => break,
                Err(TransportError::Overflow { .. }) => {
                    SessionMetrics::incr(&self.metrics.late_replies);
                },
                Err(e) => return Err(self.link_failure(e)),
            }
        }
        Ok(())
    }

    fn malformed(&self, verb: Verb, error: ProtocolError) -> DriverError {
        SessionMetrics::incr(&self.metrics.protocol_errors);
        warn!("{}: malformed reply to {}: {}", self.address, verb, error);
        DriverError::Protocol(error)
    }

    fn link_failure(&self, error: TransportError) -> DriverError {
        SessionMetrics::incr(&self.metrics.connection_errors);
        error!("{}: link failure: {}", self.address, error);
        DriverError::from(error)
    }

    fn not_connected(&self) -> DriverError {
        if self.is_closed() { DriverError::Closed } else { DriverError::Disconnected }
    }

    /// 发送命令并取出值；设备拒绝映射为 `Rejected`
    fn request(&self, command: Command) -> Result<Reply, DriverError> {
        let verb = command.verb();
        self.query(&command)?.into_result().map_err(|fault| {
            SessionMetrics::incr(&self.metrics.device_rejections);
            warn!("{}: {} rejected: {}", self.address, verb, fault);
            DriverError::Rejected { verb, fault }
        })
    }

    fn request_number(&self, command: Command) -> Result<f64, DriverError> {
        let verb = command.verb();
        let reply = self.request(command)?;
        reply.as_number().ok_or_else(|| shape_mismatch(verb, &reply))
    }

    fn request_flag(&self, command: Command) -> Result<bool, DriverError> {
        let verb = command.verb();
        let reply = self.request(command)?;
        reply.as_flag().ok_or_else(|| shape_mismatch(verb, &reply))
    }

    fn request_numbers(&self, command: Command, expected: usize) -> Result<Vec<f64>, DriverError> {
        let verb = command.verb();
        let reply = self.request(command)?;
        match reply.as_numbers() {
            Some(values) if values.len() == expected => Ok(values.to_vec()),
            _ => Err(shape_mismatch(verb, &reply)),
        }
    }

    fn request_ack(&self, command: Command) -> Result<(), DriverError> {
        let verb = command.verb();
        let reply = self.request(command)?;
        if reply.is_ack() { Ok(()) } else { Err(shape_mismatch(verb, &reply)) }
    }

    fn reject(&self, reason: String) -> DriverError {
        SessionMetrics::incr(&self.metrics.validation_rejections);
        warn!("{}: {}", self.address, reason);
        DriverError::Validation(reason)
    }

    /// 查询仪器身份（`*IDN?`）
    pub fn identify(&self) -> Result<InstrumentIdentity, DriverError> {
        let reply = self.request(Command::identify())?;
        let text = reply.as_text().ok_or_else(|| shape_mismatch(Verb::Identify, &reply))?;
        Ok(InstrumentIdentity::parse(self.address.clone(), text)?)
    }

    pub fn get_temperature(&self) -> Result<f64, DriverError> {
        self.request_number(Command::read_temperature())
    }

    pub fn get_setpoint(&self) -> Result<f64, DriverError> {
        self.request_number(Command::read_setpoint())
    }

    /// 写入设定点
    ///
    /// 非有限值或超出仪器范围时返回 `Validation`，不发生任何 I/O。
    pub fn set_setpoint(&self, value: f64) -> Result<(), DriverError> {
        if !value.is_finite() {
            return Err(self.reject(format!("setpoint {} is not finite", value)));
        }
        if let Some(range) = self.setpoint_range.get()
            && !range.contains(value)
        {
            return Err(self.reject(format!("setpoint {:.2} outside {}", value, range)));
        }
        self.request_ack(Command::write_setpoint(value))?;
        info!("{}: setpoint -> {:.2}", self.address, value);
        Ok(())
    }

    pub fn get_ramp_rate(&self) -> Result<f64, DriverError> {
        self.request_number(Command::read_ramp_rate())
    }

    /// 写入升温速率（K/min），要求有限且 `0 < rate <= max_ramp_rate`
    pub fn set_ramp_rate(&self, rate: f64) -> Result<(), DriverError> {
        if !rate.is_finite() || rate <= 0.0 || rate > self.max_ramp_rate {
            return Err(self.reject(format!(
                "ramp rate {} outside (0, {}]",
                rate, self.max_ramp_rate
            )));
        }
        self.request_ack(Command::write_ramp_rate(rate))?;
        info!("{}: ramp rate -> {:.2}", self.address, rate);
        Ok(())
    }

    pub fn get_heater_power(&self) -> Result<f64, DriverError> {
        self.request_number(Command::read_heater())
    }

    pub fn set_heater_enabled(&self, enabled: bool) -> Result<(), DriverError> {
        self.request_ack(Command::write_heater_enabled(enabled))?;
        info!("{}: heater {}", self.address, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn get_heater_enabled(&self) -> Result<bool, DriverError> {
        self.request_flag(Command::read(Verb::ReadHeaterEnabled))
    }

    /// 加热器输出电压（V）
    pub fn get_heater_voltage(&self) -> Result<f64, DriverError> {
        self.request_number(Command::read(Verb::ReadHeaterVoltage))
    }

    /// 加热器是否处于自动（闭环）模式
    pub fn get_heater_auto(&self) -> Result<bool, DriverError> {
        self.request_flag(Command::read(Verb::ReadHeaterAuto))
    }

    /// 切换加热器自动/手动；手动模式下加热功率等于 [`set_heater_output`](Self::set_heater_output) 的值
    pub fn set_heater_auto(&self, auto: bool) -> Result<(), DriverError> {
        self.request_ack(Command::write_heater_auto(auto))?;
        info!("{}: heater {}", self.address, if auto { "auto" } else { "manual" });
        Ok(())
    }

    /// 手动加热输出（%）
    pub fn get_heater_output(&self) -> Result<f64, DriverError> {
        self.request_number(Command::read(Verb::ReadHeaterOutput))
    }

    pub fn set_heater_output(&self, percent: f64) -> Result<(), DriverError> {
        self.check_percent("heater output", percent)?;
        self.request_ack(Command::write_heater_output(percent))?;
        info!("{}: heater output -> {:.1}%", self.address, percent);
        Ok(())
    }

    /// 实际气流（%）
    pub fn get_gas_flow(&self) -> Result<f64, DriverError> {
        self.request_number(Command::read(Verb::ReadGasFlow))
    }

    /// 手动气流设定（%）
    pub fn get_gas_flow_setpoint(&self) -> Result<f64, DriverError> {
        self.request_number(Command::read(Verb::ReadGasFlowSetpoint))
    }

    pub fn set_gas_flow_setpoint(&self, percent: f64) -> Result<(), DriverError> {
        self.check_percent("gas flow", percent)?;
        self.request_ack(Command::write_gas_flow_setpoint(percent))?;
        info!("{}: gas flow -> {:.1}%", self.address, percent);
        Ok(())
    }

    pub fn get_gas_flow_auto(&self) -> Result<bool, DriverError> {
        self.request_flag(Command::read(Verb::ReadGasFlowAuto))
    }

    pub fn set_gas_flow_auto(&self, auto: bool) -> Result<(), DriverError> {
        self.request_ack(Command::write_gas_flow_auto(auto))?;
        info!("{}: gas flow {}", self.address, if auto { "auto" } else { "manual" });
        Ok(())
    }

    /// 仪器内部斜坡是否启用（停用时设定点立即生效）
    pub fn get_ramp_enabled(&self) -> Result<bool, DriverError> {
        self.request_flag(Command::read(Verb::ReadRampEnabled))
    }

    pub fn set_ramp_enabled(&self, enabled: bool) -> Result<(), DriverError> {
        self.request_ack(Command::write_ramp_enabled(enabled))?;
        info!("{}: internal ramp {}", self.address, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    fn check_percent(&self, what: &str, percent: f64) -> Result<(), DriverError> {
        if !(0.0..=MAX_OUTPUT_PERCENT).contains(&percent) {
            return Err(self.reject(format!(
                "{} {} outside 0..={}",
                what, percent, MAX_OUTPUT_PERCENT
            )));
        }
        Ok(())
    }

    pub fn get_alarms(&self) -> Result<AlarmFlags, DriverError> {
        let reply = self.request(Command::read_alarms())?;
        let bits = reply
            .as_integer()
            .ok_or_else(|| shape_mismatch(Verb::ReadAlarms, &reply))?;
        Ok(AlarmFlags::from_bits_retain(bits))
    }

    /// 完整状态（`STAT?`）
    pub fn get_status(&self) -> Result<Status, DriverError> {
        let fields = self.request_numbers(Command::read_status(), STATUS_FIELDS)?;
        Ok(Status {
            temperature: fields[0],
            setpoint: fields[1],
            heater_power: fields[2],
            ramp_rate: fields[3],
            alarms: AlarmFlags::from_bits_retain(alarm_bits(fields[4])?),
        })
    }

    /// 仪器宣告的设定点范围（`LIM?`）
    pub fn get_limits(&self) -> Result<(f64, f64), DriverError> {
        let fields = self.request_numbers(Command::read_limits(), LIMITS_FIELDS)?;
        Ok((fields[0], fields[1]))
    }

    /// 用于校验的设定点范围
    pub fn setpoint_range(&self) -> Option<SetpointRange> {
        self.setpoint_range.get().copied()
    }

    pub fn max_ramp_rate(&self) -> f64 {
        self.max_ramp_rate
    }

    /// 会话身份（关闭后为 `None`）
    pub fn identity(&self) -> Option<Arc<InstrumentIdentity>> {
        self.identity.load_full()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    /// 断开链路但保留会话（幂等）
    ///
    /// 会等待在途命令完成；之后的命令返回 `Disconnected`，直到重新连接。
    pub fn disconnect(&self) {
        if let Some(mut link) = self.link.lock().take() {
            link.transport.close();
            info!("{} disconnected", self.address);
        }
    }

    /// 按打开时的端口重新连接
    ///
    /// 只有通过端口字符串打开的会话才记得地址；注入传输打开的会话请用
    /// [`connect_with`](Self::connect_with)。
    pub fn connect(&self) -> Result<(), DriverError> {
        let address = self.reopen.as_ref().ok_or_else(|| {
            DriverError::Validation(format!("{} has no port to reopen", self.address))
        })?;
        let transport = cryo_transport::open(address, self.timeout)?;
        self.connect_with(transport)
    }

    /// 在新的传输上重新连接（替换现有链路）并重新确认身份
    ///
    /// 设定点范围沿用首次打开时建立的值。身份确认失败时链路保持断开。
    pub fn connect_with(&self, transport: Box<dyn Transport>) -> Result<(), DriverError> {
        {
            let mut guard = self.link.lock();
            if self.is_closed() {
                return Err(DriverError::Closed);
            }
            if let Some(mut old) = guard.replace(Link::new(transport)) {
                old.transport.close();
            }
        }
        SessionMetrics::incr(&self.metrics.reconnects);

        match self.identify() {
            Ok(identity) => {
                if let Some(previous) = self.identity.load_full()
                    && (previous.model != identity.model || previous.serial != identity.serial)
                {
                    warn!("{}: instrument changed from {} to {}", self.address, previous, identity);
                }
                info!("Reconnected to {}", identity);
                self.identity.store(Some(Arc::new(identity)));
                Ok(())
            },
            Err(e) => {
                error!("Failed to reconnect {}: {}", self.address, e);
                self.disconnect();
                Err(e)
            },
        }
    }

    /// 关闭会话并释放传输（幂等）
    ///
    /// 会等待在途命令完成；之后所有调用返回 `Closed`。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut link) = self.link.lock().take() {
            link.transport.close();
        }
        self.identity.store(None);
        info!("Session {} closed", self.address);
    }
}

impl Drop for InstrumentSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for InstrumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentSession")
            .field("address", &self.address)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn shape_mismatch(verb: Verb, reply: &Reply) -> DriverError {
    DriverError::Protocol(ProtocolError::UnexpectedReply {
        verb,
        reply: format!("{:?}", reply),
    })
}

/// `STAT?` 的报警字段以定点数传输，必须是非负整数
fn alarm_bits(field: f64) -> Result<u32, DriverError> {
    if field < 0.0 || field.fract() != 0.0 || field > f64::from(u32::MAX) {
        return Err(DriverError::Protocol(ProtocolError::InvalidNumber {
            field: field.to_string(),
        }));
    }
    Ok(field as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryo_transport::{Fault, SimConfig, SimHandle, SimTransport};

    /// 按脚本逐条应答的传输替身
    struct ScriptedTransport {
        replies: std::collections::VecDeque<Result<Vec<u8>, TransportError>>,
        writes: Arc<Mutex<Vec<String>>>,
        discards: Arc<std::sync::atomic::AtomicUsize>,
        closed: bool,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<&[u8], TransportError>>) -> Self {
            Self {
                replies: replies.into_iter().map(|r| r.map(|b| b.to_vec())).collect(),
                writes: Arc::new(Mutex::new(Vec::new())),
                discards: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
                closed: false,
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.writes.lock().push(String::from_utf8_lossy(bytes).trim_end().to_string());
            Ok(())
        }

        fn read_until(&mut self, _terminator: u8, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            self.replies.pop_front().unwrap_or(Err(TransportError::Timeout))
        }

        fn discard_input(&mut self) -> Result<(), TransportError> {
            self.discards.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn fast_config() -> InstrumentConfig {
        InstrumentConfig::default()
            .with_timeout(Duration::from_millis(20))
            .with_retry(RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            })
    }

    fn open_sim() -> (InstrumentSession, SimHandle) {
        let sim = SimTransport::new(SimConfig::default());
        let handle = sim.handle();
        let session = InstrumentSession::open(Box::new(sim), &fast_config()).unwrap();
        (session, handle)
    }

    const IDN: &[u8] = b"ACME,CRYO-336,SN42,1.4\n";
    const LIM: &[u8] = b"1.50,300.00\n";

    #[test]
    fn test_open_establishes_identity_and_range() {
        let (session, _handle) = open_sim();
        let identity = session.identity().unwrap();
        assert_eq!(identity.model, "SIM-1");
        assert_eq!(identity.firmware, Some(semver::Version::new(1, 0, 0)));
        assert_eq!(identity.address, "sim://default");
        assert_eq!(session.setpoint_range(), Some(SetpointRange { min: 1.5, max: 320.0 }));
    }

    #[test]
    fn test_open_with_configured_range_skips_limits_query() {
        let sim = SimTransport::new(SimConfig::default());
        let handle = sim.handle();
        let config = fast_config().with_setpoint_range(SetpointRange { min: 2.0, max: 50.0 });
        let session = InstrumentSession::open(Box::new(sim), &config).unwrap();
        assert_eq!(handle.count(Verb::ReadLimits), 0);
        assert!(matches!(session.set_setpoint(60.0), Err(DriverError::Validation(_))));
    }

    #[test]
    fn test_set_setpoint_reflected_in_status() {
        let (session, _handle) = open_sim();
        session.set_setpoint(77.0).unwrap();
        let status = session.get_status().unwrap();
        assert_eq!(status.setpoint, 77.0);
        assert_eq!(session.get_setpoint().unwrap(), 77.0);
    }

    #[test]
    fn test_validation_happens_before_io() {
        let (session, handle) = open_sim();
        handle.clear_log();

        assert!(matches!(session.set_setpoint(f64::NAN), Err(DriverError::Validation(_))));
        assert!(matches!(session.set_setpoint(1000.0), Err(DriverError::Validation(_))));
        assert!(matches!(session.set_ramp_rate(0.0), Err(DriverError::Validation(_))));
        assert!(matches!(session.set_ramp_rate(51.0), Err(DriverError::Validation(_))));
        assert!(matches!(
            session.set_ramp_rate(f64::INFINITY),
            Err(DriverError::Validation(_))
        ));

        assert!(handle.commands().is_empty());
        assert_eq!(session.metrics().snapshot().validation_rejections, 5);
    }

    #[test]
    fn test_timeout_retries_then_communication_error() {
        let transport = ScriptedTransport::new(vec![Ok(IDN), Ok(LIM)]);
        let writes = Arc::clone(&transport.writes);
        let discards = Arc::clone(&transport.discards);
        let session = InstrumentSession::open(Box::new(transport), &fast_config()).unwrap();
        writes.lock().clear();

        let err = session.get_temperature().unwrap_err();
        assert!(matches!(
            err,
            DriverError::Communication {
                verb: Verb::ReadTemperature,
                attempts: 3
            }
        ));
        assert_eq!(writes.lock().len(), 3);
        // 每次尝试之前都先丢弃残留输入
        assert_eq!(discards.load(Ordering::SeqCst), 3);

        let snapshot = session.metrics().snapshot();
        assert_eq!(snapshot.timeouts, 3);
        assert_eq!(snapshot.retries, 2);
        assert_eq!(snapshot.communication_failures, 1);
    }

    #[test]
    fn test_late_reply_is_not_paired_with_next_command() {
        let sim = SimTransport::new(SimConfig::default());
        let handle = sim.handle();
        let config = fast_config().with_retry(RetryPolicy::none());
        let session = InstrumentSession::open(Box::new(sim), &config).unwrap();
        session.set_setpoint(77.0).unwrap();

        // 温度应答在超时之后才到达
        handle.set_latency(Duration::from_millis(30));
        assert!(matches!(
            session.get_temperature(),
            Err(DriverError::Communication {
                verb: Verb::ReadTemperature,
                attempts: 1
            })
        ));
        handle.set_latency(Duration::ZERO);

        assert_eq!(session.get_setpoint().unwrap(), 77.0);
        assert_eq!(session.metrics().snapshot().late_replies, 1);
    }

    #[test]
    fn test_lost_request_costs_one_drain_timeout() {
        let (session, handle) = open_sim();
        // 三次尝试全部丢失，没有任何迟到应答
        handle.inject(Fault::Silent { count: 3 });
        assert!(session.get_temperature().is_err());
        assert!((session.get_temperature().unwrap() - 4.2).abs() < 0.5);
        assert_eq!(session.metrics().snapshot().late_replies, 0);
    }

    #[test]
    fn test_overflow_is_protocol_error() {
        let transport = ScriptedTransport::new(vec![
            Ok(IDN),
            Ok(LIM),
            Err(TransportError::Overflow { limit: 256 }),
        ]);
        let session = InstrumentSession::open(Box::new(transport), &fast_config()).unwrap();

        let err = session.get_temperature().unwrap_err();
        assert!(matches!(
            err,
            DriverError::Protocol(ProtocolError::FrameTooLong { len: 257, max: 256 })
        ));
        assert!(!err.is_fatal());
        let snapshot = session.metrics().snapshot();
        assert_eq!(snapshot.protocol_errors, 1);
        assert_eq!(snapshot.connection_errors, 0);
    }

    #[test]
    fn test_timeout_then_success() {
        let transport = ScriptedTransport::new(vec![
            Ok(IDN),
            Ok(LIM),
            Err(TransportError::Timeout),
            Ok(b"4.20\n"),
        ]);
        let session = InstrumentSession::open(Box::new(transport), &fast_config()).unwrap();
        assert_eq!(session.get_temperature().unwrap(), 4.2);
    }

    #[test]
    fn test_protocol_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Ok(IDN), Ok(LIM), Ok(b"OK\n")]);
        let writes = Arc::clone(&transport.writes);
        let session = InstrumentSession::open(Box::new(transport), &fast_config()).unwrap();
        writes.lock().clear();

        let err = session.get_temperature().unwrap_err();
        assert!(matches!(err, DriverError::Protocol(ProtocolError::UnexpectedReply { .. })));
        assert_eq!(writes.lock().len(), 1);
    }

    #[test]
    fn test_device_rejection() {
        let (session, handle) = open_sim();
        handle.inject(Fault::Reject { code: 7, count: 1 });
        let err = session.set_heater_enabled(false).unwrap_err();
        assert!(matches!(err, DriverError::Rejected { fault, .. } if fault.code == 7));
        assert_eq!(handle.count(Verb::WriteHeaterEnabled), 1);
    }

    #[test]
    fn test_connection_failure_is_fatal() {
        let (session, handle) = open_sim();
        handle.inject(Fault::Disconnect);
        let err = session.get_status().unwrap_err();
        assert!(err.is_fatal(), "got {:?}", err);
        assert_eq!(session.metrics().snapshot().connection_errors, 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (session, _handle) = open_sim();
        session.close();
        session.close();
        assert!(session.is_closed());
        assert!(session.identity().is_none());
        assert!(matches!(session.get_temperature(), Err(DriverError::Closed)));
    }

    #[test]
    fn test_disconnect_and_reconnect_with_transport() {
        let (session, handle) = open_sim();
        session.set_setpoint(50.0).unwrap();

        session.disconnect();
        session.disconnect();
        assert!(!session.is_connected());
        assert!(!session.is_closed());
        assert!(matches!(session.get_temperature(), Err(DriverError::Disconnected)));
        // 注入传输打开的会话没有可重新打开的端口
        assert!(matches!(session.connect(), Err(DriverError::Validation(_))));

        session.connect_with(Box::new(handle.attach())).unwrap();
        assert_eq!(session.get_setpoint().unwrap(), 50.0);
        assert_eq!(session.metrics().snapshot().reconnects, 1);

        session.close();
        assert!(matches!(
            session.connect_with(Box::new(handle.attach())),
            Err(DriverError::Closed)
        ));
    }

    #[test]
    fn test_reconnect_after_link_failure() {
        let (session, handle) = open_sim();
        handle.inject(Fault::Disconnect);
        assert!(session.get_status().unwrap_err().is_fatal());

        handle.restore_link();
        session.connect_with(Box::new(handle.attach())).unwrap();
        assert!(session.get_status().is_ok());
    }

    #[test]
    fn test_manual_heater_gas_flow_and_ramp_switches() {
        let (session, handle) = open_sim();
        session.set_heater_auto(false).unwrap();
        assert!(!session.get_heater_auto().unwrap());
        session.set_heater_output(30.0).unwrap();
        assert_eq!(session.get_heater_output().unwrap(), 30.0);
        assert!(session.get_heater_enabled().unwrap());
        assert!(session.get_heater_voltage().unwrap() >= 0.0);

        session.set_gas_flow_auto(false).unwrap();
        assert!(!session.get_gas_flow_auto().unwrap());
        session.set_gas_flow_setpoint(12.5).unwrap();
        assert_eq!(session.get_gas_flow_setpoint().unwrap(), 12.5);
        assert!((0.0..=MAX_OUTPUT_PERCENT).contains(&session.get_gas_flow().unwrap()));

        session.set_ramp_enabled(false).unwrap();
        assert!(!session.get_ramp_enabled().unwrap());
        assert!(!handle.ramp_enabled());

        handle.clear_log();
        assert!(matches!(session.set_heater_output(100.0), Err(DriverError::Validation(_))));
        assert!(matches!(session.set_gas_flow_setpoint(-0.1), Err(DriverError::Validation(_))));
        assert!(matches!(
            session.set_gas_flow_setpoint(f64::NAN),
            Err(DriverError::Validation(_))
        ));
        assert!(handle.commands().is_empty());
    }

    #[test]
    fn test_open_failure_closes_transport() {
        let transport = ScriptedTransport::new(vec![Ok(b"garbage\n")]);
        let err = InstrumentSession::open(Box::new(transport), &fast_config()).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn test_open_rejects_inverted_limits() {
        let transport = ScriptedTransport::new(vec![Ok(IDN), Ok(b"300.00,1.50\n")]);
        let err = InstrumentSession::open(Box::new(transport), &fast_config()).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }

    #[test]
    fn test_typed_reads() {
        let (session, handle) = open_sim();
        handle.set_alarms(cryo_protocol::alarm::HEATER_OPEN);
        assert!(session.get_alarms().unwrap().contains(AlarmFlags::HEATER_OPEN));
        assert!(session.get_heater_power().unwrap() >= 0.0);
        session.set_ramp_rate(5.0).unwrap();
        assert_eq!(session.get_ramp_rate().unwrap(), 5.0);
        assert_eq!(session.get_limits().unwrap(), (1.5, 320.0));
        assert!((session.get_temperature().unwrap() - 4.2).abs() < 0.5);
    }

    #[test]
    fn test_identity_parse() {
        let identity = InstrumentIdentity::parse("x", "ACME, CRYO-336 ,SN1,v2.1").unwrap();
        assert_eq!(identity.model, "CRYO-336");
        assert_eq!(identity.firmware, Some(semver::Version::new(2, 1, 0)));

        let identity = InstrumentIdentity::parse("x", "ACME,M,S,build-17").unwrap();
        assert_eq!(identity.firmware, None);
        assert_eq!(identity.firmware_raw, "build-17");

        assert!(InstrumentIdentity::parse("x", "ACME,M").is_err());
    }

    #[test]
    fn test_alarm_bits() {
        assert_eq!(alarm_bits(5.0).unwrap(), 5);
        assert!(alarm_bits(-1.0).is_err());
        assert!(alarm_bits(1.5).is_err());
    }
}
