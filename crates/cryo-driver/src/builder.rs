//! Builder 模式实现
//!
//! 提供链式构造 [`InstrumentSession`] 的便捷方式。传输类型由端口字符串自动识别
//! （见 [`TransportAddress::parse`]），也可以直接注入自定义传输（测试替身、模拟器）。

use crate::config::{InstrumentConfig, RetryPolicy, SetpointRange};
use crate::error::DriverError;
use crate::session::InstrumentSession;
use cryo_transport::{Transport, TransportAddress};
use std::time::Duration;
use tracing::debug;

/// 会话 Builder
///
/// # Example
///
/// ```
/// use cryo_driver::SessionBuilder;
/// use std::time::Duration;
///
/// let session = SessionBuilder::new()
///     .port("sim://bench")
///     .timeout(Duration::from_millis(200))
///     .open()
///     .unwrap();
/// assert_eq!(session.identity().unwrap().model, "SIM-1");
/// ```
#[derive(Default)]
pub struct SessionBuilder {
    config: InstrumentConfig,
    transport: Option<Box<dyn Transport>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从完整配置开始
    pub fn from_config(config: InstrumentConfig) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    /// 端口（`sim://`、`tcp://host:port`、`gpib://host/addr` 或串口路径）
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.config.port = port.into();
        self
    }

    /// 串口波特率（默认 9600）
    pub fn baud(mut self, baud: u32) -> Self {
        self.config.baud = baud;
        self
    }

    /// 单条命令读超时（默认 500 ms）
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// 固定设定点范围（跳过 `LIM?` 查询）
    pub fn setpoint_range(mut self, min: f64, max: f64) -> Self {
        self.config.setpoint_range = Some(SetpointRange { min, max });
        self
    }

    pub fn max_ramp_rate(mut self, rate: f64) -> Self {
        self.config.max_ramp_rate = rate;
        self
    }

    /// 使用自定义传输（忽略 `port` / `baud`）
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// 打开传输并建立会话
    ///
    /// # 错误
    /// - `Validation`: 配置不一致
    /// - `Connection`: 端口无法打开
    /// - `Protocol` / `Communication`: 身份或范围查询失败
    pub fn open(self) -> Result<InstrumentSession, DriverError> {
        self.config.validate()?;

        match self.transport {
            Some(transport) => InstrumentSession::open(transport, &self.config),
            None => {
                let address = TransportAddress::parse(&self.config.port, self.config.baud)
                    .map_err(|e| DriverError::Validation(e.to_string()))?;
                debug!("Opening {} (auto-detected from {:?})", address, self.config.port);
                let transport = cryo_transport::open(&address, self.config.timeout())?;
                Ok(InstrumentSession::open(transport, &self.config)?.with_reopen(address))
            },
        }
    }
}
