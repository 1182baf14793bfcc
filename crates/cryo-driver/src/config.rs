//! 会话配置
//!
//! 只有结构体和默认值，不解析任何配置文件；外层可以通过 `serde` feature 自行持久化。

use crate::error::DriverError;
use std::time::Duration;

/// 超时重试策略（指数退避）
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// 首次尝试之后的最大重试次数
    pub max_retries: u32,
    /// 第一次重试前的等待时间
    pub initial_backoff: Duration,
    /// 退避时间上限
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// 不重试
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// 第 `retry` 次重试（从 0 开始）之前的等待时间
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// 总尝试次数（首次 + 重试）
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// 设定点允许范围（闭区间）
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SetpointRange {
    pub min: f64,
    pub max: f64,
}

impl SetpointRange {
    pub fn new(min: f64, max: f64) -> Result<Self, DriverError> {
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(DriverError::Validation(format!(
                "invalid setpoint range {}..={}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

impl std::fmt::Display for SetpointRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}..={:.2}", self.min, self.max)
    }
}

/// 仪器连接配置
///
/// # Example
///
/// ```
/// use cryo_driver::{InstrumentConfig, RetryPolicy};
/// use std::time::Duration;
///
/// let config = InstrumentConfig::new("/dev/ttyUSB0")
///     .with_baud(19_200)
///     .with_timeout(Duration::from_millis(300))
///     .with_retry(RetryPolicy { max_retries: 5, ..Default::default() });
/// assert_eq!(config.timeout_ms, 300);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstrumentConfig {
    /// 端口：`sim://`、`tcp://host:port`、`gpib://host/addr` 或串口路径
    pub port: String,
    /// 串口波特率
    pub baud: u32,
    /// 单条命令读超时（毫秒）
    pub timeout_ms: u64,
    /// 状态轮询周期（毫秒）
    pub poll_interval_ms: u64,
    pub retry: RetryPolicy,
    /// 设定点范围；`None` 时在打开会话时通过 `LIM?` 查询
    pub setpoint_range: Option<SetpointRange>,
    /// 升温速率上限（K/min）
    pub max_ramp_rate: f64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            port: "sim://".to_string(),
            baud: 9600,
            timeout_ms: 500,
            poll_interval_ms: 250,
            retry: RetryPolicy::default(),
            setpoint_range: None,
            max_ramp_rate: 50.0,
        }
    }
}

impl InstrumentConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_setpoint_range(mut self, range: SetpointRange) -> Self {
        self.setpoint_range = Some(range);
        self
    }

    pub fn with_max_ramp_rate(mut self, rate: f64) -> Self {
        self.max_ramp_rate = rate;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// 校验配置一致性
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.timeout_ms == 0 {
            return Err(DriverError::Validation("timeout_ms must be > 0".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(DriverError::Validation("poll_interval_ms must be > 0".to_string()));
        }
        if !self.max_ramp_rate.is_finite() || self.max_ramp_rate <= 0.0 {
            return Err(DriverError::Validation(format!(
                "max_ramp_rate must be finite and > 0, got {}",
                self.max_ramp_rate
            )));
        }
        if let Some(range) = self.setpoint_range {
            SetpointRange::new(range.min, range.max)?;
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(DriverError::Validation(
                "retry.initial_backoff exceeds retry.max_backoff".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(70),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
        assert_eq!(policy.backoff(2), Duration::from_millis(40));
        assert_eq!(policy.backoff(3), Duration::from_millis(70));
        assert_eq!(policy.backoff(40), Duration::from_millis(70));
        assert_eq!(policy.attempts(), 11);
        assert_eq!(RetryPolicy::none().attempts(), 1);
    }

    #[test]
    fn test_setpoint_range() {
        let range = SetpointRange::new(1.5, 300.0).unwrap();
        assert!(range.contains(1.5));
        assert!(range.contains(300.0));
        assert!(!range.contains(300.01));
        assert_eq!(range.to_string(), "1.50..=300.00");

        assert!(SetpointRange::new(10.0, 10.0).is_err());
        assert!(SetpointRange::new(f64::NAN, 10.0).is_err());
    }

    #[test]
    fn test_config_defaults_and_setters() {
        let config = InstrumentConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert!(config.validate().is_ok());

        let config = InstrumentConfig::new("tcp://10.0.0.2:7777")
            .with_poll_interval(Duration::from_millis(100))
            .with_max_ramp_rate(20.0);
        assert_eq!(config.port, "tcp://10.0.0.2:7777");
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.max_ramp_rate, 20.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(InstrumentConfig::default().with_timeout(Duration::ZERO).validate().is_err());
        assert!(InstrumentConfig::default().with_max_ramp_rate(-1.0).validate().is_err());

        let mut config = InstrumentConfig::default();
        config.setpoint_range = Some(SetpointRange { min: 5.0, max: 1.0 });
        assert!(matches!(config.validate(), Err(DriverError::Validation(_))));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_config_serde_round_trip() {
        let config = InstrumentConfig::new("COM3").with_setpoint_range(SetpointRange { min: 2.0, max: 80.0 });
        let json = serde_json::to_string(&config).unwrap();
        let back: InstrumentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
