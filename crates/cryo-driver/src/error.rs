//! 驱动层错误类型定义

use cryo_protocol::{DeviceFault, ProtocolError, Verb};
use cryo_transport::TransportError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 链路不可用（打开失败、IO 错误、对端断开）
    ///
    /// 不重试：会话需要重新打开。
    #[error("Connection error: {0}")]
    Connection(#[source] TransportError),

    /// 应答不符合语法（固件与编解码器不匹配，不重试）
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 参数在发出任何 I/O 之前被拒绝
    #[error("Validation error: {0}")]
    Validation(String),

    /// 重试耗尽仍未得到有效应答
    #[error("Communication failed: no reply to {verb} after {attempts} attempts")]
    Communication { verb: Verb, attempts: u32 },

    /// 仪器以 `ERR <code>` 拒绝命令
    #[error("Instrument rejected {verb}: {fault}")]
    Rejected { verb: Verb, fault: DeviceFault },

    /// 会话已关闭
    #[error("Session closed")]
    Closed,

    /// 链路已断开（`disconnect` 之后、重新 `connect` 之前）
    #[error("Instrument disconnected")]
    Disconnected,

    /// 后台线程错误
    #[error("Thread error: {0}")]
    Thread(String),
}

impl DriverError {
    /// 是否为瞬态错误（稍后重发同一命令可能成功）
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Communication { .. })
    }

    /// 是否需要重新打开会话才能恢复
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Connection(_) | DriverError::Closed | DriverError::Disconnected
        )
    }
}

/// 把传输错误映射到驱动层（`Timeout` 由重试循环处理，不会走到这里）
///
/// `Overflow` 是失步的设备输出，链路本身完好，归入协议错误。
impl From<TransportError> for DriverError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Closed => DriverError::Closed,
            TransportError::Overflow { limit } => DriverError::Protocol(ProtocolError::FrameTooLong {
                len: limit.saturating_add(1),
                max: limit,
            }),
            other => DriverError::Connection(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::Communication {
            verb: Verb::ReadStatus,
            attempts: 4,
        };
        assert_eq!(
            err.to_string(),
            "Communication failed: no reply to STAT? after 4 attempts"
        );

        let err = DriverError::Rejected {
            verb: Verb::WriteSetpoint,
            fault: DeviceFault { code: 2 },
        };
        let msg = err.to_string();
        assert!(msg.contains("SETP") && msg.contains("code 2"), "message: {}", msg);

        let err = DriverError::Validation("setpoint 500.00 outside 1.50..=320.00".to_string());
        assert!(err.to_string().starts_with("Validation error"));
    }

    #[test]
    fn test_from_transport_error() {
        let err: DriverError = TransportError::Closed.into();
        assert!(matches!(err, DriverError::Closed));

        let err: DriverError = TransportError::Connection("refused".into()).into();
        assert!(matches!(err, DriverError::Connection(_)));
        assert!(err.is_fatal());

        let err: DriverError = TransportError::Overflow { limit: 256 }.into();
        assert!(matches!(
            err,
            DriverError::Protocol(ProtocolError::FrameTooLong { len: 257, max: 256 })
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_from_protocol_error() {
        let err: DriverError = ProtocolError::Empty.into();
        assert!(matches!(err, DriverError::Protocol(ProtocolError::Empty)));
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_classification() {
        assert!(
            DriverError::Communication {
                verb: Verb::ReadTemperature,
                attempts: 1
            }
            .is_retryable()
        );
        assert!(!DriverError::Validation(String::new()).is_retryable());
        assert!(DriverError::Closed.is_fatal());
        assert!(DriverError::Disconnected.is_fatal());
    }
}
