//! 客户端层错误类型

use crate::supervisor::SupervisorState;
use cryo_driver::DriverError;
use std::time::Duration;
use thiserror::Error;

/// 客户端层错误
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// 斜坡计划不合法（空计划、非有限值、超出仪器范围）
    #[error("Invalid ramp plan: {0}")]
    InvalidPlan(String),

    /// 监督器正在执行计划
    #[error("Supervisor busy ({state})")]
    Busy { state: SupervisorState },

    /// `Aborted` / `Complete` 之后必须先 `reset()`
    #[error("Supervisor is {state}, reset() required before a new plan")]
    ResetRequired { state: SupervisorState },

    /// 安全动作尚未成功下发，不能复位
    #[error("Safe action still pending")]
    SafeActionPending,

    /// 监督线程已退出
    #[error("Supervisor thread stopped")]
    SupervisorStopped,

    #[error("Session closed")]
    Closed,
}

impl ClientError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ClientError::Driver(e) => e.is_fatal(),
            ClientError::SupervisorStopped | ClientError::Closed => true,
            _ => false,
        }
    }
}

/// 监督失败（计划无法继续执行）
#[derive(Error, Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SupervisionError {
    /// 步骤下发重试耗尽
    #[error("step {step} not issued after {attempts} attempts: {error}")]
    StepExhausted { step: usize, attempts: u32, error: String },

    /// 步骤下发遇到非瞬态错误（校验、协议、设备拒绝、链路断开）
    #[error("step {step} failed: {error}")]
    StepFailed { step: usize, error: String },

    /// 安全动作重试耗尽
    #[error("safe action failed after {attempts} attempts: {error}")]
    SafeActionFailed { attempts: u32, error: String },
}

/// 进入 `Aborted` 的原因
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AbortReason {
    /// 调用者取消
    Cancelled,
    /// 联锁触发
    Interlock { name: String, condition: String },
    /// 状态缓存超过允许的陈旧时间
    CommunicationLost { staleness: Duration },
    Supervision(SupervisionError),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Cancelled => f.write_str("cancelled"),
            AbortReason::Interlock { name, condition } => {
                write!(f, "interlock '{}' tripped ({})", name, condition)
            },
            AbortReason::CommunicationLost { staleness } => {
                write!(f, "communication lost (no reading for {:?})", staleness)
            },
            AbortReason::Supervision(e) => write!(f, "supervision error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ClientError::ResetRequired {
            state: SupervisorState::Aborted,
        };
        assert_eq!(
            err.to_string(),
            "Supervisor is Aborted, reset() required before a new plan"
        );

        let reason = AbortReason::Interlock {
            name: "overtemp".into(),
            condition: "T > 300.00".into(),
        };
        assert_eq!(reason.to_string(), "interlock 'overtemp' tripped (T > 300.00)");

        let reason = AbortReason::Supervision(SupervisionError::StepExhausted {
            step: 1,
            attempts: 4,
            error: "timeout".into(),
        });
        assert!(reason.to_string().contains("step 1 not issued after 4 attempts"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ClientError::Closed.is_fatal());
        assert!(ClientError::Driver(DriverError::Closed).is_fatal());
        assert!(!ClientError::InvalidPlan(String::new()).is_fatal());
    }
}
