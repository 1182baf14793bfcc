//! 斜坡计划
//!
//! 计划由若干步组成，每步：以 `rate`（K/min）升/降温到 `target_setpoint`，
//! 到达（在容差内持续 debounce 窗口）后保持 `hold` 时长。
//!
//! # 示例
//!
//! ```rust
//! use cryo_client::{RampPlan, RampStep};
//! use std::time::Duration;
//!
//! let plan = RampPlan::new(vec![
//!     RampStep::new(10.0, 2.0, Duration::from_secs(600)),
//!     RampStep::new(4.2, 5.0, Duration::ZERO),
//! ])
//! .unwrap();
//! assert_eq!(plan.len(), 2);
//! ```

use crate::error::ClientError;
use cryo_driver::SetpointRange;
use std::time::Duration;

/// 计划中的一步
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RampStep {
    /// 目标设定点（K）
    pub target_setpoint: f64,
    /// 升温速率（K/min）
    pub rate: f64,
    /// 到达后的保持时长
    pub hold: Duration,
}

impl RampStep {
    pub fn new(target_setpoint: f64, rate: f64, hold: Duration) -> Self {
        Self {
            target_setpoint,
            rate,
            hold,
        }
    }
}

/// 斜坡计划（非空、有序）
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RampPlan {
    steps: Vec<RampStep>,
}

impl RampPlan {
    /// 创建计划并做与仪器无关的校验
    pub fn new(steps: Vec<RampStep>) -> Result<Self, ClientError> {
        check_steps(&steps)?;
        Ok(Self { steps })
    }

    /// 单步计划
    pub fn single(target_setpoint: f64, rate: f64, hold: Duration) -> Result<Self, ClientError> {
        Self::new(vec![RampStep::new(target_setpoint, rate, hold)])
    }

    /// 按仪器能力校验（设定点范围、速率上限）
    ///
    /// 反序列化得到的计划未经过 [`RampPlan::new`]，这里会重新做基本校验。
    pub fn validate_for(&self, range: Option<SetpointRange>, max_rate: f64) -> Result<(), ClientError> {
        check_steps(&self.steps)?;
        for (index, step) in self.steps.iter().enumerate() {
            if let Some(range) = range
                && !range.contains(step.target_setpoint)
            {
                return Err(ClientError::InvalidPlan(format!(
                    "step {}: target {:.2} outside {}",
                    index, step.target_setpoint, range
                )));
            }
            if step.rate > max_rate {
                return Err(ClientError::InvalidPlan(format!(
                    "step {}: rate {:.2} exceeds {:.2}",
                    index, step.rate, max_rate
                )));
            }
        }
        Ok(())
    }

    pub fn steps(&self) -> &[RampStep] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&RampStep> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn check_steps(steps: &[RampStep]) -> Result<(), ClientError> {
    if steps.is_empty() {
        return Err(ClientError::InvalidPlan("plan has no steps".to_string()));
    }
    for (index, step) in steps.iter().enumerate() {
        if !step.target_setpoint.is_finite() {
            return Err(ClientError::InvalidPlan(format!(
                "step {}: target {} is not finite",
                index, step.target_setpoint
            )));
        }
        if !step.rate.is_finite() || step.rate <= 0.0 {
            return Err(ClientError::InvalidPlan(format!(
                "step {}: rate {} must be finite and > 0",
                index, step.rate
            )));
        }
    }
    Ok(())
}
