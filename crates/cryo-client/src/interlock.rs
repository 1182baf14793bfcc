//! 安全联锁
//!
//! 联锁 = 读数上的条件 + 触发后的动作。每条新读数都会被评估；
//! 触发后进入冷却期，冷却期内同一联锁不会再次触发。

use cryo_driver::{AlarmFlags, Reading};
use std::fmt;
use std::time::{Duration, Instant};

/// 默认冷却时间
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// 联锁条件
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Condition {
    /// 温度高于给定值（K）
    TemperatureAbove(f64),
    /// 温度低于给定值（K）
    TemperatureBelow(f64),
    /// 加热功率高于给定值（%）
    HeaterAbove(f64),
    /// 任一给定报警位置位
    AlarmRaised(AlarmFlags),
}

impl Condition {
    pub fn is_met(&self, reading: &Reading) -> bool {
        match *self {
            Condition::TemperatureAbove(limit) => reading.temperature > limit,
            Condition::TemperatureBelow(limit) => reading.temperature < limit,
            Condition::HeaterAbove(limit) => reading.heater_power > limit,
            Condition::AlarmRaised(mask) => reading.alarms.intersects(mask),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::TemperatureAbove(limit) => write!(f, "T > {:.2}", limit),
            Condition::TemperatureBelow(limit) => write!(f, "T < {:.2}", limit),
            Condition::HeaterAbove(limit) => write!(f, "heater > {:.2}%", limit),
            Condition::AlarmRaised(mask) => write!(f, "alarm in [{}]", mask),
        }
    }
}

/// 触发后的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Action {
    /// 中止斜坡，写入安全设定点
    AbortRamp,
    /// 中止斜坡，关闭加热器并写入安全设定点
    CutHeater,
}

/// 一条联锁规则
#[derive(Debug, Clone)]
pub struct Interlock {
    name: String,
    condition: Condition,
    action: Action,
    cooldown: Duration,
    last_trip: Option<Instant>,
}

impl Interlock {
    pub fn new(name: impl Into<String>, condition: Condition, action: Action) -> Self {
        Self {
            name: name.into(),
            condition,
            action,
            cooldown: DEFAULT_COOLDOWN,
            last_trip: None,
        }
    }

    /// 温度上限联锁（触发时关闭加热器）
    pub fn over_temperature(limit: f64) -> Self {
        Self::new("over-temperature", Condition::TemperatureAbove(limit), Action::CutHeater)
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// 最近一次触发时刻
    pub fn last_trip(&self) -> Option<Instant> {
        self.last_trip
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.last_trip
            .is_some_and(|trip| now.saturating_duration_since(trip) < self.cooldown)
    }

    /// 评估一条新读数；触发时记录时间并返回 `true`
    pub fn check(&mut self, reading: &Reading, now: Instant) -> bool {
        if self.cooling_down(now) || !self.condition.is_met(reading) {
            return false;
        }
        self.last_trip = Some(now);
        true
    }
}
