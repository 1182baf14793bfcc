//! 仪器状态类型：报警位、状态应答、缓存读数

use cryo_protocol::alarm;
use std::fmt;

bitflags::bitflags! {
    /// 报警位集合
    ///
    /// 固件可能定义更多报警位，解析时用 `from_bits_retain` 保留未知位。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[cfg_attr(feature = "serde", serde(transparent))]
    pub struct AlarmFlags: u32 {
        const SENSOR_FAULT = alarm::SENSOR_FAULT;
        const OVER_TEMPERATURE = alarm::OVER_TEMPERATURE;
        const HEATER_OPEN = alarm::HEATER_OPEN;
        const HEATER_SHORT = alarm::HEATER_SHORT;
        const RAMP_ACTIVE = alarm::RAMP_ACTIVE;
    }
}

const LABELS: [(AlarmFlags, &str); 5] = [
    (AlarmFlags::SENSOR_FAULT, "sensor fault"),
    (AlarmFlags::OVER_TEMPERATURE, "over-temperature"),
    (AlarmFlags::HEATER_OPEN, "heater open"),
    (AlarmFlags::HEATER_SHORT, "heater short"),
    (AlarmFlags::RAMP_ACTIVE, "ramp active"),
];

impl AlarmFlags {
    /// 已置位的已知报警（人类可读名称）
    pub fn labels(self) -> impl Iterator<Item = &'static str> {
        LABELS
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, label)| label)
    }

    /// 未定义的位
    pub fn unknown(self) -> u32 {
        self.bits() & !Self::all().bits()
    }
}

impl fmt::Display for AlarmFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut parts: Vec<String> = self.labels().map(str::to_string).collect();
        if self.unknown() != 0 {
            parts.push(format!("{:#x}", self.unknown()));
        }
        f.write_str(&parts.join(", "))
    }
}

/// `STAT?` 应答
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Status {
    pub temperature: f64,
    pub setpoint: f64,
    /// 加热功率（%）
    pub heater_power: f64,
    /// 升温速率（K/min）
    pub ramp_rate: f64,
    pub alarms: AlarmFlags,
}

/// 状态缓存中的一条读数
///
/// 发布后不可变。`timestamp_us` 为进程内单调时钟（微秒），
/// 同一缓存内严格递增；`sequence` 从 1 开始逐条递增。
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reading {
    pub timestamp_us: u64,
    pub sequence: u64,
    pub temperature: f64,
    pub setpoint: f64,
    pub heater_power: f64,
    pub ramp_rate: f64,
    pub alarms: AlarmFlags,
}

impl Reading {
    pub fn from_status(status: Status, timestamp_us: u64) -> Self {
        Self {
            timestamp_us,
            sequence: 0,
            temperature: status.temperature,
            setpoint: status.setpoint,
            heater_power: status.heater_power,
            ramp_rate: status.ramp_rate,
            alarms: status.alarms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm_flags() {
        let flags = AlarmFlags::SENSOR_FAULT | AlarmFlags::HEATER_OPEN;
        assert!(flags.contains(AlarmFlags::SENSOR_FAULT));
        assert!(!flags.contains(AlarmFlags::SENSOR_FAULT | AlarmFlags::RAMP_ACTIVE));
        assert!(flags.intersects(AlarmFlags::SENSOR_FAULT | AlarmFlags::RAMP_ACTIVE));
        assert_eq!(flags.labels().collect::<Vec<_>>(), vec!["sensor fault", "heater open"]);
        assert_eq!(flags.to_string(), "sensor fault, heater open");

        assert!(AlarmFlags::empty().is_empty());
        assert_eq!(AlarmFlags::empty().to_string(), "none");

        // 未知位保留，不会被静默丢弃
        let flags = AlarmFlags::from_bits_retain(alarm::HEATER_SHORT | 1 << 20);
        assert_eq!(flags.bits(), alarm::HEATER_SHORT | 1 << 20);
        assert_eq!(flags.unknown(), 1 << 20);
        assert_eq!(flags.to_string(), "heater short, 0x100000");
        assert_eq!(AlarmFlags::from_bits_retain(1 << 20).to_string(), "0x100000");
    }

    #[test]
    fn test_reading_from_status() {
        let status = Status {
            temperature: 4.2,
            setpoint: 5.0,
            heater_power: 12.5,
            ramp_rate: 1.0,
            alarms: AlarmFlags::RAMP_ACTIVE,
        };
        let reading = Reading::from_status(status, 1_000);
        assert_eq!(reading.timestamp_us, 1_000);
        assert_eq!(reading.setpoint, 5.0);
        assert_eq!(reading.alarms, AlarmFlags::RAMP_ACTIVE);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_reading_serde() {
        let reading = Reading::from_status(
            Status {
                temperature: 4.2,
                setpoint: 5.0,
                heater_power: 0.0,
                ramp_rate: 1.0,
                alarms: AlarmFlags::empty(),
            },
            7,
        );
        let json = serde_json::to_string(&reading).unwrap();
        assert_eq!(serde_json::from_str::<Reading>(&json).unwrap(), reading);
    }
}
