//! 命令定义模块
//!
//! 命令 = 动词 + 可选参数。动词决定助记符、参数类型和期望的应答形状。

use crate::ProtocolError;
use crate::constants::{IDENTITY_FIELDS, LIMITS_FIELDS, STATUS_FIELDS};
use crate::reply::ReplyShape;
use std::fmt;

/// 命令动词
///
/// 每个动词对应一条固件指令。读命令以 `?` 结尾，写命令携带一个参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Verb {
    /// 仪器识别（`*IDN?`）
    Identify,
    /// 读取当前温度（`TEMP?`）
    ReadTemperature,
    /// 读取设定点（`SETP?`）
    ReadSetpoint,
    /// 写入设定点（`SETP <n>`）
    WriteSetpoint,
    /// 读取升温速率（`RAMP?`）
    ReadRampRate,
    /// 写入升温速率（`RAMP <n>`）
    WriteRampRate,
    /// 读取加热功率（`HTR?`）
    ReadHeater,
    /// 使能/关闭加热器（`HTREN <0|1>`）
    WriteHeaterEnabled,
    /// 读取报警位（`ALRM?`）
    ReadAlarms,
    /// 读取完整状态（`STAT?`）
    ReadStatus,
    /// 读取设定点允许范围（`LIM?`）
    ReadLimits,
    /// 加热器是否使能（`HTREN?`）
    ReadHeaterEnabled,
    /// 加热器输出电压（`HTRV?`）
    ReadHeaterVoltage,
    /// 加热器自动/手动（`HTRAUTO?`）
    ReadHeaterAuto,
    /// 切换加热器自动/手动（`HTRAUTO <0|1>`）
    WriteHeaterAuto,
    /// 手动模式下的加热输出百分比（`HTRSET?`）
    ReadHeaterOutput,
    /// 写入手动加热输出百分比（`HTRSET <n>`）
    WriteHeaterOutput,
    /// 实际气流百分比（`FLOW?`）
    ReadGasFlow,
    /// 手动气流设定百分比（`FLOWSP?`）
    ReadGasFlowSetpoint,
    /// 写入手动气流设定（`FLOWSP <n>`）
    WriteGasFlowSetpoint,
    /// 气流自动/手动（`FLOWAUTO?`）
    ReadGasFlowAuto,
    /// 切换气流自动/手动（`FLOWAUTO <0|1>`）
    WriteGasFlowAuto,
    /// 仪器内部斜坡是否启用（`RAMPEN?`）
    ReadRampEnabled,
    /// 启用/停用内部斜坡（`RAMPEN <0|1>`）
    WriteRampEnabled,
}

/// 参数类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentKind {
    /// 无参数（读命令）
    None,
    /// 定点数值
    Number,
    /// 开关量（`0`/`1`）
    Flag,
}

impl Verb {
    /// 全部动词（按助记符匹配时遍历）
    pub const ALL: [Verb; 24] = [
        Verb::Identify,
        Verb::ReadTemperature,
        Verb::ReadSetpoint,
        Verb::WriteSetpoint,
        Verb::ReadRampRate,
        Verb::WriteRampRate,
        Verb::ReadHeater,
        Verb::WriteHeaterEnabled,
        Verb::ReadAlarms,
        Verb::ReadStatus,
        Verb::ReadLimits,
        Verb::ReadHeaterEnabled,
        Verb::ReadHeaterVoltage,
        Verb::ReadHeaterAuto,
        Verb::WriteHeaterAuto,
        Verb::ReadHeaterOutput,
        Verb::WriteHeaterOutput,
        Verb::ReadGasFlow,
        Verb::ReadGasFlowSetpoint,
        Verb::WriteGasFlowSetpoint,
        Verb::ReadGasFlowAuto,
        Verb::WriteGasFlowAuto,
        Verb::ReadRampEnabled,
        Verb::WriteRampEnabled,
    ];

    /// 线上助记符
    pub fn mnemonic(self) -> &'static str {
        match self {
            Verb::Identify => "*IDN?",
            Verb::ReadTemperature => "TEMP?",
            Verb::ReadSetpoint => "SETP?",
            Verb::WriteSetpoint => "SETP",
            Verb::ReadRampRate => "RAMP?",
            Verb::WriteRampRate => "RAMP",
            Verb::ReadHeater => "HTR?",
            Verb::WriteHeaterEnabled => "HTREN",
            Verb::ReadAlarms => "ALRM?",
            Verb::ReadStatus => "STAT?",
            Verb::ReadLimits => "LIM?",
            Verb::ReadHeaterEnabled => "HTREN?",
            Verb::ReadHeaterVoltage => "HTRV?",
            Verb::ReadHeaterAuto => "HTRAUTO?",
            Verb::WriteHeaterAuto => "HTRAUTO",
            Verb::ReadHeaterOutput => "HTRSET?",
            Verb::WriteHeaterOutput => "HTRSET",
            Verb::ReadGasFlow => "FLOW?",
            Verb::ReadGasFlowSetpoint => "FLOWSP?",
            Verb::WriteGasFlowSetpoint => "FLOWSP",
            Verb::ReadGasFlowAuto => "FLOWAUTO?",
            Verb::WriteGasFlowAuto => "FLOWAUTO",
            Verb::ReadRampEnabled => "RAMPEN?",
            Verb::WriteRampEnabled => "RAMPEN",
        }
    }

    /// 根据助记符查找动词（大小写不敏感）
    pub fn from_mnemonic(mnemonic: &str) -> Option<Verb> {
        Verb::ALL
            .into_iter()
            .find(|verb| verb.mnemonic().eq_ignore_ascii_case(mnemonic))
    }

    /// 参数类型
    pub fn argument_kind(self) -> ArgumentKind {
        match self {
            Verb::WriteSetpoint | Verb::WriteRampRate | Verb::WriteHeaterOutput | Verb::WriteGasFlowSetpoint => {
                ArgumentKind::Number
            },
            Verb::WriteHeaterEnabled | Verb::WriteHeaterAuto | Verb::WriteGasFlowAuto | Verb::WriteRampEnabled => {
                ArgumentKind::Flag
            },
            _ => ArgumentKind::None,
        }
    }

    /// 期望的应答形状
    pub fn reply_shape(self) -> ReplyShape {
        match self {
            Verb::Identify => ReplyShape::Text {
                fields: IDENTITY_FIELDS,
            },
            Verb::ReadTemperature
            | Verb::ReadSetpoint
            | Verb::ReadRampRate
            | Verb::ReadHeater
            | Verb::ReadHeaterVoltage
            | Verb::ReadHeaterOutput
            | Verb::ReadGasFlow
            | Verb::ReadGasFlowSetpoint => ReplyShape::Number,
            Verb::ReadHeaterEnabled | Verb::ReadHeaterAuto | Verb::ReadGasFlowAuto | Verb::ReadRampEnabled => {
                ReplyShape::Flag
            },
            Verb::WriteSetpoint
            | Verb::WriteRampRate
            | Verb::WriteHeaterEnabled
            | Verb::WriteHeaterAuto
            | Verb::WriteHeaterOutput
            | Verb::WriteGasFlowSetpoint
            | Verb::WriteGasFlowAuto
            | Verb::WriteRampEnabled => ReplyShape::Ack,
            Verb::ReadAlarms => ReplyShape::Integer,
            Verb::ReadStatus => ReplyShape::Numbers {
                fields: STATUS_FIELDS,
            },
            Verb::ReadLimits => ReplyShape::Numbers {
                fields: LIMITS_FIELDS,
            },
        }
    }

    /// 是否会改变仪器状态
    pub fn is_write(self) -> bool {
        self.argument_kind() != ArgumentKind::None
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// 命令参数
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Argument {
    /// 数值（编码为两位小数）
    Number(f64),
    /// 开关量
    Flag(bool),
}

impl Argument {
    fn kind(&self) -> ArgumentKind {
        match self {
            Argument::Number(_) => ArgumentKind::Number,
            Argument::Flag(_) => ArgumentKind::Flag,
        }
    }
}

/// 一条命令（动词 + 可选参数）
///
/// 通过 [`Command::new`] 构造时会校验参数与动词匹配；
/// 便捷构造器（如 [`Command::write_setpoint`]）在类型上已保证匹配。
///
/// # 示例
///
/// ```rust
/// use cryo_protocol::{Command, Verb, encode};
///
/// let cmd = Command::write_setpoint(4.2);
/// assert_eq!(cmd.verb(), Verb::WriteSetpoint);
/// assert_eq!(encode(&cmd).unwrap(), b"SETP 4.20\r\n");
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Command {
    verb: Verb,
    argument: Option<Argument>,
}

impl Command {
    /// 通用构造器（校验参数类型）
    ///
    /// # 错误
    /// - `MissingArgument`: 写命令缺少参数
    /// - `InvalidArgument`: 参数类型不匹配、读命令携带参数或数值非有限
    pub fn new(verb: Verb, argument: Option<Argument>) -> Result<Self, ProtocolError> {
        match (verb.argument_kind(), argument) {
            (ArgumentKind::None, None) => Ok(Self { verb, argument }),
            (ArgumentKind::None, Some(arg)) => Err(ProtocolError::InvalidArgument {
                verb,
                argument: format!("{:?}", arg),
            }),
            (_, None) => Err(ProtocolError::MissingArgument { verb }),
            (_, Some(Argument::Number(value))) if !value.is_finite() => {
                Err(ProtocolError::InvalidArgument {
                    verb,
                    argument: value.to_string(),
                })
            },
            (kind, Some(arg)) if kind == arg.kind() => Ok(Self { verb, argument }),
            (_, Some(arg)) => Err(ProtocolError::InvalidArgument {
                verb,
                argument: format!("{:?}", arg),
            }),
        }
    }

    /// 读命令（无参数）
    ///
    /// 对写动词调用时参数缺失，由 `encode` 之前的 [`Command::new`] 负责拦截；
    /// 这里仅在调试构建中断言。
    pub fn read(verb: Verb) -> Self {
        debug_assert!(!verb.is_write(), "{} requires an argument", verb);
        Self {
            verb,
            argument: None,
        }
    }

    pub fn identify() -> Self {
        Self::read(Verb::Identify)
    }

    pub fn read_temperature() -> Self {
        Self::read(Verb::ReadTemperature)
    }

    pub fn read_setpoint() -> Self {
        Self::read(Verb::ReadSetpoint)
    }

    pub fn read_ramp_rate() -> Self {
        Self::read(Verb::ReadRampRate)
    }

    pub fn read_heater() -> Self {
        Self::read(Verb::ReadHeater)
    }

    pub fn read_alarms() -> Self {
        Self::read(Verb::ReadAlarms)
    }

    pub fn read_status() -> Self {
        Self::read(Verb::ReadStatus)
    }

    pub fn read_limits() -> Self {
        Self::read(Verb::ReadLimits)
    }

    /// 写入设定点
    ///
    /// **注意**：数值不做范围校验（协议层与单位无关），范围校验由会话层完成；
    /// 非有限值由 [`encode`](crate::encode) 拒绝。
    pub fn write_setpoint(value: f64) -> Self {
        Self {
            verb: Verb::WriteSetpoint,
            argument: Some(Argument::Number(value)),
        }
    }

    /// 写入升温速率
    pub fn write_ramp_rate(rate: f64) -> Self {
        Self {
            verb: Verb::WriteRampRate,
            argument: Some(Argument::Number(rate)),
        }
    }

    /// 使能/关闭加热器
    pub fn write_heater_enabled(enabled: bool) -> Self {
        Self {
            verb: Verb::WriteHeaterEnabled,
            argument: Some(Argument::Flag(enabled)),
        }
    }

    pub fn write_heater_auto(auto: bool) -> Self {
        Self {
            verb: Verb::WriteHeaterAuto,
            argument: Some(Argument::Flag(auto)),
        }
    }

    /// 手动加热输出（%）
    pub fn write_heater_output(percent: f64) -> Self {
        Self {
            verb: Verb::WriteHeaterOutput,
            argument: Some(Argument::Number(percent)),
        }
    }

    /// 手动气流设定（%）
    pub fn write_gas_flow_setpoint(percent: f64) -> Self {
        Self {
            verb: Verb::WriteGasFlowSetpoint,
            argument: Some(Argument::Number(percent)),
        }
    }

    pub fn write_gas_flow_auto(auto: bool) -> Self {
        Self {
            verb: Verb::WriteGasFlowAuto,
            argument: Some(Argument::Flag(auto)),
        }
    }

    pub fn write_ramp_enabled(enabled: bool) -> Self {
        Self {
            verb: Verb::WriteRampEnabled,
            argument: Some(Argument::Flag(enabled)),
        }
    }

    /// 获取动词
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// 获取参数
    pub fn argument(&self) -> Option<Argument> {
        self.argument
    }

    /// 获取数值参数（如有）
    pub fn number(&self) -> Option<f64> {
        match self.argument {
            Some(Argument::Number(value)) => Some(value),
            _ => None,
        }
    }

    /// 获取开关量参数（如有）
    pub fn flag(&self) -> Option<bool> {
        match self.argument {
            Some(Argument::Flag(flag)) => Some(flag),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonic_lookup_roundtrip() {
        for verb in Verb::ALL {
            assert_eq!(Verb::from_mnemonic(verb.mnemonic()), Some(verb));
        }
        assert_eq!(Verb::from_mnemonic("temp?"), Some(Verb::ReadTemperature));
        assert_eq!(Verb::from_mnemonic("FOO?"), None);
    }

    #[test]
    fn test_read_and_write_mnemonics_are_distinct() {
        assert_ne!(
            Verb::ReadSetpoint.mnemonic(),
            Verb::WriteSetpoint.mnemonic()
        );
        assert!(Verb::WriteSetpoint.is_write());
        assert!(!Verb::ReadSetpoint.is_write());
    }

    #[test]
    fn test_command_new_validates_argument() {
        assert!(Command::new(Verb::ReadTemperature, None).is_ok());
        assert!(Command::new(Verb::WriteSetpoint, Some(Argument::Number(1.0))).is_ok());

        assert_eq!(
            Command::new(Verb::WriteSetpoint, None),
            Err(ProtocolError::MissingArgument {
                verb: Verb::WriteSetpoint
            })
        );
        assert!(matches!(
            Command::new(Verb::ReadStatus, Some(Argument::Flag(true))),
            Err(ProtocolError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Command::new(Verb::WriteHeaterEnabled, Some(Argument::Number(1.0))),
            Err(ProtocolError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Command::new(Verb::WriteRampRate, Some(Argument::Number(f64::NAN))),
            Err(ProtocolError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_query_and_write_pairs_share_argument_kind() {
        let pairs = [
            (Verb::ReadHeaterAuto, Verb::WriteHeaterAuto),
            (Verb::ReadHeaterOutput, Verb::WriteHeaterOutput),
            (Verb::ReadGasFlowSetpoint, Verb::WriteGasFlowSetpoint),
            (Verb::ReadGasFlowAuto, Verb::WriteGasFlowAuto),
            (Verb::ReadRampEnabled, Verb::WriteRampEnabled),
            (Verb::ReadHeaterEnabled, Verb::WriteHeaterEnabled),
        ];
        for (read, write) in pairs {
            assert_eq!(format!("{}?", write.mnemonic()), read.mnemonic());
            assert!(!read.is_write());
            assert!(write.is_write());
            let expected = if read.reply_shape() == ReplyShape::Flag {
                ArgumentKind::Flag
            } else {
                ArgumentKind::Number
            };
            assert_eq!(write.argument_kind(), expected, "{}", write);
        }
        assert_eq!(Verb::ReadGasFlow.reply_shape(), ReplyShape::Number);
    }

    #[test]
    fn test_convenience_constructors() {
        let cmd = Command::write_ramp_rate(0.5);
        assert_eq!(cmd.verb(), Verb::WriteRampRate);
        assert_eq!(cmd.number(), Some(0.5));
        assert_eq!(cmd.flag(), None);

        let cmd = Command::write_heater_enabled(false);
        assert_eq!(cmd.flag(), Some(false));

        let cmd = Command::read_status();
        assert_eq!(cmd.argument(), None);

        assert_eq!(Command::write_gas_flow_setpoint(12.5).number(), Some(12.5));
        assert_eq!(Command::write_ramp_enabled(true).flag(), Some(true));
        assert_eq!(Command::write_heater_auto(false).verb(), Verb::WriteHeaterAuto);
    }
}
