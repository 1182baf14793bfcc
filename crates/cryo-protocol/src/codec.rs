//! 编解码模块
//!
//! 主机侧：[`encode`] 把命令编码为线上字节，[`decode`] 按命令期望的应答语法
//! 解析仪器应答，任何不符合语法的帧都会被立即拒绝（不会返回 0 或垃圾值）。
//!
//! 仪器侧：[`parse_command`] / [`encode_reply`] 供模拟器和测试替身使用。
//!
//! # 数值精度
//!
//! 数值按 `%.2f` 编码，舍入误差 ≤ [`MAX_ROUND_TRIP_ERROR`]（0.005）。
//! 超出 f64 有效精度的极大数值（|x| > 1e12 量级）误差由 f64 本身决定。

use crate::ProtocolError;
use crate::command::{Argument, ArgumentKind, Command, Verb};
use crate::constants::*;
use crate::reply::{DeviceFault, NumberFields, Payload, Reply, ReplyShape, Response};

/// 将命令编码为线上字节（含终止符）
///
/// # 错误
/// - `InvalidArgument`: 数值参数为 NaN 或无穷大（`%.2f` 会产生仪器无法解析的 `NaN` / `inf`）
pub fn encode(command: &Command) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(command.verb().mnemonic().as_bytes());
    match command.argument() {
        Some(Argument::Number(value)) => {
            if !value.is_finite() {
                return Err(ProtocolError::InvalidArgument {
                    verb: command.verb(),
                    argument: value.to_string(),
                });
            }
            out.push(b' ');
            out.extend_from_slice(format_number(value).as_bytes());
        },
        Some(Argument::Flag(enabled)) => {
            out.extend_from_slice(if enabled { b" 1" } else { b" 0" });
        },
        None => {},
    }
    out.extend_from_slice(COMMAND_TERMINATOR);
    Ok(out)
}

/// 解码仪器应答
///
/// `command` 是产生此应答的命令，用于确定期望的应答语法。
///
/// # 错误
/// - `Truncated`: 缺少终止符
/// - `FrameTooLong` / `NotAscii` / `Empty`: 帧本身不合法
/// - `UnexpectedReply` / `FieldCount` / `InvalidNumber`: 应答与命令期望的形状不符
pub fn decode(command: &Command, frame: &[u8]) -> Result<Response, ProtocolError> {
    let verb = command.verb();
    let text = frame_text(frame)?;

    if let Some(fault) = parse_fault(verb, text)? {
        return Ok(Response::new(verb, Payload::Fault(fault)));
    }

    let reply = match verb.reply_shape() {
        ReplyShape::Ack => {
            if text != ACK {
                return Err(unexpected(verb, text));
            }
            Reply::Ack
        },
        ReplyShape::Number => Reply::Number(parse_number(text).map_err(|_| unexpected(verb, text))?),
        ReplyShape::Integer => {
            if !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(unexpected(verb, text));
            }
            Reply::Integer(text.parse().map_err(|_| unexpected(verb, text))?)
        },
        ReplyShape::Flag => match text {
            "0" => Reply::Flag(false),
            "1" => Reply::Flag(true),
            _ => return Err(unexpected(verb, text)),
        },
        ReplyShape::Text { fields } => {
            let actual = text.split(',').count();
            if actual != fields {
                return Err(ProtocolError::FieldCount {
                    expected: fields,
                    actual,
                });
            }
            Reply::Text(text.to_string())
        },
        ReplyShape::Numbers { fields } => Reply::Numbers(parse_fields(text, fields)?),
    };

    Ok(Response::new(verb, Payload::Value(reply)))
}

/// 仪器侧：解析主机发来的命令帧
pub fn parse_command(frame: &[u8]) -> Result<Command, ProtocolError> {
    let text = frame_text(frame)?;
    let (mnemonic, rest) = match text.split_once(' ') {
        Some((mnemonic, rest)) => (mnemonic, rest.trim()),
        None => (text, ""),
    };

    let verb = Verb::from_mnemonic(mnemonic).ok_or_else(|| ProtocolError::UnknownCommand {
        mnemonic: mnemonic.to_string(),
    })?;

    let argument = match verb.argument_kind() {
        ArgumentKind::None => {
            if !rest.is_empty() {
                return Err(ProtocolError::InvalidArgument {
                    verb,
                    argument: rest.to_string(),
                });
            }
            None
        },
        _ if rest.is_empty() => return Err(ProtocolError::MissingArgument { verb }),
        ArgumentKind::Number => Some(Argument::Number(parse_number(rest)?)),
        ArgumentKind::Flag => match rest {
            "0" => Some(Argument::Flag(false)),
            "1" => Some(Argument::Flag(true)),
            other => {
                return Err(ProtocolError::InvalidArgument {
                    verb,
                    argument: other.to_string(),
                });
            },
        },
    };

    Command::new(verb, argument)
}

/// 仪器侧：编码应答（含终止符）
pub fn encode_reply(payload: &Payload) -> Vec<u8> {
    let mut text = match payload {
        Payload::Value(Reply::Ack) => ACK.to_string(),
        Payload::Value(Reply::Number(value)) => format_number(*value),
        Payload::Value(Reply::Integer(value)) => value.to_string(),
        Payload::Value(Reply::Flag(value)) => if *value { "1" } else { "0" }.to_string(),
        Payload::Value(Reply::Text(text)) => text.clone(),
        Payload::Value(Reply::Numbers(values)) => values
            .iter()
            .map(|value| format_number(*value))
            .collect::<Vec<_>>()
            .join(","),
        Payload::Fault(fault) => format!("{} {}", FAULT_PREFIX, fault.code),
    };
    text.push(REPLY_TERMINATOR as char);
    text.into_bytes()
}

/// 按固件精度格式化数值（`%.2f`）
pub fn format_number(value: f64) -> String {
    format!("{:.*}", NUMERIC_PRECISION, value)
}

/// 严格解析定点数字段
///
/// 只接受数字、符号、小数点和指数记号；`NaN`、`inf` 等一律拒绝。
pub fn parse_number(field: &str) -> Result<f64, ProtocolError> {
    let invalid = || ProtocolError::InvalidNumber {
        field: field.to_string(),
    };

    if field.is_empty()
        || !field
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'))
    {
        return Err(invalid());
    }

    let value: f64 = field.parse().map_err(|_| invalid())?;
    if !value.is_finite() {
        return Err(invalid());
    }
    Ok(value)
}

/// 校验帧格式并提取去除终止符和空白后的文本
fn frame_text(frame: &[u8]) -> Result<&str, ProtocolError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLong {
            len: frame.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let body = frame
        .strip_suffix(&[REPLY_TERMINATOR])
        .ok_or(ProtocolError::Truncated { len: frame.len() })?;

    if !body.is_ascii() {
        return Err(ProtocolError::NotAscii);
    }
    let text = std::str::from_utf8(body).map_err(|_| ProtocolError::NotAscii)?.trim();

    if text.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(text)
}

/// 识别 `ERR <code>` 设备拒绝
fn parse_fault(verb: Verb, text: &str) -> Result<Option<DeviceFault>, ProtocolError> {
    let Some(rest) = text.strip_prefix(FAULT_PREFIX) else {
        return Ok(None);
    };
    if !rest.is_empty() && !rest.starts_with(' ') {
        return Ok(None);
    }
    let code = rest.trim().parse::<u16>().map_err(|_| unexpected(verb, text))?;
    Ok(Some(DeviceFault { code }))
}

fn parse_fields(text: &str, expected: usize) -> Result<NumberFields, ProtocolError> {
    let actual = text.split(',').count();
    if actual != expected {
        return Err(ProtocolError::FieldCount { expected, actual });
    }
    text.split(',').map(|field| parse_number(field.trim())).collect()
}

fn unexpected(verb: Verb, text: &str) -> ProtocolError {
    ProtocolError::UnexpectedReply {
        verb,
        reply: text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use smallvec::smallvec;

    fn encoded(command: Command) -> Vec<u8> {
        encode(&command).unwrap()
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(encoded(Command::identify()), b"*IDN?\r\n");
        assert_eq!(encoded(Command::read_status()), b"STAT?\r\n");
        assert_eq!(encoded(Command::write_setpoint(4.2)), b"SETP 4.20\r\n");
        assert_eq!(encoded(Command::write_setpoint(-1.005)), b"SETP -1.00\r\n");
        assert_eq!(encoded(Command::write_ramp_rate(10.0)), b"RAMP 10.00\r\n");
        assert_eq!(encoded(Command::write_heater_enabled(true)), b"HTREN 1\r\n");
        assert_eq!(encoded(Command::write_heater_enabled(false)), b"HTREN 0\r\n");
        assert_eq!(encoded(Command::write_gas_flow_setpoint(12.5)), b"FLOWSP 12.50\r\n");
        assert_eq!(encoded(Command::write_heater_auto(true)), b"HTRAUTO 1\r\n");
        assert_eq!(encoded(Command::read(Verb::ReadRampEnabled)), b"RAMPEN?\r\n");
    }

    #[test]
    fn test_encode_rejects_non_finite_argument() {
        // 便捷构造器不校验，编码时必须拦截，不能把 `NaN` 发给仪器
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = encode(&Command::write_setpoint(value)).unwrap_err();
            assert!(
                matches!(
                    err,
                    ProtocolError::InvalidArgument {
                        verb: Verb::WriteSetpoint,
                        ..
                    }
                ),
                "{:?}",
                err
            );
        }
        assert!(encode(&Command::write_heater_output(f64::NAN)).is_err());
    }

    #[test]
    fn test_decode_flag() {
        let response = decode(&Command::read(Verb::ReadGasFlowAuto), b"1\n").unwrap();
        assert_eq!(response.into_result(), Ok(Reply::Flag(true)));
        let response = decode(&Command::read(Verb::ReadHeaterEnabled), b"0\n").unwrap();
        assert_eq!(response.into_result().unwrap().as_flag(), Some(false));

        let err = decode(&Command::read(Verb::ReadRampEnabled), b"2\n").unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedReply { .. }));
        let err = decode(&Command::read(Verb::ReadHeaterAuto), b"OK\n").unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedReply { .. }));
    }

    #[test]
    fn test_decode_number() {
        let response = decode(&Command::read_temperature(), b"4.23\n").unwrap();
        assert_eq!(response.verb(), Verb::ReadTemperature);
        assert_eq!(response.into_result(), Ok(Reply::Number(4.23)));

        // 兼容 CRLF
        let response = decode(&Command::read_setpoint(), b"77.00\r\n").unwrap();
        assert_eq!(response.into_result(), Ok(Reply::Number(77.0)));
    }

    #[test]
    fn test_decode_ack() {
        let response = decode(&Command::write_setpoint(1.0), b"OK\n").unwrap();
        assert_eq!(response.into_result(), Ok(Reply::Ack));
    }

    #[test]
    fn test_decode_status() {
        let response = decode(&Command::read_status(), b"4.20,5.00,12.50,1.00,0.00\n").unwrap();
        let expected: NumberFields = smallvec![4.2, 5.0, 12.5, 1.0, 0.0];
        assert_eq!(response.into_result(), Ok(Reply::Numbers(expected)));
    }

    #[test]
    fn test_decode_identity() {
        let response = decode(&Command::identify(), b"ACME,CRYO-336,SN1234,1.4.2\n").unwrap();
        assert_eq!(
            response.into_result().unwrap().as_text(),
            Some("ACME,CRYO-336,SN1234,1.4.2")
        );
    }

    #[test]
    fn test_decode_alarms() {
        let response = decode(&Command::read_alarms(), b"5\n").unwrap();
        assert_eq!(response.into_result(), Ok(Reply::Integer(5)));

        let err = decode(&Command::read_alarms(), b"-5\n").unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedReply { .. }));
    }

    #[test]
    fn test_decode_device_fault() {
        let response = decode(&Command::write_setpoint(999.0), b"ERR 3\n").unwrap();
        assert!(response.is_fault());
        assert_eq!(response.into_result(), Err(DeviceFault { code: 3 }));

        let err = decode(&Command::write_setpoint(1.0), b"ERR x\n").unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedReply { .. }));
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let err = decode(&Command::read_temperature(), b"4.2").unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { len: 3 });
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        // 写命令的应答交给读命令
        let err = decode(&Command::read_temperature(), b"OK\n").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedReply {
                verb: Verb::ReadTemperature,
                ..
            }
        ));

        // 读命令的应答交给写命令
        let err = decode(&Command::write_setpoint(4.0), b"4.00\n").unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedReply { .. }));

        // 字段数不符
        let err = decode(&Command::read_status(), b"4.20,5.00\n").unwrap_err();
        assert_eq!(
            err,
            ProtocolError::FieldCount {
                expected: 5,
                actual: 2
            }
        );

        // 字段内容非法
        let err = decode(&Command::read_limits(), b"0.00,abc\n").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidNumber { .. }));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            decode(&Command::read_temperature(), b"\n").unwrap_err(),
            ProtocolError::Empty
        );
        assert_eq!(
            decode(&Command::read_temperature(), &[0xFF, 0xFE, b'\n']).unwrap_err(),
            ProtocolError::NotAscii
        );
        assert!(matches!(
            decode(&Command::read_temperature(), b"NaN\n").unwrap_err(),
            ProtocolError::UnexpectedReply { .. }
        ));

        let long = vec![b'1'; MAX_FRAME_LEN + 1];
        assert!(matches!(
            decode(&Command::read_temperature(), &long).unwrap_err(),
            ProtocolError::FrameTooLong { .. }
        ));
    }

    #[test]
    fn test_parse_command() {
        let cmd = parse_command(b"SETP 4.20\r\n").unwrap();
        assert_eq!(cmd.verb(), Verb::WriteSetpoint);
        assert_eq!(cmd.number(), Some(4.2));

        let cmd = parse_command(b"htren 1\r\n").unwrap();
        assert_eq!(cmd.flag(), Some(true));

        assert!(matches!(
            parse_command(b"FOO\r\n"),
            Err(ProtocolError::UnknownCommand { .. })
        ));
        assert!(matches!(
            parse_command(b"SETP\r\n"),
            Err(ProtocolError::MissingArgument { .. })
        ));
        assert!(matches!(
            parse_command(b"HTREN 2\r\n"),
            Err(ProtocolError::InvalidArgument { .. })
        ));
        assert!(matches!(
            parse_command(b"TEMP? 1\r\n"),
            Err(ProtocolError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_encode_reply() {
        assert_eq!(encode_reply(&Payload::Value(Reply::Ack)), b"OK\n");
        assert_eq!(encode_reply(&Payload::Value(Reply::Number(4.2))), b"4.20\n");
        assert_eq!(encode_reply(&Payload::Value(Reply::Integer(9))), b"9\n");
        assert_eq!(encode_reply(&Payload::Value(Reply::Flag(true))), b"1\n");
        assert_eq!(
            encode_reply(&Payload::Value(Reply::Numbers(smallvec![1.0, 2.5]))),
            b"1.00,2.50\n"
        );
        assert_eq!(encode_reply(&Payload::Fault(DeviceFault { code: 2 })), b"ERR 2\n");
    }

    #[test]
    fn test_parse_number_strictness() {
        assert_eq!(parse_number("-0.50"), Ok(-0.5));
        assert_eq!(parse_number("1e2"), Ok(100.0));
        assert!(parse_number("").is_err());
        assert!(parse_number("inf").is_err());
        assert!(parse_number("1.0K").is_err());
        assert!(parse_number("1,0").is_err());
    }

    proptest! {
        #[test]
        fn prop_argument_round_trip_within_precision(value in -1.0e6f64..1.0e6f64) {
            let frame = encode(&Command::write_setpoint(value)).unwrap();
            let parsed = parse_command(&frame).unwrap();
            let decoded = parsed.number().unwrap();
            prop_assert!((decoded - value).abs() <= MAX_ROUND_TRIP_ERROR + 1e-9);
        }

        #[test]
        fn prop_reply_round_trip_within_precision(value in -1.0e6f64..1.0e6f64) {
            let frame = encode_reply(&Payload::Value(Reply::Number(value)));
            let response = decode(&Command::read_temperature(), &frame).unwrap();
            let decoded = response.into_result().unwrap().as_number().unwrap();
            prop_assert!((decoded - value).abs() <= MAX_ROUND_TRIP_ERROR + 1e-9);
        }
    }
}
