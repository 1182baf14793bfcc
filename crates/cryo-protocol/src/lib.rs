//! # Cryo Protocol
//!
//! 低温温控仪行式请求/应答协议定义（无硬件依赖）
//!
//! ## 模块
//!
//! - `constants`: 终止符、数值精度等协议常量
//! - `command`: 命令动词与参数
//! - `reply`: 应答类型（值或设备拒绝）
//! - `codec`: 编码/解码（主机侧）与命令解析/应答编码（仪器侧）
//!
//! ## 帧格式
//!
//! ```text
//! 主机 → 仪器:  <MNEMONIC>[ <ARG>]\r\n      例如 "SETP 4.20\r\n"
//! 仪器 → 主机:  <REPLY>\n                   例如 "4.20\n"、"OK\n"、"ERR 3\n"
//! ```
//!
//! 数值字段统一使用两位小数文本（与固件 `%.2f` 一致），往返误差不超过
//! [`MAX_ROUND_TRIP_ERROR`]。开关量（参数和应答）一律是 `0` / `1`。
//!
//! 协议层与单位无关：只关心动词、参数和应答的形状，不关心"温度"或"加热功率"的含义。

pub mod codec;
pub mod command;
pub mod constants;
pub mod reply;

// 重新导出常用类型
pub use codec::{decode, encode, encode_reply, format_number, parse_command, parse_number};
pub use command::{Argument, ArgumentKind, Command, Verb};
pub use constants::*;
pub use reply::{DeviceFault, NumberFields, Payload, Reply, ReplyShape, Response};

use thiserror::Error;

/// 协议解析错误类型
///
/// 协议错误表示固件与编解码器不匹配，**不可重试**。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Truncated frame: no terminator after {len} bytes")]
    Truncated { len: usize },

    #[error("Frame too long: {len} bytes (max {max})")]
    FrameTooLong { len: usize, max: usize },

    #[error("Frame is not ASCII")]
    NotAscii,

    #[error("Empty reply")]
    Empty,

    #[error("Unexpected reply to {verb}: {reply:?}")]
    UnexpectedReply { verb: Verb, reply: String },

    #[error("Invalid number: {field:?}")]
    InvalidNumber { field: String },

    #[error("Invalid field count: expected {expected}, got {actual}")]
    FieldCount { expected: usize, actual: usize },

    #[error("Unknown command: {mnemonic:?}")]
    UnknownCommand { mnemonic: String },

    #[error("Missing argument for {verb}")]
    MissingArgument { verb: Verb },

    #[error("Invalid argument for {verb}: {argument}")]
    InvalidArgument { verb: Verb, argument: String },
}
