//! 应答类型定义
//!
//! 每个 [`Response`] 与产生它的命令一一对应：要么携带类型化的值，
//! 要么携带设备拒绝原因（`ERR <code>`）。

use crate::command::Verb;
use smallvec::SmallVec;

/// 应答形状（由动词决定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// `OK`
    Ack,
    /// 单个定点数
    Number,
    /// 无符号整数（报警位）
    Integer,
    /// `0` / `1`
    Flag,
    /// 逗号分隔的文本字段
    Text { fields: usize },
    /// 逗号分隔的定点数
    Numbers { fields: usize },
}

/// 数值字段缓冲区
///
/// 最长的数值应答是 `STAT?`（5 个字段），栈上预留 5 个位置避免堆分配。
pub type NumberFields = SmallVec<[f64; 5]>;

/// 类型化的应答值
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Reply {
    Ack,
    Number(f64),
    Integer(u32),
    Flag(bool),
    Text(String),
    Numbers(NumberFields),
}

impl Reply {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Reply::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<u32> {
        match self {
            Reply::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Reply::Flag(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Reply::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_numbers(&self) -> Option<&[f64]> {
        match self {
            Reply::Numbers(values) => Some(values),
            _ => None,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Ack)
    }

    /// 该值是否符合给定形状
    pub fn matches(&self, shape: ReplyShape) -> bool {
        match (self, shape) {
            (Reply::Ack, ReplyShape::Ack) => true,
            (Reply::Number(_), ReplyShape::Number) => true,
            (Reply::Integer(_), ReplyShape::Integer) => true,
            (Reply::Flag(_), ReplyShape::Flag) => true,
            (Reply::Text(text), ReplyShape::Text { fields }) => text.split(',').count() == fields,
            (Reply::Numbers(values), ReplyShape::Numbers { fields }) => values.len() == fields,
            _ => false,
        }
    }
}

/// 设备拒绝（仪器返回 `ERR <code>`）
///
/// 这是仪器对一条格式正确的命令给出的"失败原因"，不是协议错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceFault {
    pub code: u16,
}

impl std::fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device fault code {}", self.code)
    }
}

/// 应答负载
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Payload {
    Value(Reply),
    Fault(DeviceFault),
}

/// 解码后的应答（与产生它的命令绑定）
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    verb: Verb,
    payload: Payload,
}

impl Response {
    pub fn new(verb: Verb, payload: Payload) -> Self {
        Self { verb, payload }
    }

    /// 产生此应答的命令动词
    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// 是否为设备拒绝
    pub fn is_fault(&self) -> bool {
        matches!(self.payload, Payload::Fault(_))
    }

    /// 转换为 `Result`：值或设备拒绝
    pub fn into_result(self) -> Result<Reply, DeviceFault> {
        match self.payload {
            Payload::Value(reply) => Ok(reply),
            Payload::Fault(fault) => Err(fault),
        }
    }
}
