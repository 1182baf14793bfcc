//! 协议常量定义

/// 命令终止符（主机 → 仪器）
pub const COMMAND_TERMINATOR: &[u8] = b"\r\n";

/// 应答终止符（仪器 → 主机）
pub const REPLY_TERMINATOR: u8 = b'\n';

/// 数值字段小数位数（固件按 `%.2f` 解析/输出）
pub const NUMERIC_PRECISION: usize = 2;

/// 数值往返的最大绝对误差
///
/// 两位小数编码的舍入误差不超过末位的一半（0.005）。
pub const MAX_ROUND_TRIP_ERROR: f64 = 0.005;

/// 单帧最大长度（字节，含终止符）
///
/// 超过此长度仍未出现终止符的数据视为失步。
pub const MAX_FRAME_LEN: usize = 256;

/// 写命令的确认应答
pub const ACK: &str = "OK";

/// 设备拒绝应答前缀（`ERR <code>`）
pub const FAULT_PREFIX: &str = "ERR";

/// `STAT?` 应答字段数：温度、设定点、加热功率、升温速率、报警位
pub const STATUS_FIELDS: usize = 5;

/// `LIM?` 应答字段数：设定点下限、上限
pub const LIMITS_FIELDS: usize = 2;

/// `*IDN?` 应答字段数：厂商、型号、序列号、固件版本
pub const IDENTITY_FIELDS: usize = 4;

/// 手动加热输出 / 手动气流设定的上限（百分比，下限为 0）
pub const MAX_OUTPUT_PERCENT: f64 = 99.9;

/// `ALRM?` / `STAT?` 报警位定义
pub mod alarm {
    /// 传感器开路或读数无效
    pub const SENSOR_FAULT: u32 = 1 << 0;
    /// 温度超过仪器内部上限
    pub const OVER_TEMPERATURE: u32 = 1 << 1;
    /// 加热器开路
    pub const HEATER_OPEN: u32 = 1 << 2;
    /// 加热器短路
    pub const HEATER_SHORT: u32 = 1 << 3;
    /// 仪器内部斜坡进行中
    pub const RAMP_ACTIVE: u32 = 1 << 4;
}
