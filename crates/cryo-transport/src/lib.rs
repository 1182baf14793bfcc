//! # Cryo Transport Layer
//!
//! 字节级双工通道抽象：串口、TCP、GPIB 网关以及进程内模拟器。
//!
//! 传输层只是原始字节管道：
//! - 不了解协议内容（终止符由调用方传入）
//! - 不做任何重试（重试策略属于会话层）
//! - 每个实例独占底层 OS 资源，不可克隆，只能被一个会话持有

use std::time::Duration;
use thiserror::Error;

mod address;
mod framing;
pub mod gpib;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sim;
pub mod tcp;

pub use address::TransportAddress;
pub use gpib::GpibTransport;
#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use sim::{Fault, SimConfig, SimHandle, SimTransport};
pub use tcp::TcpTransport;

/// 单帧最大缓冲长度，超过仍未见终止符则认为链路失步
pub const MAX_LINE_LEN: usize = 4096;

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    /// 无法打开或维持连接（对会话致命，需重新打开）
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    /// 读超时（瞬态，可由上层重试）
    #[error("Read timeout")]
    Timeout,
    /// `close()` 之后的任何操作
    #[error("Transport closed")]
    Closed,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    /// 缓冲区中超过 `limit` 字节仍未出现终止符
    #[error("Line overflow: no terminator within {limit} bytes")]
    Overflow { limit: usize },
}

impl TransportError {
    /// 是否为瞬态错误（可重试）
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }

    /// 是否需要重新打开传输层才能恢复
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_)
                | TransportError::Io(_)
                | TransportError::Closed
                | TransportError::InvalidAddress(_)
        )
    }
}

/// 字节级传输通道
///
/// 所有方法都需要 `&mut self`：同一时刻只有一个调用者能操作底层句柄。
pub trait Transport: Send {
    /// 写入完整字节序列
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// 读取直到（并包含）`terminator`，最长阻塞 `timeout`
    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// 丢弃已到达但尚未读取的数据（重试前清除迟到的应答）
    fn discard_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// 关闭底层资源（幂等）
    fn close(&mut self);

    /// 是否已关闭
    fn is_closed(&self) -> bool;

    /// 用于日志的链路描述，如 `serial:/dev/ttyUSB0@9600`
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes)
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read_until(terminator, timeout)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        (**self).discard_input()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// 按地址打开传输通道
///
/// # 错误
/// - `TransportError::Connection`: 设备不存在、被占用或网络不可达
pub fn open(address: &TransportAddress, timeout: Duration) -> Result<Box<dyn Transport>, TransportError> {
    let transport: Box<dyn Transport> = match address {
        TransportAddress::Serial { path, baud } => open_serial(path, *baud, timeout)?,
        TransportAddress::Tcp { addr } => Box::new(TcpTransport::connect(addr, timeout)?),
        TransportAddress::Gpib { gateway, address } => {
            Box::new(GpibTransport::connect(gateway, *address, timeout)?)
        },
        TransportAddress::Sim { name } => Box::new(SimTransport::new(SimConfig {
            name: name.clone(),
            ..Default::default()
        })),
    };
    tracing::info!("Opened transport {}", transport.describe());
    Ok(transport)
}

#[cfg(feature = "serial")]
fn open_serial(path: &str, baud: u32, timeout: Duration) -> Result<Box<dyn Transport>, TransportError> {
    Ok(Box::new(SerialTransport::open(path, baud, timeout)?))
}

#[cfg(not(feature = "serial"))]
fn open_serial(path: &str, _baud: u32, _timeout: Duration) -> Result<Box<dyn Transport>, TransportError> {
    Err(TransportError::Connection(format!(
        "serial support disabled, cannot open {} (enable the `serial` feature)",
        path
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(!TransportError::Timeout.is_fatal());

        let io = TransportError::Io(std::io::Error::other("broken pipe"));
        assert!(io.is_fatal());
        assert!(!io.is_retryable());

        assert!(TransportError::Closed.is_fatal());
        assert!(!TransportError::Overflow { limit: 10 }.is_retryable());
    }

    #[test]
    fn test_open_sim_address() {
        let address = TransportAddress::parse("sim://", 9600).unwrap();
        let mut transport = open(&address, Duration::from_millis(50)).unwrap();
        assert!(transport.describe().starts_with("sim"));

        transport.write(b"TEMP?\r\n").unwrap();
        let reply = transport.read_until(b'\n', Duration::from_millis(50)).unwrap();
        assert!(reply.ends_with(b"\n"));

        transport.close();
        transport.close();
        assert!(transport.is_closed());
    }

    #[test]
    fn test_open_unreachable_tcp_fails_with_connection_error() {
        // 保留端口 0 不可连接
        let address = TransportAddress::parse("tcp://127.0.0.1:0", 0).unwrap();
        let err = open(&address, Duration::from_millis(50)).err().unwrap();
        assert!(matches!(err, TransportError::Connection(_)), "got {:?}", err);
    }
}
