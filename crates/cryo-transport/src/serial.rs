//! 串口传输（8N1，无流控）

use crate::framing::{LineBuffer, read_line, timed_out_as_none};
use crate::{MAX_LINE_LEN, Transport, TransportError};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 串口传输
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    path: String,
    baud: u32,
    buffer: LineBuffer,
}

impl SerialTransport {
    /// 打开串口
    ///
    /// # 错误
    /// - `TransportError::Connection`: 设备不存在、权限不足或被其他进程占用
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| TransportError::Connection(format!("{}: {}", path, e)))?;

        debug!("Serial port {} opened at {} baud", path, baud);
        Ok(Self {
            port: Some(port),
            path: path.to_string(),
            baud,
            buffer: LineBuffer::new(MAX_LINE_LEN),
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        trace!("serial tx {:?}", String::from_utf8_lossy(bytes));
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        let line = read_line(&mut self.buffer, terminator, timeout, |chunk, remaining| {
            port.set_timeout(remaining)
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            // 串口 read 返回 0 表示本次超时而非对端关闭
            match timed_out_as_none(port.read(chunk))? {
                Some(0) => Ok(None),
                other => Ok(other),
            }
        })?;
        trace!("serial rx {:?}", String::from_utf8_lossy(&line));
        Ok(line)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.buffer.clear();
        let port = self.port_mut()?;
        port.clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush() {
                warn!("Failed to flush {} on close: {}", self.path, e);
            }
            debug!("Serial port {} closed", self.path);
        }
    }

    fn is_closed(&self) -> bool {
        self.port.is_none()
    }

    fn describe(&self) -> String {
        format!("serial:{}@{}", self.path, self.baud)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
