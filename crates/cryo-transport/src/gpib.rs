//! GPIB 传输（Prologix 风格 GPIB-以太网网关）
//!
//! 网关以 `++` 开头的行作为自身配置命令，其余行转发给当前寻址的仪器。
//! 转发数据中的 `CR`、`LF`、`ESC`、`+` 需要用 `ESC` 转义；
//! 网关按 `++eos 0` 在转发时自动追加 `CR LF`。

use crate::framing::LineBuffer;
use crate::tcp::{connect_stream, drain_stream, read_stream_line};
use crate::{MAX_LINE_LEN, Transport, TransportError};
use cryo_protocol::COMMAND_TERMINATOR;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::{debug, trace};

const ESC: u8 = 0x1B;

/// GPIB 网关传输
pub struct GpibTransport {
    stream: Option<TcpStream>,
    gateway: String,
    address: u8,
    buffer: LineBuffer,
}

impl GpibTransport {
    /// 连接网关并寻址仪器
    pub fn connect(gateway: &str, address: u8, timeout: Duration) -> Result<Self, TransportError> {
        let mut stream = connect_stream(gateway, timeout)?;

        for line in setup_commands(address, timeout) {
            stream.write_all(line.as_bytes())?;
        }
        debug!("GPIB gateway {} configured for address {}", gateway, address);

        Ok(Self {
            stream: Some(stream),
            gateway: gateway.to_string(),
            address,
            buffer: LineBuffer::new(MAX_LINE_LEN),
        })
    }
}

/// 网关初始化命令
///
/// 控制器模式、寻址、写后自动读、转发时追加 CR LF、读超时。
fn setup_commands(address: u8, timeout: Duration) -> Vec<String> {
    let read_timeout_ms = timeout.as_millis().clamp(1, 3000);
    vec![
        "++mode 1\n".to_string(),
        format!("++addr {}\n", address),
        "++auto 1\n".to_string(),
        "++eos 0\n".to_string(),
        format!("++read_tmo_ms {}\n", read_timeout_ms),
    ]
}

/// 转义转发数据并以网关行终止符结尾
fn escape_payload(bytes: &[u8]) -> Vec<u8> {
    let body = bytes.strip_suffix(COMMAND_TERMINATOR).unwrap_or(bytes);
    let mut out = Vec::with_capacity(body.len() + 2);
    for &b in body {
        if matches!(b, b'\r' | b'\n' | ESC | b'+') {
            out.push(ESC);
        }
        out.push(b);
    }
    out.push(b'\n');
    out
}

impl Transport for GpibTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let framed = escape_payload(bytes);
        trace!("gpib tx {:?}", String::from_utf8_lossy(&framed));
        stream.write_all(&framed)?;
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let line = read_stream_line(stream, &mut self.buffer, terminator, timeout)?;
        trace!("gpib rx {:?}", String::from_utf8_lossy(&line));
        Ok(line)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        drain_stream(stream, &mut self.buffer)
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            // 交还前面板控制
            let _ = stream.write_all(b"++loc\n");
            let _ = stream.shutdown(Shutdown::Both);
            debug!("GPIB gateway {} closed", self.gateway);
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn describe(&self) -> String {
        format!("gpib://{}/{}", self.gateway, self.address)
    }
}

impl Drop for GpibTransport {
    fn drop(&mut self) {
        self.close();
    }
}
