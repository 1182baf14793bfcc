//! 原始 TCP 传输（以太网-串口桥、仪器自带以太网口）

use crate::framing::{LineBuffer, read_line, timed_out_as_none};
use crate::{MAX_LINE_LEN, Transport, TransportError};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

/// TCP 传输
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: String,
    buffer: LineBuffer,
}

impl TcpTransport {
    /// 建立连接（`addr` 为 `host:port`）
    ///
    /// 依次尝试解析出的所有地址，`timeout` 作用于每次连接尝试。
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, TransportError> {
        let stream = connect_stream(addr, timeout)?;
        debug!("TCP connection to {} established", addr);
        Ok(Self {
            stream: Some(stream),
            peer: addr.to_string(),
            buffer: LineBuffer::new(MAX_LINE_LEN),
        })
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

pub(crate) fn connect_stream(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let candidates: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|e| TransportError::Connection(format!("{}: {}", addr, e)))?
        .collect();

    let mut last_error = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            },
            Err(e) => last_error = Some(e),
        }
    }

    Err(TransportError::Connection(match last_error {
        Some(e) => format!("{}: {}", addr, e),
        None => format!("{}: no address resolved", addr),
    }))
}

/// 从流中读取一行（TCP 与 GPIB 网关共用）
pub(crate) fn read_stream_line(
    stream: &mut TcpStream,
    buffer: &mut LineBuffer,
    terminator: u8,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    read_line(buffer, terminator, timeout, |chunk, remaining| {
        stream.set_read_timeout(Some(remaining))?;
        timed_out_as_none(stream.read(chunk))
    })
}

/// 丢弃内核缓冲区中已到达的数据
pub(crate) fn drain_stream(stream: &mut TcpStream, buffer: &mut LineBuffer) -> Result<(), TransportError> {
    buffer.clear();
    stream.set_nonblocking(true)?;
    let mut scratch = [0u8; 256];
    let result = loop {
        match stream.read(&mut scratch) {
            Ok(0) => break Err(TransportError::Connection("connection closed by peer".to_string())),
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(TransportError::Io(e)),
        }
    };
    stream.set_nonblocking(false)?;
    result
}

impl Transport for TcpTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        trace!("tcp tx {:?}", String::from_utf8_lossy(bytes));
        let stream = self.stream_mut()?;
        stream.write_all(bytes)?;
        Ok(())
    }

    fn read_until(&mut self, terminator: u8, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let line = read_stream_line(stream, &mut self.buffer, terminator, timeout)?;
        trace!("tcp rx {:?}", String::from_utf8_lossy(&line));
        Ok(line)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        drain_stream(stream, &mut self.buffer)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("TCP connection to {} closed", self.peer);
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
