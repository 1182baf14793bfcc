//! 行缓冲与带截止时间的读取循环
//!
//! 串口和 TCP 都可能把一行拆成多次到达，也可能一次带来多行；
//! [`LineBuffer`] 保存尚未消费的字节，[`read_line`] 在截止时间前反复填充。

use crate::TransportError;
use bytes::{Buf, BytesMut};
use std::time::{Duration, Instant};

const CHUNK_SIZE: usize = 256;

/// 尚未消费的接收字节
#[derive(Debug)]
pub(crate) struct LineBuffer {
    buf: BytesMut,
    limit: usize,
}

impl LineBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(CHUNK_SIZE),
            limit,
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// 取出第一行（含终止符）
    ///
    /// 缓冲区超过上限仍无终止符时清空并返回 `Overflow`。
    pub(crate) fn take_line(&mut self, terminator: u8) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(pos) = self.buf.iter().position(|b| *b == terminator) {
            let line = self.buf.split_to(pos + 1);
            return Ok(Some(line.to_vec()));
        }
        if self.buf.len() > self.limit {
            let limit = self.limit;
            self.buf.advance(self.buf.len());
            return Err(TransportError::Overflow { limit });
        }
        Ok(None)
    }
}

/// 在 `timeout` 内读取一行
///
/// `fill` 每次最多阻塞给定的剩余时间：
/// - `Ok(None)`: 本次无数据（底层超时）
/// - `Ok(Some(0))`: 对端关闭
/// - `Ok(Some(n))`: 读到 `n` 字节
pub(crate) fn read_line<F>(
    buffer: &mut LineBuffer,
    terminator: u8,
    timeout: Duration,
    mut fill: F,
) -> Result<Vec<u8>, TransportError>
where
    F: FnMut(&mut [u8], Duration) -> Result<Option<usize>, TransportError>,
{
    if let Some(line) = buffer.take_line(terminator)? {
        return Ok(line);
    }

    let deadline = Instant::now() + timeout;
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout);
        }

        match fill(&mut chunk, remaining)? {
            None => continue,
            Some(0) => {
                return Err(TransportError::Connection("connection closed by peer".to_string()));
            },
            Some(n) => {
                buffer.extend(&chunk[..n]);
                if let Some(line) = buffer.take_line(terminator)? {
                    return Ok(line);
                }
            },
        }
    }
}

/// 把 `io::ErrorKind::TimedOut` / `WouldBlock` 归一化为"本次无数据"
pub(crate) fn timed_out_as_none(result: std::io::Result<usize>) -> Result<Option<usize>, TransportError> {
    match result {
        Ok(n) => Ok(Some(n)),
        Err(e) if matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock) => {
            Ok(None)
        },
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(TransportError::Io(e)),
    }
}
