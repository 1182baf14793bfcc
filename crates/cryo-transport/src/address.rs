//! 传输地址解析
//!
//! 配置中的 `port` 字段按前缀自动识别链路类型：
//!
//! | 形式                         | 链路                         |
//! |------------------------------|------------------------------|
//! | `sim://[name]`               | 进程内模拟器                 |
//! | `tcp://host:port`            | 原始 TCP（以太网-串口桥）     |
//! | `gpib://host[:port]/addr`    | Prologix 风格 GPIB-以太网网关 |
//! | 其他（`/dev/ttyUSB0`、`COM3`）| 串口                         |

use crate::TransportError;
use std::fmt;

/// Prologix 网关默认端口
pub const GPIB_GATEWAY_PORT: u16 = 1234;

/// 传输地址
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportAddress {
    Serial { path: String, baud: u32 },
    Tcp { addr: String },
    Gpib { gateway: String, address: u8 },
    Sim { name: String },
}

impl TransportAddress {
    /// 解析配置中的端口字符串
    ///
    /// `baud` 仅对串口有效。
    pub fn parse(port: &str, baud: u32) -> Result<Self, TransportError> {
        let port = port.trim();
        if port.is_empty() {
            return Err(TransportError::InvalidAddress("empty port".to_string()));
        }

        if let Some(name) = port.strip_prefix("sim://") {
            return Ok(TransportAddress::Sim {
                name: if name.is_empty() { "default".to_string() } else { name.to_string() },
            });
        }

        if let Some(rest) = port.strip_prefix("tcp://") {
            return Ok(TransportAddress::Tcp {
                addr: parse_host_port(rest, None, port)?,
            });
        }

        if let Some(rest) = port.strip_prefix("gpib://") {
            let (host, primary) = rest
                .rsplit_once('/')
                .ok_or_else(|| TransportError::InvalidAddress(format!("{}: missing GPIB address", port)))?;
            let address: u8 = primary
                .parse()
                .ok()
                .filter(|addr| *addr <= 30)
                .ok_or_else(|| TransportError::InvalidAddress(format!("{}: GPIB address must be 0..=30", port)))?;
            return Ok(TransportAddress::Gpib {
                gateway: parse_host_port(host, Some(GPIB_GATEWAY_PORT), port)?,
                address,
            });
        }

        if port.contains("://") {
            return Err(TransportError::InvalidAddress(format!("{}: unknown scheme", port)));
        }

        if baud == 0 {
            return Err(TransportError::InvalidAddress(format!("{}: baud rate must be non-zero", port)));
        }
        Ok(TransportAddress::Serial {
            path: port.to_string(),
            baud,
        })
    }

    /// 是否为模拟器地址
    pub fn is_sim(&self) -> bool {
        matches!(self, TransportAddress::Sim { .. })
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Serial { path, baud } => write!(f, "serial:{}@{}", path, baud),
            TransportAddress::Tcp { addr } => write!(f, "tcp://{}", addr),
            TransportAddress::Gpib { gateway, address } => write!(f, "gpib://{}/{}", gateway, address),
            TransportAddress::Sim { name } => write!(f, "sim://{}", name),
        }
    }
}

fn parse_host_port(text: &str, default_port: Option<u16>, original: &str) -> Result<String, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidAddress(format!("{}: {}", original, reason));

    match text.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(invalid("missing host"));
            }
            port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
            Ok(text.to_string())
        },
        None => {
            if text.is_empty() {
                return Err(invalid("missing host"));
            }
            let port = default_port.ok_or_else(|| invalid("missing port"))?;
            Ok(format!("{}:{}", text, port))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial() {
        assert_eq!(
            TransportAddress::parse("/dev/ttyUSB0", 9600).unwrap(),
            TransportAddress::Serial {
                path: "/dev/ttyUSB0".to_string(),
                baud: 9600
            }
        );
        assert!(matches!(
            TransportAddress::parse("COM3", 0),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            TransportAddress::parse("tcp://192.168.1.20:7777", 0).unwrap(),
            TransportAddress::Tcp {
                addr: "192.168.1.20:7777".to_string()
            }
        );
        assert!(TransportAddress::parse("tcp://192.168.1.20", 0).is_err());
        assert!(TransportAddress::parse("tcp://:7777", 0).is_err());
        assert!(TransportAddress::parse("tcp://host:99999", 0).is_err());
    }

    #[test]
    fn test_parse_gpib() {
        assert_eq!(
            TransportAddress::parse("gpib://10.0.0.5/12", 0).unwrap(),
            TransportAddress::Gpib {
                gateway: "10.0.0.5:1234".to_string(),
                address: 12
            }
        );
        assert_eq!(
            TransportAddress::parse("gpib://gw:5000/3", 0).unwrap(),
            TransportAddress::Gpib {
                gateway: "gw:5000".to_string(),
                address: 3
            }
        );
        assert!(TransportAddress::parse("gpib://10.0.0.5", 0).is_err());
        assert!(TransportAddress::parse("gpib://10.0.0.5/31", 0).is_err());
    }

    #[test]
    fn test_parse_sim_and_unknown() {
        assert!(TransportAddress::parse("sim://", 0).unwrap().is_sim());
        assert_eq!(
            TransportAddress::parse("sim://bench", 0).unwrap().to_string(),
            "sim://bench"
        );
        assert!(TransportAddress::parse("usb://x", 9600).is_err());
        assert!(TransportAddress::parse("   ", 9600).is_err());
    }
}
