//! 驱动层模块
//!
//! 本模块提供单台温控仪的会话管理，包括：
//! - 会话（`*IDN?` 身份、设定点范围、串行化的请求/应答、超时重试）
//! - 状态缓存（ArcSwap 无锁读取，单写多读）
//! - 轮询线程（周期 `STAT?`，失败保留旧读数）
//! - 会话指标（原子计数器）
//!
//! # 使用场景
//!
//! 适用于需要直接发命令、自行安排轮询的场景。
//! 需要斜坡监督和联锁的用户应该使用 `cryo-client` 提供的 `Session`。

mod builder;
pub mod cache;
pub mod clock;
mod config;
mod error;
pub mod metrics;
pub mod poller;
pub mod reading;
mod session;

pub use builder::SessionBuilder;
pub use cache::{CacheHealth, CacheWriter, StateCache};
pub use clock::{JoinTimeout, monotonic_micros};
pub use config::{InstrumentConfig, RetryPolicy, SetpointRange};
pub use error::DriverError;
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use poller::{DEFAULT_POLL_INTERVAL, Poller};
pub use reading::{AlarmFlags, Reading, Status};
pub use session::{InstrumentIdentity, InstrumentSession};
