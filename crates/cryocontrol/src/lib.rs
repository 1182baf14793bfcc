//! cryocontrol - 低温温控仪控制引擎
//!
//! 通过行协议控制一台或多台温控仪：串口、TCP、GPIB 网关或进程内模拟器。
//!
//! # 架构设计
//!
//! 从底层到高层：
//!
//! - **协议层** (`protocol`): 命令编码、应答解析（`%.2f` 定点数、`ERR <code>`）
//! - **传输层** (`transport`): 半双工字节链路，按端口字符串自动识别类型
//! - **驱动层** (`driver`): 串行化的仪器会话、超时重试、状态缓存、轮询线程
//! - **客户端层** (`client`): 斜坡计划、监督状态机、安全联锁、会话 API
//!
//! # 快速开始
//!
//! ```rust
//! use cryocontrol::prelude::*;
//! use std::time::Duration;
//!
//! let session = open_session(InstrumentConfig::new("sim://bench")).unwrap();
//! session.add_interlock(Interlock::over_temperature(300.0)).unwrap();
//! session
//!     .start_ramp(RampPlan::single(10.0, 5.0, Duration::from_secs(60)).unwrap())
//!     .unwrap();
//! session.cancel();
//! session.close();
//! ```
//!
//! 只需要收发单条命令的用户可以使用驱动层：
//!
//! ```rust
//! use cryocontrol::driver::SessionBuilder;
//!
//! let instrument = SessionBuilder::new().port("sim://").open().unwrap();
//! let status = instrument.get_status().unwrap();
//! assert!(status.alarms.is_empty());
//! ```

pub use cryo_client as client;
pub use cryo_driver as driver;
pub use cryo_protocol as protocol;
pub use cryo_transport as transport;

pub mod prelude;

// 协议层 / 传输层错误
pub use cryo_protocol::ProtocolError;
pub use cryo_transport::TransportError;

// 驱动层
pub use cryo_driver::{
    AlarmFlags, DriverError, InstrumentConfig, InstrumentIdentity, InstrumentSession, Reading, RetryPolicy,
    SessionBuilder, SetpointRange, StateCache,
};

// 客户端层（推荐入口）
pub use cryo_client::{
    AbortReason, Action, ClientError, Condition, Interlock, RampPlan, RampStep, Session, SessionConfig,
    SupervisionError, SupervisorConfig, SupervisorState, SupervisorStatus, open_session, open_session_with,
};
