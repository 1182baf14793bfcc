//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use cryocontrol::prelude::*;
//! ```

// 客户端层
pub use crate::client::{
    Action, Condition, Interlock, RampPlan, RampStep, Session, SessionConfig, SupervisorConfig, SupervisorState,
    open_session, open_session_with,
};

// 驱动层
pub use crate::driver::{AlarmFlags, InstrumentConfig, Reading, RetryPolicy};

// 错误类型
pub use crate::client::ClientError;
pub use crate::driver::DriverError;
pub use crate::protocol::ProtocolError;
pub use crate::transport::TransportError;
