//! 客户端接口模块
//!
//! 本模块提供温控仪的用户级接口，包括：
//! - 会话（[`open_session`]：仪器会话 + 轮询线程 + 监督线程）
//! - 斜坡计划（多步升/降温，到达后保持）
//! - 监督状态机（`Idle → Ramping → Holding → Complete`，可中止）
//! - 安全联锁（条件 + 动作 + 冷却期）
//!
//! # 使用场景
//!
//! 这是大多数用户应该使用的模块。如果只需要收发单条命令、自行安排轮询，
//! 可以直接使用 `cryo-driver` 的 `InstrumentSession`。

mod error;
pub mod interlock;
pub mod ramp;
mod session;
pub mod supervisor;

pub use error::{AbortReason, ClientError, SupervisionError};
pub use interlock::{Action, Condition, Interlock};
pub use ramp::{RampPlan, RampStep};
pub use session::{Session, SessionConfig, open_session, open_session_with};
pub use supervisor::{
    ControlPort, Supervisor, SupervisorConfig, SupervisorHandle, SupervisorState, SupervisorStatus,
};
