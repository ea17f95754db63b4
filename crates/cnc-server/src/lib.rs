//! CNC 主机控制服务
//!
//! - `protocol`: 客户端消息（按行分隔的 JSON）
//! - `status`: 硬件状态轮询
//! - `executor`: 动作程序执行引擎
//! - `builder`: 程序文本 -> 动作程序
//! - `emulation`: 仿真实时子系统与寄存器总线
//! - `server`: 会话编排（命令接收、分发、坐标同步）

pub mod builder;
pub mod emulation;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod server;
pub mod status;

pub use builder::{BuiltProgram, ProgramBuilder, ScriptBuilder};
pub use emulation::{EmulationModbusSender, EmulationRtSender};
pub use error::{BuildError, ServerError};
pub use executor::{EventHandler, Machine, MachineEvent, MachineFactory, ProgramExecutor, RunState};
pub use protocol::{ClientCommand, ClientRequest, MessageReceiver, MessageSender, ServerMessage};
pub use server::{GCodeServer, SessionEnd};
pub use status::{StatusCallback, StatusMachine, StatusReport};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// 持锁线程 panic 后数据仍然可用（只有简单赋值），忽略中毒标记
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
