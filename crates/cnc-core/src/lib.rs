//! CNC 主机控制核心
//!
//! 把几何运动请求编译为实时运动子系统可执行的步进指令，并按顺序记录为动作程序。
//!
//! # 架构设计
//!
//! - `geometry`: 平面投影、坐标系变换
//! - `command`: 直线/圆弧运动指令编译器与控制指令
//! - `program`: 动作程序（动作 + 执行前后状态快照），回零与探测宏
//! - `transport`: 实时子系统与寄存器外设的传输接口
//!
//! # 示例
//!
//! ```rust
//! use std::sync::Arc;
//! use cnc_core::prelude::*;
//!
//! let config = Arc::new(MachineParameters::default());
//! let mut program = ActionProgram::new(config);
//!
//! let state = CncState::default();
//! let state = program.add_line_movement(Vector3::new(10.0, 0.0, 0.0), 300.0, &state);
//!
//! assert_eq!(program.len(), 1);
//! assert!((state.axis.position.x - 10.0).abs() < 1e-9);
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod geometry;
pub mod math;
pub mod program;
pub mod state;
pub mod transport;

pub use error::{CompileError, ConfigError, TransportError};

pub mod prelude {
    //! 常用类型的便捷导入
    pub use crate::command::{
        ArcMoveCommand, CompiledMove, LineMoveCommand, MovementOptions, RtCommand,
    };
    pub use crate::config::{AxisParameters, MachineParameters};
    pub use crate::error::{CompileError, ConfigError, TransportError};
    pub use crate::geometry::{Axis, CoordinateSystem, Plane};
    pub use crate::math::{PlanarExt, Vector2, Vector3, EPSILON};
    pub use crate::program::{Action, ActionId, ActionProgram, ControlCommand, ProgramEntry};
    pub use crate::state::{AxisState, CncState, MoveType, SpindleRotation, SpindleState};
    pub use crate::transport::{
        Endstops, ModbusRegister, ModbusSender, ModbusToolCommand, RtResponse, RtSender,
    };
}
