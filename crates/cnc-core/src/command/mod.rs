//! 实时子系统指令
//!
//! 运动指令（直线/圆弧）在构造时完成全部几何计算和步数量化，之后只读；
//! 控制指令是固定的文本操作码。

mod arc;
mod line;

pub use arc::{hardware_ccw, ArcMoveCommand};
pub use line::LineMoveCommand;

use crate::math::Vector3;
use serde::{Deserialize, Serialize};

/// 运动参数（编译输入，不属于机床状态）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MovementOptions {
    /// 请求进给（已按轴限制截断）
    pub feed: f64,
    /// 该运动允许的最大进给
    pub max_feed: f64,
    /// 运动前延时
    pub delay: f64,
    /// 加速度
    pub acceleration: f64,
}

impl MovementOptions {
    pub fn new(feed: f64, max_feed: f64, delay: f64, acceleration: f64) -> Self {
        Self {
            feed,
            max_feed,
            delay,
            acceleration,
        }
    }

    /// 以固定进给运行（回零/探测宏使用）
    pub fn constant(feed: f64, acceleration: f64) -> Self {
        Self::new(feed, feed, 0.0, acceleration)
    }

    pub fn command(&self) -> String {
        format!(
            "F{:.3}P{:.3}L{:.3}T{:.3}",
            self.feed, self.max_feed, self.delay, self.acceleration
        )
    }
}

/// 编译后的运动指令
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledMove {
    Line(LineMoveCommand),
    Arc(ArcMoveCommand),
}

impl CompiledMove {
    pub fn command(&self) -> String {
        match self {
            CompiledMove::Line(line) => line.command(),
            CompiledMove::Arc(arc) => arc.command(),
        }
    }

    /// 步数量化后硬件实际会走的位移
    pub fn physical_delta(&self) -> Vector3 {
        match self {
            CompiledMove::Line(line) => line.physical_delta,
            CompiledMove::Arc(arc) => arc.physical_delta,
        }
    }

    pub fn options(&self) -> &MovementOptions {
        match self {
            CompiledMove::Line(line) => &line.options,
            CompiledMove::Arc(arc) => &arc.options,
        }
    }
}

/// 实时子系统指令
#[derive(Debug, Clone, PartialEq)]
pub enum RtCommand {
    Move(CompiledMove),
    /// 电机锁定/释放
    Lock(bool),
    /// 当前位置设为原点
    SetZero,
    /// 探针触发时中断运动
    BreakOnProbe(bool),
    /// 限位开关触发时报错
    FailOnLimit(bool),
    GetPosition,
    GetEndstops,
    Tool { tool: u32, enabled: bool },
    /// 原样发送
    Raw(String),
}

impl RtCommand {
    pub fn command(&self) -> String {
        match self {
            RtCommand::Move(mv) => mv.command(),
            RtCommand::Lock(true) => "M17".to_string(),
            RtCommand::Lock(false) => "M18".to_string(),
            RtCommand::SetZero => "G92".to_string(),
            RtCommand::BreakOnProbe(true) => "M120".to_string(),
            RtCommand::BreakOnProbe(false) => "M121".to_string(),
            RtCommand::FailOnLimit(true) => "M122".to_string(),
            RtCommand::FailOnLimit(false) => "M123".to_string(),
            RtCommand::GetPosition => "M114".to_string(),
            RtCommand::GetEndstops => "M119".to_string(),
            RtCommand::Tool { tool, enabled: true } => format!("M3 T{}", tool),
            RtCommand::Tool { tool, enabled: false } => format!("M5 T{}", tool),
            RtCommand::Raw(text) => text.clone(),
        }
    }
}

impl From<LineMoveCommand> for RtCommand {
    fn from(line: LineMoveCommand) -> Self {
        RtCommand::Move(CompiledMove::Line(line))
    }
}

impl From<ArcMoveCommand> for RtCommand {
    fn from(arc: ArcMoveCommand) -> Self {
        RtCommand::Move(CompiledMove::Arc(arc))
    }
}
