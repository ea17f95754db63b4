//! 直线运动指令

use super::MovementOptions;
use crate::config::MachineParameters;
use crate::math::Vector3;

/// 直线运动
#[derive(Debug, Clone, PartialEq)]
pub struct LineMoveCommand {
    /// 请求的位移
    pub delta: Vector3,
    /// 每轴硬件步数
    pub steps: [i64; 3],
    /// 步数量化后可实现的位移
    pub physical_delta: Vector3,
    pub options: MovementOptions,
}

impl LineMoveCommand {
    pub fn new(delta: Vector3, options: MovementOptions, config: &MachineParameters) -> Self {
        let steps = config.to_steps(&delta);
        let physical_delta = config.from_steps(&steps);
        Self {
            delta,
            steps,
            physical_delta,
            options,
        }
    }

    pub fn command(&self) -> String {
        let [dx, dy, dz] = self.steps;
        format!("G1 {} X{}Y{}Z{}", self.options.command(), dx, dy, dz)
    }
}
