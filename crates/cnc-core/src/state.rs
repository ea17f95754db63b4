//! 机床逻辑状态
//!
//! 状态只通过生成新快照推进（`Clone` 后修改副本），动作程序里保存的快照与调用方的
//! 活动状态互不共享。

use crate::error::ConfigError;
use crate::geometry::{CoordinateSystem, Plane};
use crate::math::Vector3;
use serde::{Deserialize, Serialize};

/// 可选坐标系数量
pub const COORDINATE_SYSTEM_COUNT: usize = 8;

/// 最近一次运动的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MoveType {
    #[default]
    FastLine,
    Line,
    ArcCw,
    ArcCcw,
}

/// 轴状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisState {
    /// 当前位置（物理单位，全局坐标）
    pub position: Vector3,
    /// 最近一次请求的目标位置，后续目标从这里推算；与 `position` 之差是取整残差
    pub target_position: Vector3,
    /// 当前圆弧平面
    pub plane: Plane,
    /// 当前进给
    pub feed: f64,
    /// 绝对/相对坐标模式
    pub absolute: bool,
    /// 当前坐标系下标
    pub coordinate_system_index: usize,
    pub coordinate_systems: [CoordinateSystem; COORDINATE_SYSTEM_COUNT],
    pub move_type: MoveType,
}

impl Default for AxisState {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            target_position: Vector3::zeros(),
            plane: Plane::XY,
            feed: 100.0,
            absolute: true,
            coordinate_system_index: 0,
            coordinate_systems: Default::default(),
            move_type: MoveType::default(),
        }
    }
}

impl AxisState {
    pub fn current_coordinate_system(&self) -> &CoordinateSystem {
        &self.coordinate_systems[self.coordinate_system_index]
    }

    /// 切换当前坐标系
    pub fn select_coordinate_system(&mut self, index: usize) -> Result<(), ConfigError> {
        if index >= COORDINATE_SYSTEM_COUNT {
            return Err(ConfigError::invalid(
                "coordinate_system",
                format!("index {} out of range 0..{}", index, COORDINATE_SYSTEM_COUNT),
            ));
        }
        self.coordinate_system_index = index;
        Ok(())
    }

    /// 丢弃目标与实际位置之间的残差
    pub fn forget_residual(&mut self) {
        self.target_position = self.position;
    }

    /// 位置与所有坐标系偏移清零
    pub fn reset(&mut self) {
        self.position = Vector3::zeros();
        self.target_position = Vector3::zeros();
        for cs in &mut self.coordinate_systems {
            cs.offset = Vector3::zeros();
        }
    }

    /// 全局坐标 -> 当前坐标系
    pub fn to_local(&self, global: &Vector3) -> Vector3 {
        self.current_coordinate_system().to_local(global)
    }
}

/// 主轴旋转状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpindleRotation {
    #[default]
    Off,
    Clockwise,
    CounterClockwise,
}

/// 主轴状态
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpindleState {
    pub rotation: SpindleRotation,
    pub speed: f64,
}

/// 钻孔循环参数
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DrillingState {
    pub retract_height: f64,
    pub peck_depth: f64,
}

/// 整机状态
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CncState {
    pub axis: AxisState,
    pub spindle: SpindleState,
    pub drilling: DrillingState,
}

impl CncState {
    /// 位置清零后的副本（set-zero 之后的状态）
    pub fn zeroed(&self) -> Self {
        let mut state = self.clone();
        state.axis.position = Vector3::zeros();
        state.axis.target_position = Vector3::zeros();
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_is_independent() {
        let mut state = CncState::default();
        state.axis.coordinate_systems[3].offset = Vector3::new(1.0, 2.0, 3.0);

        let snapshot = state.clone();
        state.axis.coordinate_systems[3].offset.x = 100.0;
        state.axis.position.z = -5.0;

        assert_eq!(snapshot.axis.coordinate_systems[3].offset, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(snapshot.axis.position, Vector3::zeros());
    }

    #[test]
    fn test_select_coordinate_system() {
        let mut axis = AxisState::default();
        axis.coordinate_systems[2].offset = Vector3::new(10.0, 0.0, 0.0);

        axis.select_coordinate_system(2).unwrap();
        assert_eq!(axis.to_local(&Vector3::new(15.0, 1.0, 0.0)), Vector3::new(5.0, 1.0, 0.0));
        assert!(axis.select_coordinate_system(COORDINATE_SYSTEM_COUNT).is_err());
    }

    #[test]
    fn test_forget_residual_and_reset() {
        let mut axis = AxisState::default();
        axis.position = Vector3::new(1.0, 2.0, 3.0);
        axis.forget_residual();
        assert_eq!(axis.target_position, axis.position);

        axis.coordinate_systems[1].offset = Vector3::new(4.0, 4.0, 4.0);
        axis.reset();
        assert_eq!(axis.position, Vector3::zeros());
        assert_eq!(axis.coordinate_systems[1].offset, Vector3::zeros());
    }
}
