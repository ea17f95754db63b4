//! 平面与坐标系
//!
//! 圆弧平面由一张 平面 -> 轴排列 表描述：
//! - XY: (x, y, z)
//! - YZ: (y, z, x)
//! - ZX: (z, x, y)
//!
//! 前两个轴构成圆弧平面，第三个轴是"高度"（螺旋插补方向）。

use crate::error::ConfigError;
use crate::math::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 机床轴
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// 向量分量下标
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn from_index(index: usize) -> Result<Self, ConfigError> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or_else(|| ConfigError::UnknownAxis(index.to_string()))
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        }
    }
}

impl FromStr for Axis {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Axis::X),
            "Y" => Ok(Axis::Y),
            "Z" => Ok(Axis::Z),
            other => Err(ConfigError::UnknownAxis(other.to_string())),
        }
    }
}

/// 圆弧平面
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Plane {
    #[default]
    XY,
    YZ,
    ZX,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::XY, Plane::YZ, Plane::ZX];

    /// 轴排列：`[平面第一轴, 平面第二轴, 高度轴]`
    pub fn axes(self) -> [Axis; 3] {
        match self {
            Plane::XY => [Axis::X, Axis::Y, Axis::Z],
            Plane::YZ => [Axis::Y, Axis::Z, Axis::X],
            Plane::ZX => [Axis::Z, Axis::X, Axis::Y],
        }
    }

    /// 高度轴
    pub fn normal_axis(self) -> Axis {
        self.axes()[2]
    }

    /// 把三维向量分解为平面分量和高度分量
    pub fn project(self, v: &Vector3) -> (Vector2, f64) {
        let [a, b, h] = self.axes();
        (Vector2::new(v[a.index()], v[b.index()]), v[h.index()])
    }

    /// `project` 的逆变换
    pub fn unproject(self, in_plane: &Vector2, height: f64) -> Vector3 {
        let [a, b, h] = self.axes();
        let mut v = Vector3::zeros();
        v[a.index()] = in_plane.x;
        v[b.index()] = in_plane.y;
        v[h.index()] = height;
        v
    }

    /// 实时子系统的平面选择指令
    pub fn opcode(self) -> &'static str {
        match self {
            Plane::XY => "G17",
            Plane::YZ => "G18",
            Plane::ZX => "G19",
        }
    }

    pub fn from_index(index: usize) -> Result<Self, ConfigError> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or_else(|| ConfigError::UnknownPlane(index.to_string()))
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Plane::XY => "XY",
            Plane::YZ => "YZ",
            Plane::ZX => "ZX",
        };
        f.write_str(name)
    }
}

impl FromStr for Plane {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "XY" | "G17" => Ok(Plane::XY),
            "YZ" | "G18" => Ok(Plane::YZ),
            "ZX" | "XZ" | "G19" => Ok(Plane::ZX),
            other => Err(ConfigError::UnknownPlane(other.to_string())),
        }
    }
}

/// 坐标系：`global = local * sign + offset`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSystem {
    pub offset: Vector3,
    /// 每轴方向，取值 ±1
    pub sign: Vector3,
}

impl Default for CoordinateSystem {
    fn default() -> Self {
        Self {
            offset: Vector3::zeros(),
            sign: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

impl CoordinateSystem {
    pub fn new(offset: Vector3, sign: Vector3) -> Self {
        Self { offset, sign }
    }

    pub fn with_offset(offset: Vector3) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }

    /// 全局坐标 -> 本坐标系
    pub fn to_local(&self, p: &Vector3) -> Vector3 {
        (p - self.offset).component_mul(&self.sign)
    }

    /// 本坐标系 -> 全局坐标
    pub fn to_global(&self, p: &Vector3) -> Vector3 {
        p.component_mul(&self.sign) + self.offset
    }

    /// 构造一个坐标系，使 `to_local(reference)` 恰好等于 `local`
    pub fn anchored(reference: &Vector3, local: &Vector3, sign: Vector3) -> Self {
        Self {
            offset: reference - sign.component_mul(local),
            sign,
        }
    }
}
