//! 圆弧/螺旋运动指令
//!
//! 支持两种输入形式：
//! - 半径形式：带符号半径，负半径表示取大弧
//! - 圆心形式：给出起点到圆心的向量
//!
//! 两种形式最终都归结为 (起点->圆心, 终点->圆心, 半径, 是否大弧)，由 `finish` 统一计算
//! 角度、长度、切向量和硬件步数字段。

use super::MovementOptions;
use crate::config::MachineParameters;
use crate::error::CompileError;
use crate::geometry::Plane;
use crate::math::{PlanarExt, Vector2, Vector3, EPSILON};
use std::f64::consts::TAU;

/// 圆弧运动
#[derive(Debug, Clone, PartialEq)]
pub struct ArcMoveCommand {
    pub plane: Plane,
    /// 请求的旋转方向
    pub ccw: bool,
    /// 经手性修正后硬件看到的旋转方向
    pub hardware_ccw: bool,
    pub options: MovementOptions,

    /// 请求的位移
    pub delta: Vector3,
    /// 步数量化后可实现的位移
    pub physical_delta: Vector3,

    /// 半径（正值）
    pub radius: f64,
    /// 是否取大弧
    pub major_arc: bool,
    /// 扫过的角度，(0, 2π]
    pub angle: f64,
    /// 平面内弧长
    pub plane_length: f64,
    /// 螺旋总长
    pub length: f64,
    /// 高度轴位移
    pub height: f64,

    pub start_to_center: Vector2,
    pub end_to_center: Vector2,

    /// 起点单位切向量
    pub dir_start: Vector3,
    /// 终点单位切向量
    pub dir_end: Vector3,

    /// 圆心 -> 起点（硬件步数）
    pub start_offset: [i64; 2],
    /// 圆心 -> 终点（硬件步数）
    pub end_offset: [i64; 2],
    /// 高度（硬件步数）
    pub height_steps: i64,
    /// 按平面两轴步距缩放的半径，大弧取负
    pub radius_steps: [f64; 2],
}

/// 手性修正：平面两轴中恰有一个反向时，硬件看到的旋转方向与请求相反
pub fn hardware_ccw(plane: Plane, ccw: bool, config: &MachineParameters) -> bool {
    if plane == Plane::ZX && config.legacy_zx_handedness {
        return ccw;
    }
    let [a, b, _] = plane.axes();
    let left_basis = config.axis(a).invert != config.axis(b).invert;
    ccw != left_basis
}

impl ArcMoveCommand {
    /// 半径形式
    pub fn with_radius(
        delta: Vector3,
        radius: f64,
        ccw: bool,
        plane: Plane,
        options: MovementOptions,
        config: &MachineParameters,
    ) -> Result<Self, CompileError> {
        if !radius.is_finite() {
            return Err(CompileError::GeometricInfeasibility(format!(
                "invalid radius {}",
                radius
            )));
        }

        let (chord, _) = plane.project(&delta);
        let major_arc = radius < 0.0;
        let radius = radius.abs();
        let half_chord = chord.norm() / 2.0;

        if half_chord < EPSILON {
            return Err(CompileError::GeometricInfeasibility(
                "zero chord: a full circle needs the center form".to_string(),
            ));
        }
        if radius < half_chord - EPSILON {
            return Err(CompileError::GeometricInfeasibility(format!(
                "radius {} is smaller than half chord {}",
                radius, half_chord
            )));
        }

        // 圆心到弦中点的距离，符号选择弦的哪一侧
        let mut hcl = (radius * radius - half_chord * half_chord).max(0.0).sqrt();
        if ccw != major_arc {
            hcl = -hcl;
        }
        let start_to_center = chord / 2.0 + chord.right().normalize() * hcl;

        Ok(Self::finish(
            delta,
            start_to_center,
            radius,
            major_arc,
            ccw,
            plane,
            options,
            config,
        ))
    }

    /// 圆心形式，`start_to_center` 只取平面内分量
    pub fn with_center(
        delta: Vector3,
        start_to_center: Vector3,
        ccw: bool,
        plane: Plane,
        options: MovementOptions,
        config: &MachineParameters,
    ) -> Result<Self, CompileError> {
        let (chord, _) = plane.project(&delta);
        // 半径只按平面内分量计算，给出的法向分量被丢弃，不计入半径
        let (start_to_center, _) = plane.project(&start_to_center);
        let radius = start_to_center.norm();

        if !radius.is_finite() || radius < EPSILON {
            return Err(CompileError::GeometricInfeasibility(
                "arc center coincides with the start point".to_string(),
            ));
        }

        let side = chord.cross2(&start_to_center);
        let minor = (side > 0.0 && ccw) || (side < 0.0 && !ccw);

        Ok(Self::finish(
            delta,
            start_to_center,
            radius,
            !minor,
            ccw,
            plane,
            options,
            config,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        delta: Vector3,
        start_to_center: Vector2,
        radius: f64,
        major_arc: bool,
        ccw: bool,
        plane: Plane,
        options: MovementOptions,
        config: &MachineParameters,
    ) -> Self {
        let (chord, height) = plane.project(&delta);
        let end_to_center = start_to_center - chord;

        let mut angle = 2.0 * (chord.norm() / 2.0 / radius).min(1.0).asin();
        if major_arc {
            angle = TAU - angle;
        }
        let plane_length = angle * radius;
        let length = plane_length.hypot(height);

        let (tan_start, tan_end) = tangents(&start_to_center, &end_to_center, ccw);
        let slope = height / plane_length;
        let dir_start = plane.unproject(&tan_start, slope).normalize();
        let dir_end = plane.unproject(&tan_end, slope).normalize();

        let [a, b, h] = plane.axes();
        let (pa, pb, ph) = (config.axis(a), config.axis(b), config.axis(h));

        let start_offset = [pa.to_steps(-start_to_center.x), pb.to_steps(-start_to_center.y)];
        let end_offset = [pa.to_steps(-end_to_center.x), pb.to_steps(-end_to_center.y)];
        let height_steps = ph.to_steps(height);

        let radius_sign = if major_arc { -1.0 } else { 1.0 };
        let radius_steps = [
            radius * pa.steps_per_unit * radius_sign,
            radius * pb.steps_per_unit * radius_sign,
        ];

        // 硬件实际走的步数：平面内是两个圆心偏移之差，法向是高度步数
        let mut steps = [0i64; 3];
        steps[a.index()] = end_offset[0] - start_offset[0];
        steps[b.index()] = end_offset[1] - start_offset[1];
        steps[h.index()] = height_steps;
        let physical_delta = config.from_steps(&steps);

        Self {
            plane,
            ccw,
            hardware_ccw: hardware_ccw(plane, ccw, config),
            options,
            delta,
            physical_delta,
            radius,
            major_arc,
            angle,
            plane_length,
            length,
            height,
            start_to_center,
            end_to_center,
            dir_start,
            dir_end,
            start_offset,
            end_offset,
            height_steps,
            radius_steps,
        }
    }

    /// 沿圆弧运动时每轴方向分量绝对值的上界
    ///
    /// 平面内方向会扫过整个圆周，两轴都按 `plane_length / length` 计。
    pub fn direction_bound(&self) -> Vector3 {
        let planar = self.plane_length / self.length;
        let vertical = self.height.abs() / self.length;
        self.plane.unproject(&Vector2::new(planar, planar), vertical)
    }

    /// 硬件旋转方向指令
    pub fn move_opcode(&self) -> &'static str {
        if self.hardware_ccw {
            "G3"
        } else {
            "G2"
        }
    }

    pub fn command(&self) -> String {
        format!(
            "{} {} {} X{}Y{}R{}S{}H{}D{:.3} A{:.3}B{:.3}",
            self.move_opcode(),
            self.plane.opcode(),
            self.options.command(),
            self.end_offset[0],
            self.end_offset[1],
            self.start_offset[0],
            self.start_offset[1],
            self.height_steps,
            self.length,
            self.radius_steps[0],
            self.radius_steps[1],
        )
    }
}

/// 起点/终点处的平面单位切向量
fn tangents(start_to_center: &Vector2, end_to_center: &Vector2, ccw: bool) -> (Vector2, Vector2) {
    let mut st = start_to_center.right();
    let mut et = end_to_center.right();
    if !ccw {
        st = -st;
        et = -et;
    }
    (st.normalize(), et.normalize())
}
