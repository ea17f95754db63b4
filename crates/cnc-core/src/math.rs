//! 数学基础类型
//!
//! 向量运算直接使用 nalgebra，这里只补充平面运动需要的几个操作。

pub type Vector2 = nalgebra::Vector2<f64>;
pub type Vector3 = nalgebra::Vector3<f64>;

/// 通用浮点比较容差
pub const EPSILON: f64 = 1e-9;

/// 单轴方向分量低于此值时不参与进给/加速度限制
pub const AXIS_EPSILON: f64 = 1e-8;

/// 位移各分量都低于此值的运动视为空操作
pub const MOVE_EPSILON: f64 = 1e-12;

/// 平面向量扩展
pub trait PlanarExt {
    /// 顺时针旋转 90°：`(x, y) -> (y, -x)`
    fn right(&self) -> Vector2;

    /// 二维叉积 `a.x * b.y - a.y * b.x`
    fn cross2(&self, other: &Vector2) -> f64;
}

impl PlanarExt for Vector2 {
    fn right(&self) -> Vector2 {
        Vector2::new(self.y, -self.x)
    }

    fn cross2(&self, other: &Vector2) -> f64 {
        self.perp(other)
    }
}

/// 所有分量的绝对值都小于 `tolerance`
pub fn is_negligible(v: &Vector3, tolerance: f64) -> bool {
    v.iter().all(|c| c.abs() < tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_right_is_clockwise() {
        let v = Vector2::new(1.0, 0.0);
        assert_eq!(v.right(), Vector2::new(0.0, -1.0));
        assert!(v.right().dot(&v).abs() < EPSILON);
    }

    #[test]
    fn test_cross2_sign() {
        let a = Vector2::new(2.0, 0.0);
        let b = Vector2::new(1.0, 1.0);
        assert!((a.cross2(&b) - 2.0).abs() < EPSILON);
        assert!((b.cross2(&a) + 2.0).abs() < EPSILON);
    }

    #[test]
    fn test_negligible() {
        assert!(is_negligible(&Vector3::new(1e-13, -1e-13, 0.0), MOVE_EPSILON));
        assert!(!is_negligible(&Vector3::new(0.0, 0.0, 1e-6), MOVE_EPSILON));
    }
}
