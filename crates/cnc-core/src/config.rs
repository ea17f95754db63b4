//! 机床参数
//!
//! 会话开始时从 JSON 加载一次，之后只读共享（`Arc<MachineParameters>`）。
//! 所有字段都有默认值，配置文件只需写出与默认值不同的部分。

use crate::error::ConfigError;
use crate::geometry::Axis;
use crate::math::Vector3;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 单轴参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisParameters {
    /// 每单位长度的步数
    pub steps_per_unit: f64,
    /// 逻辑方向到硬件方向的符号，±1
    pub sign: f64,
    /// 物理反向（影响回零方向和圆弧手性）
    pub invert: bool,
    /// 行程
    pub size: f64,
    /// 回零时触发限位后的回退距离
    pub step_back: f64,
}

impl Default for AxisParameters {
    fn default() -> Self {
        Self {
            steps_per_unit: 400.0,
            sign: 1.0,
            invert: false,
            size: 100.0,
            step_back: 5.0,
        }
    }
}

impl AxisParameters {
    /// 物理长度 -> 硬件步数（含方向）
    pub fn to_steps(&self, value: f64) -> i64 {
        (value * self.steps_per_unit * self.sign).round() as i64
    }

    /// 硬件步数 -> 物理长度
    pub fn from_steps(&self, steps: i64) -> f64 {
        steps as f64 / self.steps_per_unit * self.sign
    }

    fn validate(&self, axis: Axis) -> Result<(), ConfigError> {
        let name = |field: &str| format!("{}.{}", axis.name().to_ascii_lowercase(), field);

        if !(self.steps_per_unit.is_finite() && self.steps_per_unit > 0.0) {
            return Err(ConfigError::invalid(name("steps_per_unit"), "must be positive"));
        }
        if self.sign != 1.0 && self.sign != -1.0 {
            return Err(ConfigError::invalid(name("sign"), "must be 1 or -1"));
        }
        if !(self.size.is_finite() && self.size >= 0.0) {
            return Err(ConfigError::invalid(name("size"), "must be non-negative"));
        }
        if !(self.step_back.is_finite() && self.step_back >= 0.0) {
            return Err(ConfigError::invalid(name("step_back"), "must be non-negative"));
        }
        Ok(())
    }
}

/// 机床参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineParameters {
    pub x: AxisParameters,
    pub y: AxisParameters,
    pub z: AxisParameters,

    /// 回零/探测的快速接近进给
    pub fast_feed: f64,
    /// 回零/探测的慢速进给
    pub slow_feed: f64,
    /// 单轴最大进给
    pub max_feed: f64,
    /// 单轴最大加速度
    pub max_acceleration: f64,

    /// 状态轮询间隔（毫秒）
    pub status_poll_interval_ms: u64,
    /// 传输失败后的重试等待（毫秒）
    pub retry_backoff_ms: u64,

    /// ZX 平面沿用旧控制器的手性判断（永不翻转旋转方向）
    pub legacy_zx_handedness: bool,
}

impl Default for MachineParameters {
    fn default() -> Self {
        Self {
            x: AxisParameters::default(),
            y: AxisParameters::default(),
            z: AxisParameters::default(),
            fast_feed: 600.0,
            slow_feed: 100.0,
            max_feed: 800.0,
            max_acceleration: 40.0 * 60.0 * 60.0,
            status_poll_interval_ms: 200,
            retry_backoff_ms: 100,
            legacy_zx_handedness: false,
        }
    }
}

impl MachineParameters {
    pub fn axis(&self, axis: Axis) -> &AxisParameters {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }

    pub fn axis_mut(&mut self, axis: Axis) -> &mut AxisParameters {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
        }
    }

    /// 每轴符号向量
    pub fn signs(&self) -> Vector3 {
        Vector3::new(self.x.sign, self.y.sign, self.z.sign)
    }

    /// 三维位移 -> 每轴硬件步数
    pub fn to_steps(&self, delta: &Vector3) -> [i64; 3] {
        Axis::ALL.map(|axis| self.axis(axis).to_steps(delta[axis.index()]))
    }

    /// 每轴硬件步数 -> 可实现的物理位移
    pub fn from_steps(&self, steps: &[i64; 3]) -> Vector3 {
        Vector3::from_fn(|i, _| self.axis(Axis::ALL[i]).from_steps(steps[i]))
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// 检查参数合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        for axis in Axis::ALL {
            self.axis(axis).validate(axis)?;
        }

        let positive = [
            ("fast_feed", self.fast_feed),
            ("slow_feed", self.slow_feed),
            ("max_feed", self.max_feed),
            ("max_acceleration", self.max_acceleration),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::invalid(name, "must be positive"));
            }
        }

        if self.status_poll_interval_ms == 0 {
            return Err(ConfigError::invalid("status_poll_interval_ms", "must be positive"));
        }

        if self.legacy_zx_handedness {
            tracing::warn!("Legacy ZX handedness enabled: ZX arcs never flip rotation sense");
        }
        Ok(())
    }

    /// 从 JSON 文本加载并校验
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// 从 JSON 文件加载并校验
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let params = Self::from_json_str(&text)?;
        tracing::info!("Loaded machine parameters from: {}", path.display());
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        MachineParameters::default().validate().expect("defaults must validate");
    }

    #[test]
    fn test_partial_json() {
        let params = MachineParameters::from_json_str(
            r#"{ "z": { "size": 80, "invert": true }, "max_feed": 1200 }"#,
        )
        .expect("Failed to parse");

        assert_eq!(params.z.size, 80.0);
        assert!(params.z.invert);
        assert_eq!(params.z.steps_per_unit, 400.0);
        assert_eq!(params.max_feed, 1200.0);
        assert_eq!(params.slow_feed, 100.0);
    }

    #[test]
    fn test_invalid_sign_rejected() {
        let result = MachineParameters::from_json_str(r#"{ "y": { "sign": 0.5 } }"#);
        assert!(matches!(result, Err(ConfigError::InvalidParameter { .. })));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let result = MachineParameters::from_json_str("{ max_feed: }");
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_step_conversion() {
        let mut params = MachineParameters::default();
        params.y.sign = -1.0;

        let steps = params.to_steps(&Vector3::new(1.0, 0.5, 0.00126));
        assert_eq!(steps, [400, -200, 1]);

        let physical = params.from_steps(&steps);
        assert_eq!(physical, Vector3::new(1.0, 0.5, 0.0025));
    }
}
