//! 核心错误定义

use thiserror::Error;

/// 配置错误：无法识别的平面/轴，或非法的机床参数
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown plane: {0}")]
    UnknownPlane(String),

    #[error("Unknown axis: {0}")]
    UnknownAxis(String),

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// 运动指令编译错误
///
/// 两种错误都只影响当前这一次编译调用，调用方不应把对应动作加入程序。
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Geometrically infeasible move: {0}")]
    GeometricInfeasibility(String),
}

/// 实时子系统/外设传输错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Transport failure: {0}")]
    Failure(String),

    #[error("Transport timed out")]
    Timeout,

    #[error("Missing field `{0}` in response")]
    MissingField(String),

    #[error("Invalid value `{value}` for field `{key}`")]
    InvalidField { key: String, value: String },
}
