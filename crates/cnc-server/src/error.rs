//! 服务错误定义

use cnc_core::{CompileError, ConfigError, TransportError};
use thiserror::Error;

/// 会话级错误，出现后会话结束
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// 程序构建错误，只放弃本次加载，会话继续
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Line {line}: malformed statement: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Line {line}: {source}")]
    Compile {
        line: usize,
        #[source]
        source: CompileError,
    },

    #[error("Line {line}: {source}")]
    Config {
        line: usize,
        #[source]
        source: ConfigError,
    },
}

impl BuildError {
    /// 出错的程序行（从 0 开始）
    pub fn line(&self) -> usize {
        match self {
            BuildError::Parse { line, .. }
            | BuildError::Compile { line, .. }
            | BuildError::Config { line, .. } => *line,
        }
    }
}
