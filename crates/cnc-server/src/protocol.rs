//! 客户端协议
//!
//! 每行一个 JSON 对象（UTF-8，`\n` 结尾）。
//!
//! 请求：`{"type":"command","command":"...","program":[...] | "..."}`
//!
//! 推送：
//! - `{"type":"coordinates","hardware":[x,y,z],"global":[x,y,z],"local":[x,y,z],"cs":n}`
//! - `{"type":"line","line":n}`

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

/// 程序文本：行数组或整段文本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgramText {
    Lines(Vec<String>),
    Text(String),
}

impl Default for ProgramText {
    fn default() -> Self {
        ProgramText::Lines(Vec::new())
    }
}

impl ProgramText {
    pub fn into_lines(self) -> Vec<String> {
        match self {
            ProgramText::Lines(lines) => lines,
            ProgramText::Text(text) => text.lines().map(str::to_string).collect(),
        }
    }
}

/// 客户端请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(default)]
    pub program: ProgramText,
}

/// 规范化后的客户端指令
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Exit,
    Disconnect,
    Reboot,
    /// `reset` 和 `stop`
    Reset,
    Pause,
    Load(Vec<String>),
    Continue,
    Start,
    Execute(Vec<String>),
}

impl ClientRequest {
    pub fn into_command(self) -> Result<ClientCommand, ServerError> {
        if self.kind != "command" {
            return Err(ServerError::UnknownCommand(format!("message type `{}`", self.kind)));
        }

        let command = match self.command.as_str() {
            "exit" => ClientCommand::Exit,
            "disconnect" => ClientCommand::Disconnect,
            "reboot" => ClientCommand::Reboot,
            "reset" | "stop" => ClientCommand::Reset,
            "pause" => ClientCommand::Pause,
            "load" => ClientCommand::Load(self.program.into_lines()),
            "continue" => ClientCommand::Continue,
            "start" => ClientCommand::Start,
            "execute" => ClientCommand::Execute(self.program.into_lines()),
            other => return Err(ServerError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

/// 服务端推送
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Coordinates {
        hardware: [f64; 3],
        global: [f64; 3],
        local: [f64; 3],
        cs: usize,
    },
    Line {
        line: usize,
    },
}

/// 按行读取请求
pub struct MessageReceiver<R> {
    reader: R,
    buffer: String,
}

impl<R: BufRead> MessageReceiver<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: String::new(),
        }
    }

    /// 读取下一条请求，流结束返回 `None`；空行跳过
    pub fn receive(&mut self) -> Result<Option<ClientRequest>, ServerError> {
        loop {
            self.buffer.clear();
            if self.reader.read_line(&mut self.buffer)? == 0 {
                return Ok(None);
            }
            let line = self.buffer.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(line)?));
        }
    }
}

/// 按行写出推送
pub struct MessageSender<W> {
    writer: W,
}

impl<W: Write> MessageSender<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn send(&mut self, message: &ServerMessage) -> Result<(), ServerError> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
