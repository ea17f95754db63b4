//! 传输接口
//!
//! 实时子系统（文本指令 + 键值应答）和寄存器外设（批量写寄存器）的具体连接方式
//! 由外部实现，这里只定义接口和应答解析。

use crate::command::RtCommand;
use crate::error::TransportError;
use crate::math::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// 实时子系统应答：字段名 -> 文本值
pub type RtResponse = HashMap<String, String>;

/// 实时子系统连接
pub trait RtSender: Send + Sync {
    /// 发送一条指令并等待应答
    fn send_command(&self, command: &str) -> Result<RtResponse, TransportError>;

    fn send(&self, command: &RtCommand) -> Result<RtResponse, TransportError> {
        self.send_command(&command.command())
    }
}

/// 限位/探针状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Endstops {
    pub x: bool,
    pub y: bool,
    pub z: bool,
    pub probe: bool,
}

fn field<'a>(response: &'a RtResponse, key: &str) -> Result<&'a str, TransportError> {
    response
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| TransportError::MissingField(key.to_string()))
}

fn number(response: &RtResponse, key: &str) -> Result<f64, TransportError> {
    let value = field(response, key)?;
    value.trim().parse().map_err(|_| TransportError::InvalidField {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// 查询硬件位置
pub fn query_position(sender: &dyn RtSender) -> Result<Vector3, TransportError> {
    let response = sender.send(&RtCommand::GetPosition)?;
    Ok(Vector3::new(
        number(&response, "X")?,
        number(&response, "Y")?,
        number(&response, "Z")?,
    ))
}

/// 查询限位与探针
pub fn query_endstops(sender: &dyn RtSender) -> Result<Endstops, TransportError> {
    let response = sender.send(&RtCommand::GetEndstops)?;
    let flag = |key: &str| field(&response, key).map(|v| v.trim() == "1");
    Ok(Endstops {
        x: flag("EX")?,
        y: flag("EY")?,
        z: flag("EZ")?,
        probe: flag("EP")?,
    })
}

/// 单个寄存器写入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusRegister {
    pub device_id: u16,
    pub register_id: u16,
    pub value: u16,
}

/// 工具（主轴等）寄存器指令：一组写入加写入后的等待
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModbusToolCommand {
    pub registers: Vec<ModbusRegister>,
    pub delay: Duration,
}

/// 寄存器外设连接
pub trait ModbusSender: Send + Sync {
    fn write_registers(&self, registers: &[ModbusRegister]) -> Result<(), TransportError>;
}
