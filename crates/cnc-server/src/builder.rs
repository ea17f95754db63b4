//! 程序构建
//!
//! `ProgramBuilder` 把程序文本编译为动作程序，并记录每行对应的第一个动作，
//! 用于执行时上报当前行号。
//!
//! `ScriptBuilder` 是一个动作脚本构建器：每行一个带 `op` 标签的 JSON 对象，
//! 每行对应一次动作程序调用。坐标在当前坐标系下给出，默认绝对坐标，
//! `"relative": true` 时为相对位移。
//!
//! ```text
//! # 注释
//! {"op":"home"}
//! {"op":"fast","x":10,"y":10}
//! {"op":"line","z":-1,"feed":120}
//! {"op":"arc","x":20,"y":10,"r":5,"ccw":true}
//! {"op":"probe","z":0}
//! ```

use crate::error::BuildError;
use cnc_core::command::RtCommand;
use cnc_core::config::MachineParameters;
use cnc_core::geometry::Plane;
use cnc_core::math::Vector3;
use cnc_core::program::{ActionId, ActionProgram};
use cnc_core::state::{CncState, SpindleRotation};
use cnc_core::transport::{ModbusRegister, ModbusToolCommand};
use cnc_core::{CompileError, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// 构建结果
#[derive(Debug, Clone)]
pub struct BuiltProgram {
    pub program: ActionProgram,
    /// 动作 -> 程序行
    pub starts: HashMap<ActionId, usize>,
}

/// 程序构建器
pub trait ProgramBuilder: Send + Sync {
    /// 从给定状态开始编译
    fn build(&self, lines: &[String], state: &CncState) -> Result<BuiltProgram, BuildError>;
}

/// 目标坐标（缺省分量保持不变）
#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct Target {
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    #[serde(default)]
    relative: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ScriptOp {
    Line {
        #[serde(flatten)]
        target: Target,
        feed: Option<f64>,
    },
    Fast {
        #[serde(flatten)]
        target: Target,
    },
    Arc {
        #[serde(flatten)]
        target: Target,
        #[serde(default)]
        ccw: bool,
        plane: Option<String>,
        /// 半径，负值取大弧
        r: Option<f64>,
        /// 起点 -> 圆心
        i: Option<f64>,
        j: Option<f64>,
        k: Option<f64>,
        feed: Option<f64>,
    },
    Home,
    Probe {
        /// 探针触发点在当前坐标系下的 Z
        #[serde(default)]
        z: f64,
    },
    SetZero,
    Lock,
    Unlock,
    Delay {
        ms: u64,
    },
    Pause,
    Stop,
    ToolOn {
        tool: u32,
    },
    ToolOff {
        tool: u32,
    },
    SelectTool {
        tool: u32,
    },
    Registers {
        writes: Vec<ModbusRegister>,
        #[serde(default)]
        delay_ms: u64,
    },
    CoordinateSystem {
        index: usize,
    },
    Resync,
    Raw {
        command: String,
    },
}

/// 动作脚本构建器
pub struct ScriptBuilder {
    config: Arc<MachineParameters>,
}

impl ScriptBuilder {
    pub fn new(config: Arc<MachineParameters>) -> Self {
        Self { config }
    }
}

/// 目标点 -> 相对当前实际位置的全局位移
///
/// 目标从上一次请求的目标位置（而不是量化后的实际位置）推算，位移里包含残差，
/// 连续的相对运动不会累积取整误差。缺省分量保持上一次的目标。
fn displacement(target: &Target, state: &CncState) -> Vector3 {
    let cs = state.axis.current_coordinate_system();
    let intended = cs.to_local(&state.axis.target_position);
    let local = if target.relative {
        intended
            + Vector3::new(
                target.x.unwrap_or(0.0),
                target.y.unwrap_or(0.0),
                target.z.unwrap_or(0.0),
            )
    } else {
        Vector3::new(
            target.x.unwrap_or(intended.x),
            target.y.unwrap_or(intended.y),
            target.z.unwrap_or(intended.z),
        )
    };
    cs.to_global(&local) - state.axis.position
}

impl ScriptBuilder {
    fn apply(
        &self,
        program: &mut ActionProgram,
        op: ScriptOp,
        state: CncState,
        line: usize,
    ) -> Result<CncState, BuildError> {
        let compile = |source: CompileError| BuildError::Compile { line, source };
        let config = |source: ConfigError| BuildError::Config { line, source };

        let state = match op {
            ScriptOp::Line { target, feed } => {
                let mut state = state;
                if let Some(feed) = feed {
                    state.axis.feed = feed;
                }
                let delta = displacement(&target, &state);
                program.add_line_movement(delta, state.axis.feed, &state)
            }
            ScriptOp::Fast { target } => {
                let delta = displacement(&target, &state);
                program.add_fast_line_movement(delta, &state)
            }
            ScriptOp::Arc { target, ccw, plane, r, i, j, k, feed } => {
                let mut state = state;
                if let Some(plane) = plane {
                    state.axis.plane = Plane::from_str(&plane).map_err(config)?;
                }
                if let Some(feed) = feed {
                    state.axis.feed = feed;
                }
                let delta = displacement(&target, &state);
                let (plane, feed) = (state.axis.plane, state.axis.feed);
                match r {
                    Some(radius) => program
                        .add_arc_movement_radius(delta, radius, ccw, plane, feed, &state)
                        .map_err(compile)?,
                    None => {
                        let sign = state.axis.current_coordinate_system().sign;
                        let center = Vector3::new(i.unwrap_or(0.0), j.unwrap_or(0.0), k.unwrap_or(0.0))
                            .component_mul(&sign);
                        program
                            .add_arc_movement_center(delta, center, ccw, plane, feed, &state)
                            .map_err(compile)?
                    }
                }
            }
            ScriptOp::Home => program.add_homing(&state),
            ScriptOp::Probe { z } => {
                let mut probed = state.clone();
                let cs = state.axis.current_coordinate_system();
                let mut local = cs.to_local(&state.axis.position);
                local.z = z;
                probed.axis.position = cs.to_global(&local);

                let probed = program.add_z_probe(&state, Some(&probed));
                program.add_resync(&probed);
                probed
            }
            ScriptOp::SetZero => program.add_set_zero(&state),
            ScriptOp::Lock => {
                program.add_lock(&state);
                state
            }
            ScriptOp::Unlock => {
                program.add_unlock(&state);
                state
            }
            ScriptOp::Delay { ms } => {
                program.add_delay(ms, &state);
                state
            }
            ScriptOp::Pause => {
                program.add_break();
                state
            }
            ScriptOp::Stop => {
                program.add_stop();
                state
            }
            ScriptOp::ToolOn { tool } => {
                let mut after = state.clone();
                after.spindle.rotation = SpindleRotation::Clockwise;
                program.enable_rt_tool(tool, &state, &after);
                after
            }
            ScriptOp::ToolOff { tool } => {
                let mut after = state.clone();
                after.spindle.rotation = SpindleRotation::Off;
                program.disable_rt_tool(tool, &state, &after);
                after
            }
            ScriptOp::SelectTool { tool } => {
                program.add_tool_change(tool);
                state
            }
            ScriptOp::Registers { writes, delay_ms } => {
                let command = ModbusToolCommand {
                    registers: writes,
                    delay: Duration::from_millis(delay_ms),
                };
                program.add_tool_command(command, &state, &state);
                state
            }
            ScriptOp::CoordinateSystem { index } => {
                let mut after = state.clone();
                after.axis.select_coordinate_system(index).map_err(config)?;
                program.add_state_change(&state, &after);
                after
            }
            ScriptOp::Resync => {
                program.add_resync(&state);
                state
            }
            ScriptOp::Raw { command } => {
                program.add_rt_command(RtCommand::Raw(command), &state);
                state
            }
        };
        Ok(state)
    }
}

impl ProgramBuilder for ScriptBuilder {
    fn build(&self, lines: &[String], state: &CncState) -> Result<BuiltProgram, BuildError> {
        let mut program = ActionProgram::new(Arc::clone(&self.config));
        let mut starts = HashMap::new();
        let mut state = state.clone();

        for (line, text) in lines.iter().enumerate() {
            let text = text.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }

            let op: ScriptOp =
                serde_json::from_str(text).map_err(|source| BuildError::Parse { line, source })?;

            let first = program.next_id();
            state = self.apply(&mut program, op, state, line)?;
            if program.len() > first.0 {
                starts.insert(first, line);
            }
        }

        Ok(BuiltProgram { program, starts })
    }
}
