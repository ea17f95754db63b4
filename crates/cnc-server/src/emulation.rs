//! 仿真外设
//!
//! `EmulationRtSender` 按步数记录位置，执行直线和圆弧指令（只计算终点），
//! 应答位置/限位查询；`EmulationModbusSender` 只记录寄存器写入。

use crate::lock;
use cnc_core::config::MachineParameters;
use cnc_core::geometry::{Axis, Plane};
use cnc_core::transport::{Endstops, ModbusRegister, ModbusSender, RtResponse, RtSender};
use cnc_core::TransportError;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// 解析 `X10Y-2.5Z0` 形式的字段
fn parse_words(token: &str) -> Result<HashMap<char, f64>, TransportError> {
    let mut words = HashMap::new();
    let mut key: Option<char> = None;
    let mut value = String::new();

    let mut flush = |key: Option<char>, value: &mut String| -> Result<(), TransportError> {
        if let Some(k) = key {
            let number = value.parse().map_err(|_| TransportError::InvalidField {
                key: k.to_string(),
                value: value.clone(),
            })?;
            words.insert(k, number);
        }
        value.clear();
        Ok(())
    };

    for c in token.chars() {
        if c.is_ascii_alphabetic() {
            flush(key, &mut value)?;
            key = Some(c.to_ascii_uppercase());
        } else {
            value.push(c);
        }
    }
    flush(key, &mut value)?;
    Ok(words)
}

/// 合并多个字段组（运动参数组与坐标组的字母互不重复）
fn parse_fields(fields: &[&str]) -> Result<HashMap<char, f64>, TransportError> {
    let mut words = HashMap::new();
    for field in fields {
        words.extend(parse_words(field)?);
    }
    Ok(words)
}

fn word(words: &HashMap<char, f64>, key: char) -> Result<i64, TransportError> {
    words
        .get(&key)
        .map(|v| v.round() as i64)
        .ok_or_else(|| TransportError::MissingField(key.to_string()))
}

/// 仿真实时子系统
pub struct EmulationRtSender {
    config: Arc<MachineParameters>,
    steps: Mutex<[i64; 3]>,
    endstops: Mutex<Endstops>,
    locked: Mutex<bool>,
}

impl EmulationRtSender {
    pub fn new(config: Arc<MachineParameters>) -> Self {
        Self {
            config,
            steps: Mutex::new([0; 3]),
            endstops: Mutex::new(Endstops::default()),
            locked: Mutex::new(false),
        }
    }

    pub fn steps(&self) -> [i64; 3] {
        *lock(&self.steps)
    }

    pub fn set_endstops(&self, endstops: Endstops) {
        *lock(&self.endstops) = endstops;
    }

    pub fn is_locked(&self) -> bool {
        *lock(&self.locked)
    }

    fn apply_steps(&self, delta: [i64; 3]) {
        let mut steps = lock(&self.steps);
        for (s, d) in steps.iter_mut().zip(delta) {
            *s += d;
        }
    }

    /// 直线：`G1 <opts> X<dx>Y<dy>Z<dz>`
    fn line(&self, fields: &[&str]) -> Result<(), TransportError> {
        let words = parse_fields(&fields[1..])?;
        self.apply_steps([word(&words, 'X')?, word(&words, 'Y')?, word(&words, 'Z')?]);
        Ok(())
    }

    /// 圆弧：终点 = 圆心->终点 - 圆心->起点，法向为 H
    fn arc(&self, fields: &[&str]) -> Result<(), TransportError> {
        let plane_token = fields
            .get(1)
            .ok_or_else(|| TransportError::MissingField("plane".to_string()))?;
        let plane = Plane::from_str(plane_token)
            .map_err(|e| TransportError::Failure(e.to_string()))?;
        let words = parse_fields(&fields[2..])?;

        let [a0, a1, normal] = plane.axes();
        let mut delta = [0i64; 3];
        delta[a0.index()] = word(&words, 'X')? - word(&words, 'R')?;
        delta[a1.index()] = word(&words, 'Y')? - word(&words, 'S')?;
        delta[normal.index()] = word(&words, 'H')?;
        self.apply_steps(delta);
        Ok(())
    }

    fn position(&self) -> RtResponse {
        let steps = self.steps();
        let mut response = RtResponse::new();
        for (axis, key) in ["X", "Y", "Z"].into_iter().enumerate() {
            let spu = self.config.axis(Axis::ALL[axis]).steps_per_unit;
            response.insert(key.to_string(), format!("{}", steps[axis] as f64 / spu));
        }
        response
    }

    fn endstop_response(&self) -> RtResponse {
        let endstops = *lock(&self.endstops);
        let flag = |b: bool| (if b { "1" } else { "0" }).to_string();
        [
            ("EX", endstops.x),
            ("EY", endstops.y),
            ("EZ", endstops.z),
            ("EP", endstops.probe),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), flag(v)))
        .collect()
    }
}

impl RtSender for EmulationRtSender {
    fn send_command(&self, command: &str) -> Result<RtResponse, TransportError> {
        let fields: Vec<&str> = command.split_whitespace().collect();
        let Some(&opcode) = fields.first() else {
            return Err(TransportError::Failure("empty command".to_string()));
        };

        match opcode {
            "G1" => self.line(&fields)?,
            "G2" | "G3" => self.arc(&fields)?,
            "G92" => *lock(&self.steps) = [0; 3],
            "M17" => *lock(&self.locked) = true,
            "M18" => *lock(&self.locked) = false,
            "M114" => return Ok(self.position()),
            "M119" => return Ok(self.endstop_response()),
            _ => debug!("Emulator ignores `{}`", command),
        }
        Ok(RtResponse::new())
    }
}

/// 仿真寄存器总线
#[derive(Default)]
pub struct EmulationModbusSender {
    writes: Mutex<Vec<ModbusRegister>>,
}

impl EmulationModbusSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<ModbusRegister> {
        lock(&self.writes).clone()
    }
}

impl ModbusSender for EmulationModbusSender {
    fn write_registers(&self, registers: &[ModbusRegister]) -> Result<(), TransportError> {
        for r in registers {
            info!(
                "Modbus write: device {} register {} = {}",
                r.device_id, r.register_id, r.value
            );
        }
        lock(&self.writes).extend_from_slice(registers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnc_core::command::{ArcMoveCommand, LineMoveCommand, MovementOptions, RtCommand};
    use cnc_core::math::{Vector2, Vector3};
    use cnc_core::program::{Action, ActionProgram};
    use cnc_core::state::CncState;
    use cnc_core::transport::{query_endstops, query_position};

    fn emulator() -> EmulationRtSender {
        EmulationRtSender::new(Arc::new(MachineParameters::default()))
    }

    #[test]
    fn test_parse_words() {
        let words = parse_words("X10Y-2.5z0").unwrap();
        assert_eq!(words[&'X'], 10.0);
        assert_eq!(words[&'Y'], -2.5);
        assert_eq!(words[&'Z'], 0.0);
        assert!(parse_words("X1-").is_err());
    }

    #[test]
    fn test_line_and_position() {
        let config = MachineParameters::default();
        let rt = emulator();
        let line = LineMoveCommand::new(Vector3::new(1.0, -2.0, 0.5), MovementOptions::constant(100.0, 10.0), &config);

        rt.send(&RtCommand::from(line)).unwrap();
        assert_eq!(rt.steps(), [400, -800, 200]);
        assert_eq!(query_position(&rt).unwrap(), Vector3::new(1.0, -2.0, 0.5));

        rt.send(&RtCommand::SetZero).unwrap();
        assert_eq!(query_position(&rt).unwrap(), Vector3::zeros());
    }

    #[test]
    fn test_arc_endpoint() {
        let config = MachineParameters::default();
        let rt = emulator();

        for plane in Plane::ALL {
            rt.send(&RtCommand::SetZero).unwrap();
            let delta = plane.unproject(&Vector2::new(3.0, 1.0), 0.75);
            let arc = ArcMoveCommand::with_radius(delta, 4.0, true, plane, MovementOptions::default(), &config).unwrap();
            rt.send(&RtCommand::from(arc.clone())).unwrap();

            let [a, b, h] = plane.axes();
            let steps = rt.steps();
            assert_eq!(steps[a.index()], arc.end_offset[0] - arc.start_offset[0]);
            assert_eq!(steps[b.index()], arc.end_offset[1] - arc.start_offset[1]);
            assert_eq!(steps[h.index()], arc.height_steps);
            assert_eq!(steps, config.to_steps(&arc.physical_delta));
            assert_eq!(query_position(&rt).unwrap(), arc.physical_delta);
        }
    }

    #[test]
    fn test_chained_arcs_track_hardware() {
        let config = Arc::new(MachineParameters::default());
        let rt = EmulationRtSender::new(Arc::clone(&config));
        let mut program = ActionProgram::new(Arc::clone(&config));

        let mut state = CncState::default();
        for i in 0..200 {
            let delta = Vector3::new(1.0367 + 0.0011 * (i % 7) as f64, 0.5607 - 0.0013 * (i % 5) as f64, 0.0);
            state = program
                .add_arc_movement_radius(delta, 1.3, i % 2 == 0, Plane::XY, 500.0, &state)
                .unwrap();
        }

        for entry in program.entries() {
            if let Action::Rt(command) = &entry.action {
                rt.send(command).unwrap();
            }
        }
        assert_eq!(rt.steps(), config.to_steps(&state.axis.position));
    }

    #[test]
    fn test_endstops_and_lock() {
        let rt = emulator();
        rt.set_endstops(Endstops { x: false, y: true, z: false, probe: true });
        let es = query_endstops(&rt).unwrap();
        assert!(es.y && es.probe && !es.x);

        rt.send(&RtCommand::Lock(true)).unwrap();
        assert!(rt.is_locked());
        assert!(rt.send_command("").is_err());
    }

    #[test]
    fn test_modbus_records() {
        let bus = EmulationModbusSender::new();
        bus.write_registers(&[ModbusRegister { device_id: 1, register_id: 2, value: 3 }]).unwrap();
        assert_eq!(bus.writes().len(), 1);
    }
}
