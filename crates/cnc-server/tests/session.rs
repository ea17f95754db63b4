//! 会话集成测试：仿真外设 + 动作脚本，经由客户端协议驱动整个服务

use cnc_core::config::MachineParameters;
use cnc_core::math::Vector3;
use cnc_core::transport::{query_position, RtSender};
use cnc_server::{
    EmulationModbusSender, EmulationRtSender, GCodeServer, ProgramExecutor, ScriptBuilder,
    ServerError, SessionEnd,
};
use crossbeam::channel::{self, Receiver, Sender};
use serde_json::Value;
use std::io::{self, BufReader, Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 按行从通道读取的输入流，通道关闭即流结束
struct ChannelReader {
    rx: Receiver<String>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(line) => {
                    self.pending = line.into_bytes();
                    self.pending.push(b'\n');
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    /// 已完整写出的消息
    fn messages(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        let complete = &text[..text.rfind('\n').map_or(0, |i| i + 1)];
        complete
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

fn config() -> Arc<MachineParameters> {
    Arc::new(MachineParameters {
        status_poll_interval_ms: 5,
        retry_backoff_ms: 5,
        ..Default::default()
    })
}

fn server(config: &Arc<MachineParameters>, rt: &Arc<EmulationRtSender>, out: &SharedBuf) -> GCodeServer {
    let modbus = Arc::new(EmulationModbusSender::new());
    GCodeServer::new(
        Arc::clone(config),
        rt.clone(),
        Arc::new(ScriptBuilder::new(Arc::clone(config))),
        ProgramExecutor::factory(rt.clone(), modbus),
        out.clone(),
    )
}

fn command(name: &str) -> String {
    format!("{{\"type\":\"command\",\"command\":\"{}\"}}", name)
}

fn execute(lines: &[&str]) -> String {
    serde_json::json!({ "type": "command", "command": "execute", "program": lines }).to_string()
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn reported_lines(out: &SharedBuf) -> Vec<u64> {
    out.messages()
        .iter()
        .filter(|m| m["type"] == "line")
        .filter_map(|m| m["line"].as_u64())
        .collect()
}

fn load(lines: &[&str]) -> String {
    serde_json::json!({ "type": "command", "command": "load", "program": lines }).to_string()
}

struct Session {
    input: Sender<String>,
    out: SharedBuf,
    rt: Arc<EmulationRtSender>,
    handle: JoinHandle<Result<SessionEnd, ServerError>>,
}

fn spawn_session(rt: Arc<EmulationRtSender>) -> Session {
    let (input, rx) = channel::unbounded();
    let out = SharedBuf::default();
    let config = config();

    let server = server(&config, &rt, &out);
    let reader = BufReader::new(ChannelReader { rx, pending: Vec::new(), pos: 0 });
    let handle = thread::spawn(move || server.run(reader));

    Session { input, out, rt, handle }
}

fn run_to_end(input: &str) -> Result<SessionEnd, ServerError> {
    let config = config();
    let rt = Arc::new(EmulationRtSender::new(Arc::clone(&config)));
    server(&config, &rt, &SharedBuf::default()).run(Cursor::new(input.to_string()))
}

#[test]
fn test_exit_ends_session() {
    let input = format!("{}\n{}\n", command("pause"), command("exit"));
    assert_eq!(run_to_end(&input).unwrap(), SessionEnd::Exit);
}

#[test]
fn test_closed_stream_disconnects() {
    assert_eq!(run_to_end("").unwrap(), SessionEnd::Disconnected);

    let input = format!("{}\n", command("disconnect"));
    assert_eq!(run_to_end(&input).unwrap(), SessionEnd::Disconnected);
}

#[test]
fn test_unknown_command_terminates() {
    let input = format!("{}\n{}\n", command("dance"), command("exit"));
    assert!(matches!(run_to_end(&input), Err(ServerError::UnknownCommand(c)) if c == "dance"));
}

#[test]
fn test_malformed_message_terminates() {
    let result = run_to_end("{\"type\":\"command\",\n");
    assert!(matches!(result, Err(ServerError::Protocol(_))));
}

#[test]
fn test_execute_moves_and_reports_lines() {
    let session = spawn_session(Arc::new(EmulationRtSender::new(config())));

    session
        .input
        .send(execute(&["{\"op\":\"fast\",\"x\":10}", "{\"op\":\"line\",\"y\":5,\"feed\":100}"]))
        .unwrap();

    let rt = Arc::clone(&session.rt);
    assert!(wait_until(|| query_position(&*rt).ok() == Some(Vector3::new(10.0, 5.0, 0.0))));

    let out = session.out.clone();
    assert!(wait_until(|| {
        let lines: Vec<u64> = out
            .messages()
            .iter()
            .filter(|m| m["type"] == "line")
            .filter_map(|m| m["line"].as_u64())
            .collect();
        lines == [0, 1]
    }));

    session.input.send(command("exit")).unwrap();
    assert_eq!(session.handle.join().unwrap().unwrap(), SessionEnd::Exit);
}

#[test]
fn test_coordinates_anchored_at_session_start() {
    let rt = Arc::new(EmulationRtSender::new(config()));
    // 会话开始前硬件已不在原点
    rt.send_command("G1 F1.000P1.000L0.000T1.000 X400Y-800Z0").unwrap();

    let session = spawn_session(rt);
    let out = session.out.clone();
    assert!(wait_until(|| out.messages().iter().any(|m| m["type"] == "coordinates")));

    let report = out
        .messages()
        .into_iter()
        .find(|m| m["type"] == "coordinates")
        .unwrap();
    assert_eq!(report["hardware"], serde_json::json!([1.0, -2.0, 0.0]));
    assert_eq!(report["global"], serde_json::json!([0.0, 0.0, 0.0]));
    assert_eq!(report["cs"], 0);

    drop(session.input);
    assert_eq!(session.handle.join().unwrap().unwrap(), SessionEnd::Disconnected);
}

#[test]
fn test_probe_resynchronizes() {
    let session = spawn_session(Arc::new(EmulationRtSender::new(config())));
    session.input.send(execute(&["{\"op\":\"probe\",\"z\":2}"])).unwrap();

    // 仿真器不会在探针处停下，Z 走完全部 -100 +5 -6；重新同步后该点对应逻辑 Z=2
    let out = session.out.clone();
    assert!(wait_until(|| {
        out.messages().iter().any(|m| {
            m["type"] == "coordinates"
                && m["hardware"][2].as_f64() == Some(-101.0)
                && m["global"][2].as_f64().is_some_and(|z| (z - 2.0).abs() < 1e-9)
        })
    }));

    session.input.send(command("exit")).unwrap();
    assert_eq!(session.handle.join().unwrap().unwrap(), SessionEnd::Exit);
}

#[test]
fn test_build_failure_keeps_session_open() {
    let session = spawn_session(Arc::new(EmulationRtSender::new(config())));

    session.input.send(execute(&["{\"op\":\"teleport\"}"])).unwrap();
    session.input.send(execute(&["{\"op\":\"fast\",\"z\":-1}"])).unwrap();

    let rt = Arc::clone(&session.rt);
    assert!(wait_until(|| rt.steps() == [0, 0, -400]));

    session.input.send(command("reset")).unwrap();
    session.input.send(command("exit")).unwrap();
    assert_eq!(session.handle.join().unwrap().unwrap(), SessionEnd::Exit);
}

#[test]
fn test_load_then_start() {
    let session = spawn_session(Arc::new(EmulationRtSender::new(config())));

    session.input.send(load(&["{\"op\":\"fast\",\"y\":2}"])).unwrap();
    thread::sleep(Duration::from_millis(100));
    // 只装载不执行
    assert_eq!(session.rt.steps(), [0, 0, 0]);

    session.input.send(command("start")).unwrap();
    let rt = Arc::clone(&session.rt);
    assert!(wait_until(|| rt.steps() == [0, 800, 0]));

    session.input.send(command("exit")).unwrap();
    assert_eq!(session.handle.join().unwrap().unwrap(), SessionEnd::Exit);
}

#[test]
fn test_continue_after_program_pause() {
    let session = spawn_session(Arc::new(EmulationRtSender::new(config())));

    session
        .input
        .send(execute(&[
            "{\"op\":\"fast\",\"x\":1}",
            "{\"op\":\"pause\"}",
            "{\"op\":\"fast\",\"x\":2}",
        ]))
        .unwrap();

    let out = session.out.clone();
    assert!(wait_until(|| reported_lines(&out) == [0, 1]));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(session.rt.steps(), [400, 0, 0]);
    assert_eq!(reported_lines(&out), [0, 1]);

    session.input.send(command("continue")).unwrap();
    let rt = Arc::clone(&session.rt);
    assert!(wait_until(|| rt.steps() == [800, 0, 0]));
    assert!(wait_until(|| reported_lines(&out) == [0, 1, 2]));

    session.input.send(command("exit")).unwrap();
    assert_eq!(session.handle.join().unwrap().unwrap(), SessionEnd::Exit);
}

#[test]
fn test_reboot_forgets_logical_position() {
    let session = spawn_session(Arc::new(EmulationRtSender::new(config())));

    session
        .input
        .send(execute(&["{\"op\":\"fast\",\"x\":10}", "{\"op\":\"lock\"}"]))
        .unwrap();
    // 第 1 行开始时第 0 行的状态已经提交
    let out = session.out.clone();
    assert!(wait_until(|| reported_lines(&out) == [0, 1]));

    session.input.send(command("reboot")).unwrap();
    session.input.send(execute(&["{\"op\":\"fast\",\"x\":1}"])).unwrap();

    // 引擎状态回到原点，绝对目标 X=1 从逻辑 0 起算
    let rt = Arc::clone(&session.rt);
    assert!(wait_until(|| rt.steps() == [4400, 0, 0]));

    session.input.send(command("exit")).unwrap();
    assert_eq!(session.handle.join().unwrap().unwrap(), SessionEnd::Exit);
}

#[test]
fn test_reset_reanchors_coordinates() {
    let session = spawn_session(Arc::new(EmulationRtSender::new(config())));

    session.input.send(execute(&["{\"op\":\"fast\",\"x\":10}"])).unwrap();
    let rt = Arc::clone(&session.rt);
    assert!(wait_until(|| rt.steps() == [4000, 0, 0]));

    let out = session.out.clone();
    assert!(wait_until(|| {
        out.messages().iter().any(|m| {
            m["type"] == "coordinates" && m["global"] == serde_json::json!([10.0, 0.0, 0.0])
        })
    }));

    session.input.send(command("reset")).unwrap();
    assert!(wait_until(|| {
        out.messages().iter().any(|m| {
            m["type"] == "coordinates"
                && m["hardware"] == serde_json::json!([10.0, 0.0, 0.0])
                && m["global"] == serde_json::json!([0.0, 0.0, 0.0])
        })
    }));

    // 复位后的新引擎从逻辑原点编译
    session.input.send(execute(&["{\"op\":\"fast\",\"x\":1}"])).unwrap();
    assert!(wait_until(|| rt.steps() == [4400, 0, 0]));

    session.input.send(command("exit")).unwrap();
    assert_eq!(session.handle.join().unwrap().unwrap(), SessionEnd::Exit);
}
