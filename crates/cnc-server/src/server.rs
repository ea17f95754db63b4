//! 会话编排
//!
//! 一个客户端会话内有三条线程：
//! - 命令接收：解码客户端消息，转换为内部指令放入队列
//! - 状态轮询：`StatusMachine`，把硬件坐标换算后推送给客户端
//! - 分发（调用 `run` 的线程）：从队列取指令，驱动执行引擎
//!
//! 硬件坐标系 `hw_cs` 满足 `hw = sign * logical + offset`，只在轮询停止时由分发线程改写。

use crate::builder::ProgramBuilder;
use crate::error::ServerError;
use crate::executor::{EventHandler, Machine, MachineEvent, MachineFactory};
use crate::protocol::{ClientCommand, MessageReceiver, MessageSender, ServerMessage};
use crate::status::{StatusCallback, StatusMachine, StatusReport};
use crate::{lock, read, write};
use cnc_core::config::MachineParameters;
use cnc_core::geometry::CoordinateSystem;
use cnc_core::math::Vector3;
use cnc_core::program::ActionId;
use cnc_core::transport::RtSender;
use crossbeam::channel::{self, Receiver, Sender};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use tracing::{debug, error, info, warn};

/// 会话结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 客户端要求退出服务
    Exit,
    /// 客户端断开（主动或连接关闭），服务可以等待下一个客户端
    Disconnected,
}

/// 分发线程的内部指令
enum Internal {
    Start(Vec<String>),
    Continue,
    Reset,
    Reboot,
    Resync,
    Finish(SessionEnd),
    Fail(ServerError),
}

type Responder = Arc<Mutex<MessageSender<Box<dyn Write + Send>>>>;

fn respond(responder: &Responder, message: &ServerMessage) {
    if let Err(e) = lock(responder).send(message) {
        warn!("Failed to send message: {}", e);
    }
}

fn triple(v: &Vector3) -> [f64; 3] {
    [v.x, v.y, v.z]
}

/// G-code 服务会话
pub struct GCodeServer {
    config: Arc<MachineParameters>,
    builder: Arc<dyn ProgramBuilder>,
    factory: MachineFactory,
    machine: Arc<RwLock<Arc<dyn Machine>>>,
    status: StatusMachine,
    hw_cs: Arc<RwLock<CoordinateSystem>>,
    responder: Responder,
    starts: Arc<Mutex<HashMap<ActionId, usize>>>,
    commands: Sender<Internal>,
    queue: Receiver<Internal>,
}

impl GCodeServer {
    pub fn new(
        config: Arc<MachineParameters>,
        rt: Arc<dyn RtSender>,
        builder: Arc<dyn ProgramBuilder>,
        factory: MachineFactory,
        writer: impl Write + Send + 'static,
    ) -> Self {
        let machine = Arc::new(RwLock::new(factory()));
        let hw_cs = Arc::new(RwLock::new(CoordinateSystem::default()));
        let writer: Box<dyn Write + Send> = Box::new(writer);
        let responder = Arc::new(Mutex::new(MessageSender::new(writer)));

        let callback = status_callback(Arc::clone(&machine), Arc::clone(&hw_cs), Arc::clone(&responder));
        let status = StatusMachine::new(rt, &config, callback);
        let (commands, queue) = channel::unbounded();

        let server = Self {
            config,
            builder,
            factory,
            machine,
            status,
            hw_cs,
            responder,
            starts: Arc::new(Mutex::new(HashMap::new())),
            commands,
            queue,
        };
        server.machine().set_event_handler(server.event_handler());
        server
    }

    fn machine(&self) -> Arc<dyn Machine> {
        Arc::clone(&read(&self.machine))
    }

    fn event_handler(&self) -> EventHandler {
        let starts = Arc::clone(&self.starts);
        let responder = Arc::clone(&self.responder);
        let commands = self.commands.clone();

        Arc::new(move |event| match event {
            MachineEvent::ActionStarted(id) => {
                let line = lock(&starts).get(&id).copied();
                if let Some(line) = line {
                    respond(&responder, &ServerMessage::Line { line });
                }
            }
            MachineEvent::ResyncRequested => {
                let _ = commands.send(Internal::Resync);
            }
            MachineEvent::Finished => debug!("Machine reported program end"),
            MachineEvent::Failed { id, error } => {
                warn!("Execution paused at action {}: {}", id.0, error);
            }
        })
    }

    /// 以引擎当前逻辑位置重新锚定硬件坐标系
    ///
    /// 调用前必须停止状态轮询。
    pub fn resync(&self) {
        let hardware = self.status.read_hardware_coordinates();
        let logical = self.machine().last_state().axis.position;
        let cs = CoordinateSystem::anchored(&hardware, &logical, self.config.signs());
        info!(
            "Coordinates synchronized: hardware {:?}, logical {:?}, offset {:?}",
            triple(&hardware),
            triple(&logical),
            triple(&cs.offset)
        );
        *write(&self.hw_cs) = cs;
    }

    fn install_machine(&self, machine: Arc<dyn Machine>) {
        machine.set_event_handler(self.event_handler());
        let old = std::mem::replace(&mut *write(&self.machine), machine);
        drop(old);
    }

    fn start_program(&self, lines: &[String]) {
        let machine = self.machine();
        let built = match self.builder.build(lines, &machine.last_state()) {
            Ok(built) => built,
            Err(e) => {
                error!("Program compilation failed: {}", e);
                return;
            }
        };

        info!("Starting program: {} lines, {} actions", lines.len(), built.program.len());
        *lock(&self.starts) = built.starts;
        machine.load_program(built.program);
        machine.start();
        machine.resume();
    }

    fn reset(&self) {
        info!("Resetting machine");
        self.status.stop();
        self.machine().abort();
        self.install_machine((self.factory)());
        lock(&self.starts).clear();
        self.resync();
        self.status.start();
    }

    fn handle_resync(&self) {
        self.status.stop();
        self.resync();
        self.status.start();
        self.machine().resume();
    }

    fn dispatch(&self) -> Result<SessionEnd, ServerError> {
        loop {
            let Ok(command) = self.queue.recv() else {
                return Ok(SessionEnd::Disconnected);
            };
            match command {
                Internal::Start(lines) => self.start_program(&lines),
                Internal::Continue => self.machine().resume(),
                Internal::Reset => self.reset(),
                Internal::Reboot => self.machine().reboot(),
                Internal::Resync => self.handle_resync(),
                Internal::Finish(end) => return Ok(end),
                Internal::Fail(e) => {
                    error!("Session terminated: {}", e);
                    return Err(e);
                }
            }
        }
    }

    fn shutdown(&self) {
        self.status.stop();
        self.machine().stop();
    }

    /// 运行会话直到客户端退出、断开或协议错误
    pub fn run(self, reader: impl BufRead + Send + 'static) -> Result<SessionEnd, ServerError> {
        self.resync();
        self.status.start();

        let commands = self.commands.clone();
        let receiver = thread::spawn(move || receive_loop(MessageReceiver::new(reader), &commands));

        let result = self.dispatch();
        self.shutdown();
        if receiver.join().is_err() {
            warn!("Command receiver panicked");
        }
        result
    }
}

fn status_callback(
    machine: Arc<RwLock<Arc<dyn Machine>>>,
    hw_cs: Arc<RwLock<CoordinateSystem>>,
    responder: Responder,
) -> StatusCallback {
    Arc::new(move |report: StatusReport| {
        let hardware = report.hardware;
        let global = read(&hw_cs).to_local(&hardware);
        let current = Arc::clone(&read(&machine));
        let (local, cs) = current.convert_coordinates(&global);

        respond(
            &responder,
            &ServerMessage::Coordinates {
                hardware: triple(&hardware),
                global: triple(&global),
                local: triple(&local),
                cs,
            },
        );
    })
}

fn receive_loop<R: BufRead>(mut receiver: MessageReceiver<R>, commands: &Sender<Internal>) {
    let mut loaded: Vec<String> = Vec::new();

    let end = loop {
        let request = match receiver.receive() {
            Ok(Some(request)) => request,
            Ok(None) => {
                info!("Client stream closed");
                break Internal::Finish(SessionEnd::Disconnected);
            }
            Err(e) => break Internal::Fail(e),
        };

        let command = match request.into_command() {
            Ok(command) => command,
            Err(e) => break Internal::Fail(e),
        };

        let internal = match command {
            ClientCommand::Exit => break Internal::Finish(SessionEnd::Exit),
            ClientCommand::Disconnect => break Internal::Finish(SessionEnd::Disconnected),
            ClientCommand::Reboot => Internal::Reboot,
            ClientCommand::Reset => Internal::Reset,
            ClientCommand::Pause => {
                debug!("Pause request ignored");
                continue;
            }
            ClientCommand::Load(lines) => {
                info!("Program received: {} lines", lines.len());
                loaded = lines;
                continue;
            }
            ClientCommand::Continue => Internal::Continue,
            ClientCommand::Start => Internal::Start(loaded.clone()),
            ClientCommand::Execute(lines) => Internal::Start(lines),
        };

        if commands.send(internal).is_err() {
            return;
        }
    };

    let _ = commands.send(end);
}
