//! 动作程序执行引擎
//!
//! 单个工作线程按顺序执行程序条目。控制状态（程序、游标、运行状态）由一把互斥锁保护，
//! 状态变化通过条件变量唤醒工作线程；执行动作时不持有控制锁。

use crate::{lock, read, write};
use cnc_core::math::Vector3;
use cnc_core::program::{Action, ActionId, ActionProgram, ControlCommand, ProgramEntry};
use cnc_core::state::CncState;
use cnc_core::transport::{ModbusSender, RtSender};
use cnc_core::TransportError;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// 引擎事件
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    /// 开始执行某个动作
    ActionStarted(ActionId),
    /// 执行到重新同步动作，引擎已暂停，等待上层同步坐标后继续
    ResyncRequested,
    /// 程序执行完毕
    Finished,
    /// 动作执行失败，引擎已暂停
    Failed { id: ActionId, error: String },
}

pub type EventHandler = Arc<dyn Fn(MachineEvent) + Send + Sync>;

/// 执行引擎工厂，复位时用来重建引擎
pub type MachineFactory = Box<dyn Fn() -> Arc<dyn Machine> + Send + Sync>;

/// 执行引擎接口
pub trait Machine: Send + Sync {
    /// 装载程序（替换当前程序，游标归零）
    fn load_program(&self, program: ActionProgram);
    fn start(&self);
    fn resume(&self);
    fn pause(&self);
    fn stop(&self);
    fn abort(&self);
    fn reboot(&self);
    /// 最近一个已完成动作之后的状态
    fn last_state(&self) -> CncState;
    fn set_event_handler(&self, handler: EventHandler);

    /// 全局坐标 -> (当前坐标系下的坐标, 坐标系序号)
    fn convert_coordinates(&self, global: &Vector3) -> (Vector3, usize) {
        let state = self.last_state();
        (state.axis.to_local(global), state.axis.coordinate_system_index)
    }
}

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// 没有程序
    Idle,
    /// 已装载，尚未开始
    Ready,
    Running,
    Paused,
    Finished,
}

struct Control {
    program: Option<Arc<ActionProgram>>,
    cursor: usize,
    run: RunState,
    shutdown: bool,
}

enum Next {
    Entry(Arc<ActionProgram>, usize),
    Finished,
    Shutdown,
}

struct Shared {
    rt: Arc<dyn RtSender>,
    modbus: Arc<dyn ModbusSender>,
    control: Mutex<Control>,
    wake: Condvar,
    state: Mutex<CncState>,
    handler: RwLock<Option<EventHandler>>,
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        lock(&self.control)
    }

    fn emit(&self, event: MachineEvent) {
        let handler = read(&self.handler).clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn next(&self) -> Next {
        let mut control = self.control();
        loop {
            if control.shutdown {
                return Next::Shutdown;
            }
            if control.run == RunState::Running {
                match control.program.clone() {
                    Some(program) if control.cursor < program.len() => {
                        let index = control.cursor;
                        control.cursor += 1;
                        return Next::Entry(program, index);
                    }
                    _ => {
                        control.run = RunState::Finished;
                        return Next::Finished;
                    }
                }
            }
            control = self.wake.wait(control).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn set_run(&self, from: RunState, to: RunState) {
        let mut control = self.control();
        if control.run == from {
            control.run = to;
            self.wake.notify_all();
        }
    }

    /// 可被暂停/停止打断的等待
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut control = self.control();
        while control.run == RunState::Running && !control.shutdown {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            control = match self.wake.wait_timeout(control, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn perform(&self, action: &Action) -> Result<(), TransportError> {
        match action {
            Action::Rt(command) => {
                let response = self.rt.send(command)?;
                debug!("RT {} -> {:?}", command.command(), response);
            }
            Action::ToolRegisters(command) => {
                self.modbus.write_registers(&command.registers)?;
                self.sleep(command.delay);
            }
            Action::Delay(duration) => self.sleep(*duration),
            Action::MachineControl(_) | Action::Placeholder => {}
        }
        Ok(())
    }

    fn execute(&self, entry: &ProgramEntry) {
        self.emit(MachineEvent::ActionStarted(entry.id));

        if let Err(e) = self.perform(&entry.action) {
            error!("Action {} failed: {}", entry.id.0, e);
            self.set_run(RunState::Running, RunState::Paused);
            self.emit(MachineEvent::Failed {
                id: entry.id,
                error: e.to_string(),
            });
            return;
        }

        if let Some(after) = &entry.after {
            *lock(&self.state) = after.clone();
        }

        if let Action::MachineControl(control) = &entry.action {
            match control {
                ControlCommand::Pause => {
                    info!("Program paused at action {}", entry.id.0);
                    self.set_run(RunState::Running, RunState::Paused);
                }
                ControlCommand::Stop => {
                    info!("Program stopped at action {}", entry.id.0);
                    let mut control = self.control();
                    if let Some(len) = control.program.as_ref().map(|p| p.len()) {
                        control.cursor = len;
                    }
                }
                ControlCommand::SelectTool(tool) => {
                    info!("Insert tool {} and continue", tool);
                    self.set_run(RunState::Running, RunState::Paused);
                }
                ControlCommand::Resync => {
                    self.set_run(RunState::Running, RunState::Paused);
                    self.emit(MachineEvent::ResyncRequested);
                }
            }
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        match shared.next() {
            Next::Entry(program, index) => shared.execute(&program.entries()[index]),
            Next::Finished => {
                info!("Program finished");
                shared.emit(MachineEvent::Finished);
            }
            Next::Shutdown => break,
        }
    }
    debug!("Executor worker exited");
}

/// 顺序执行引擎
pub struct ProgramExecutor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProgramExecutor {
    pub fn new(rt: Arc<dyn RtSender>, modbus: Arc<dyn ModbusSender>) -> Self {
        Self::with_state(rt, modbus, CncState::default())
    }

    pub fn with_state(rt: Arc<dyn RtSender>, modbus: Arc<dyn ModbusSender>, state: CncState) -> Self {
        Self {
            shared: Arc::new(Shared {
                rt,
                modbus,
                control: Mutex::new(Control {
                    program: None,
                    cursor: 0,
                    run: RunState::Idle,
                    shutdown: false,
                }),
                wake: Condvar::new(),
                state: Mutex::new(state),
                handler: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// 共享同一组传输连接的引擎工厂
    pub fn factory(rt: Arc<dyn RtSender>, modbus: Arc<dyn ModbusSender>) -> MachineFactory {
        Box::new(move || {
            Arc::new(ProgramExecutor::new(Arc::clone(&rt), Arc::clone(&modbus))) as Arc<dyn Machine>
        })
    }

    pub fn run_state(&self) -> RunState {
        self.shared.control().run
    }

    fn clear(&self) {
        let mut control = self.shared.control();
        control.program = None;
        control.cursor = 0;
        control.run = RunState::Idle;
        self.shared.wake.notify_all();
    }
}

impl Machine for ProgramExecutor {
    fn load_program(&self, program: ActionProgram) {
        info!("Loaded program with {} actions", program.len());
        let mut control = self.shared.control();
        control.program = Some(Arc::new(program));
        control.cursor = 0;
        control.run = RunState::Ready;
        self.shared.wake.notify_all();
    }

    fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_none() {
            let shared = Arc::clone(&self.shared);
            *worker = Some(thread::spawn(move || run_worker(shared)));
        }
    }

    fn resume(&self) {
        let mut control = self.shared.control();
        match control.run {
            RunState::Ready | RunState::Paused => {
                control.run = RunState::Running;
                self.shared.wake.notify_all();
            }
            other => debug!("Resume ignored in state {:?}", other),
        }
    }

    fn pause(&self) {
        self.shared.set_run(RunState::Running, RunState::Paused);
    }

    fn stop(&self) {
        info!("Execution stopped");
        self.clear();
    }

    fn abort(&self) {
        warn!("Execution aborted");
        self.clear();
    }

    fn reboot(&self) {
        info!("Executor reboot: program discarded, state reset");
        self.clear();
        *lock(&self.shared.state) = CncState::default();
    }

    fn last_state(&self) -> CncState {
        lock(&self.shared.state).clone()
    }

    fn set_event_handler(&self, handler: EventHandler) {
        *write(&self.shared.handler) = Some(handler);
    }
}

impl Drop for ProgramExecutor {
    fn drop(&mut self) {
        {
            let mut control = self.shared.control();
            control.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                warn!("Executor worker panicked");
            }
        }
    }
}
