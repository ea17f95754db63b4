//! 动作程序
//!
//! 有序、只追加的 (动作, 执行前状态, 执行后状态) 序列。加入时立即克隆状态，之后调用方
//! 修改自己的活动状态不会影响已记录的历史。
//!
//! 运动辅助方法负责：
//! - 按轴限制进给和加速度
//! - 编译运动指令
//! - 用可实现的物理位移（而不是请求位移）推进状态

use crate::command::{ArcMoveCommand, LineMoveCommand, MovementOptions, RtCommand};
use crate::config::MachineParameters;
use crate::error::CompileError;
use crate::geometry::{Axis, Plane};
use crate::math::{is_negligible, Vector3, AXIS_EPSILON, MOVE_EPSILON};
use crate::state::{CncState, MoveType};
use crate::transport::ModbusToolCommand;
use std::sync::Arc;
use std::time::Duration;

/// 动作标识（程序内的序号）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub usize);

/// 作用于执行引擎本身的控制指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// 暂停，等待继续
    Pause,
    /// 结束程序
    Stop,
    /// 人工换刀
    SelectTool(u32),
    /// 请求把硬件坐标重新锚定到当前逻辑位置
    Resync,
}

/// 动作
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// 实时子系统指令（运动或控制）
    Rt(RtCommand),
    /// 工具寄存器写入
    ToolRegisters(ModbusToolCommand),
    MachineControl(ControlCommand),
    Delay(Duration),
    /// 不产生硬件动作，只承载状态变化
    Placeholder,
}

/// 程序条目
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramEntry {
    pub id: ActionId,
    pub action: Action,
    pub before: Option<CncState>,
    pub after: Option<CncState>,
}

/// 动作程序
#[derive(Debug, Clone)]
pub struct ActionProgram {
    config: Arc<MachineParameters>,
    entries: Vec<ProgramEntry>,
}

impl ActionProgram {
    pub fn new(config: Arc<MachineParameters>) -> Self {
        Self {
            config,
            entries: Vec::new(),
        }
    }

    pub fn config(&self) -> &MachineParameters {
        &self.config
    }

    pub fn entries(&self) -> &[ProgramEntry] {
        &self.entries
    }

    pub fn get(&self, id: ActionId) -> Option<&ProgramEntry> {
        self.entries.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 下一个动作将获得的标识
    pub fn next_id(&self) -> ActionId {
        ActionId(self.entries.len())
    }

    /// 追加动作，状态立即深拷贝
    pub fn add_action(
        &mut self,
        action: Action,
        before: Option<&CncState>,
        after: Option<&CncState>,
    ) -> ActionId {
        let id = self.next_id();
        self.entries.push(ProgramEntry {
            id,
            action,
            before: before.cloned(),
            after: after.cloned(),
        });
        id
    }

    /// 追加状态不变的实时指令
    pub fn add_rt_command(&mut self, command: RtCommand, state: &CncState) -> ActionId {
        self.add_action(Action::Rt(command), Some(state), Some(state))
    }

    // ========== 控制 ==========

    pub fn add_lock(&mut self, state: &CncState) {
        self.add_rt_command(RtCommand::Lock(true), state);
    }

    pub fn add_unlock(&mut self, state: &CncState) {
        self.add_rt_command(RtCommand::Lock(false), state);
    }

    /// 当前位置设为原点，返回清零后的状态
    pub fn add_set_zero(&mut self, state: &CncState) -> CncState {
        let after = state.zeroed();
        self.add_action(Action::Rt(RtCommand::SetZero), Some(state), Some(&after));
        after
    }

    pub fn add_enable_break_on_probe(&mut self, state: &CncState) {
        self.add_rt_command(RtCommand::BreakOnProbe(true), state);
    }

    pub fn add_disable_break_on_probe(&mut self, state: &CncState) {
        self.add_rt_command(RtCommand::BreakOnProbe(false), state);
    }

    pub fn add_enable_fail_on_limit(&mut self, state: &CncState) {
        self.add_rt_command(RtCommand::FailOnLimit(true), state);
    }

    pub fn add_disable_fail_on_limit(&mut self, state: &CncState) {
        self.add_rt_command(RtCommand::FailOnLimit(false), state);
    }

    /// 执行到这里时要求上层重新同步坐标
    pub fn add_resync(&mut self, state: &CncState) {
        self.add_action(
            Action::MachineControl(ControlCommand::Resync),
            Some(state),
            Some(state),
        );
    }

    // ========== 宏 ==========

    /// 单轴分阶段接近：快速全行程、慢速回退、慢速再次接近（1.2 倍回退距离）
    fn staged_approach(&self, axis: Axis, follow_invert: bool) -> [(Vector3, f64); 3] {
        let params = self.config.axis(axis);
        let mut distances = [-params.size, params.step_back, -params.step_back * 1.2];
        if follow_invert && params.invert {
            distances = distances.map(|d| -d);
        }
        let feeds = [self.config.fast_feed, self.config.slow_feed, self.config.slow_feed];

        let mut moves = [(Vector3::zeros(), 0.0); 3];
        for (i, (distance, feed)) in distances.into_iter().zip(feeds).enumerate() {
            let mut delta = Vector3::zeros();
            delta[axis.index()] = distance;
            moves[i] = (delta, feed);
        }
        moves
    }

    /// 开环探索运动，进给同样受按轴限制
    fn exploratory_line(&self, delta: Vector3, feed: f64) -> Action {
        let (max_feed, acc) = self.axis_limits(&delta.normalize());
        let options = MovementOptions::constant(feed.min(max_feed), acc);
        Action::Rt(LineMoveCommand::new(delta, options, &self.config).into())
    }

    /// 回零：依次 Z、X、Y，全部完成后设零点
    ///
    /// 各子运动预期会被限位开关截断，因此不记录状态快照，限位报错在整个过程中关闭。
    /// 返回的零点状态没有残差。
    pub fn add_homing(&mut self, state: &CncState) -> CncState {
        self.add_action(Action::Rt(RtCommand::FailOnLimit(false)), None, None);
        for axis in [Axis::Z, Axis::X, Axis::Y] {
            for (delta, feed) in self.staged_approach(axis, true) {
                let action = self.exploratory_line(delta, feed);
                self.add_action(action, None, None);
            }
        }

        let after = state.zeroed();
        self.add_action(Action::Rt(RtCommand::SetZero), None, Some(&after));
        self.add_action(Action::Rt(RtCommand::FailOnLimit(true)), None, None);
        after
    }

    /// Z 轴探测
    ///
    /// `after` 只挂在最后一段慢速接近上，这一段预期被探针触发截断。
    /// 探测后实际位置由探针决定，之前的目标不再有意义：挂上的快照和返回的状态
    /// （`after`，缺省为 `state`）都丢弃残差。
    pub fn add_z_probe(&mut self, state: &CncState, after: Option<&CncState>) -> CncState {
        let mut resolved = after.unwrap_or(state).clone();
        resolved.axis.forget_residual();

        self.add_enable_break_on_probe(state);
        self.add_action(Action::Rt(RtCommand::FailOnLimit(false)), None, None);

        let moves = self.staged_approach(Axis::Z, false);
        let last = moves.len() - 1;
        for (i, (delta, feed)) in moves.into_iter().enumerate() {
            let action = self.exploratory_line(delta, feed);
            let recorded = (i == last && after.is_some()).then_some(&resolved);
            self.add_action(action, None, recorded);
        }

        self.add_action(Action::Rt(RtCommand::BreakOnProbe(false)), None, None);
        self.add_action(Action::Rt(RtCommand::FailOnLimit(true)), None, None);
        resolved
    }

    // ========== 运动 ==========

    /// 按轴限制的 (最大进给, 最大加速度)
    ///
    /// `bound` 是每轴方向分量的绝对值上界。
    pub fn axis_limits(&self, bound: &Vector3) -> (f64, f64) {
        let mut feed = f64::MAX;
        let mut acc = f64::MAX;
        for component in bound.iter().map(|c| c.abs()) {
            if component > AXIS_EPSILON {
                feed = feed.min(self.config.max_feed / component);
                acc = acc.min(self.config.max_acceleration / component);
            }
        }
        (feed, acc)
    }

    fn record_move(
        &mut self,
        command: RtCommand,
        delta: Vector3,
        physical_delta: Vector3,
        move_type: MoveType,
        state: &CncState,
    ) -> CncState {
        let mut after = state.clone();
        after.axis.target_position = state.axis.position + delta;
        after.axis.position += physical_delta;
        after.axis.move_type = move_type;
        self.add_action(Action::Rt(command), Some(state), Some(&after));
        after
    }

    fn line(&mut self, delta: Vector3, feed: Option<f64>, state: &CncState) -> CncState {
        if is_negligible(&delta, MOVE_EPSILON) {
            return state.clone();
        }

        let (max_feed, acc) = self.axis_limits(&delta.normalize());
        let (feed, move_type) = match feed {
            Some(requested) => (requested.min(max_feed), MoveType::Line),
            None => (max_feed, MoveType::FastLine),
        };

        let options = MovementOptions::new(feed, max_feed, 0.0, acc);
        let command = LineMoveCommand::new(delta, options, &self.config);
        let physical = command.physical_delta;
        self.record_move(command.into(), delta, physical, move_type, state)
    }

    /// 直线进给运动
    pub fn add_line_movement(&mut self, delta: Vector3, feed: f64, state: &CncState) -> CncState {
        self.line(delta, Some(feed), state)
    }

    /// 快速直线运动（按轴限制的最大进给）
    pub fn add_fast_line_movement(&mut self, delta: Vector3, state: &CncState) -> CncState {
        self.line(delta, None, state)
    }

    fn arc(&mut self, mut arc: ArcMoveCommand, feed: f64, state: &CncState) -> CncState {
        let (max_feed, acc) = self.axis_limits(&arc.direction_bound());
        arc.options = MovementOptions::new(feed.min(max_feed), max_feed, 0.0, acc);

        let move_type = if arc.ccw { MoveType::ArcCcw } else { MoveType::ArcCw };
        let (delta, physical) = (arc.delta, arc.physical_delta);
        self.record_move(arc.into(), delta, physical, move_type, state)
    }

    /// 圆弧运动（半径形式，负半径取大弧）
    pub fn add_arc_movement_radius(
        &mut self,
        delta: Vector3,
        radius: f64,
        ccw: bool,
        plane: Plane,
        feed: f64,
        state: &CncState,
    ) -> Result<CncState, CompileError> {
        let arc = ArcMoveCommand::with_radius(
            delta,
            radius,
            ccw,
            plane,
            MovementOptions::default(),
            &self.config,
        )?;
        Ok(self.arc(arc, feed, state))
    }

    /// 圆弧运动（圆心形式）
    pub fn add_arc_movement_center(
        &mut self,
        delta: Vector3,
        start_to_center: Vector3,
        ccw: bool,
        plane: Plane,
        feed: f64,
        state: &CncState,
    ) -> Result<CncState, CompileError> {
        let arc = ArcMoveCommand::with_center(
            delta,
            start_to_center,
            ccw,
            plane,
            MovementOptions::default(),
            &self.config,
        )?;
        Ok(self.arc(arc, feed, state))
    }

    // ========== 工具 ==========

    pub fn add_tool_command(
        &mut self,
        command: ModbusToolCommand,
        before: &CncState,
        after: &CncState,
    ) {
        self.add_action(Action::ToolRegisters(command), Some(before), Some(after));
    }

    pub fn add_tool_change(&mut self, tool: u32) {
        self.add_action(
            Action::MachineControl(ControlCommand::SelectTool(tool)),
            None,
            None,
        );
    }

    pub fn enable_rt_tool(&mut self, tool: u32, before: &CncState, after: &CncState) {
        let command = RtCommand::Tool { tool, enabled: true };
        self.add_action(Action::Rt(command), Some(before), Some(after));
    }

    pub fn disable_rt_tool(&mut self, tool: u32, before: &CncState, after: &CncState) {
        let command = RtCommand::Tool { tool, enabled: false };
        self.add_action(Action::Rt(command), Some(before), Some(after));
    }

    // ========== 停止 ==========

    pub fn add_break(&mut self) {
        self.add_action(Action::MachineControl(ControlCommand::Pause), None, None);
    }

    pub fn add_stop(&mut self) {
        self.add_action(Action::MachineControl(ControlCommand::Stop), None, None);
    }

    // ========== 其他 ==========

    pub fn add_placeholder(&mut self, state: &CncState) {
        self.add_action(Action::Placeholder, Some(state), Some(state));
    }

    /// 纯状态变化（如切换坐标系）
    pub fn add_state_change(&mut self, before: &CncState, after: &CncState) {
        self.add_action(Action::Placeholder, Some(before), Some(after));
    }

    pub fn add_delay(&mut self, ms: u64, state: &CncState) {
        self.add_action(
            Action::Delay(Duration::from_millis(ms)),
            Some(state),
            Some(state),
        );
    }
}
