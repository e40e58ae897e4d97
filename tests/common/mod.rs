//! Shared fixtures: a recording backend, a scripted optimizer and a scripted tracer.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracejit::core::{CompileError, CompileResult, GcRef, InvalidLoop, JitConfig, Kind, Value};
use tracejit::metainterp::{
    AbortReason, Backend, BoxRef, BridgeTrace, CompiledProcedure, FailDescrId, ForceToken, GreenKey, History,
    JitDriver, JitExit, LoopCompiler, LoopTrace, OpCode, OpDescr, Operand, OptimizeOptions, Operation, Optimizer,
    ProcedureTokenId, ResumeKind, TokenRegistry, Tracer, WarmEnterState,
};
use tracejit::Const;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Everything the recording backend saw, shared with the test.
#[derive(Debug, Default)]
pub struct BackendState {
    pub loops: Vec<(ProcedureTokenId, CompiledProcedure, String)>,
    pub bridges: Vec<(FailDescrId, Vec<Operation>, ProcedureTokenId)>,
    pub redirected: Vec<(ProcedureTokenId, ProcedureTokenId)>,
    pub invalidated: Vec<ProcedureTokenId>,
    pub freed: Vec<ProcedureTokenId>,
    pub executed: Vec<(ProcedureTokenId, Vec<Value>)>,
    /// Scripted results of `execute_token`, consumed in order.
    pub exits: VecDeque<(FailDescrId, Vec<Value>)>,
    pub latest: Vec<Value>,
    pub cleared: usize,
    pub exception: GcRef,
    pub force_token: ForceToken,
    pub forced_descr: Option<FailDescrId>,
    pub reject_loops: bool,
}

#[derive(Clone)]
pub struct RecordingBackend {
    pub state: Rc<RefCell<BackendState>>,
}

impl RecordingBackend {
    pub fn new() -> (Self, Rc<RefCell<BackendState>>) {
        let state = Rc::new(RefCell::new(BackendState::default()));
        (Self { state: Rc::clone(&state) }, state)
    }

    fn latest(&self, index: usize) -> Value {
        self.state.borrow().latest.get(index).copied().unwrap_or(Value::Void)
    }
}

impl Backend for RecordingBackend {
    fn compile_loop(&mut self, token: ProcedureTokenId, procedure: &CompiledProcedure, name: &str) -> CompileResult<()> {
        let mut state = self.state.borrow_mut();
        if state.reject_loops {
            return Err(CompileError::Backend {
                reason: "rejected".into(),
            });
        }
        state.loops.push((token, procedure.clone(), name.to_string()));
        Ok(())
    }

    fn compile_bridge(
        &mut self,
        faildescr: FailDescrId,
        _inputargs: &[BoxRef],
        operations: &[Operation],
        original_token: ProcedureTokenId,
    ) -> CompileResult<()> {
        self.state
            .borrow_mut()
            .bridges
            .push((faildescr, operations.to_vec(), original_token));
        Ok(())
    }

    fn get_fail_descr_number(&mut self, faildescr: FailDescrId) -> u32 {
        faildescr.0
    }

    fn redirect_call_assembler(&mut self, old: ProcedureTokenId, new: ProcedureTokenId) {
        self.state.borrow_mut().redirected.push((old, new));
    }

    fn execute_token(&mut self, token: ProcedureTokenId, args: &[Value]) -> FailDescrId {
        let mut state = self.state.borrow_mut();
        state.executed.push((token, args.to_vec()));
        let (descr, values) = state
            .exits
            .pop_front()
            .unwrap_or((FailDescrId(1), vec![Value::Int(0)]));
        state.latest = values;
        descr
    }

    fn latest_value_int(&self, index: usize) -> i64 {
        self.latest(index).as_int().unwrap_or(0)
    }

    fn latest_value_ref(&self, index: usize) -> GcRef {
        self.latest(index).as_gcref().unwrap_or(GcRef::NULL)
    }

    fn latest_value_float(&self, index: usize) -> f64 {
        self.latest(index).as_float().unwrap_or(0.0)
    }

    fn clear_latest_values(&mut self, count: usize) {
        self.state.borrow_mut().cleared += count;
    }

    fn grab_exc_value(&mut self) -> GcRef {
        std::mem::take(&mut self.state.borrow_mut().exception)
    }

    fn get_latest_force_token(&self) -> ForceToken {
        self.state.borrow().force_token
    }

    fn force(&mut self, token: ForceToken) -> FailDescrId {
        let mut state = self.state.borrow_mut();
        state.force_token = token;
        state.forced_descr.unwrap_or(FailDescrId(0))
    }

    fn invalidate_loop(&mut self, token: ProcedureTokenId) {
        self.state.borrow_mut().invalidated.push(token);
    }

    fn free_loop(&mut self, token: ProcedureTokenId) {
        self.state.borrow_mut().freed.push(token);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptStep {
    Keep,
    Invalid,
    /// Turn the final JUMP into a LABEL, as if a preamble was peeled.
    Peel,
}

/// Optimizer following a script; keeps traces unchanged once it runs out.
#[derive(Clone, Default)]
pub struct ScriptedOptimizer {
    pub steps: Rc<RefCell<VecDeque<OptStep>>>,
    pub seen: Rc<RefCell<Vec<(CompiledProcedure, OptimizeOptions)>>>,
}

impl ScriptedOptimizer {
    pub fn new(steps: &[OptStep]) -> Self {
        let opt = Self::default();
        opt.steps.borrow_mut().extend(steps.iter().copied());
        opt
    }
}

impl Optimizer for ScriptedOptimizer {
    fn optimize_trace(
        &mut self,
        mut procedure: CompiledProcedure,
        options: &OptimizeOptions,
        registry: &mut TokenRegistry,
    ) -> Result<CompiledProcedure, InvalidLoop> {
        self.seen.borrow_mut().push((procedure.clone(), *options));
        let step = self.steps.borrow_mut().pop_front().unwrap_or(OptStep::Keep);
        match step {
            OptStep::Keep => Ok(procedure),
            OptStep::Invalid => Err(InvalidLoop::new("scripted")),
            OptStep::Peel => {
                let jump = procedure
                    .operations
                    .pop()
                    .filter(|op| op.opcode == OpCode::Jump)
                    .ok_or_else(|| InvalidLoop::new("nothing to peel"))?;
                let target = registry.new_target(None);
                procedure
                    .operations
                    .push(Operation::new(OpCode::Label, jump.args, None).with_descr(OpDescr::Target(target)));
                Ok(procedure)
            }
        }
    }
}

pub type LoopStep = Box<dyn FnMut(&mut WarmEnterState) -> LoopTrace>;
pub type BridgeStep = Box<dyn FnMut(&mut WarmEnterState, FailDescrId) -> BridgeTrace>;

/// Tracer answering from queues of closures.
#[derive(Default)]
pub struct ScriptedTracer {
    pub loops: VecDeque<LoopStep>,
    pub bridges: VecDeque<BridgeStep>,
    pub retraces: VecDeque<LoopStep>,
    pub traced: Vec<GreenKey>,
    pub blackholed: Vec<(FailDescrId, Vec<Value>)>,
    pub aborts: Vec<AbortReason>,
    pub virtuals: Vec<Value>,
}

/// Exit returned by the scripted blackhole.
pub const BLACKHOLE_EXIT: JitExit = JitExit::DoneWithThisFrame(Value::Int(-1));

impl ScriptedTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_loop(&mut self, step: impl FnMut(&mut WarmEnterState) -> LoopTrace + 'static) {
        self.loops.push_back(Box::new(step));
    }

    pub fn on_bridge(&mut self, step: impl FnMut(&mut WarmEnterState, FailDescrId) -> BridgeTrace + 'static) {
        self.bridges.push_back(Box::new(step));
    }

    pub fn on_retrace(&mut self, step: impl FnMut(&mut WarmEnterState) -> LoopTrace + 'static) {
        self.retraces.push_back(Box::new(step));
    }
}

impl Tracer for ScriptedTracer {
    fn trace_loop(&mut self, jit: &mut WarmEnterState, greenkey: &GreenKey, _redargs: &[Value]) -> LoopTrace {
        self.traced.push(greenkey.clone());
        match self.loops.pop_front() {
            Some(mut step) => step(jit),
            None => LoopTrace::Aborted(AbortReason::BadLoop),
        }
    }

    fn trace_bridge(&mut self, jit: &mut WarmEnterState, descr: FailDescrId) -> BridgeTrace {
        match self.bridges.pop_front() {
            Some(mut step) => step(jit, descr),
            None => BridgeTrace::Aborted(AbortReason::Bridge),
        }
    }

    fn retrace(&mut self, jit: &mut WarmEnterState, _partial: &CompiledProcedure) -> LoopTrace {
        match self.retraces.pop_front() {
            Some(mut step) => step(jit),
            None => LoopTrace::Aborted(AbortReason::BadLoop),
        }
    }

    fn resume_in_blackhole(&mut self, _jit: &mut WarmEnterState, descr: FailDescrId, virtuals: Vec<Value>) -> JitExit {
        self.blackholed.push((descr, virtuals));
        BLACKHOLE_EXIT
    }

    fn switch_to_blackhole(&mut self, _jit: &mut WarmEnterState, reason: &AbortReason) -> JitExit {
        self.aborts.push(reason.clone());
        BLACKHOLE_EXIT
    }

    fn force_virtuals(&mut self, _jit: &mut WarmEnterState, _descr: FailDescrId) -> Vec<Value> {
        self.virtuals.clone()
    }
}

pub fn key(n: i64) -> GreenKey {
    GreenKey(vec![Const::Int(n)])
}

/// Loop body `i1 = i0 + 1; guard_true(i1 < limit) [i1]; jump(i1)`.
///
/// The guard gets a fresh resume descriptor from `jit`'s compiler.
pub fn counting_loop(compiler: &mut LoopCompiler, limit: i64) -> (History, FailDescrId) {
    let mut history = History::new();
    let inputs = history.set_inputargs(&[Kind::Int]);
    let i0 = inputs[0];
    let i1 = history
        .record(OpCode::IntAdd, vec![i0.into(), Const::Int(1).into()], Kind::Int)
        .unwrap();
    let cond = history
        .record(OpCode::IntLt, vec![i1.into(), Const::Int(limit).into()], Kind::Int)
        .unwrap();
    let guard = compiler.guards_mut().new_resume_guard(ResumeKind::Plain);
    history.push(
        Operation::new(OpCode::GuardTrue, vec![cond.into()], None)
            .with_descr(OpDescr::Fail(guard))
            .with_fail_args(vec![i1]),
    );
    (history, guard)
}

/// A closed loop trace over [`counting_loop`].
pub fn closed_counting_loop(jit: &mut WarmEnterState, limit: i64) -> (LoopTrace, FailDescrId) {
    let (history, guard) = counting_loop(jit.compiler_mut(), limit);
    let inputargs = history.inputargs.clone();
    let i1 = history.operations[0].result.unwrap();
    let trace = LoopTrace::Closed {
        history,
        start: 0,
        inputargs,
        jumpargs: vec![Operand::Box(i1)],
        live_values: vec![Value::Int(1)],
    };
    (trace, guard)
}

pub struct Harness {
    pub jit: WarmEnterState,
    pub backend: Rc<RefCell<BackendState>>,
    pub optimizer: ScriptedOptimizer,
}

/// Warm state over the recording backend with `params` applied to the defaults.
pub fn harness(params: &str, steps: &[OptStep]) -> Harness {
    let (backend, state) = RecordingBackend::new();
    let optimizer = ScriptedOptimizer::new(steps);
    let compiler = LoopCompiler::new(Box::new(backend), Box::new(optimizer.clone()));
    let mut config = JitConfig::default();
    config.set_user_param(params).unwrap();
    let driver = JitDriver::new("test", 1, vec![Kind::Int], Kind::Int).with_portal_runner(0x1000);
    Harness {
        jit: WarmEnterState::new(config, driver, compiler),
        backend: state,
        optimizer,
    }
}
