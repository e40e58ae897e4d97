// This module implements the warm entry state, the part of the JIT the interpreter talks
// to. Each call site is identified by its green key and owns a JitCell in the CellTable. A
// counting cell adds a precomputed increment per call so that exactly `threshold` calls
// cross THRESHOLD_LIMIT; crossing it (and passing the driver's confirm_enter_jit check)
// switches the cell to tracing, which refuses re-entrant tracing of the same key. A
// successful trace attaches the compiled entry to the cell; later calls run it directly.
// Running compiled code is a loop over execute_token and handle_fail: FINISH descriptors
// end the frame, resume guards either compile a bridge once they failed trace_eagerness
// times or replay in the blackhole, and GUARD_NOT_FORCED failures fetch the virtuals that
// force_now saved in the execution context. Aborted traces reset the cell; three aborts in
// a row disable it for good. The tracer and blackhole are external and receive the warm
// state mutably, so they can compile nested call sites while tracing.

//! Call-site cells and the JIT entry point.

use super::compile::{BridgeOutcome, LoopCompiler};
use super::context::{ExecutionContext, ForceToken};
use super::guard::{FailDescrId, FailureDescriptor, ResumeKind};
use super::history::{BoxRef, CompiledProcedure, DependencyId, GreenKey, History, OpCode, Operand, ProcedureTokenId};
use crate::codewriter::CallDescr;
use crate::core::{ConfigError, GcRef, JitConfig, JitError, Kind, Value, THRESHOLD_LIMIT};
use hashbrown::HashMap;
use std::fmt;

/// Aborted traces in a row after which a cell stops tracing.
pub const MAX_CONSECUTIVE_ABORTS: u32 = 3;

const MISSING_LOCATION: &str = "(no jitdriver.get_printable_location!)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellCounter {
    /// Warming up.
    Counting(u64),
    /// A compiled entry is attached.
    EntryAttached,
    /// Tracing from this cell is in progress.
    Tracing,
}

impl CellCounter {
    /// Classic encoding: the count, `-1` for an attached entry, `-2` while tracing.
    pub fn as_raw(self) -> i64 {
        match self {
            CellCounter::Counting(n) => n as i64,
            CellCounter::EntryAttached => -1,
            CellCounter::Tracing => -2,
        }
    }
}

impl Default for CellCounter {
    fn default() -> Self {
        CellCounter::Counting(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JitCell {
    pub counter: CellCounter,
    /// Calls to this green key are not inlined by the tracer.
    pub dont_trace_here: bool,
    /// Tracing from this cell gave up for good.
    pub disabled: bool,
    /// Aborted traces since the last successful one.
    pub aborts: u32,
    pub entry_token: Option<ProcedureTokenId>,
}

impl JitCell {
    /// Add `increment` to a counting cell; true once the bound is crossed.
    ///
    /// A crossing call leaves the counter untouched.
    pub fn tick(&mut self, increment: u64) -> bool {
        match self.counter {
            CellCounter::Counting(n) => {
                let next = n.saturating_add(increment);
                if next <= THRESHOLD_LIMIT {
                    self.counter = CellCounter::Counting(next);
                    false
                } else {
                    true
                }
            }
            _ => false,
        }
    }
}

/// Green key to cell map; cells are created on first lookup.
#[derive(Debug, Default)]
pub struct CellTable {
    cells: HashMap<GreenKey, JitCell>,
}

impl CellTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&mut self, greenkey: &GreenKey) -> &mut JitCell {
        self.cells.entry_ref(greenkey).or_insert_with(|| {
            log::trace!("new jit cell for {}", greenkey);
            JitCell::default()
        })
    }

    pub fn get(&self, greenkey: &GreenKey) -> Option<&JitCell> {
        self.cells.get(greenkey)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&GreenKey, &mut JitCell)> {
        self.cells.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

type LocationFn = Box<dyn Fn(&GreenKey) -> String>;
type ConfirmFn = Box<dyn Fn(&GreenKey, &[Value]) -> bool>;
type NeverInlineFn = Box<dyn Fn(&GreenKey) -> bool>;

/// Description of the interpreter loop the JIT is attached to.
pub struct JitDriver {
    pub name: String,
    pub num_greens: usize,
    pub red_kinds: Vec<Kind>,
    pub result_kind: Kind,
    /// Address of the portal runner, called by temporary callbacks.
    pub portal_runner_adr: i64,
    get_printable_location: Option<LocationFn>,
    confirm_enter_jit: Option<ConfirmFn>,
    can_never_inline: Option<NeverInlineFn>,
}

impl JitDriver {
    pub fn new(name: impl Into<String>, num_greens: usize, red_kinds: Vec<Kind>, result_kind: Kind) -> Self {
        Self {
            name: name.into(),
            num_greens,
            red_kinds,
            result_kind,
            portal_runner_adr: 0,
            get_printable_location: None,
            confirm_enter_jit: None,
            can_never_inline: None,
        }
    }

    pub fn with_printable_location(mut self, f: impl Fn(&GreenKey) -> String + 'static) -> Self {
        self.get_printable_location = Some(Box::new(f));
        self
    }

    pub fn with_confirm_enter_jit(mut self, f: impl Fn(&GreenKey, &[Value]) -> bool + 'static) -> Self {
        self.confirm_enter_jit = Some(Box::new(f));
        self
    }

    pub fn with_can_never_inline(mut self, f: impl Fn(&GreenKey) -> bool + 'static) -> Self {
        self.can_never_inline = Some(Box::new(f));
        self
    }

    pub fn with_portal_runner(mut self, adr: i64) -> Self {
        self.portal_runner_adr = adr;
        self
    }

    pub fn num_reds(&self) -> usize {
        self.red_kinds.len()
    }

    pub fn location(&self, greenkey: &GreenKey) -> String {
        match &self.get_printable_location {
            Some(f) => f(greenkey),
            None => MISSING_LOCATION.to_string(),
        }
    }

    pub fn confirm_enter_jit(&self, greenkey: &GreenKey, redargs: &[Value]) -> bool {
        self.confirm_enter_jit.as_ref().map_or(true, |f| f(greenkey, redargs))
    }

    pub fn can_never_inline(&self, greenkey: &GreenKey) -> bool {
        self.can_never_inline.as_ref().is_some_and(|f| f(greenkey))
    }

    /// Call descriptor of the portal runner for `greenkey` plus the reds.
    pub fn portal_calldescr(&self, greenkey: &GreenKey) -> CallDescr {
        let mut arg_kinds: Vec<Kind> = greenkey.0.iter().map(|c| c.kind()).collect();
        arg_kinds.extend(self.red_kinds.iter().copied());
        CallDescr {
            name: format!("{}_portal_runner", self.name),
            arg_kinds,
            result: self.result_kind,
        }
    }
}

impl fmt::Debug for JitDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitDriver")
            .field("name", &self.name)
            .field("num_greens", &self.num_greens)
            .field("red_kinds", &self.red_kinds)
            .field("result_kind", &self.result_kind)
            .finish_non_exhaustive()
    }
}

/// How a frame running compiled code ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JitExit {
    DoneWithThisFrame(Value),
    ExitFrameWithException(GcRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// Keep interpreting.
    Interpret,
    /// The frame finished in compiled code or the blackhole.
    Exit(JitExit),
}

/// What to do after a failure descriptor was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Exit(JitExit),
    /// Enter compiled code again.
    Continue { token: ProcedureTokenId, args: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// The trace outgrew `trace_limit`; `culprit` is the function that made it long.
    TooLong { culprit: Option<GreenKey> },
    BadLoop,
    Bridge,
    Escape,
    ForceQuasiImmut,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::TooLong { culprit: Some(key) } => write!(f, "trace too long (inlining {})", key),
            AbortReason::TooLong { culprit: None } => f.write_str("trace too long"),
            AbortReason::BadLoop => f.write_str("bad loop"),
            AbortReason::Bridge => f.write_str("bridge"),
            AbortReason::Escape => f.write_str("escaping virtualizable"),
            AbortReason::ForceQuasiImmut => f.write_str("forced quasi-immutable field"),
        }
    }
}

/// Result of tracing a loop.
#[derive(Debug, Clone)]
pub enum LoopTrace {
    /// The trace came back to its own loop header.
    Closed {
        history: History,
        /// First operation of the loop body in `history`.
        start: usize,
        inputargs: Vec<BoxRef>,
        jumpargs: Vec<Operand>,
        /// Runtime values of `jumpargs`.
        live_values: Vec<Value>,
    },
    /// The trace reached the loop header of `target`, which has compiled code.
    EnteredExisting {
        history: History,
        target: GreenKey,
        live_values: Vec<Value>,
    },
    /// The traced frame returned before a loop closed.
    Finished(JitExit),
    Aborted(AbortReason),
}

/// Result of tracing from a failing guard.
#[derive(Debug, Clone)]
pub enum BridgeTrace {
    /// The trace jumps to compiled code, entered with `live_values`.
    Closed { history: History, live_values: Vec<Value> },
    /// The trace ends the frame with a FINISH.
    Done { history: History, exit: JitExit },
    Aborted(AbortReason),
}

/// The tracing interpreter and the blackhole, provided by the host.
pub trait Tracer {
    fn trace_loop(&mut self, jit: &mut WarmEnterState, greenkey: &GreenKey, redargs: &[Value]) -> LoopTrace;

    fn trace_bridge(&mut self, jit: &mut WarmEnterState, descr: FailDescrId) -> BridgeTrace;

    /// Keep tracing after the optimizer stopped `partial` at a peeled label.
    fn retrace(&mut self, jit: &mut WarmEnterState, partial: &CompiledProcedure) -> LoopTrace;

    /// Finish the frame in the blackhole from the guard `descr`.
    fn resume_in_blackhole(&mut self, jit: &mut WarmEnterState, descr: FailDescrId, virtuals: Vec<Value>) -> JitExit;

    /// Finish the frame being traced in the blackhole after an abort.
    fn switch_to_blackhole(&mut self, jit: &mut WarmEnterState, reason: &AbortReason) -> JitExit;

    /// Materialize the virtuals of the frame owning GUARD_NOT_FORCED `descr`.
    fn force_virtuals(&mut self, jit: &mut WarmEnterState, descr: FailDescrId) -> Vec<Value>;
}

pub struct WarmEnterState {
    config: JitConfig,
    increment: u64,
    cells: CellTable,
    compiler: LoopCompiler,
    context: ExecutionContext,
    driver: JitDriver,
}

impl WarmEnterState {
    pub fn new(config: JitConfig, driver: JitDriver, compiler: LoopCompiler) -> Self {
        let mut state = Self {
            increment: 0,
            config,
            cells: CellTable::new(),
            compiler,
            context: ExecutionContext::new(),
            driver,
        };
        state.apply_config();
        state
    }

    fn apply_config(&mut self) {
        self.increment = self.config.increment_threshold();
        self.compiler.memmgr_mut().set_max_age(self.config.loop_longevity);
    }

    pub fn set_param(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        self.config.set_param(name, value)?;
        self.apply_config();
        Ok(())
    }

    pub fn set_user_param(&mut self, text: &str) -> Result<(), ConfigError> {
        self.config.set_user_param(text)?;
        self.apply_config();
        Ok(())
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn increment(&self) -> u64 {
        self.increment
    }

    pub fn cells(&self) -> &CellTable {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut CellTable {
        &mut self.cells
    }

    pub fn compiler(&self) -> &LoopCompiler {
        &self.compiler
    }

    pub fn compiler_mut(&mut self) -> &mut LoopCompiler {
        &mut self.compiler
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn driver(&self) -> &JitDriver {
        &self.driver
    }

    pub fn get_location_str(&self, greenkey: &GreenKey) -> String {
        self.driver.location(greenkey)
    }

    /// Entry point, called by the interpreter at every loop header.
    pub fn maybe_compile_and_run<T: Tracer>(
        &mut self,
        tracer: &mut T,
        greenkey: &GreenKey,
        redargs: &[Value],
    ) -> Result<EntryOutcome, JitError> {
        debug_assert_eq!(greenkey.0.len(), self.driver.num_greens);
        debug_assert_eq!(redargs.len(), self.driver.num_reds());
        let increment = self.increment;
        let cell = self.cells.lookup(greenkey);
        match cell.counter {
            CellCounter::Counting(_) => {
                if cell.disabled || !cell.tick(increment) {
                    return Ok(EntryOutcome::Interpret);
                }
                if !self.driver.confirm_enter_jit(greenkey, redargs) {
                    self.cells.lookup(greenkey).counter = CellCounter::Counting(0);
                    return Ok(EntryOutcome::Interpret);
                }
                self.cells.lookup(greenkey).counter = CellCounter::Tracing;
                log::debug!("start tracing at {}", self.get_location_str(greenkey));
                let result = self.trace_and_compile_loop(tracer, greenkey, redargs);
                let cell = self.cells.lookup(greenkey);
                if cell.counter == CellCounter::Tracing {
                    cell.counter = CellCounter::Counting(0);
                }
                result
            }
            CellCounter::Tracing => {
                // An outer invocation is tracing this key already.
                Ok(EntryOutcome::Interpret)
            }
            CellCounter::EntryAttached => {
                if !self.driver.confirm_enter_jit(greenkey, redargs) {
                    return Ok(EntryOutcome::Interpret);
                }
                let registry = self.compiler.registry();
                let cell = self.cells.lookup(greenkey);
                match cell.entry_token.filter(|t| registry.is_alive(*t)) {
                    Some(token) => {
                        let exit = self.run_compiled(tracer, token, redargs.to_vec())?;
                        Ok(EntryOutcome::Exit(exit))
                    }
                    None => {
                        // Freed or invalidated in the meantime.
                        cell.counter = CellCounter::Counting(0);
                        cell.entry_token = None;
                        Ok(EntryOutcome::Interpret)
                    }
                }
            }
        }
    }

    fn trace_and_compile_loop<T: Tracer>(
        &mut self,
        tracer: &mut T,
        greenkey: &GreenKey,
        redargs: &[Value],
    ) -> Result<EntryOutcome, JitError> {
        self.next_generation();
        let location = self.get_location_str(greenkey);
        let level = self.config.optimizer;
        match tracer.trace_loop(self, greenkey, redargs) {
            LoopTrace::Closed {
                history,
                start,
                inputargs,
                jumpargs,
                live_values,
            } => {
                if history.len() > self.config.trace_limit {
                    return self.abort_loop(tracer, greenkey, AbortReason::TooLong { culprit: None });
                }
                let compiled =
                    self.compiler
                        .compile_loop(&history, greenkey, start, &inputargs, &jumpargs, level, &location)?;
                let Some(token) = compiled.and_then(|target| self.compiler.target_owner(target)) else {
                    return self.abort_loop(tracer, greenkey, AbortReason::BadLoop);
                };
                self.cells.lookup(greenkey).aborts = 0;
                self.attach_procedure_to_interp(greenkey, token);
                let exit = self.run_compiled(tracer, token, live_values)?;
                Ok(EntryOutcome::Exit(exit))
            }
            LoopTrace::EnteredExisting {
                history,
                target,
                live_values,
            } => {
                if history.len() > self.config.trace_limit {
                    return self.abort_loop(tracer, greenkey, AbortReason::TooLong { culprit: None });
                }
                let resumekey = self.compiler.guards_mut().new_resume_from_interp(greenkey.clone());
                match self.compiler.compile_trace(&history, resumekey, level, &location)? {
                    BridgeOutcome::EntryBridge {
                        greenkey: origin,
                        token,
                        destination,
                    } => {
                        self.cells.lookup(greenkey).aborts = 0;
                        self.attach_procedure_to_interp(&origin, token);
                        let destination = destination.or_else(|| self.cells.get(&target).and_then(|c| c.entry_token));
                        match destination {
                            Some(dest) => Ok(EntryOutcome::Exit(self.run_compiled(tracer, dest, live_values)?)),
                            None => Err(JitError::UnexpectedDescr {
                                reason: format!("entry bridge at {} jumps nowhere", location),
                            }),
                        }
                    }
                    _ => self.abort_loop(tracer, greenkey, AbortReason::BadLoop),
                }
            }
            LoopTrace::Finished(exit) => Ok(EntryOutcome::Exit(exit)),
            LoopTrace::Aborted(reason) => self.abort_loop(tracer, greenkey, reason),
        }
    }

    fn abort_loop<T: Tracer>(
        &mut self,
        tracer: &mut T,
        greenkey: &GreenKey,
        reason: AbortReason,
    ) -> Result<EntryOutcome, JitError> {
        let location = self.get_location_str(greenkey);
        log::debug!("aborted tracing at {}: {}", location, reason);
        if let AbortReason::TooLong { culprit: Some(culprit) } = &reason {
            self.disable_noninlinable_function(culprit);
        }
        let cell = self.cells.lookup(greenkey);
        cell.counter = CellCounter::Counting(0);
        cell.aborts += 1;
        if cell.aborts >= MAX_CONSECUTIVE_ABORTS && !cell.disabled {
            cell.disabled = true;
            log::info!("disabled tracing at {} after {} aborts", location, cell.aborts);
        }
        Ok(EntryOutcome::Exit(tracer.switch_to_blackhole(self, &reason)))
    }

    fn run_compiled<T: Tracer>(
        &mut self,
        tracer: &mut T,
        mut token: ProcedureTokenId,
        mut args: Vec<Value>,
    ) -> Result<JitExit, JitError> {
        loop {
            self.compiler.keep_loop_alive(token);
            let descr = self.compiler.backend_mut().execute_token(token, &args);
            match self.handle_fail(tracer, descr)? {
                FailOutcome::Exit(exit) => return Ok(exit),
                FailOutcome::Continue { token: next, args: next_args } => {
                    token = next;
                    args = next_args;
                }
            }
        }
    }

    /// React to compiled code leaving through `descr`.
    pub fn handle_fail<T: Tracer>(&mut self, tracer: &mut T, descr: FailDescrId) -> Result<FailOutcome, JitError> {
        let Some(failure) = self.compiler.guards().get(descr).cloned() else {
            return Err(JitError::UnexpectedDescr {
                reason: format!("unknown failure descriptor {:?}", descr),
            });
        };
        match failure {
            FailureDescriptor::DoneWithFrame(kind) => {
                if kind != self.driver.result_kind {
                    return Err(JitError::ResultKindMismatch {
                        expected: self.driver.result_kind,
                        found: kind,
                    });
                }
                let backend = self.compiler.backend_mut();
                let value = backend.latest_value(0, kind);
                if kind == Kind::Ref {
                    backend.clear_latest_values(1);
                }
                Ok(FailOutcome::Exit(JitExit::DoneWithThisFrame(value)))
            }
            FailureDescriptor::ExitWithException => {
                let backend = self.compiler.backend_mut();
                let value = backend.latest_value_ref(0);
                backend.clear_latest_values(1);
                Ok(FailOutcome::Exit(JitExit::ExitFrameWithException(value)))
            }
            FailureDescriptor::PropagateException => {
                let exception = self.compiler.backend_mut().grab_exc_value();
                if exception.is_null() {
                    return Err(JitError::UnexpectedDescr {
                        reason: "exception propagated without an exception".to_string(),
                    });
                }
                Ok(FailOutcome::Exit(JitExit::ExitFrameWithException(exception)))
            }
            FailureDescriptor::GuardResume(guard) if guard.kind == ResumeKind::Forced => {
                let token = self.compiler.backend().get_latest_force_token();
                let virtuals = self.context.fetch_data(token)?;
                Ok(FailOutcome::Exit(tracer.resume_in_blackhole(self, descr, virtuals)))
            }
            FailureDescriptor::GuardResume(_) => {
                let eagerness = self.config.trace_eagerness;
                if self.compiler.must_compile(descr, eagerness) {
                    log::debug!("guard {:?} failed often enough, compiling a bridge", descr);
                    self.compiler.guards_mut().start_compiling(descr);
                    let result = self.trace_and_compile_bridge(tracer, descr);
                    self.compiler.guards_mut().done_compiling(descr);
                    result
                } else {
                    Ok(FailOutcome::Exit(tracer.resume_in_blackhole(self, descr, Vec::new())))
                }
            }
            FailureDescriptor::ResumeFromInterpreter { greenkey } => Err(JitError::UnexpectedDescr {
                reason: format!("interpreter resume key for {} reached as a guard", greenkey),
            }),
        }
    }

    fn trace_and_compile_bridge<T: Tracer>(
        &mut self,
        tracer: &mut T,
        descr: FailDescrId,
    ) -> Result<FailOutcome, JitError> {
        let level = self.config.optimizer;
        let location = format!("bridge out of {:?}", descr);
        match tracer.trace_bridge(self, descr) {
            BridgeTrace::Closed { history, live_values } => {
                if history.len() > self.config.trace_limit {
                    return self.abort_bridge(tracer, descr, AbortReason::TooLong { culprit: None });
                }
                match self.compiler.compile_trace(&history, descr, level, &location)? {
                    BridgeOutcome::Attached { token, destination } => Ok(FailOutcome::Continue {
                        token: destination.unwrap_or(token),
                        args: live_values,
                    }),
                    BridgeOutcome::EntryBridge {
                        greenkey,
                        token,
                        destination,
                    } => {
                        self.attach_procedure_to_interp(&greenkey, token);
                        Ok(FailOutcome::Continue {
                            token: destination.unwrap_or(token),
                            args: live_values,
                        })
                    }
                    BridgeOutcome::RetraceNeeded(partial) => self.retrace_from_guard(tracer, descr, partial),
                    BridgeOutcome::Aborted => self.abort_bridge(tracer, descr, AbortReason::BadLoop),
                }
            }
            BridgeTrace::Done { history, exit } => {
                if history.len() <= self.config.trace_limit {
                    match self.compiler.compile_trace(&history, descr, level, &location)? {
                        BridgeOutcome::Attached { .. } | BridgeOutcome::EntryBridge { .. } => {}
                        _ => self.compiler.guards_mut().reset_counter_from_failure(descr),
                    }
                } else {
                    self.compiler.guards_mut().reset_counter_from_failure(descr);
                }
                Ok(FailOutcome::Exit(exit))
            }
            BridgeTrace::Aborted(reason) => self.abort_bridge(tracer, descr, reason),
        }
    }

    fn retrace_from_guard<T: Tracer>(
        &mut self,
        tracer: &mut T,
        descr: FailDescrId,
        partial: CompiledProcedure,
    ) -> Result<FailOutcome, JitError> {
        let loop_token = partial
            .last_op()
            .filter(|op| op.opcode == OpCode::Label)
            .and_then(|op| op.target())
            .and_then(|target| self.compiler.target_owner(target));
        let Some(loop_token) = loop_token else {
            return self.abort_bridge(tracer, descr, AbortReason::BadLoop);
        };
        let level = self.config.optimizer;
        let location = format!("retrace from {:?}", descr);
        match tracer.retrace(self, &partial) {
            LoopTrace::Closed {
                history,
                start,
                inputargs,
                jumpargs,
                live_values,
            } => {
                let compiled = self.compiler.compile_retrace(
                    &history, loop_token, start, &inputargs, &jumpargs, partial, descr, level, &location,
                )?;
                match compiled {
                    Some(target) => Ok(FailOutcome::Continue {
                        token: self.compiler.target_owner(target).unwrap_or(loop_token),
                        args: live_values,
                    }),
                    None => self.abort_bridge(tracer, descr, AbortReason::BadLoop),
                }
            }
            LoopTrace::Finished(exit) => Ok(FailOutcome::Exit(exit)),
            LoopTrace::EnteredExisting { .. } => self.abort_bridge(tracer, descr, AbortReason::BadLoop),
            LoopTrace::Aborted(reason) => self.abort_bridge(tracer, descr, reason),
        }
    }

    fn abort_bridge<T: Tracer>(
        &mut self,
        tracer: &mut T,
        descr: FailDescrId,
        reason: AbortReason,
    ) -> Result<FailOutcome, JitError> {
        log::debug!("aborted bridge from {:?}: {}", descr, reason);
        if let AbortReason::TooLong { culprit: Some(culprit) } = &reason {
            self.disable_noninlinable_function(culprit);
        }
        self.compiler.guards_mut().reset_counter_from_failure(descr);
        Ok(FailOutcome::Exit(tracer.switch_to_blackhole(self, &reason)))
    }

    /// Make `token` the procedure run for `greenkey`.
    ///
    /// Calls through CALL_ASSEMBLER to the previous entry are redirected.
    pub fn attach_procedure_to_interp(&mut self, greenkey: &GreenKey, token: ProcedureTokenId) {
        let cell = self.cells.lookup(greenkey);
        let old = cell.entry_token.replace(token);
        cell.counter = CellCounter::EntryAttached;
        cell.aborts = 0;
        if let Some(old) = old.filter(|old| *old != token) {
            self.compiler.backend_mut().redirect_call_assembler(old, token);
            // The old token may still be the target of CALL_ASSEMBLERs.
            self.compiler.registry_mut().record_jump_to(old, token);
        }
        log::debug!("attached {:?} to {}", token, self.get_location_str(greenkey));
    }

    /// Token to CALL_ASSEMBLER for `greenkey`, compiling a temporary
    /// callback into the interpreter when no entry exists.
    pub fn get_assembler_token(&mut self, greenkey: &GreenKey) -> Result<ProcedureTokenId, JitError> {
        let registry = self.compiler.registry();
        let cell = self.cells.lookup(greenkey);
        if let Some(token) = cell.entry_token.filter(|t| registry.is_alive(*t)) {
            return Ok(token);
        }
        if cell.counter == CellCounter::EntryAttached {
            // Used to be a valid entry, freed in the meantime.
            cell.counter = CellCounter::Counting(0);
        }
        let token = self.compiler.compile_tmp_callback(&self.driver, greenkey)?;
        self.cells.lookup(greenkey).entry_token = Some(token);
        Ok(token)
    }

    pub fn can_inline_callable(&self, greenkey: &GreenKey) -> bool {
        if self.driver.can_never_inline(greenkey) {
            return false;
        }
        !self.cells.get(greenkey).is_some_and(|c| c.dont_trace_here)
    }

    pub fn disable_noninlinable_function(&mut self, greenkey: &GreenKey) {
        self.cells.lookup(greenkey).dont_trace_here = true;
        log::debug!("disabled inlining {}", self.get_location_str(greenkey));
    }

    /// Force the frame of `token` and save its virtuals for the
    /// GUARD_NOT_FORCED that will fail when the frame resumes.
    pub fn force_now<T: Tracer>(&mut self, tracer: &mut T, token: ForceToken) -> Result<(), JitError> {
        let _critical = self.context.critical_section();
        let descr = self.compiler.backend_mut().force(token);
        match self.compiler.guards().resume_guard(descr) {
            Some(guard) if guard.kind == ResumeKind::Forced => {}
            _ => {
                return Err(JitError::UnexpectedDescr {
                    reason: format!("forcing returned {:?}, not a GUARD_NOT_FORCED", descr),
                })
            }
        }
        let virtuals = tracer.force_virtuals(self, descr);
        self.context.save_data(token, virtuals)
    }

    /// Age compiled procedures; cells whose entry was freed count again.
    pub fn next_generation(&mut self) -> Vec<ProcedureTokenId> {
        let freed = self.compiler.next_generation();
        if !freed.is_empty() {
            for (_, cell) in self.cells.iter_mut() {
                if cell.entry_token.is_some_and(|t| freed.contains(&t)) {
                    cell.entry_token = None;
                    if cell.counter == CellCounter::EntryAttached {
                        cell.counter = CellCounter::Counting(0);
                    }
                }
            }
        }
        freed
    }

    pub fn invalidate_dependency(&mut self, dep: DependencyId) -> Vec<ProcedureTokenId> {
        self.compiler.invalidate_dependency(dep)
    }
}

impl fmt::Debug for WarmEnterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarmEnterState")
            .field("config", &self.config)
            .field("increment", &self.increment)
            .field("cells", &self.cells.len())
            .field("compiler", &self.compiler)
            .field("driver", &self.driver)
            .finish()
    }
}
