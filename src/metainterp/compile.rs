// This module implements the loop compiler: it turns a recorded trace into a new loop, a
// bridge attached to a failing guard, an entry bridge callable from the interpreter, or a
// signal that the trace must be retraced. Every path builds a CompiledProcedure, hands it
// to the external optimizer and, on success, to the backend. InvalidLoop from the optimizer
// aborts only the current attempt: tokens and labels minted for it are discarded from the
// registry and nothing already compiled is touched. When the optimizer peels a specialized
// preamble the result ends in a LABEL; the recorded body is then inlined once more behind
// that label through a ValueMap and optimized again, until the procedure ends in a JUMP.
// Each peeled label becomes a valid entry of the new token. After the backend accepted a
// procedure, record_loop_or_bridge stamps the owning token into every resume descriptor,
// records the jump edges the memory manager follows and registers quasi-immutable
// dependencies. The compiler also produces the temporary callback procedures used by
// CALL_ASSEMBLER before a real entry exists.

//! Loop, bridge and retrace compilation.

use super::backend::Backend;
use super::guard::{FailDescrId, FailureDescriptor, GuardFailureManager, ResumeKind};
use super::history::{
    BoxRef, CompiledProcedure, DependencyId, GreenKey, History, OpCode, OpDescr, Operand, Operation,
    ProcedureTokenId, TargetId, TokenRegistry, ValueMap,
};
use super::memmgr::MemoryManager;
use super::optimizer::{OptimizeOptions, Optimizer};
use super::warmstate::JitDriver;
use crate::core::{CompileError, CompileResult, Const, OptimizerLevel};
use std::fmt;

/// Result of compiling a trace that started at a guard or in the interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutcome {
    /// Bridge attached to the guard; `token` owns the procedure it was attached to.
    /// `destination` is the token the bridge jumps to, if it ends in a JUMP.
    Attached {
        token: ProcedureTokenId,
        destination: Option<ProcedureTokenId>,
    },
    /// New entry procedure for `greenkey`, to be attached to its cell.
    EntryBridge {
        greenkey: GreenKey,
        token: ProcedureTokenId,
        destination: Option<ProcedureTokenId>,
    },
    /// The optimizer closed the trace into a label; tracing must continue to a loop.
    RetraceNeeded(CompiledProcedure),
    /// The optimizer rejected the trace.
    Aborted,
}

/// Counters of what the compiler produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileStats {
    pub loops: usize,
    pub bridges: usize,
    pub entry_bridges: usize,
    pub retraces: usize,
    pub invalid_loops: usize,
    pub tmp_callbacks: usize,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Statistics:")?;
        writeln!(f, "  Loops: {}", self.loops)?;
        writeln!(f, "  Bridges: {}", self.bridges)?;
        writeln!(f, "  Entry bridges: {}", self.entry_bridges)?;
        writeln!(f, "  Retraces: {}", self.retraces)?;
        writeln!(f, "  Invalid loops: {}", self.invalid_loops)?;
        write!(f, "  Temporary callbacks: {}", self.tmp_callbacks)
    }
}

pub struct LoopCompiler {
    backend: Box<dyn Backend>,
    optimizer: Box<dyn Optimizer>,
    registry: TokenRegistry,
    guards: GuardFailureManager,
    memmgr: MemoryManager,
    loop_numbering: u32,
    stats: CompileStats,
}

impl LoopCompiler {
    pub fn new(backend: Box<dyn Backend>, optimizer: Box<dyn Optimizer>) -> Self {
        Self {
            backend,
            optimizer,
            registry: TokenRegistry::new(),
            guards: GuardFailureManager::new(),
            memmgr: MemoryManager::new(1000),
            loop_numbering: 0,
            stats: CompileStats::default(),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TokenRegistry {
        &mut self.registry
    }

    pub fn guards(&self) -> &GuardFailureManager {
        &self.guards
    }

    pub fn guards_mut(&mut self) -> &mut GuardFailureManager {
        &mut self.guards
    }

    pub fn memmgr(&self) -> &MemoryManager {
        &self.memmgr
    }

    pub fn memmgr_mut(&mut self) -> &mut MemoryManager {
        &mut self.memmgr
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    /// Count one failure of `descr`; true when a bridge should be compiled.
    pub fn must_compile(&mut self, descr: FailDescrId, trace_eagerness: u32) -> bool {
        self.guards.must_compile(descr, self.backend.as_ref(), trace_eagerness)
    }

    pub fn keep_loop_alive(&mut self, token: ProcedureTokenId) {
        self.memmgr.keep_loop_alive(&mut self.registry, token);
    }

    /// Start a new memory-manager generation; returns the freed tokens.
    pub fn next_generation(&mut self) -> Vec<ProcedureTokenId> {
        self.memmgr.next_generation(&mut self.registry, self.backend.as_mut())
    }

    fn optimize(
        &mut self,
        procedure: CompiledProcedure,
        options: &OptimizeOptions,
    ) -> Option<CompiledProcedure> {
        match self.optimizer.optimize_trace(procedure, options, &mut self.registry) {
            Ok(optimized) => Some(optimized),
            Err(err) => {
                log::debug!("{}", err);
                self.stats.invalid_loops += 1;
                None
            }
        }
    }

    /// Give a guard copied into a peeled body its own resume descriptor.
    fn fresh_resume_descr(&mut self, op: &mut Operation) {
        let Some(id) = op.fail_descr() else {
            return;
        };
        if let Some(kind) = self.guards.resume_guard(id).map(|g| g.kind) {
            op.descr = Some(OpDescr::Fail(self.guards.new_resume_guard(kind)));
        }
    }

    fn discard(&mut self, token: ProcedureTokenId, targets: &[TargetId]) {
        self.registry.discard(token, targets);
    }

    /// Compile `history[start..]` as a new loop for `greenkey`.
    ///
    /// Returns the first target label of the new token, or `None` when the
    /// optimizer rejected the trace; no state is kept in that case.
    #[allow(clippy::too_many_arguments)]
    pub fn compile_loop(
        &mut self,
        history: &History,
        greenkey: &GreenKey,
        start: usize,
        inputargs: &[BoxRef],
        jumpargs: &[Operand],
        level: OptimizerLevel,
        location: &str,
    ) -> CompileResult<Option<TargetId>> {
        let body = history.operations.get(start..).ok_or_else(|| CompileError::MalformedTrace {
            reason: format!("loop start {} beyond history of {} operations", start, history.len()),
        })?;
        let token = self.registry.new_token(Some(greenkey.clone()));
        let first = self.registry.new_target(None);
        let options = OptimizeOptions::new(level);

        let mut operations = Vec::with_capacity(body.len() + 2);
        operations.push(Operation::label(inputargs, first));
        operations.extend(body.iter().cloned());
        operations.push(Operation::jump(jumpargs.to_vec(), OpDescr::Token(token)));
        let part = CompiledProcedure::new(location, inputargs.to_vec(), operations);

        let mut all_targets = vec![first];
        let Some(part) = self.optimize(part, &options) else {
            self.discard(token, &all_targets);
            return Ok(None);
        };

        let mut procedure = part;
        let mut peel_inputargs: Vec<Operand> = inputargs.iter().map(|b| Operand::Box(*b)).collect();
        let mut peel_jumpargs: Vec<Operand> = jumpargs.to_vec();
        while procedure.ends_in_label() {
            let Some(label) = procedure.operations.pop() else {
                break;
            };
            let target = label.target().ok_or_else(|| CompileError::MalformedTrace {
                reason: "peeled label without a target".to_string(),
            })?;
            all_targets.push(target);

            let mut map = ValueMap::new(&peel_inputargs, &peel_jumpargs, procedure.first_free_box());
            let mut operations = Vec::with_capacity(body.len() + 2);
            operations.push(label);
            for op in body {
                let mut inlined = map.inline_op(op);
                self.fresh_resume_descr(&mut inlined);
                operations.push(inlined);
            }
            let new_jumpargs: Vec<Operand> = peel_jumpargs.iter().map(|a| map.inline_arg(a)).collect();
            operations.push(Operation::jump(new_jumpargs.clone(), OpDescr::Token(token)));
            peel_inputargs = std::mem::replace(&mut peel_jumpargs, new_jumpargs);

            let part = CompiledProcedure::new(location, procedure.inputargs.clone(), operations);
            let Some(part) = self.optimize(part, &options) else {
                self.discard(token, &all_targets);
                return Ok(None);
            };
            log::debug!("peeled preamble of {}, {} operations", location, part.operations.len());
            procedure.operations.extend(part.operations);
            procedure.add_dependencies(&part.quasi_immutable_deps);
        }

        for target in &all_targets {
            self.registry.set_target_owner(*target, token);
        }
        if let Some(t) = self.registry.token_mut(token) {
            t.target_labels = all_targets.clone();
        }

        if let Err(err) = self.send_loop_to_backend(token, &procedure, "loop", location) {
            self.discard(token, &all_targets);
            return Err(err);
        }
        self.record_loop_or_bridge(token, &procedure);
        self.stats.loops += 1;
        Ok(all_targets.first().copied())
    }

    /// Compile a loop that continues a partial trace stopped at a peeled label.
    ///
    /// The new entry is appended to the labels of `loop_token` instead of
    /// minting a token. When the optimizer rejects the body, a second
    /// attempt jumps straight back to the preamble.
    #[allow(clippy::too_many_arguments)]
    pub fn compile_retrace(
        &mut self,
        history: &History,
        loop_token: ProcedureTokenId,
        start: usize,
        inputargs: &[BoxRef],
        jumpargs: &[Operand],
        partial: CompiledProcedure,
        resumekey: FailDescrId,
        level: OptimizerLevel,
        location: &str,
    ) -> CompileResult<Option<TargetId>> {
        let body = history.operations.get(start..).ok_or_else(|| CompileError::MalformedTrace {
            reason: format!("retrace start {} beyond history of {} operations", start, history.len()),
        })?;
        let label = match partial.last_op() {
            Some(op) if op.opcode == OpCode::Label => op.clone(),
            _ => {
                return Err(CompileError::MalformedTrace {
                    reason: "partial trace does not end in a label".to_string(),
                })
            }
        };
        let target = label.target().ok_or_else(|| CompileError::MalformedTrace {
            reason: "retrace label without a target".to_string(),
        })?;
        if self.registry.token(loop_token).map_or(true, |t| t.target_labels.is_empty()) {
            return Err(CompileError::MalformedTrace {
                reason: format!("retrace into token {:?} without labels", loop_token),
            });
        }

        let mut operations = Vec::with_capacity(body.len() + 2);
        operations.push(label.clone());
        operations.extend(body.iter().cloned());
        operations.push(Operation::jump(jumpargs.to_vec(), OpDescr::Token(loop_token)));
        let part = CompiledProcedure::new(location, inputargs.to_vec(), operations);

        let part = match self.optimize(part, &OptimizeOptions::new(level)) {
            Some(part) => part,
            None => {
                // Fall back on jumping to the preamble.
                let fallback_args = inputargs.iter().map(|b| Operand::Box(*b)).collect();
                let fallback = CompiledProcedure::new(
                    location,
                    inputargs.to_vec(),
                    vec![label, Operation::jump(fallback_args, OpDescr::Token(loop_token))],
                );
                let options = OptimizeOptions {
                    inline_short_preamble: false,
                    ..OptimizeOptions::new(level)
                };
                match self.optimize(fallback, &options) {
                    Some(part) => part,
                    None => return Ok(None),
                }
            }
        };
        if part.ends_in_label() {
            return Err(CompileError::MalformedTrace {
                reason: "retraced loop still ends in a label".to_string(),
            });
        }

        let mut procedure = partial;
        procedure.operations.pop();
        procedure.operations.extend(part.operations);
        procedure.add_dependencies(&part.quasi_immutable_deps);

        let original = match self.compile_and_attach(resumekey, &procedure, location)? {
            Some(token) => token,
            None => self.original_token_of(resumekey)?,
        };
        // The label belongs to the loop it was appended to, whichever
        // procedure the retraced code was attached to.
        if let Some(t) = self.registry.token_mut(loop_token) {
            t.target_labels.push(target);
        }
        self.registry.set_target_owner(target, loop_token);
        self.record_loop_or_bridge(original, &procedure);
        self.stats.retraces += 1;
        Ok(Some(target))
    }

    /// Compile a trace recorded from a guard failure or from the interpreter.
    pub fn compile_trace(
        &mut self,
        history: &History,
        resumekey: FailDescrId,
        level: OptimizerLevel,
        location: &str,
    ) -> CompileResult<BridgeOutcome> {
        let inline_short_preamble = !matches!(
            self.guards.resume_guard(resumekey),
            Some(guard) if guard.kind == ResumeKind::AtPosition
        );
        let options = OptimizeOptions {
            inline_short_preamble,
            ..OptimizeOptions::new(level)
        };
        let trace = CompiledProcedure::new(location, history.inputargs.clone(), history.operations.clone());
        let Some(trace) = self.optimize(trace, &options) else {
            log::debug!("compile_new_bridge: got an InvalidLoop");
            return Ok(BridgeOutcome::Aborted);
        };
        if trace.ends_in_label() {
            return Ok(BridgeOutcome::RetraceNeeded(trace));
        }

        let destination = self.jump_destination(&trace);
        let entry = self.compile_and_attach(resumekey, &trace, location)?;
        match entry {
            Some(token) => {
                self.record_loop_or_bridge(token, &trace);
                let greenkey = self.registry.token(token).and_then(|t| t.greenkey.clone()).unwrap_or_default();
                Ok(BridgeOutcome::EntryBridge { greenkey, token, destination })
            }
            None => {
                let token = self.original_token_of(resumekey)?;
                self.record_loop_or_bridge(token, &trace);
                Ok(BridgeOutcome::Attached { token, destination })
            }
        }
    }

    /// Token whose code the final JUMP of `procedure` lands in.
    pub fn jump_destination(&self, procedure: &CompiledProcedure) -> Option<ProcedureTokenId> {
        let last = procedure.last_op().filter(|op| op.opcode == OpCode::Jump)?;
        match last.descr {
            Some(OpDescr::Token(token)) => Some(token),
            Some(OpDescr::Target(target)) => self.registry.target(target).and_then(|t| t.owner),
            _ => None,
        }
    }

    /// Owner of a target label.
    pub fn target_owner(&self, target: TargetId) -> Option<ProcedureTokenId> {
        self.registry.target(target).and_then(|t| t.owner)
    }

    fn original_token_of(&self, resumekey: FailDescrId) -> CompileResult<ProcedureTokenId> {
        self.guards
            .resume_guard(resumekey)
            .and_then(|g| g.original_token)
            .ok_or_else(|| CompileError::MalformedTrace {
                reason: format!("guard {:?} has no original token", resumekey),
            })
    }

    /// Dispatch on the resume key: a bridge off a guard, or a new entry
    /// procedure. Returns the new token in the second case.
    fn compile_and_attach(
        &mut self,
        resumekey: FailDescrId,
        procedure: &CompiledProcedure,
        location: &str,
    ) -> CompileResult<Option<ProcedureTokenId>> {
        match self.guards.get(resumekey) {
            Some(FailureDescriptor::GuardResume(_)) => {
                let original = self.original_token_of(resumekey)?;
                self.send_bridge_to_backend(resumekey, procedure, original, location)?;
                self.guards.mark_bridged(resumekey);
                self.stats.bridges += 1;
                Ok(None)
            }
            Some(FailureDescriptor::ResumeFromInterpreter { greenkey }) => {
                let token = self.registry.new_token(Some(greenkey.clone()));
                if let Err(err) = self.send_loop_to_backend(token, procedure, "entry bridge", location) {
                    self.discard(token, &[]);
                    return Err(err);
                }
                self.stats.entry_bridges += 1;
                Ok(Some(token))
            }
            other => Err(CompileError::MalformedTrace {
                reason: format!("cannot attach a trace to {:?}", other),
            }),
        }
    }

    /// Check that every guard has a failure descriptor and set up per-value
    /// counting for GUARD_VALUEs.
    fn prepare_guards(&mut self, operations: &[Operation]) -> CompileResult<()> {
        for (op_index, op) in operations.iter().enumerate() {
            if !op.opcode.is_guard() {
                continue;
            }
            let descr = op.fail_descr().ok_or(CompileError::MissingFailDescr { op_index })?;
            if op.opcode == OpCode::GuardValue {
                self.guards.make_a_counter_per_value(descr, op);
            }
        }
        Ok(())
    }

    fn send_loop_to_backend(
        &mut self,
        token: ProcedureTokenId,
        procedure: &CompiledProcedure,
        what: &str,
        location: &str,
    ) -> CompileResult<()> {
        self.prepare_guards(&procedure.operations)?;
        let number = self.loop_numbering;
        self.loop_numbering += 1;
        if let Some(t) = self.registry.token_mut(token) {
            t.number = Some(number);
        }
        self.backend.compile_loop(token, procedure, location)?;
        log::info!(
            "compiled new {} #{} at {} ({} operations)",
            what,
            number,
            location,
            procedure.operations.len()
        );
        log::debug!("{}", procedure);
        self.keep_loop_alive(token);
        Ok(())
    }

    fn send_bridge_to_backend(
        &mut self,
        faildescr: FailDescrId,
        procedure: &CompiledProcedure,
        original: ProcedureTokenId,
        location: &str,
    ) -> CompileResult<()> {
        self.prepare_guards(&procedure.operations)?;
        let n = self.backend.get_fail_descr_number(faildescr);
        self.backend
            .compile_bridge(faildescr, &procedure.inputargs, &procedure.operations, original)?;
        log::info!(
            "compiled new bridge out of guard {} at {} ({} operations)",
            n,
            location,
            procedure.operations.len()
        );
        log::debug!("{}", procedure);
        Ok(())
    }

    /// Bookkeeping after `procedure` of token `original` reached the backend.
    fn record_loop_or_bridge(&mut self, original: ProcedureTokenId, procedure: &CompiledProcedure) {
        for op in &procedure.operations {
            match &op.descr {
                Some(OpDescr::Fail(id)) if self.guards.is_resume_descr(*id) => {
                    self.guards.set_original_token(*id, original);
                    let n = self.backend.get_fail_descr_number(*id);
                    if let Some(t) = self.registry.token_mut(original) {
                        t.faildescr_indices.push(n);
                    }
                }
                Some(OpDescr::Token(token)) => self.registry.record_jump_to(original, *token),
                Some(OpDescr::Target(target)) => {
                    if let Some(owner) = self.registry.target(*target).and_then(|t| t.owner) {
                        self.registry.record_jump_to(original, owner);
                    }
                }
                _ => {}
            }
        }
        for dep in &procedure.quasi_immutable_deps {
            self.registry.register_dependency(*dep, original);
        }
    }

    /// Compile a procedure that just calls the portal through the interpreter.
    ///
    /// Used as the CALL_ASSEMBLER target of a green key that has no entry
    /// procedure yet; a real entry later replaces it.
    pub fn compile_tmp_callback(&mut self, driver: &JitDriver, greenkey: &GreenKey) -> CompileResult<ProcedureTokenId> {
        let token = self.registry.new_token(Some(greenkey.clone()));
        let mut history = History::new();
        let inputargs = history.set_inputargs(&driver.red_kinds);

        let mut callargs: Vec<Operand> = Vec::with_capacity(1 + greenkey.0.len() + inputargs.len());
        callargs.push(Const::Int(driver.portal_runner_adr).into());
        callargs.extend(greenkey.0.iter().map(|c| Operand::Const(*c)));
        callargs.extend(inputargs.iter().map(|b| Operand::Box(*b)));
        let result = history.record(OpCode::Call, callargs, driver.result_kind);
        if let Some(call) = history.operations.last_mut() {
            call.descr = Some(OpDescr::Call(driver.portal_calldescr(greenkey)));
        }

        let propagate = self.guards.new_propagate_exception();
        history.push(Operation::new(OpCode::GuardNoException, vec![], None).with_descr(OpDescr::Fail(propagate)));
        let done = self.guards.done_with_frame(driver.result_kind);
        let finishargs = result.map(Operand::Box).into_iter().collect();
        history.push(Operation::new(OpCode::Finish, finishargs, None).with_descr(OpDescr::Fail(done)));

        let procedure = CompiledProcedure::new("tmp callback", inputargs, history.operations);
        if let Err(err) = self.backend.compile_loop(token, &procedure, "tmp callback") {
            self.discard(token, &[]);
            return Err(err);
        }
        log::debug!("compiled temporary callback for {}", greenkey);
        self.keep_loop_alive(token);
        self.stats.tmp_callbacks += 1;
        Ok(token)
    }

    /// A quasi-immutable field changed: invalidate every token depending on it.
    pub fn invalidate_dependency(&mut self, dep: DependencyId) -> Vec<ProcedureTokenId> {
        let invalidated = self.registry.invalidate_dependency(dep);
        for token in &invalidated {
            log::info!("invalidated loop {:?}", token);
            self.backend.invalidate_loop(*token);
        }
        invalidated
    }
}

impl fmt::Debug for LoopCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopCompiler")
            .field("tokens", &self.registry.len())
            .field("descrs", &self.guards.len())
            .field("loop_numbering", &self.loop_numbering)
            .field("stats", &self.stats)
            .finish()
    }
}
