// This module holds the data model shared by the tracer, the loop compiler and the guard
// failure machinery. A History is the linear record of operations produced while tracing;
// boxes are placeholders for runtime values, constants are known at compile time. A
// CompiledProcedure is what the optimizer and backend see: input boxes plus an operation
// list ending with a JUMP or FINISH (loops also start with a LABEL). Procedure tokens identify a
// family of compiled procedures (one per loop or entry bridge) and own the target labels
// that jumps may land on. Instead of weak references, tokens and labels live in a
// TokenRegistry keyed by monotonically increasing ids; the memory manager retires tokens
// through the registry and every lookup tolerates ids that are gone. ValueMap is the
// explicit old-to-new box substitution used when a loop body is inlined after a peeled
// preamble: it produces fresh operations and never mutates the originals.

//! Traces, compiled procedures and procedure tokens.

use super::guard::FailDescrId;
use crate::codewriter::{CallDescr, FieldDescr};
use crate::core::{Const, Kind};
use hashbrown::{HashMap, HashSet};
use std::fmt;

/// A runtime value placeholder in a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxRef {
    pub id: u32,
    pub kind: Kind,
}

impl fmt::Display for BoxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.letter(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Box(BoxRef),
    Const(Const),
}

impl Operand {
    pub fn kind(&self) -> Kind {
        match self {
            Operand::Box(b) => b.kind,
            Operand::Const(c) => c.kind(),
        }
    }

    pub fn as_box(&self) -> Option<BoxRef> {
        match self {
            Operand::Box(b) => Some(*b),
            Operand::Const(_) => None,
        }
    }
}

impl From<BoxRef> for Operand {
    fn from(b: BoxRef) -> Self {
        Operand::Box(b)
    }
}

impl From<Const> for Operand {
    fn from(c: Const) -> Self {
        Operand::Const(c)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Box(b) => b.fmt(f),
            Operand::Const(c) => c.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Label,
    Jump,
    Finish,
    GuardTrue,
    GuardFalse,
    GuardValue,
    GuardClass,
    GuardNonnull,
    GuardNoException,
    GuardNoOverflow,
    GuardNotForced,
    GuardNotInvalidated,
    IntAdd,
    IntSub,
    IntMul,
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    FloatAdd,
    FloatSub,
    FloatMul,
    GetfieldGc,
    SetfieldGc,
    Call,
    CallMayForce,
    CallAssembler,
    ForceToken,
    QuasiimmutField,
    SameAs,
}

impl OpCode {
    pub fn is_guard(self) -> bool {
        matches!(
            self,
            OpCode::GuardTrue
                | OpCode::GuardFalse
                | OpCode::GuardValue
                | OpCode::GuardClass
                | OpCode::GuardNonnull
                | OpCode::GuardNoException
                | OpCode::GuardNoOverflow
                | OpCode::GuardNotForced
                | OpCode::GuardNotInvalidated
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, OpCode::Jump | OpCode::Finish)
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Label => "label",
            OpCode::Jump => "jump",
            OpCode::Finish => "finish",
            OpCode::GuardTrue => "guard_true",
            OpCode::GuardFalse => "guard_false",
            OpCode::GuardValue => "guard_value",
            OpCode::GuardClass => "guard_class",
            OpCode::GuardNonnull => "guard_nonnull",
            OpCode::GuardNoException => "guard_no_exception",
            OpCode::GuardNoOverflow => "guard_no_overflow",
            OpCode::GuardNotForced => "guard_not_forced",
            OpCode::GuardNotInvalidated => "guard_not_invalidated",
            OpCode::IntAdd => "int_add",
            OpCode::IntSub => "int_sub",
            OpCode::IntMul => "int_mul",
            OpCode::IntLt => "int_lt",
            OpCode::IntLe => "int_le",
            OpCode::IntEq => "int_eq",
            OpCode::IntNe => "int_ne",
            OpCode::IntGt => "int_gt",
            OpCode::IntGe => "int_ge",
            OpCode::FloatAdd => "float_add",
            OpCode::FloatSub => "float_sub",
            OpCode::FloatMul => "float_mul",
            OpCode::GetfieldGc => "getfield_gc",
            OpCode::SetfieldGc => "setfield_gc",
            OpCode::Call => "call",
            OpCode::CallMayForce => "call_may_force",
            OpCode::CallAssembler => "call_assembler",
            OpCode::ForceToken => "force_token",
            OpCode::QuasiimmutField => "quasiimmut_field",
            OpCode::SameAs => "same_as",
        }
    }
}

/// Descriptor attached to a trace operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpDescr {
    /// LABEL and JUMP targets.
    Target(TargetId),
    /// CALL_ASSEMBLER callee, or a JUMP to a token's first label.
    Token(ProcedureTokenId),
    /// Guards and FINISH.
    Fail(FailDescrId),
    Call(CallDescr),
    Field(FieldDescr),
    /// QUASIIMMUT_FIELD: the procedure depends on this field staying unchanged.
    Dependency(DependencyId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub opcode: OpCode,
    pub args: Vec<Operand>,
    pub result: Option<BoxRef>,
    pub descr: Option<OpDescr>,
    /// Values saved when a guard fails.
    pub fail_args: Vec<Operand>,
}

impl Operation {
    pub fn new(opcode: OpCode, args: Vec<Operand>, result: Option<BoxRef>) -> Self {
        Self {
            opcode,
            args,
            result,
            descr: None,
            fail_args: Vec::new(),
        }
    }

    pub fn with_descr(mut self, descr: OpDescr) -> Self {
        self.descr = Some(descr);
        self
    }

    pub fn with_fail_args<T: Into<Operand>>(mut self, fail_args: impl IntoIterator<Item = T>) -> Self {
        self.fail_args = fail_args.into_iter().map(Into::into).collect();
        self
    }

    pub fn label(inputargs: &[BoxRef], target: TargetId) -> Self {
        Operation::new(OpCode::Label, inputargs.iter().map(|b| Operand::Box(*b)).collect(), None)
            .with_descr(OpDescr::Target(target))
    }

    pub fn jump(args: Vec<Operand>, descr: OpDescr) -> Self {
        Operation::new(OpCode::Jump, args, None).with_descr(descr)
    }

    pub fn fail_descr(&self) -> Option<FailDescrId> {
        match self.descr {
            Some(OpDescr::Fail(id)) => Some(id),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<TargetId> {
        match self.descr {
            Some(OpDescr::Target(id)) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(res) = self.result {
            write!(f, "{} = ", res)?;
        }
        write!(f, "{}(", self.opcode.name())?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            arg.fmt(f)?;
        }
        if let Some(descr) = &self.descr {
            write!(f, ", descr={:?}", descr)?;
        }
        f.write_str(")")?;
        if self.opcode.is_guard() {
            let names: Vec<String> = self.fail_args.iter().map(|b| b.to_string()).collect();
            write!(f, " [{}]", names.join(", "))?;
        }
        Ok(())
    }
}

/// Operations recorded by the tracer.
#[derive(Debug, Clone, Default)]
pub struct History {
    pub inputargs: Vec<BoxRef>,
    pub operations: Vec<Operation>,
    next_box: u32,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_box(&mut self, kind: Kind) -> BoxRef {
        let b = BoxRef { id: self.next_box, kind };
        self.next_box += 1;
        b
    }

    /// Create the input boxes of the trace.
    pub fn set_inputargs(&mut self, kinds: &[Kind]) -> Vec<BoxRef> {
        self.inputargs = kinds.iter().map(|k| self.new_box(*k)).collect();
        self.inputargs.clone()
    }

    /// Append an operation, creating its result box for non-void `result`.
    pub fn record(&mut self, opcode: OpCode, args: Vec<Operand>, result: Kind) -> Option<BoxRef> {
        let res = (result != Kind::Void).then(|| self.new_box(result));
        self.operations.push(Operation::new(opcode, args, res));
        res
    }

    pub fn push(&mut self, op: Operation) {
        self.operations.push(op);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Identity of an externally invalidated dependency (a quasi-immutable field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyId(pub u32);

/// A procedure handed to the optimizer and the backend.
///
/// Loops start with a LABEL; loops and bridges end with a JUMP or FINISH.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledProcedure {
    pub name: String,
    pub inputargs: Vec<BoxRef>,
    pub operations: Vec<Operation>,
    pub quasi_immutable_deps: Vec<DependencyId>,
}

impl CompiledProcedure {
    pub fn new(name: impl Into<String>, inputargs: Vec<BoxRef>, operations: Vec<Operation>) -> Self {
        Self {
            name: name.into(),
            inputargs,
            operations,
            quasi_immutable_deps: Vec::new(),
        }
    }

    pub fn last_op(&self) -> Option<&Operation> {
        self.operations.last()
    }

    /// Whether the optimizer stopped at a peeled preamble.
    pub fn ends_in_label(&self) -> bool {
        self.last_op().is_some_and(|op| op.opcode == OpCode::Label)
    }

    pub fn add_dependencies(&mut self, deps: &[DependencyId]) {
        for dep in deps {
            if !self.quasi_immutable_deps.contains(dep) {
                self.quasi_immutable_deps.push(*dep);
            }
        }
    }

    /// First box id not used anywhere in the procedure.
    pub fn first_free_box(&self) -> u32 {
        let args = self.operations.iter().flat_map(|op| {
            op.args
                .iter()
                .filter_map(Operand::as_box)
                .chain(op.result)
                .chain(op.fail_args.iter().filter_map(Operand::as_box))
        });
        self.inputargs
            .iter()
            .copied()
            .chain(args)
            .map(|b| b.id + 1)
            .max()
            .unwrap_or(0)
    }
}

impl fmt::Display for CompiledProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.inputargs.iter().map(|b| b.to_string()).collect();
        writeln!(f, "[{}]", args.join(", "))?;
        for op in &self.operations {
            writeln!(f, "    {}", op)?;
        }
        Ok(())
    }
}

/// Old-to-new substitution used to inline a loop body after a peeled preamble.
#[derive(Debug, Clone)]
pub struct ValueMap {
    argmap: HashMap<BoxRef, Operand>,
    next_box: u32,
}

impl ValueMap {
    /// Map `inputargs[i]` to `jumpargs[i]`; fresh boxes start at `first_free`.
    pub fn new(inputargs: &[Operand], jumpargs: &[Operand], first_free: u32) -> Self {
        let mut argmap = HashMap::new();
        for (input, jump) in inputargs.iter().zip(jumpargs) {
            if let Operand::Box(b) = input {
                argmap.entry(*b).or_insert(*jump);
            }
        }
        Self { argmap, next_box: first_free }
    }

    pub fn inline_arg(&self, arg: &Operand) -> Operand {
        match arg {
            Operand::Const(_) => *arg,
            Operand::Box(b) => self.argmap.get(b).copied().unwrap_or(*arg),
        }
    }

    /// A substituted copy of `op` whose result is a fresh box.
    pub fn inline_op(&mut self, op: &Operation) -> Operation {
        let mut new_op = op.clone();
        new_op.args = op.args.iter().map(|a| self.inline_arg(a)).collect();
        new_op.fail_args = op.fail_args.iter().map(|a| self.inline_arg(a)).collect();
        if let Some(old) = op.result {
            let fresh = BoxRef { id: self.next_box, kind: old.kind };
            self.next_box += 1;
            self.argmap.insert(old, Operand::Box(fresh));
            new_op.result = Some(fresh);
        }
        new_op
    }

    pub fn next_free_box(&self) -> u32 {
        self.next_box
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcedureTokenId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u32);

/// Green arguments identifying a call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct GreenKey(pub Vec<Const>);

impl From<&GreenKey> for GreenKey {
    fn from(key: &GreenKey) -> Self {
        key.clone()
    }
}

impl fmt::Display for GreenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "({})", parts.join(", "))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcedureToken {
    pub greenkey: Option<GreenKey>,
    pub target_labels: Vec<TargetId>,
    /// Generation of the last use, maintained by the memory manager.
    pub generation: u64,
    pub invalidated: bool,
    /// Tokens this one may jump to; they are kept alive with it.
    pub jumps_to: HashSet<ProcedureTokenId>,
    /// Loop number assigned when sent to the backend.
    pub number: Option<u32>,
    pub faildescr_indices: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetLabel {
    pub owner: Option<ProcedureTokenId>,
}

/// Owner of all procedure tokens and target labels.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: HashMap<ProcedureTokenId, ProcedureToken>,
    targets: HashMap<TargetId, TargetLabel>,
    dependencies: HashMap<DependencyId, Vec<ProcedureTokenId>>,
    next_token: u32,
    next_target: u32,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_token(&mut self, greenkey: Option<GreenKey>) -> ProcedureTokenId {
        let id = ProcedureTokenId(self.next_token);
        self.next_token += 1;
        self.tokens.insert(
            id,
            ProcedureToken {
                greenkey,
                ..ProcedureToken::default()
            },
        );
        id
    }

    pub fn new_target(&mut self, owner: Option<ProcedureTokenId>) -> TargetId {
        let id = TargetId(self.next_target);
        self.next_target += 1;
        self.targets.insert(id, TargetLabel { owner });
        id
    }

    pub fn token(&self, id: ProcedureTokenId) -> Option<&ProcedureToken> {
        self.tokens.get(&id)
    }

    pub fn token_mut(&mut self, id: ProcedureTokenId) -> Option<&mut ProcedureToken> {
        self.tokens.get_mut(&id)
    }

    pub fn target(&self, id: TargetId) -> Option<TargetLabel> {
        self.targets.get(&id).copied()
    }

    pub fn set_target_owner(&mut self, target: TargetId, owner: ProcedureTokenId) {
        self.targets.entry(target).or_default().owner = Some(owner);
    }

    /// Drop a token that never reached the backend, with its labels.
    pub fn discard(&mut self, id: ProcedureTokenId, labels: &[TargetId]) {
        self.tokens.remove(&id);
        for label in labels {
            self.targets.remove(label);
        }
        self.targets.retain(|_, t| t.owner != Some(id));
    }

    pub fn record_jump_to(&mut self, from: ProcedureTokenId, to: ProcedureTokenId) {
        if from == to {
            return;
        }
        if let Some(token) = self.tokens.get_mut(&from) {
            token.jumps_to.insert(to);
        }
    }

    pub fn register_dependency(&mut self, dep: DependencyId, token: ProcedureTokenId) {
        let tokens = self.dependencies.entry(dep).or_default();
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }

    /// Mark every token depending on `dep` invalidated; returns the newly invalidated ones.
    pub fn invalidate_dependency(&mut self, dep: DependencyId) -> Vec<ProcedureTokenId> {
        let mut invalidated = Vec::new();
        for id in self.dependencies.remove(&dep).unwrap_or_default() {
            if let Some(token) = self.tokens.get_mut(&id) {
                if !token.invalidated {
                    token.invalidated = true;
                    invalidated.push(id);
                }
            }
        }
        invalidated
    }

    pub fn is_alive(&self, id: ProcedureTokenId) -> bool {
        self.tokens
            .get(&id)
            .is_some_and(|t| !t.invalidated)
    }

    /// Forget a freed token together with its labels and dependency entries.
    pub fn retire(&mut self, id: ProcedureTokenId) {
        let Some(token) = self.tokens.remove(&id) else {
            return;
        };
        for label in &token.target_labels {
            self.targets.remove(label);
        }
        self.targets.retain(|_, t| t.owner != Some(id));
        self.dependencies.retain(|_, tokens| {
            tokens.retain(|t| *t != id);
            !tokens.is_empty()
        });
    }

    /// Number of dependencies some live token still waits on.
    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }

    pub fn token_ids(&self) -> Vec<ProcedureTokenId> {
        let mut ids: Vec<_> = self.tokens.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_map_renames_results() {
        let mut history = History::new();
        let [i0, i1] = [history.new_box(Kind::Int), history.new_box(Kind::Int)];
        let i2 = history.record(OpCode::IntAdd, vec![i0.into(), Const::Int(1).into()], Kind::Int).unwrap();
        let i3 = history.record(OpCode::IntMul, vec![i2.into(), i1.into()], Kind::Int).unwrap();

        let mut map = ValueMap::new(&[i0.into(), i1.into()], &[i3.into(), Const::Int(7).into()], 10);
        let first = map.inline_op(&history.operations[0]);
        let second = map.inline_op(&history.operations[1]);
        assert_eq!(first.args, vec![Operand::Box(i3), Operand::Const(Const::Int(1))]);
        let fresh = first.result.unwrap();
        assert_eq!(fresh.id, 10);
        assert_eq!(second.args, vec![Operand::Box(fresh), Operand::Const(Const::Int(7))]);
        // originals untouched
        assert_eq!(history.operations[0].args[0], Operand::Box(i0));
        assert_eq!(map.next_free_box(), 12);
    }

    #[test]
    fn test_value_map_substitutes_fail_args() {
        let i0 = BoxRef { id: 0, kind: Kind::Int };
        let i1 = BoxRef { id: 1, kind: Kind::Int };
        let guard = Operation::new(OpCode::GuardTrue, vec![i0.into()], None).with_fail_args([i0, i1]);
        let mut map = ValueMap::new(&[i0.into(), i1.into()], &[Const::Int(5).into(), i0.into()], 10);
        let inlined = map.inline_op(&guard);
        assert_eq!(inlined.args, vec![Operand::Const(Const::Int(5))]);
        assert_eq!(inlined.fail_args, vec![Operand::Const(Const::Int(5)), Operand::Box(i0)]);
    }

    #[test]
    fn test_retire_forgets_token() {
        let mut reg = TokenRegistry::new();
        let a = reg.new_token(None);
        let b = reg.new_token(None);
        let la = reg.new_target(Some(a));
        reg.token_mut(a).unwrap().target_labels.push(la);
        reg.register_dependency(DependencyId(1), a);
        reg.register_dependency(DependencyId(2), a);
        reg.register_dependency(DependencyId(2), b);

        reg.retire(a);
        assert!(reg.token(a).is_none());
        assert!(reg.target(la).is_none());
        assert!(!reg.is_alive(a));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.dependency_count(), 1);
        assert_eq!(reg.invalidate_dependency(DependencyId(2)), vec![b]);
    }

    #[test]
    fn test_registry_discard_and_dependencies() {
        let mut reg = TokenRegistry::new();
        let a = reg.new_token(None);
        let b = reg.new_token(None);
        let la = reg.new_target(Some(a));
        reg.discard(a, &[la]);
        assert!(reg.token(a).is_none());
        assert!(reg.target(la).is_none());

        let dep = DependencyId(3);
        reg.register_dependency(dep, b);
        reg.register_dependency(dep, b);
        assert_eq!(reg.invalidate_dependency(dep), vec![b]);
        assert!(!reg.is_alive(b));
        assert!(reg.invalidate_dependency(dep).is_empty());
    }

    #[test]
    fn test_first_free_box_scans_everything() {
        let i0 = BoxRef { id: 0, kind: Kind::Int };
        let i9 = BoxRef { id: 9, kind: Kind::Int };
        let proc = CompiledProcedure::new(
            "p",
            vec![i0],
            vec![Operation::new(OpCode::GuardTrue, vec![i0.into()], None).with_fail_args(vec![i9])],
        );
        assert_eq!(proc.first_free_box(), 10);
    }
}
