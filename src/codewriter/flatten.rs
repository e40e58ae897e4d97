// This module turns a lowered, register-allocated flow graph into an SsaRepr: a linear
// list of instructions with explicit labels and jumps, the input of the assembler. Blocks
// are emitted depth-first from the start block; a link to a block not yet emitted falls
// through into it, a link to an emitted block becomes a backward `goto`. Two-way branches
// emit a `goto_if_not` (or a fused `goto_if_not_<cmp>`) jumping forward past the true path
// to a fresh label holding the false path; switches emit a `switch` with a jump table
// descriptor followed by the default path and one labelled path per case. Link arguments
// are bound with per-kind `<kind>_copy` moves, sequentialized so that no source is
// overwritten before it is read; cycles go through `<kind>_push`/`<kind>_pop`.

//! Flattening of flow graphs into linear SSA listings.

use super::descr::{Descr, SwitchDescr};
use super::flow::{BlockId, Condition, Exit, FlowArg, FlowGraph, Link};
use super::regalloc::RegMap;
use crate::core::{CompileError, CompileResult, Const, Kind, Register};
use hashbrown::HashMap;

/// A label definition in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label(pub String);

/// A label used as an operand; resolved by the assembler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TLabel(pub String);

/// A homogeneous operand list, encoded as a count followed by its items.
#[derive(Debug, Clone, PartialEq)]
pub struct ListOfKind {
    pub kind: Kind,
    pub items: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reg(Register),
    Const(Const),
    TLabel(TLabel),
    List(ListOfKind),
    Descr(Descr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    Label(Label),
    /// Registers live across the following instruction.
    Live(Vec<Register>),
    Op {
        opname: String,
        args: Vec<Operand>,
        result: Option<Register>,
    },
}

impl Insn {
    pub fn op(opname: impl Into<String>, args: Vec<Operand>, result: Option<Register>) -> Self {
        Insn::Op {
            opname: opname.into(),
            args,
            result,
        }
    }
}

/// A flattened procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct SsaRepr {
    pub name: String,
    pub insns: Vec<Insn>,
}

impl SsaRepr {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insns: Vec::new(),
        }
    }
}

/// Flatten `graph` using the register assignment in `regs`.
///
/// `switch_ids` numbers switch descriptors across a compilation unit.
pub fn flatten_graph(graph: &FlowGraph, regs: &RegMap, switch_ids: &mut u32) -> CompileResult<SsaRepr> {
    let mut flattener = Flattener {
        graph,
        regs,
        switch_ids,
        ssarepr: SsaRepr::new(graph.name.clone()),
        block_labels: HashMap::new(),
        next_label: 1,
    };
    flattener.emit_block(graph.start_block())?;
    Ok(flattener.ssarepr)
}

struct Flattener<'g, 'r, 'c> {
    graph: &'g FlowGraph,
    regs: &'r RegMap,
    switch_ids: &'c mut u32,
    ssarepr: SsaRepr,
    block_labels: HashMap<BlockId, String>,
    next_label: u32,
}

impl Flattener<'_, '_, '_> {
    fn fresh_label(&mut self) -> String {
        let name = format!("L{}", self.next_label);
        self.next_label += 1;
        name
    }

    fn emit(&mut self, insn: Insn) {
        self.ssarepr.insns.push(insn);
    }

    fn operand(&self, arg: &FlowArg) -> CompileResult<Operand> {
        match arg {
            FlowArg::Var(v) => Ok(Operand::Reg(self.regs.get(*v)?)),
            FlowArg::Const(c) => Ok(Operand::Const(*c)),
            FlowArg::Descr(d) => Ok(Operand::Descr(d.clone())),
            FlowArg::List { kind, items } => Ok(Operand::List(ListOfKind {
                kind: *kind,
                items: items.iter().map(|i| self.operand(i)).collect::<CompileResult<_>>()?,
            })),
            FlowArg::Graph(g) => Err(CompileError::UnsupportedOperand {
                context: format!("flattening {}", self.graph.name),
                operand: format!("graph {}", g.0),
            }),
        }
    }

    fn emit_block(&mut self, block_id: BlockId) -> CompileResult<()> {
        if self.block_labels.contains_key(&block_id) {
            return Ok(());
        }
        let label = self.fresh_label();
        self.block_labels.insert(block_id, label.clone());
        self.emit(Insn::Label(Label(label)));

        let block = self.graph.block(block_id);
        for op in &block.operations {
            if op.opname == "-live-" {
                let live = op
                    .args
                    .iter()
                    .map(|a| match self.operand(a)? {
                        Operand::Reg(r) => Ok(r),
                        other => Err(CompileError::UnsupportedOperand {
                            context: "-live-".into(),
                            operand: format!("{:?}", other),
                        }),
                    })
                    .collect::<CompileResult<Vec<_>>>()?;
                self.emit(Insn::Live(live));
                continue;
            }
            let args = op
                .args
                .iter()
                .map(|a| self.operand(a))
                .collect::<CompileResult<Vec<_>>>()?;
            let result = op.result.map(|v| self.regs.get(v)).transpose()?;
            self.emit(Insn::op(op.opname.clone(), args, result));
        }

        match &block.exit {
            Exit::Return(value) => {
                let insn = match value {
                    None => Insn::op("void_return", vec![], None),
                    Some(v) => {
                        let kind = v.kind().unwrap_or(Kind::Void);
                        Insn::op(format!("{}_return", kind.name()), vec![self.operand(v)?], None)
                    }
                };
                self.emit(insn);
            }
            Exit::Raise(value) => {
                let operand = self.operand(value)?;
                self.emit(Insn::op("raise", vec![operand], None));
            }
            Exit::Goto(link) => self.emit_link(link)?,
            Exit::Branch {
                cond,
                if_true,
                if_false,
            } => {
                let false_label = self.fresh_label();
                let insn = match cond {
                    Condition::Var(v) => Insn::op(
                        "goto_if_not",
                        vec![Operand::Reg(self.regs.get(*v)?), Operand::TLabel(TLabel(false_label.clone()))],
                        None,
                    ),
                    Condition::Compare { opname, args } => {
                        let mut operands = args
                            .iter()
                            .map(|a| self.operand(a))
                            .collect::<CompileResult<Vec<_>>>()?;
                        operands.push(Operand::TLabel(TLabel(false_label.clone())));
                        Insn::op(format!("goto_if_not_{}", opname), operands, None)
                    }
                };
                self.emit(insn);
                self.emit_link(if_true)?;
                self.emit(Insn::Label(Label(false_label)));
                self.emit_link(if_false)?;
            }
            Exit::Switch {
                value,
                cases,
                default,
            } => {
                let labels: Vec<String> = cases.iter().map(|_| self.fresh_label()).collect();
                let descr = SwitchDescr {
                    id: *self.switch_ids,
                    cases: cases
                        .iter()
                        .zip(&labels)
                        .map(|((v, _), l)| (*v, l.clone()))
                        .collect(),
                };
                *self.switch_ids += 1;
                let reg = self.regs.get(*value)?;
                self.emit(Insn::op(
                    "switch",
                    vec![Operand::Reg(reg), Operand::Descr(Descr::Switch(descr))],
                    None,
                ));
                self.emit_link(default)?;
                for ((_, link), label) in cases.iter().zip(labels) {
                    self.emit(Insn::Label(Label(label)));
                    self.emit_link(link)?;
                }
            }
        }
        Ok(())
    }

    fn emit_link(&mut self, link: &Link) -> CompileResult<()> {
        let target = self.graph.block(link.target);
        let mut moves = Vec::new();
        for (arg, param) in link.args.iter().zip(&target.inputargs) {
            let dst = self.regs.get(*param)?;
            let src = self.operand(arg)?;
            if src != Operand::Reg(dst) {
                moves.push((src, dst));
            }
        }
        for insn in sequentialize_moves(moves) {
            self.emit(insn);
        }

        match self.block_labels.get(&link.target) {
            Some(label) => {
                let label = label.clone();
                self.emit(Insn::op("goto", vec![Operand::TLabel(TLabel(label))], None));
                Ok(())
            }
            None => self.emit_block(link.target),
        }
    }
}

/// Order a parallel move so every source is read before it is overwritten.
fn sequentialize_moves(mut pending: Vec<(Operand, Register)>) -> Vec<Insn> {
    let mut out = Vec::new();
    let mut saved: Option<Register> = None;
    let is_source = |pending: &[(Operand, Register)], reg: Register| {
        pending.iter().any(|(src, _)| *src == Operand::Reg(reg))
    };

    while !pending.is_empty() || saved.is_some() {
        if let Some(dst) = saved {
            if !is_source(&pending, dst) {
                out.push(Insn::op(format!("{}_pop", dst.kind.name()), vec![], Some(dst)));
                saved = None;
                continue;
            }
        }
        if let Some(pos) = pending.iter().position(|(_, dst)| !is_source(&pending, *dst)) {
            let (src, dst) = pending.remove(pos);
            out.push(Insn::op(format!("{}_copy", dst.kind.name()), vec![src], Some(dst)));
            continue;
        }
        // Every destination is still read by another move: break the cycle.
        let (src, dst) = pending.remove(0);
        out.push(Insn::op(format!("{}_push", dst.kind.name()), vec![src], None));
        saved = Some(dst);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(i: u8) -> Register {
        Register::new(Kind::Int, i)
    }

    /// Apply the listing to a register file and return the final contents.
    fn run_moves(insns: &[Insn], init: &[i64]) -> Vec<i64> {
        let mut regs = init.to_vec();
        let mut stack = Vec::new();
        for insn in insns {
            let Insn::Op { opname, args, result } = insn else { panic!() };
            let read = |op: &Operand, regs: &[i64]| match op {
                Operand::Reg(r) => regs[r.index as usize],
                Operand::Const(Const::Int(v)) => *v,
                _ => panic!(),
            };
            match opname.as_str() {
                "int_copy" => regs[result.unwrap().index as usize] = read(&args[0], &regs),
                "int_push" => stack.push(read(&args[0], &regs)),
                "int_pop" => regs[result.unwrap().index as usize] = stack.pop().unwrap(),
                _ => panic!("{}", opname),
            }
        }
        regs
    }

    #[test]
    fn test_chain_of_moves_is_ordered() {
        // r1 <- r0, r2 <- r1
        let insns = sequentialize_moves(vec![(Operand::Reg(reg(0)), reg(1)), (Operand::Reg(reg(1)), reg(2))]);
        assert_eq!(run_moves(&insns, &[10, 11, 12]), vec![10, 10, 11]);
    }

    #[test]
    fn test_swap_uses_push_pop() {
        let insns = sequentialize_moves(vec![(Operand::Reg(reg(0)), reg(1)), (Operand::Reg(reg(1)), reg(0))]);
        assert!(insns
            .iter()
            .any(|i| matches!(i, Insn::Op { opname, .. } if opname == "int_push")));
        assert_eq!(run_moves(&insns, &[1, 2]), vec![2, 1]);
    }

    #[test]
    fn test_rotation_with_constant() {
        // r0 <- r1, r1 <- r2, r2 <- r0, r3 <- $7
        let insns = sequentialize_moves(vec![
            (Operand::Reg(reg(1)), reg(0)),
            (Operand::Reg(reg(2)), reg(1)),
            (Operand::Reg(reg(0)), reg(2)),
            (Operand::Const(Const::Int(7)), reg(3)),
        ]);
        assert_eq!(run_moves(&insns, &[1, 2, 3, 4]), vec![2, 3, 1, 7]);
    }
}
