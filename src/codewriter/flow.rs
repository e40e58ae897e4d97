// This module defines the flow-graph IR the codewriter consumes: one FlowGraph per
// procedure, made of blocks that receive Variables as arguments, run SpaceOps, and end in
// an Exit (return, raise, goto, two-way branch or integer switch). Values cross blocks only
// through link arguments, so every variable is local to the block that defines it. A
// Program groups the graphs reachable from the portal (the interpreter's main loop
// procedure) and records how many of the portal's arguments are green. GraphAdaptor
// exposes a graph through the IrAdaptor trait so the shared Analyzer can compute block
// order and liveness for register allocation and `-live-` markers.

//! Flow graphs: the input of the codewriter.

use super::descr::Descr;
use crate::core::{CompileError, CompileResult, Const, IrAdaptor, Kind};
use hashbrown::HashSet;

/// A value defined once in one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable {
    pub id: u32,
    pub kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// An operand of a flow-graph operation.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowArg {
    Var(Variable),
    Const(Const),
    /// Callee of a `direct_call`.
    Graph(GraphId),
    Descr(Descr),
    /// Per-kind argument list, produced by lowering.
    List { kind: Kind, items: Vec<FlowArg> },
}

impl FlowArg {
    pub fn kind(&self) -> Option<Kind> {
        match self {
            FlowArg::Var(v) => Some(v.kind),
            FlowArg::Const(c) => Some(c.kind()),
            _ => None,
        }
    }

    /// Variables read by this operand, including list items.
    pub fn variables(&self, out: &mut Vec<Variable>) {
        match self {
            FlowArg::Var(v) => out.push(*v),
            FlowArg::List { items, .. } => items.iter().for_each(|item| item.variables(out)),
            _ => {}
        }
    }
}

impl From<Variable> for FlowArg {
    fn from(v: Variable) -> Self {
        FlowArg::Var(v)
    }
}

impl From<Const> for FlowArg {
    fn from(c: Const) -> Self {
        FlowArg::Const(c)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpaceOp {
    pub opname: String,
    pub args: Vec<FlowArg>,
    pub result: Option<Variable>,
}

impl SpaceOp {
    pub fn new(opname: impl Into<String>, args: Vec<FlowArg>, result: Option<Variable>) -> Self {
        Self {
            opname: opname.into(),
            args,
            result,
        }
    }
}

/// Control transfer to `target`, binding its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub target: BlockId,
    pub args: Vec<FlowArg>,
}

impl Link {
    pub fn new(target: BlockId, args: Vec<FlowArg>) -> Self {
        Self { target, args }
    }
}

/// Condition of a two-way branch.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Var(Variable),
    /// A comparison fused into the branch by lowering.
    Compare { opname: String, args: Vec<FlowArg> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Exit {
    Return(Option<FlowArg>),
    Raise(FlowArg),
    Goto(Link),
    Branch {
        cond: Condition,
        if_true: Link,
        if_false: Link,
    },
    Switch {
        value: Variable,
        cases: Vec<(i64, Link)>,
        default: Link,
    },
}

impl Exit {
    pub fn links(&self) -> Vec<&Link> {
        match self {
            Exit::Return(_) | Exit::Raise(_) => Vec::new(),
            Exit::Goto(link) => vec![link],
            Exit::Branch { if_true, if_false, .. } => vec![if_true, if_false],
            Exit::Switch { cases, default, .. } => {
                let mut links: Vec<&Link> = cases.iter().map(|(_, l)| l).collect();
                links.push(default);
                links
            }
        }
    }

    /// Variables read by the exit itself.
    pub fn variables(&self) -> Vec<Variable> {
        let mut out = Vec::new();
        match self {
            Exit::Return(Some(arg)) | Exit::Raise(arg) => arg.variables(&mut out),
            Exit::Return(None) | Exit::Goto(_) => {}
            Exit::Branch { cond, .. } => match cond {
                Condition::Var(v) => out.push(*v),
                Condition::Compare { args, .. } => args.iter().for_each(|a| a.variables(&mut out)),
            },
            Exit::Switch { value, .. } => out.push(*value),
        }
        for link in self.links() {
            link.args.iter().for_each(|a| a.variables(&mut out));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub inputargs: Vec<Variable>,
    pub operations: Vec<SpaceOp>,
    pub exit: Exit,
}

/// One procedure. Block 0 is the start block.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowGraph {
    pub name: String,
    pub result_kind: Kind,
    pub blocks: Vec<Block>,
    next_var: u32,
}

impl FlowGraph {
    pub fn new(name: impl Into<String>, result_kind: Kind) -> Self {
        Self {
            name: name.into(),
            result_kind,
            blocks: Vec::new(),
            next_var: 0,
        }
    }

    pub fn new_var(&mut self, kind: Kind) -> Variable {
        let var = Variable {
            id: self.next_var,
            kind,
        };
        self.next_var += 1;
        var
    }

    /// Append a block returning void; set its real exit with [`FlowGraph::set_exit`].
    pub fn add_block(&mut self, inputargs: Vec<Variable>) -> BlockId {
        self.blocks.push(Block {
            inputargs,
            operations: Vec::new(),
            exit: Exit::Return(None),
        });
        BlockId(self.blocks.len() as u32 - 1)
    }

    pub fn push_op(&mut self, block: BlockId, op: SpaceOp) {
        self.blocks[block.0 as usize].operations.push(op);
    }

    pub fn set_exit(&mut self, block: BlockId, exit: Exit) {
        self.blocks[block.0 as usize].exit = exit;
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn start_block(&self) -> BlockId {
        BlockId(0)
    }

    pub fn startargs(&self) -> &[Variable] {
        self.blocks.first().map_or(&[], |b| b.inputargs.as_slice())
    }

    fn invalid(&self, reason: String) -> CompileError {
        CompileError::InvalidGraph {
            graph: self.name.clone(),
            reason,
        }
    }

    /// Check that variables are block-local and defined once, and that
    /// links bind their targets with matching kinds.
    pub fn check(&self) -> CompileResult<()> {
        if self.blocks.is_empty() {
            return Err(self.invalid("graph has no blocks".into()));
        }
        let mut defined_anywhere = HashSet::new();
        for (idx, block) in self.blocks.iter().enumerate() {
            let mut defined = HashSet::new();
            for v in &block.inputargs {
                if !defined_anywhere.insert(*v) || !defined.insert(*v) {
                    return Err(self.invalid(format!("variable v{} defined twice", v.id)));
                }
            }
            let mut uses = Vec::new();
            for op in &block.operations {
                uses.clear();
                op.args.iter().for_each(|a| a.variables(&mut uses));
                if let Some(v) = uses.iter().find(|v| !defined.contains(*v)) {
                    return Err(self.invalid(format!(
                        "block {} uses v{} in {} before defining it",
                        idx, v.id, op.opname
                    )));
                }
                if let Some(res) = op.result {
                    if !defined_anywhere.insert(res) || !defined.insert(res) {
                        return Err(self.invalid(format!("variable v{} defined twice", res.id)));
                    }
                }
            }
            if let Some(v) = block.exit.variables().iter().find(|v| !defined.contains(*v)) {
                return Err(self.invalid(format!("exit of block {} uses undefined v{}", idx, v.id)));
            }
            for link in block.exit.links() {
                let target = self
                    .blocks
                    .get(link.target.0 as usize)
                    .ok_or_else(|| self.invalid(format!("link to missing block {}", link.target.0)))?;
                if target.inputargs.len() != link.args.len() {
                    return Err(self.invalid(format!(
                        "link from block {} passes {} values to block {} expecting {}",
                        idx,
                        link.args.len(),
                        link.target.0,
                        target.inputargs.len()
                    )));
                }
                for (arg, param) in link.args.iter().zip(&target.inputargs) {
                    if arg.kind() != Some(param.kind) {
                        return Err(self.invalid(format!(
                            "link from block {} binds a {:?} value to a {} argument",
                            idx,
                            arg.kind(),
                            param.kind
                        )));
                    }
                }
            }
            match &block.exit {
                Exit::Return(value) => {
                    let kind = value.as_ref().and_then(FlowArg::kind).unwrap_or(Kind::Void);
                    if kind != self.result_kind {
                        return Err(self.invalid(format!(
                            "block {} returns {} from a {} graph",
                            idx, kind, self.result_kind
                        )));
                    }
                }
                Exit::Switch { value, .. } if value.kind != Kind::Int => {
                    return Err(self.invalid(format!("switch on non-int v{}", value.id)));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Portal description: the graph holding the interpreter's merge point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Portal {
    pub graph: GraphId,
    pub num_greens: usize,
}

/// All graphs known to the codewriter.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub graphs: Vec<FlowGraph>,
    pub portal: Option<Portal>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_graph(&mut self, graph: FlowGraph) -> GraphId {
        self.graphs.push(graph);
        GraphId(self.graphs.len() as u32 - 1)
    }

    pub fn graph(&self, id: GraphId) -> Option<&FlowGraph> {
        self.graphs.get(id.0 as usize)
    }

    pub fn set_portal(&mut self, graph: GraphId, num_greens: usize) {
        self.portal = Some(Portal { graph, num_greens });
    }
}

/// [`IrAdaptor`] over a slice of flow graphs.
pub struct GraphAdaptor<'g> {
    graphs: &'g [FlowGraph],
    current: usize,
}

impl<'g> GraphAdaptor<'g> {
    pub fn new(graphs: &'g [FlowGraph]) -> Self {
        Self { graphs, current: 0 }
    }

    pub fn single(graph: &'g FlowGraph) -> Self {
        Self::new(std::slice::from_ref(graph))
    }

    fn graph(&self) -> &'g FlowGraph {
        &self.graphs[self.current]
    }

    fn op(&self, inst: (BlockId, usize)) -> &'g SpaceOp {
        &self.graph().block(inst.0).operations[inst.1]
    }
}

impl<'g> IrAdaptor for GraphAdaptor<'g> {
    type ValueRef = Variable;
    type InstRef = (BlockId, usize);
    type BlockRef = BlockId;
    type FuncRef = usize;

    fn func_count(&self) -> u32 {
        self.graphs.len() as u32
    }

    fn funcs(&self) -> Box<dyn Iterator<Item = Self::FuncRef> + '_> {
        Box::new(0..self.graphs.len())
    }

    fn func_link_name(&self, func: Self::FuncRef) -> &str {
        &self.graphs[func].name
    }

    fn switch_func(&mut self, func: Self::FuncRef) -> bool {
        if func < self.graphs.len() && !self.graphs[func].blocks.is_empty() {
            self.current = func;
            true
        } else {
            false
        }
    }

    fn entry_block(&self) -> Self::BlockRef {
        self.graph().start_block()
    }

    fn blocks(&self) -> Box<dyn Iterator<Item = Self::BlockRef> + '_> {
        Box::new((0..self.graph().blocks.len() as u32).map(BlockId))
    }

    fn block_args(&self, block: Self::BlockRef) -> Box<dyn Iterator<Item = Self::ValueRef> + '_> {
        Box::new(self.graph().block(block).inputargs.iter().copied())
    }

    fn block_insts(&self, block: Self::BlockRef) -> Box<dyn Iterator<Item = Self::InstRef> + '_> {
        let len = self.graph().block(block).operations.len();
        Box::new((0..len).map(move |i| (block, i)))
    }

    fn block_succs(&self, block: Self::BlockRef) -> Box<dyn Iterator<Item = Self::BlockRef> + '_> {
        let mut seen = HashSet::new();
        let succs: Vec<_> = self
            .graph()
            .block(block)
            .exit
            .links()
            .into_iter()
            .map(|l| l.target)
            .filter(|t| seen.insert(*t))
            .collect();
        Box::new(succs.into_iter())
    }

    fn block_exit_uses(
        &self,
        block: Self::BlockRef,
    ) -> Box<dyn Iterator<Item = Self::ValueRef> + '_> {
        Box::new(self.graph().block(block).exit.variables().into_iter())
    }

    fn inst_operands(&self, inst: Self::InstRef) -> Box<dyn Iterator<Item = Self::ValueRef> + '_> {
        let mut vars = Vec::new();
        self.op(inst).args.iter().for_each(|a| a.variables(&mut vars));
        Box::new(vars.into_iter())
    }

    fn inst_results(&self, inst: Self::InstRef) -> Box<dyn Iterator<Item = Self::ValueRef> + '_> {
        Box::new(self.op(inst).result.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Analyzer;

    /// `while i < n: i += 1; return i`
    fn counting_loop() -> FlowGraph {
        let mut g = FlowGraph::new("count", Kind::Int);
        let i0 = g.new_var(Kind::Int);
        let n0 = g.new_var(Kind::Int);
        let start = g.add_block(vec![i0, n0]);
        let i1 = g.new_var(Kind::Int);
        let n1 = g.new_var(Kind::Int);
        let head = g.add_block(vec![i1, n1]);
        let cond = g.new_var(Kind::Int);
        let i2 = g.new_var(Kind::Int);
        let n2 = g.new_var(Kind::Int);
        let body = g.add_block(vec![i2, n2]);
        let inc = g.new_var(Kind::Int);
        let i3 = g.new_var(Kind::Int);
        let done = g.add_block(vec![i3]);

        g.set_exit(start, Exit::Goto(Link::new(head, vec![i0.into(), n0.into()])));
        g.push_op(head, SpaceOp::new("int_lt", vec![i1.into(), n1.into()], Some(cond)));
        g.set_exit(
            head,
            Exit::Branch {
                cond: Condition::Var(cond),
                if_true: Link::new(body, vec![i1.into(), n1.into()]),
                if_false: Link::new(done, vec![i1.into()]),
            },
        );
        g.push_op(body, SpaceOp::new("int_add", vec![i2.into(), Const::Int(1).into()], Some(inc)));
        g.set_exit(body, Exit::Goto(Link::new(head, vec![inc.into(), n2.into()])));
        g.set_exit(done, Exit::Return(Some(i3.into())));
        g
    }

    #[test]
    fn test_well_formed_graph_checks() {
        counting_loop().check().unwrap();
    }

    #[test]
    fn test_cross_block_use_is_rejected() {
        let mut g = counting_loop();
        let leaked = g.blocks[0].inputargs[0];
        g.blocks[2].operations[0].args[0] = leaked.into();
        let err = g.check().unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph { .. }));
    }

    #[test]
    fn test_link_arity_is_checked() {
        let mut g = counting_loop();
        if let Exit::Goto(link) = &mut g.blocks[0].exit {
            link.args.pop();
        }
        assert!(g.check().is_err());
    }

    #[test]
    fn test_analyzer_liveness_on_flow_graph() {
        let g = counting_loop();
        let mut adaptor = GraphAdaptor::single(&g);
        let mut analyzer = Analyzer::new();
        analyzer.switch_func(&mut adaptor, 0);

        assert_eq!(analyzer.order()[0], BlockId(0));
        assert_eq!(analyzer.order().len(), 4);

        let head = analyzer.block_liveness(BlockId(1)).unwrap();
        let i1 = g.blocks[1].inputargs[0];
        let n1 = g.blocks[1].inputargs[1];
        assert!(head.live_in().contains(&i1));
        assert!(head.live_in().contains(&n1));
        // Both survive the comparison because the links pass them on.
        assert!(head.live_after(0).contains(&i1));
        assert!(head.live_after(0).contains(&n1));

        let body = analyzer.block_liveness(BlockId(2)).unwrap();
        let i2 = g.blocks[2].inputargs[0];
        assert!(!body.live_after(0).contains(&i2));
    }
}
