// This module performs register allocation for one lowered flow graph, independently per
// value kind. It builds an interference graph from the Analyzer's liveness sets: a result
// interferes with every same-kind value live after its operation, and the arguments of a
// block interfere pairwise. Link arguments are coalesced with the block arguments they bind
// whenever the merged groups do not interfere, which removes most copies at block
// boundaries. Start-block arguments are pre-coloured 0..n in order so callers can pass
// arguments positionally. Groups are then coloured greedily with the lowest free slot
// through the RegisterFile, which keeps slot indices contiguous and bounded at 256.

//! Per-kind register allocation by interference-graph colouring.

use super::flow::{FlowArg, FlowGraph, GraphAdaptor, Variable};
use crate::core::{
    Analyzer, CompileError, CompileResult, Kind, RegBitSet, Register, RegisterFile,
};
use hashbrown::{HashMap, HashSet};

/// Register assignment of every variable of a graph.
#[derive(Debug, Clone, Default)]
pub struct RegMap {
    regs: HashMap<Variable, Register>,
    counts: [usize; 3],
}

impl RegMap {
    pub fn get(&self, var: Variable) -> CompileResult<Register> {
        self.regs
            .get(&var)
            .copied()
            .ok_or_else(|| CompileError::RegisterAllocation {
                reason: format!("v{} has no register", var.id),
            })
    }

    /// Number of registers used for `kind`.
    pub fn count(&self, kind: Kind) -> usize {
        kind.bank().map_or(0, |bank| self.counts[bank])
    }
}

/// Allocate registers for all kinds of `graph`.
pub fn perform_register_allocation(graph: &FlowGraph) -> CompileResult<RegMap> {
    let mut adaptor = GraphAdaptor::single(graph);
    let mut analyzer = Analyzer::new();
    analyzer.switch_func(&mut adaptor, 0);

    let mut map = RegMap::default();
    let mut file = RegisterFile::new();
    for kind in crate::core::REGISTER_KINDS {
        KindAllocator::new(graph, &analyzer, kind).run(&mut file, &mut map.regs)?;
    }
    map.counts = file.counts();
    log::trace!(
        "{}: registers i={} r={} f={}",
        graph.name,
        map.counts[0],
        map.counts[1],
        map.counts[2]
    );
    Ok(map)
}

struct KindAllocator<'g, 'a> {
    graph: &'g FlowGraph,
    analyzer: &'a Analyzer<GraphAdaptor<'g>>,
    kind: Kind,
    /// Variables in order of definition.
    vars: Vec<Variable>,
    edges: HashMap<Variable, HashSet<Variable>>,
    /// Union-find parent pointers.
    parent: HashMap<Variable, Variable>,
    precolored: HashMap<Variable, u8>,
}

impl<'g, 'a> KindAllocator<'g, 'a> {
    fn new(graph: &'g FlowGraph, analyzer: &'a Analyzer<GraphAdaptor<'g>>, kind: Kind) -> Self {
        Self {
            graph,
            analyzer,
            kind,
            vars: Vec::new(),
            edges: HashMap::new(),
            parent: HashMap::new(),
            precolored: HashMap::new(),
        }
    }

    fn add_var(&mut self, var: Variable) {
        if var.kind == self.kind && !self.parent.contains_key(&var) {
            self.parent.insert(var, var);
            self.vars.push(var);
        }
    }

    fn interfere(&mut self, a: Variable, b: Variable) {
        if a == b || a.kind != self.kind || b.kind != self.kind {
            return;
        }
        self.edges.entry(a).or_default().insert(b);
        self.edges.entry(b).or_default().insert(a);
    }

    fn find(&mut self, var: Variable) -> Variable {
        let mut root = var;
        while let Some(&p) = self.parent.get(&root) {
            if p == root {
                break;
            }
            root = p;
        }
        let mut cur = var;
        while cur != root {
            let next = self.parent[&cur];
            self.parent.insert(cur, root);
            cur = next;
        }
        root
    }

    fn build_interference(&mut self) {
        let (graph, analyzer) = (self.graph, self.analyzer);
        for &block_id in analyzer.order() {
            let Some(live) = analyzer.block_liveness(block_id) else {
                continue;
            };
            let block = graph.block(block_id);
            for (i, a) in block.inputargs.iter().enumerate() {
                self.add_var(*a);
                for b in &block.inputargs[i + 1..] {
                    self.interfere(*a, *b);
                }
            }
            for (pos, op) in block.operations.iter().enumerate() {
                let Some(res) = op.result else { continue };
                self.add_var(res);
                for &other in live.live_after(pos) {
                    self.interfere(res, other);
                }
            }
        }
    }

    fn groups_interfere(&mut self, a: Variable, b: Variable) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        let members_b: HashSet<Variable> = self
            .vars
            .clone()
            .into_iter()
            .filter(|v| self.find(*v) == rb)
            .collect();
        let members_a: Vec<Variable> = self
            .vars
            .clone()
            .into_iter()
            .filter(|v| self.find(*v) == ra)
            .collect();
        members_a.iter().any(|m| {
            self.edges
                .get(m)
                .is_some_and(|adj| adj.iter().any(|n| members_b.contains(n)))
        })
    }

    fn coalesce_links(&mut self) {
        let (graph, analyzer) = (self.graph, self.analyzer);
        for &block_id in analyzer.order() {
            let block = graph.block(block_id);
            for link in block.exit.links() {
                let target = graph.block(link.target);
                for (arg, param) in link.args.iter().zip(&target.inputargs) {
                    let FlowArg::Var(src) = arg else { continue };
                    if src.kind != self.kind || !self.parent.contains_key(src) || !self.parent.contains_key(param) {
                        continue;
                    }
                    let (rs, rp) = (self.find(*src), self.find(*param));
                    if rs == rp {
                        continue;
                    }
                    let (cs, cp) = (self.precolored.get(&rs).copied(), self.precolored.get(&rp).copied());
                    if cs.is_some() && cp.is_some() {
                        continue;
                    }
                    if self.groups_interfere(rs, rp) {
                        continue;
                    }
                    // Keep the pre-coloured root as representative.
                    let (root, child) = if cp.is_some() { (rp, rs) } else { (rs, rp) };
                    self.parent.insert(child, root);
                }
            }
        }
    }

    fn run(
        mut self,
        file: &mut RegisterFile,
        out: &mut HashMap<Variable, Register>,
    ) -> CompileResult<()> {
        self.build_interference();

        let start_args: Vec<Variable> = self
            .graph
            .startargs()
            .iter()
            .filter(|v| v.kind == self.kind)
            .copied()
            .collect();
        for (slot, var) in start_args.iter().enumerate() {
            let slot = u8::try_from(slot).map_err(|_| CompileError::RegisterAllocation {
                reason: format!("{}: more than 256 {} arguments", self.graph.name, self.kind),
            })?;
            self.add_var(*var);
            self.precolored.insert(*var, slot);
        }

        self.coalesce_links();

        // Colour groups: pre-coloured roots first, then in definition order.
        let mut roots: Vec<Variable> = Vec::new();
        let vars = self.vars.clone();
        for var in &vars {
            let root = self.find(*var);
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        roots.sort_by_key(|r| !self.precolored.contains_key(r));

        let mut colors: HashMap<Variable, Register> = HashMap::new();
        for root in roots {
            let members: Vec<Variable> = vars.iter().copied().filter(|v| self.find(*v) == root).collect();
            let mut forbidden = RegBitSet::new();
            for m in &members {
                if let Some(adj) = self.edges.get(m) {
                    for n in adj.clone() {
                        let nroot = self.find(n);
                        if let Some(reg) = colors.get(&nroot) {
                            forbidden.set(reg.index as usize);
                        }
                    }
                }
            }
            let reg = file
                .allocate(self.kind, &forbidden, self.precolored.get(&root).copied())
                .map_err(|e| CompileError::RegisterAllocation {
                    reason: format!("{}: {}", self.graph.name, e),
                })?;
            colors.insert(root, reg);
            for m in members {
                out.insert(m, reg);
            }
        }
        Ok(())
    }
}
