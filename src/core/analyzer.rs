// This module implements the Analyzer that computes block layout and value liveness for
// a flow graph exposed through the IrAdaptor trait. It performs two analyses: a reverse
// post-order (RPO) traversal giving a deterministic block order, and a backward liveness
// dataflow. Liveness is recorded per operation boundary: for every block the analyzer keeps
// the set of values live before each operation plus the set live at the exit, iterating
// over blocks in post-order until the live-in sets stop changing. Block arguments are
// definitions, so they never propagate into predecessors. The register allocator derives
// interference from these sets and the liveness pass fills `-live-` markers from them.

use super::adaptor::IrAdaptor;
use core::marker::PhantomData;
use hashbrown::{HashMap, HashSet};

/// Liveness of one block, at every operation boundary.
#[derive(Clone)]
pub struct BlockLiveness<V> {
    /// `points[i]` holds the values live just before operation `i`;
    /// the last entry holds the values live at the exit.
    points: Vec<HashSet<V>>,
}

impl<V: Copy + Eq + core::hash::Hash> BlockLiveness<V> {
    pub fn live_in(&self) -> &HashSet<V> {
        &self.points[0]
    }

    pub fn live_out(&self) -> &HashSet<V> {
        &self.points[self.points.len() - 1]
    }

    /// Values live right after operation `inst`.
    pub fn live_after(&self, inst: usize) -> &HashSet<V> {
        &self.points[inst + 1]
    }
}

/// Computes block layout and liveness information for a graph.
///
/// The analyzer walks the graph provided by [`IrAdaptor`] in reverse
/// post-order and solves the backward liveness equations until fixpoint.
pub struct Analyzer<A: IrAdaptor> {
    order: Vec<A::BlockRef>,
    block_map: HashMap<A::BlockRef, usize>,
    liveness: Vec<BlockLiveness<A::ValueRef>>,
    _marker: PhantomData<A>,
}

impl<A: IrAdaptor> Default for Analyzer<A> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            block_map: HashMap::new(),
            liveness: Vec::new(),
            _marker: PhantomData,
        }
    }
}

impl<A: IrAdaptor> Analyzer<A> {
    /// Create a new analyzer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence of reachable blocks in reverse post order.
    pub fn order(&self) -> &[A::BlockRef] {
        &self.order
    }

    /// Position of a block in [`Analyzer::order`].
    pub fn block_index(&self, block: A::BlockRef) -> Option<usize> {
        self.block_map.get(&block).copied()
    }

    /// Liveness of a reachable block.
    pub fn block_liveness(&self, block: A::BlockRef) -> Option<&BlockLiveness<A::ValueRef>> {
        self.block_index(block).map(|idx| &self.liveness[idx])
    }

    /// Build block layout and liveness for the given graph using the adaptor.
    pub fn switch_func(&mut self, adaptor: &mut A, func: A::FuncRef) {
        self.order.clear();
        self.block_map.clear();
        self.liveness.clear();

        if !adaptor.switch_func(func) {
            return;
        }

        // -------- build RPO order ---------
        let entry = adaptor.entry_block();
        let mut post = Vec::new();
        let mut stack = vec![(entry, false)];
        let mut visited = HashSet::new();
        while let Some((block, processed)) = stack.pop() {
            if processed {
                post.push(block);
                continue;
            }
            if !visited.insert(block) {
                continue;
            }
            stack.push((block, true));
            let succs: Vec<_> = adaptor.block_succs(block).collect();
            for succ in succs.into_iter().rev() {
                stack.push((succ, false));
            }
        }
        post.reverse();
        self.order = post;
        for (idx, b) in self.order.iter().enumerate() {
            self.block_map.insert(*b, idx);
        }

        // -------- compute liveness ---------
        self.liveness = self
            .order
            .iter()
            .map(|&block| BlockLiveness {
                points: vec![HashSet::new(); adaptor.block_insts(block).count() + 1],
            })
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for idx in (0..self.order.len()).rev() {
                if self.recompute_block(adaptor, idx) {
                    changed = true;
                }
            }
        }
    }

    /// Recompute one block from its successors; returns whether live-in grew.
    fn recompute_block(&mut self, adaptor: &A, idx: usize) -> bool {
        let block = self.order[idx];
        let mut live: HashSet<A::ValueRef> = adaptor
            .block_exit_uses(block)
            .filter(|v| !adaptor.val_ignore_liveness(*v))
            .collect();
        for succ in adaptor.block_succs(block) {
            let Some(&succ_idx) = self.block_map.get(&succ) else {
                continue;
            };
            let args: HashSet<_> = adaptor.block_args(succ).collect();
            live.extend(
                self.liveness[succ_idx]
                    .live_in()
                    .iter()
                    .filter(|v| !args.contains(*v))
                    .copied(),
            );
        }

        let insts: Vec<_> = adaptor.block_insts(block).collect();
        let mut points = vec![HashSet::new(); insts.len() + 1];
        points[insts.len()] = live.clone();
        for (pos, inst) in insts.iter().enumerate().rev() {
            for res in adaptor.inst_results(*inst) {
                live.remove(&res);
            }
            live.extend(
                adaptor
                    .inst_operands(*inst)
                    .filter(|v| !adaptor.val_ignore_liveness(*v)),
            );
            points[pos] = live.clone();
        }

        let grew = points[0].len() != self.liveness[idx].points[0].len();
        self.liveness[idx].points = points;
        grew
    }
}
